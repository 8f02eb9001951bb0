use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

/// caller supplied alarm id, must be positive
pub type AlarmId = i32;

pub const DEFAULT_TITLE: &str = "Alarm";
pub const DEFAULT_BODY: &str = "Time to wake up!";
pub const DEFAULT_HABIT_ID: &str = "0";

/// represents a persisted one shot alarm.
/// the field names are the ones used in the stored document
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    pub id: AlarmId,
    /// absolute instant in milliseconds since the unix epoch (utc)
    #[serde(rename = "time")]
    pub fire_at: i64,
    pub title: String,
    pub body: String,
    #[serde(rename = "habitId")]
    pub habit_id: String,
}

impl AlarmRecord {
    #[must_use]
    pub fn new(
        id: AlarmId,
        fire_at: i64,
        title: impl Into<String>,
        body: impl Into<String>,
        habit_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            fire_at,
            title: title.into(),
            body: body.into(),
            habit_id: habit_id.into(),
        }
    }

    /// same alarm content, different instant. used by snooze
    #[must_use]
    pub fn at(&self, fire_at: i64) -> Self {
        Self {
            fire_at,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn is_due(&self, now_millis: i64) -> bool {
        self.fire_at <= now_millis
    }
}

impl fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} \"{}\" at {}",
            self.id,
            self.title,
            format_millis(self.fire_at)
        )
    }
}

/// renders epoch millis in local time for logs and the cli
#[must_use]
pub fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis).map_or_else(
        || format!("{millis}ms"),
        |utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}

/// what the host application hands to `set`.
/// everything but the id is optional so validation happens in one place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmRequest {
    pub id: AlarmId,
    pub fire_at: Option<i64>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub habit_id: Option<String>,
}

impl AlarmRequest {
    #[must_use]
    pub const fn new(id: AlarmId, fire_at: i64) -> Self {
        Self {
            id,
            fire_at: Some(fire_at),
            title: None,
            body: None,
            habit_id: None,
        }
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn habit_id(mut self, habit_id: impl Into<String>) -> Self {
        self.habit_id = Some(habit_id.into());
        self
    }

    /// checks the required fields and fills absent text with the given fallbacks
    ///
    /// # Errors
    /// `InvalidArgument` when the id is not positive or the instant is missing or not positive
    pub fn into_record(self, fallback: &Fallbacks) -> Result<AlarmRecord, AlarmError> {
        if self.id <= 0 {
            return Err(AlarmError::InvalidArgument(format!(
                "alarm id must be positive, got {}",
                self.id
            )));
        }
        let fire_at = match self.fire_at {
            Some(fire_at) if fire_at > 0 => fire_at,
            Some(fire_at) => {
                return Err(AlarmError::InvalidArgument(format!(
                    "alarm time must be positive, got {fire_at}"
                )))
            }
            None => {
                return Err(AlarmError::InvalidArgument(
                    "alarm time is required".to_string(),
                ))
            }
        };
        Ok(AlarmRecord {
            id: self.id,
            fire_at,
            title: self.title.unwrap_or_else(|| fallback.title.clone()),
            body: self.body.unwrap_or_else(|| fallback.body.clone()),
            habit_id: self.habit_id.unwrap_or_else(|| fallback.habit_id.clone()),
        })
    }
}

impl From<AlarmRecord> for AlarmRequest {
    fn from(record: AlarmRecord) -> Self {
        Self {
            id: record.id,
            fire_at: Some(record.fire_at),
            title: Some(record.title),
            body: Some(record.body),
            habit_id: Some(record.habit_id),
        }
    }
}

/// text used when a request leaves title, body or habit id out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallbacks {
    pub title: String,
    pub body: String,
    pub habit_id: String,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            body: DEFAULT_BODY.to_string(),
            habit_id: DEFAULT_HABIT_ID.to_string(),
        }
    }
}
