use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    alarm::{Fallbacks, DEFAULT_BODY, DEFAULT_HABIT_ID, DEFAULT_TITLE},
    delivery::{DEFAULT_VIBRATION_PATTERN, DEFAULT_WAKE_HOLD},
    error::ConfigError,
    timer::Fallback,
};

const APP_NAME: &str = "roosty_alarm";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// where the alarm document lives, defaults to the data dir
    pub store_path: Option<PathBuf>,
    pub default_title: String,
    pub default_body: String,
    pub default_habit_id: String,
    /// upper bound on how long a ringing alarm keeps the device awake
    pub wake_hold_minutes: u64,
    /// whether this device grants exact alarms
    pub exact_alarms: bool,
    /// arm inexactly instead of failing when exact alarms aren't granted
    pub allow_inexact_fallback: bool,
    pub inexact_window_secs: u64,
    /// delay, vibrate, pause... in milliseconds
    pub vibration_pattern: Vec<u64>,
    pub sound: Sound,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            default_title: DEFAULT_TITLE.to_string(),
            default_body: DEFAULT_BODY.to_string(),
            default_habit_id: DEFAULT_HABIT_ID.to_string(),
            wake_hold_minutes: DEFAULT_WAKE_HOLD.as_secs() / 60,
            exact_alarms: true,
            allow_inexact_fallback: false,
            inexact_window_secs: 60,
            vibration_pattern: DEFAULT_VIBRATION_PATTERN.to_vec(),
            sound: Sound::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Sound {
    /// falls back to a generated tone when unset or unreadable
    pub path: Option<PathBuf>,
    /// percent
    pub volume: f32,
}

impl Default for Sound {
    fn default() -> Self {
        Self {
            path: None,
            volume: 100.0,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// if the file can't be read or isn't valid toml
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&config)?)
    }

    /// like [`load`](Self::load) but a missing file gives the defaults
    ///
    /// # Errors
    /// if the file exists but can't be read or parsed
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// # Errors
    /// if the config can't be serialized or written
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let config = toml::to_string(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, config)?;
        Ok(())
    }

    fn project_dirs() -> Result<directories::ProjectDirs, ConfigError> {
        directories::ProjectDirs::from("", "", APP_NAME).ok_or(ConfigError::NoHome)
    }

    /// # Errors
    /// if there is no home directory
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let mut path = Self::project_dirs()?.config_dir().to_path_buf();
        path.push("config.toml");
        Ok(path)
    }

    /// # Errors
    /// if no path is configured and there is no home directory
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        let mut path = Self::project_dirs()?.data_dir().to_path_buf();
        path.push("alarms.json");
        Ok(path)
    }

    #[must_use]
    pub fn fallbacks(&self) -> Fallbacks {
        Fallbacks {
            title: self.default_title.clone(),
            body: self.default_body.clone(),
            habit_id: self.default_habit_id.clone(),
        }
    }

    #[must_use]
    pub const fn fallback(&self) -> Fallback {
        if self.allow_inexact_fallback {
            Fallback::AllowInexact
        } else {
            Fallback::RequireExact
        }
    }

    #[must_use]
    pub const fn wake_hold(&self) -> Duration {
        Duration::from_secs(self.wake_hold_minutes.saturating_mul(60))
    }

    #[must_use]
    pub const fn inexact_window(&self) -> Duration {
        Duration::from_secs(self.inexact_window_secs)
    }
}
