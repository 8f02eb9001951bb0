//! error types for each layer of the alarm subsystem

use std::io;

use thiserror::Error;

use crate::alarm::AlarmId;

/// failures of the persisted alarm document
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alarm store i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("couldn't serialize alarm store: {0}")]
    Serialize(serde_json::Error),

    /// recovered inside the store by starting empty, never surfaced to callers
    #[error("corrupt alarm store document: {0}")]
    Corrupt(serde_json::Error),
}

/// failures of the timer facility
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("exact alarm permission not granted")]
    PermissionDenied,

    #[error("timer platform error: {0}")]
    Platform(String),
}

/// failures starting alert resources. these are logged, delivery goes on without them
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("couldn't start alarm sound: {0}")]
    Sound(String),

    #[error("couldn't start vibration: {0}")]
    Vibration(String),

    #[error("couldn't acquire wake hold: {0}")]
    WakeHold(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read config file: {0}")]
    Io(#[from] io::Error),

    #[error("couldn't parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("couldn't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("couldn't determine the home directory")]
    NoHome,
}

/// everything the scheduler boundary reports to the host application
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlarmError {
    /// rejected before anything was persisted
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// the record is persisted but not armed
    #[error("alarm {0} persisted but exact alarm permission was denied")]
    PermissionDenied(AlarmId),

    #[error("platform error: {0}")]
    Platform(String),
}

impl AlarmError {
    /// whether a later sweep or an identical call can succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_))
    }

    pub(crate) fn from_timer(id: AlarmId, err: TimerError) -> Self {
        match err {
            TimerError::PermissionDenied => Self::PermissionDenied(id),
            TimerError::Platform(msg) => Self::Platform(msg),
        }
    }
}

impl From<StoreError> for AlarmError {
    fn from(err: StoreError) -> Self {
        Self::Platform(err.to_string())
    }
}
