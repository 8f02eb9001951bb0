#![warn(clippy::pedantic, clippy::nursery, clippy::cargo)]
#![deny(clippy::use_self, rust_2018_idioms, missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions, clippy::module_name_repetitions)]

//! One-shot alarms that outlive the process that set them.
//!
//! An alarm is written to the [`store`] before its [`timer`] is armed, so the
//! [`recovery`] sweep can re-arm whatever is still ahead after a restart or
//! reboot. When a timer fires, the [`delivery`] controller rings until the
//! user dismisses or snoozes.

pub mod alarm;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hardware;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod timer;

pub use alarm::{AlarmId, AlarmRecord, AlarmRequest};
pub use delivery::{AlertController, AlertState, Presenter, UserChoice};
pub use error::AlarmError;
pub use scheduler::{RestoreReport, Scheduler};
pub use store::AlarmStore;
pub use timer::{TimerGateway, TimerThread, WakeEvent};
