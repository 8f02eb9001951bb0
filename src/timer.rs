//! Wake-up timers.
//!
//! [`TimerThread`] is the in-process timer facility: one worker thread that
//! owns nothing but a wake-up channel, with the armed table shared behind a
//! mutex. The gateways on top of it decide how precise a registration is:
//!
//! - [`ExactTimer`] fires at the requested instant.
//! - [`InexactTimer`] rounds the instant up to the next batching window, the
//!   way an OS batches inexact alarms while idle.
//! - [`PermissionGate`] checks an [`ExactPermission`] right before every arm
//!   and picks one of the two, or refuses.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::{
    alarm::{format_millis, AlarmId, AlarmRecord},
    clock::{Clock, SystemClock},
    error::TimerError,
};

/// the wall clock is re-read at least this often, so clock jumps and suspends are noticed
const MAX_WAIT_MILLIS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Exact,
    InexactWhileIdle,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::InexactWhileIdle => write!(f, "inexact"),
        }
    }
}

/// what to do when exact delivery isn't permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    #[default]
    RequireExact,
    AllowInexact,
}

/// a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    pub id: AlarmId,
    /// the instant the timer will actually fire at
    pub due: i64,
    pub precision: Precision,
}

/// delivered when a timer fires. carries its own copy of the alarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub alarm: AlarmRecord,
    pub precision: Precision,
}

pub trait TimerGateway: Send + Sync {
    /// registers a wake-up for `record`, replacing any registration with the same id
    ///
    /// # Errors
    /// `PermissionDenied` if exact delivery is refused and `fallback` forbids inexact,
    /// `Platform` if the timer facility is gone
    fn arm(&self, record: &AlarmRecord, fallback: Fallback) -> Result<Armed, TimerError>;

    /// disarming an id without a timer is a no-op
    ///
    /// # Errors
    /// `Platform` if the timer facility is gone
    fn disarm(&self, id: AlarmId) -> Result<(), TimerError>;
}

impl<T: TimerGateway + ?Sized> TimerGateway for Arc<T> {
    fn arm(&self, record: &AlarmRecord, fallback: Fallback) -> Result<Armed, TimerError> {
        (**self).arm(record, fallback)
    }

    fn disarm(&self, id: AlarmId) -> Result<(), TimerError> {
        (**self).disarm(id)
    }
}

/// runtime check for the exact alarm capability
pub trait ExactPermission: Send + Sync {
    fn can_schedule_exact(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl ExactPermission for AlwaysGranted {
    fn can_schedule_exact(&self) -> bool {
        true
    }
}

/// a permission that can be granted and revoked while running
#[derive(Debug, Clone)]
pub struct PermissionFlag(Arc<AtomicBool>);

impl PermissionFlag {
    #[must_use]
    pub fn new(granted: bool) -> Self {
        Self(Arc::new(AtomicBool::new(granted)))
    }

    pub fn grant(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ExactPermission for PermissionFlag {
    fn can_schedule_exact(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Entry {
    due: i64,
    precision: Precision,
    alarm: AlarmRecord,
}

type Table = Arc<Mutex<HashMap<AlarmId, Entry>>>;

enum Command {
    Nudge,
    Shutdown,
}

/// the timer facility. fired alarms are sent to the channel given to [`TimerThread::spawn`]
#[derive(Debug)]
pub struct TimerThread {
    table: Table,
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nudge => write!(f, "Nudge"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl TimerThread {
    /// # Errors
    /// if the worker thread can't be spawned
    pub fn spawn(events: Sender<WakeEvent>) -> io::Result<Self> {
        let table = Table::default();
        let (commands, rx) = crossbeam_channel::unbounded();
        let worker_table = Arc::clone(&table);
        let handle = thread::Builder::new()
            .name("alarm-timers".to_string())
            .spawn(move || run(&worker_table, &rx, &events))?;
        Ok(Self {
            table,
            commands,
            handle: Some(handle),
        })
    }

    /// every currently armed timer, soonest first
    #[must_use]
    pub fn armed(&self) -> Vec<Armed> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut armed: Vec<_> = table
            .iter()
            .map(|(id, entry)| Armed {
                id: *id,
                due: entry.due,
                precision: entry.precision,
            })
            .collect();
        armed.sort_by_key(|a| (a.due, a.id));
        armed
    }

    fn schedule(
        &self,
        alarm: &AlarmRecord,
        due: i64,
        precision: Precision,
    ) -> Result<Armed, TimerError> {
        let replaced = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                alarm.id,
                Entry {
                    due,
                    precision,
                    alarm: alarm.clone(),
                },
            );
        if replaced.is_some() {
            debug!("replaced timer for alarm {}", alarm.id);
        }
        if let Err(err) = self.nudge() {
            // nothing will serve the table, don't report the entry as armed
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match replaced {
                Some(previous) => table.insert(alarm.id, previous),
                None => table.remove(&alarm.id),
            };
            return Err(err);
        }
        Ok(Armed {
            id: alarm.id,
            due,
            precision,
        })
    }

    fn cancel(&self, id: AlarmId) -> Result<(), TimerError> {
        let removed = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_none() {
            debug!("no timer armed for alarm {id}");
            return Ok(());
        }
        self.nudge()
    }

    fn nudge(&self) -> Result<(), TimerError> {
        self.commands
            .send(Command::Nudge)
            .map_err(|_| TimerError::Platform("timer thread is not running".to_string()))
    }

    /// stops the worker. armed timers are dropped, the store still has them
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(table: &Table, commands: &Receiver<Command>, events: &Sender<WakeEvent>) {
    let clock = SystemClock;
    loop {
        let now = clock.now_millis();
        let (fired, next) = {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            let due: Vec<AlarmId> = table
                .iter()
                .filter(|(_, entry)| entry.due <= now)
                .map(|(id, _)| *id)
                .collect();
            let fired: Vec<Entry> = due.iter().filter_map(|id| table.remove(id)).collect();
            (fired, table.values().map(|entry| entry.due).min())
        };

        for entry in fired {
            info!(
                "alarm {} fired ({}, due {})",
                entry.alarm.id,
                entry.precision,
                format_millis(entry.due)
            );
            let event = WakeEvent {
                alarm: entry.alarm,
                precision: entry.precision,
            };
            if events.send(event).is_err() {
                warn!("nobody is listening for alarms anymore, stopping timers");
                return;
            }
        }

        let wait = next.map_or(MAX_WAIT_MILLIS, |due| (due - now).clamp(0, MAX_WAIT_MILLIS));
        let wait = Duration::from_millis(u64::try_from(wait).unwrap_or(0));
        match commands.recv_timeout(wait) {
            Ok(Command::Nudge) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// fires at exactly the requested instant, including while idle
#[derive(Debug, Clone)]
pub struct ExactTimer {
    timers: Arc<TimerThread>,
}

impl ExactTimer {
    #[must_use]
    pub const fn new(timers: Arc<TimerThread>) -> Self {
        Self { timers }
    }
}

impl TimerGateway for ExactTimer {
    fn arm(&self, record: &AlarmRecord, _fallback: Fallback) -> Result<Armed, TimerError> {
        self.timers.schedule(record, record.fire_at, Precision::Exact)
    }

    fn disarm(&self, id: AlarmId) -> Result<(), TimerError> {
        self.timers.cancel(id)
    }
}

/// allowed while idle but batched: the instant is rounded up to the next window
#[derive(Debug, Clone)]
pub struct InexactTimer {
    timers: Arc<TimerThread>,
    window_millis: i64,
}

impl InexactTimer {
    #[must_use]
    pub fn new(timers: Arc<TimerThread>, window: Duration) -> Self {
        Self {
            timers,
            window_millis: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub const fn batched(&self, fire_at: i64) -> i64 {
        batch(fire_at, self.window_millis)
    }
}

const fn batch(fire_at: i64, window: i64) -> i64 {
    if window <= 0 {
        return fire_at;
    }
    let rem = fire_at.rem_euclid(window);
    if rem == 0 {
        fire_at
    } else {
        fire_at.saturating_add(window - rem)
    }
}

impl TimerGateway for InexactTimer {
    fn arm(&self, record: &AlarmRecord, _fallback: Fallback) -> Result<Armed, TimerError> {
        self.timers.schedule(
            record,
            self.batched(record.fire_at),
            Precision::InexactWhileIdle,
        )
    }

    fn disarm(&self, id: AlarmId) -> Result<(), TimerError> {
        self.timers.cancel(id)
    }
}

/// chooses exact or inexact delivery per call from a runtime permission check
#[derive(Debug)]
pub struct PermissionGate<P> {
    exact: ExactTimer,
    inexact: InexactTimer,
    permission: P,
}

impl<P: ExactPermission> PermissionGate<P> {
    #[must_use]
    pub fn new(timers: &Arc<TimerThread>, inexact_window: Duration, permission: P) -> Self {
        Self {
            exact: ExactTimer::new(Arc::clone(timers)),
            inexact: InexactTimer::new(Arc::clone(timers), inexact_window),
            permission,
        }
    }
}

impl<P: ExactPermission> TimerGateway for PermissionGate<P> {
    fn arm(&self, record: &AlarmRecord, fallback: Fallback) -> Result<Armed, TimerError> {
        if self.permission.can_schedule_exact() {
            return self.exact.arm(record, fallback);
        }
        match fallback {
            Fallback::AllowInexact => {
                warn!(
                    "exact alarms not permitted, alarm {} will fire inexactly",
                    record.id
                );
                self.inexact.arm(record, fallback)
            }
            Fallback::RequireExact => {
                warn!("exact alarms not permitted, alarm {} not armed", record.id);
                Err(TimerError::PermissionDenied)
            }
        }
    }

    fn disarm(&self, id: AlarmId) -> Result<(), TimerError> {
        // both variants share one timer table
        self.exact.disarm(id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: AlarmId, fire_at: i64) -> AlarmRecord {
        AlarmRecord::new(id, fire_at, "t", "b", "h")
    }

    fn far_future() -> i64 {
        SystemClock.now_millis() + 3_600_000
    }

    #[test]
    fn rearming_replaces() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timers = Arc::new(TimerThread::spawn(tx).unwrap());
        let exact = ExactTimer::new(Arc::clone(&timers));
        let first = far_future();
        exact.arm(&record(1, first), Fallback::RequireExact).unwrap();
        exact
            .arm(&record(1, first + 60_000), Fallback::RequireExact)
            .unwrap();
        assert_eq!(
            timers.armed(),
            vec![Armed {
                id: 1,
                due: first + 60_000,
                precision: Precision::Exact
            }]
        );
    }

    #[test]
    fn disarm_unknown_is_ok() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timers = Arc::new(TimerThread::spawn(tx).unwrap());
        let exact = ExactTimer::new(Arc::clone(&timers));
        assert_eq!(exact.disarm(42), Ok(()));
        exact.arm(&record(42, far_future()), Fallback::RequireExact).unwrap();
        assert_eq!(exact.disarm(42), Ok(()));
        assert_eq!(exact.disarm(42), Ok(()));
        assert!(timers.armed().is_empty());
    }

    #[test]
    fn fires_with_payload() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timers = Arc::new(TimerThread::spawn(tx).unwrap());
        let exact = ExactTimer::new(Arc::clone(&timers));
        let alarm = AlarmRecord::new(5, SystemClock.now_millis() + 50, "Drink water", "b", "h-5");
        exact.arm(&alarm, Fallback::RequireExact).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.alarm, alarm);
        assert_eq!(event.precision, Precision::Exact);
        assert!(timers.armed().is_empty());
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timers = Arc::new(TimerThread::spawn(tx).unwrap());
        let exact = ExactTimer::new(Arc::clone(&timers));
        exact
            .arm(&record(6, SystemClock.now_millis() + 200), Fallback::RequireExact)
            .unwrap();
        exact.disarm(6).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
    }

    #[test]
    fn inexact_rounds_up_to_window() {
        assert_eq!(batch(120_000, 60_000), 120_000);
        assert_eq!(batch(120_001, 60_000), 180_000);
        assert_eq!(batch(5, 0), 5);
    }

    #[test]
    fn gate_checks_permission_on_every_arm() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timers = Arc::new(TimerThread::spawn(tx).unwrap());
        let permission = PermissionFlag::new(true);
        let gate = PermissionGate::new(&timers, Duration::from_secs(60), permission.clone());
        let at = far_future();

        let armed = gate.arm(&record(1, at), Fallback::RequireExact).unwrap();
        assert_eq!(armed.precision, Precision::Exact);

        permission.revoke();
        assert_eq!(
            gate.arm(&record(2, at), Fallback::RequireExact),
            Err(TimerError::PermissionDenied)
        );
        let armed = gate.arm(&record(3, at), Fallback::AllowInexact).unwrap();
        assert_eq!(armed.precision, Precision::InexactWhileIdle);
        assert!(armed.due >= at);

        permission.grant();
        let armed = gate.arm(&record(2, at), Fallback::RequireExact).unwrap();
        assert_eq!(armed.precision, Precision::Exact);

        let ids: Vec<_> = timers.armed().iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn stopped_thread_reports_platform_error() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut timers = TimerThread::spawn(tx).unwrap();
        timers.shutdown();
        let err = timers.schedule(&record(1, far_future()), far_future(), Precision::Exact);
        assert!(matches!(err, Err(TimerError::Platform(_))));
        assert!(timers.armed().is_empty());
    }
}
