//! Alert delivery.
//!
//! Each fired alarm goes through
//!
//! ```text
//!  Idle ──► Presenting ──► Dismissed   (alarm removed)
//!                     ├──► Snoozed     (re-set 5 minutes out)
//!                     └──► ForceClosed (store left as it was)
//! ```
//!
//! A presentation owns its own wake hold, sound and vibration, so several
//! alarms can ring at once. A watchdog bounds how long those resources are
//! held: when it runs out the alert is silenced and torn down as if the
//! presentation surface went away.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};

use crate::{
    alarm::{AlarmId, AlarmRecord},
    error::DeliveryError,
    scheduler::Scheduler,
    timer::{TimerGateway, WakeEvent},
};

pub const SNOOZE_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_WAKE_HOLD: Duration = Duration::from_secs(10 * 60);
/// delay, vibrate, pause in milliseconds, repeated until stopped
pub const DEFAULT_VIBRATION_PATTERN: [u64; 3] = [0, 800, 400];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    Dismiss,
    Snooze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Presenting,
    Dismissed,
    Snoozed,
    ForceClosed,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// the user facing side of an alert
pub trait Presenter: Send + Sync {
    /// shows a high priority alert offering dismiss and snooze and blocks until the user picks one.
    /// `None` means the alert was torn down without a choice
    fn present(&self, alarm: &AlarmRecord) -> Option<UserChoice>;

    /// tears down the alert for `id` if one is showing. safe to call any number of times
    fn stop_alert(&self, id: AlarmId);
}

/// something started for a ringing alarm that has to be stopped again
pub trait ActiveResource: Send {
    fn stop(&mut self);
}

/// starts the per-presentation resources of an alert
pub trait AlertHardware: Send + Sync {
    /// keeps the device from suspending, for at most `bound`
    ///
    /// # Errors
    /// if the hold can't be taken
    fn acquire_wake_hold(
        &self,
        id: AlarmId,
        bound: Duration,
    ) -> Result<Box<dyn ActiveResource>, DeliveryError>;

    /// starts a looping alarm sound
    ///
    /// # Errors
    /// if no sound can be played
    fn start_sound(&self, id: AlarmId) -> Result<Box<dyn ActiveResource>, DeliveryError>;

    /// starts repeating `pattern`
    ///
    /// # Errors
    /// if the device can't vibrate
    fn start_vibration(
        &self,
        id: AlarmId,
        pattern: &[u64],
    ) -> Result<Box<dyn ActiveResource>, DeliveryError>;
}

struct Resources {
    id: AlarmId,
    held: Vec<(&'static str, Box<dyn ActiveResource>)>,
}

impl Resources {
    /// idempotent, the first call stops everything
    fn release(&mut self) {
        for (name, mut resource) in self.held.drain(..) {
            resource.stop();
            debug!("released {name} for alarm {}", self.id);
        }
    }
}

type SharedResources = Arc<Mutex<Resources>>;

pub struct AlertController<G> {
    scheduler: Arc<Scheduler<G>>,
    hardware: Arc<dyn AlertHardware>,
    presenter: Arc<dyn Presenter>,
    wake_hold: Duration,
    vibration: Vec<u64>,
    active: Mutex<HashMap<u64, AlarmId>>,
    serial: AtomicU64,
}

impl<G> fmt::Debug for AlertController<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertController")
            .field("wake_hold", &self.wake_hold)
            .field("vibration", &self.vibration)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<G: TimerGateway + 'static> AlertController<G> {
    #[must_use]
    pub fn new(
        scheduler: Arc<Scheduler<G>>,
        hardware: Arc<dyn AlertHardware>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            scheduler,
            hardware,
            presenter,
            wake_hold: DEFAULT_WAKE_HOLD,
            vibration: DEFAULT_VIBRATION_PATTERN.to_vec(),
            active: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        }
    }

    /// upper bound on how long one alert may hold its resources
    #[must_use]
    pub const fn with_wake_hold(mut self, bound: Duration) -> Self {
        self.wake_hold = bound;
        self
    }

    #[must_use]
    pub fn with_vibration_pattern(mut self, pattern: Vec<u64>) -> Self {
        self.vibration = pattern;
        self
    }

    /// ids of the alarms currently presenting
    #[must_use]
    pub fn active(&self) -> Vec<AlarmId> {
        let mut ids: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// tears down the alert for `id` from outside, it ends as `ForceClosed`
    pub fn stop_alert(&self, id: AlarmId) {
        self.presenter.stop_alert(id);
    }

    /// delivers `event` on its own thread so other alarms can ring alongside it
    ///
    /// # Errors
    /// if the thread can't be spawned
    pub fn spawn_delivery(self: &Arc<Self>, event: WakeEvent) -> io::Result<JoinHandle<AlertState>> {
        let controller = Arc::clone(self);
        thread::Builder::new()
            .name(format!("alarm-{}", event.alarm.id))
            .spawn(move || controller.deliver(event))
    }

    /// runs one alert to completion and returns the state it ended in
    pub fn deliver(&self, event: WakeEvent) -> AlertState {
        let alarm = event.alarm;
        // the event carries its own copy, a stale alert is better than a missed one
        match self.scheduler.get(alarm.id) {
            Ok(Some(_)) => {}
            Ok(None) => debug!("alarm {} is no longer stored, presenting anyway", alarm.id),
            Err(err) => warn!("couldn't look up alarm {}: {err}", alarm.id),
        }

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial, alarm.id);
        info!("alarm {alarm}: {} -> {}", AlertState::Idle, AlertState::Presenting);

        let resources = Arc::new(Mutex::new(self.acquire(&alarm)));
        let (done, done_rx) = crossbeam_channel::bounded::<()>(0);
        let watchdog = self.spawn_watchdog(alarm.id, Arc::clone(&resources), done_rx);

        let choice = self.presenter.present(&alarm);

        drop(done);
        if let Some(watchdog) = watchdog {
            if watchdog.join().is_err() {
                warn!("watchdog for alarm {} panicked", alarm.id);
            }
        }
        resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&serial);

        let state = self.finish(&alarm, choice);
        info!("alarm {}: {} -> {state}", alarm.id, AlertState::Presenting);
        state
    }

    fn acquire(&self, alarm: &AlarmRecord) -> Resources {
        let mut held: Vec<(&'static str, Box<dyn ActiveResource>)> = Vec::with_capacity(3);
        match self.hardware.acquire_wake_hold(alarm.id, self.wake_hold) {
            Ok(hold) => held.push(("wake hold", hold)),
            Err(err) => warn!("{err}"),
        }
        match self.hardware.start_sound(alarm.id) {
            Ok(sound) => held.push(("sound", sound)),
            Err(err) => error!("{err}"),
        }
        match self.hardware.start_vibration(alarm.id, &self.vibration) {
            Ok(vibration) => held.push(("vibration", vibration)),
            Err(err) => warn!("{err}"),
        }
        Resources { id: alarm.id, held }
    }

    fn spawn_watchdog(
        &self,
        id: AlarmId,
        resources: SharedResources,
        done: Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let bound = self.wake_hold;
        let presenter = Arc::clone(&self.presenter);
        let spawned = thread::Builder::new()
            .name(format!("alarm-{id}-watchdog"))
            .spawn(move || {
                crossbeam_channel::select! {
                    recv(done) -> _ => {}
                    recv(crossbeam_channel::after(bound)) -> _ => {
                        warn!("alarm {id} rang for {bound:?} without an answer, silencing it");
                        resources.lock().unwrap_or_else(PoisonError::into_inner).release();
                        presenter.stop_alert(id);
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("couldn't start watchdog for alarm {id}: {err}");
                None
            }
        }
    }

    fn finish(&self, alarm: &AlarmRecord, choice: Option<UserChoice>) -> AlertState {
        match choice {
            Some(UserChoice::Dismiss) => {
                if let Err(err) = self.scheduler.cancel(alarm.id) {
                    error!("couldn't remove dismissed alarm {}: {err}", alarm.id);
                }
                AlertState::Dismissed
            }
            Some(UserChoice::Snooze) => {
                if let Err(err) = self.scheduler.snooze(alarm, SNOOZE_DELAY) {
                    error!("couldn't snooze alarm {}: {err}", alarm.id);
                }
                AlertState::Snoozed
            }
            // left as it was, the next start or sweep decides what happens to it
            None => AlertState::ForceClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        time::Instant,
    };

    use crossbeam_channel::Sender;

    use super::*;
    use crate::{
        alarm::AlarmRequest,
        clock::ManualClock,
        store::AlarmStore,
        timer::{fake::FakeGateway, Precision},
    };

    const NOW: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct Counters {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct Counted(Arc<Counters>);

    impl ActiveResource for Counted {
        fn stop(&mut self) {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeHardware {
        counters: Arc<Counters>,
        no_vibrator: bool,
    }

    impl FakeHardware {
        fn start(&self) -> Result<Box<dyn ActiveResource>, DeliveryError> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Counted(Arc::clone(&self.counters))))
        }
    }

    impl AlertHardware for FakeHardware {
        fn acquire_wake_hold(
            &self,
            _id: AlarmId,
            _bound: Duration,
        ) -> Result<Box<dyn ActiveResource>, DeliveryError> {
            self.start()
        }

        fn start_sound(&self, _id: AlarmId) -> Result<Box<dyn ActiveResource>, DeliveryError> {
            self.start()
        }

        fn start_vibration(
            &self,
            _id: AlarmId,
            _pattern: &[u64],
        ) -> Result<Box<dyn ActiveResource>, DeliveryError> {
            if self.no_vibrator {
                return Err(DeliveryError::Vibration("no vibrator".to_string()));
            }
            self.start()
        }
    }

    /// answers immediately
    struct Scripted(Option<UserChoice>);

    impl Presenter for Scripted {
        fn present(&self, _alarm: &AlarmRecord) -> Option<UserChoice> {
            self.0
        }

        fn stop_alert(&self, _id: AlarmId) {}
    }

    /// waits until torn down
    #[derive(Default)]
    struct Unanswered {
        waiting: Mutex<HashMap<AlarmId, Sender<()>>>,
    }

    impl Presenter for Unanswered {
        fn present(&self, alarm: &AlarmRecord) -> Option<UserChoice> {
            let (tx, rx) = crossbeam_channel::bounded(1);
            self.waiting.lock().unwrap().insert(alarm.id, tx);
            let _ = rx.recv();
            None
        }

        fn stop_alert(&self, id: AlarmId) {
            if let Some(tx) = self.waiting.lock().unwrap().remove(&id) {
                let _ = tx.send(());
            }
        }
    }

    /// every presentation waits for the others before dismissing
    struct Together(Barrier);

    impl Presenter for Together {
        fn present(&self, _alarm: &AlarmRecord) -> Option<UserChoice> {
            self.0.wait();
            Some(UserChoice::Dismiss)
        }

        fn stop_alert(&self, _id: AlarmId) {}
    }

    struct Fixture {
        scheduler: Arc<Scheduler<Arc<FakeGateway>>>,
        gateway: Arc<FakeGateway>,
        counters: Arc<Counters>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let gateway = Arc::new(FakeGateway::default());
            let clock = ManualClock::new(NOW);
            let scheduler = Arc::new(Scheduler::new(
                Arc::new(AlarmStore::in_memory()),
                Arc::clone(&gateway),
                Arc::new(clock.clone()),
            ));
            Self {
                scheduler,
                gateway,
                counters: Arc::default(),
                clock,
            }
        }

        fn controller(&self, presenter: Arc<dyn Presenter>) -> Arc<AlertController<Arc<FakeGateway>>> {
            let hardware = FakeHardware {
                counters: Arc::clone(&self.counters),
                no_vibrator: false,
            };
            Arc::new(AlertController::new(
                Arc::clone(&self.scheduler),
                Arc::new(hardware),
                presenter,
            ))
        }

        /// sets the alarm and hands back the event its timer would deliver
        fn fire(&self, id: AlarmId, title: &str) -> WakeEvent {
            self.scheduler
                .set(AlarmRequest::new(id, NOW).title(title))
                .unwrap();
            self.gateway.disarm(id).unwrap();
            WakeEvent {
                alarm: self.scheduler.get(id).unwrap().unwrap(),
                precision: Precision::Exact,
            }
        }

        fn all_released(&self) -> bool {
            let started = self.counters.started.load(Ordering::SeqCst);
            started > 0 && started == self.counters.stopped.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn dismiss_removes_alarm() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(Scripted(Some(UserChoice::Dismiss))));
        let event = fixture.fire(7, "Drink water");

        assert_eq!(controller.deliver(event), AlertState::Dismissed);
        assert!(fixture.scheduler.get(7).unwrap().is_none());
        assert!(fixture.gateway.armed(7).is_none());
        assert!(fixture.all_released());
        assert!(controller.active().is_empty());
    }

    #[test]
    fn snooze_rearms_five_minutes_later() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(Scripted(Some(UserChoice::Snooze))));
        let event = fixture.fire(7, "Drink water");

        assert_eq!(controller.deliver(event), AlertState::Snoozed);
        let stored = fixture.scheduler.get(7).unwrap().unwrap();
        assert_eq!(stored.fire_at, NOW + 300_000);
        assert_eq!(stored.title, "Drink water");
        assert_eq!(fixture.gateway.armed(7).map(|a| a.due), Some(NOW + 300_000));
        assert!(fixture.all_released());
    }

    #[test]
    fn snooze_restores_a_cleared_alarm_from_the_event() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(Scripted(Some(UserChoice::Snooze))));
        let event = fixture.fire(3, "Walk");
        fixture.scheduler.cancel(3).unwrap();
        fixture.clock.advance(1_000);

        assert_eq!(controller.deliver(event), AlertState::Snoozed);
        let stored = fixture.scheduler.get(3).unwrap().unwrap();
        assert_eq!((stored.title.as_str(), stored.fire_at), ("Walk", NOW + 301_000));
    }

    #[test]
    fn force_close_leaves_store_alone() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(Scripted(None)));
        let event = fixture.fire(9, "Read");
        let before = fixture.scheduler.list().unwrap();

        assert_eq!(controller.deliver(event), AlertState::ForceClosed);
        assert_eq!(fixture.scheduler.list().unwrap(), before);
        assert!(fixture.all_released());
    }

    #[test]
    fn presents_after_cancel_raced_ahead() {
        let fixture = Fixture::new();
        let presenter = Arc::new(Scripted(Some(UserChoice::Dismiss)));
        let controller = fixture.controller(presenter);
        let event = fixture.fire(4, "Stretch");
        fixture.scheduler.cancel(4).unwrap();

        assert_eq!(controller.deliver(event), AlertState::Dismissed);
        assert!(fixture.counters.started.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn missing_vibrator_does_not_stop_delivery() {
        let fixture = Fixture::new();
        let hardware = FakeHardware {
            counters: Arc::clone(&fixture.counters),
            no_vibrator: true,
        };
        let controller = AlertController::new(
            Arc::clone(&fixture.scheduler),
            Arc::new(hardware),
            Arc::new(Scripted(Some(UserChoice::Dismiss))),
        );
        let event = fixture.fire(2, "Meditate");
        assert_eq!(controller.deliver(event), AlertState::Dismissed);
        assert_eq!(fixture.counters.started.load(Ordering::SeqCst), 2);
        assert!(fixture.all_released());
    }

    #[test]
    fn wake_hold_bound_forces_close() {
        let fixture = Fixture::new();
        let presenter = Arc::new(Unanswered::default());
        let hardware = FakeHardware {
            counters: Arc::clone(&fixture.counters),
            no_vibrator: false,
        };
        let controller = AlertController::new(
            Arc::clone(&fixture.scheduler),
            Arc::new(hardware),
            presenter,
        )
        .with_wake_hold(Duration::from_millis(100));
        let event = fixture.fire(5, "Sleep");

        let started = Instant::now();
        assert_eq!(controller.deliver(event), AlertState::ForceClosed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(fixture.all_released());
        assert!(fixture.scheduler.get(5).unwrap().is_some());
    }

    #[test]
    fn stop_alert_from_outside() {
        let fixture = Fixture::new();
        let presenter = Arc::new(Unanswered::default());
        let controller = fixture.controller(Arc::clone(&presenter) as Arc<dyn Presenter>);
        let handle = controller.spawn_delivery(fixture.fire(6, "Run")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !presenter.waiting.lock().unwrap().contains_key(&6) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(controller.active(), vec![6]);
        controller.stop_alert(6);
        controller.stop_alert(6);
        assert_eq!(handle.join().unwrap(), AlertState::ForceClosed);
    }

    #[test]
    fn concurrent_alarms_each_ring() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(Together(Barrier::new(2))));
        let first = controller.spawn_delivery(fixture.fire(1, "one")).unwrap();
        let second = controller.spawn_delivery(fixture.fire(2, "two")).unwrap();

        assert_eq!(first.join().unwrap(), AlertState::Dismissed);
        assert_eq!(second.join().unwrap(), AlertState::Dismissed);
        // three resources per presentation
        assert_eq!(fixture.counters.started.load(Ordering::SeqCst), 6);
        assert!(fixture.all_released());
        assert!(fixture.scheduler.list().unwrap().is_empty());
    }
}
