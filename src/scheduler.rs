use std::{fmt, sync::Arc, time::Duration};

use log::{debug, error, info, warn};

use crate::{
    alarm::{AlarmId, AlarmRecord, AlarmRequest, Fallbacks},
    clock::Clock,
    error::AlarmError,
    store::AlarmStore,
    timer::{Armed, Fallback, TimerGateway},
};

/// outcome of [`Scheduler::restore_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// future alarms armed again
    pub rearmed: usize,
    /// past-due alarms dropped from the store
    pub pruned: usize,
    /// future alarms that couldn't be armed, kept for the next sweep
    pub failed: usize,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} re-armed, {} expired, {} failed",
            self.rearmed, self.pruned, self.failed
        )
    }
}

/// keeps the alarm store and the timer gateway in step.
///
/// the store is always written before a timer is armed and after one is
/// disarmed, so a crash between the two steps leaves the store describing what
/// the next recovery sweep should do
pub struct Scheduler<G> {
    store: Arc<AlarmStore>,
    gateway: G,
    clock: Arc<dyn Clock>,
    fallbacks: Fallbacks,
    fallback: Fallback,
}

impl<G: fmt::Debug> fmt::Debug for Scheduler<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("fallbacks", &self.fallbacks)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl<G: TimerGateway> Scheduler<G> {
    #[must_use]
    pub fn new(store: Arc<AlarmStore>, gateway: G, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            gateway,
            clock,
            fallbacks: Fallbacks::default(),
            fallback: Fallback::RequireExact,
        }
    }

    /// text used for alarms set without a title, body or habit id
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: Fallbacks) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// whether `set` and `restore_all` accept inexact delivery when exact isn't permitted
    #[must_use]
    pub const fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<AlarmStore> {
        &self.store
    }

    #[must_use]
    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// persists the alarm, then arms its timer.
    ///
    /// # Errors
    /// - `InvalidArgument`: nothing was persisted
    /// - `PermissionDenied`/`Platform` from the timer: the record stays persisted for a later sweep
    /// - `Platform` from the store: nothing was armed
    pub fn set(&self, request: AlarmRequest) -> Result<Armed, AlarmError> {
        self.set_with(request, self.fallback)
    }

    /// same as [`set`](Self::set) for an existing id with a new time, keeping the stored text
    ///
    /// # Errors
    /// `InvalidArgument` if no alarm with `id` is stored, otherwise as [`set`](Self::set)
    pub fn reschedule(&self, id: AlarmId, new_fire_at: i64) -> Result<Armed, AlarmError> {
        let Some(current) = self.store.get(id)? else {
            return Err(AlarmError::InvalidArgument(format!("no alarm with id {id}")));
        };
        self.set(current.at(new_fire_at).into())
    }

    /// re-sets an alarm that just rang `delay` from now, from the ringing copy.
    /// accepts inexact delivery so a snoozed alarm isn't lost to a revoked permission
    ///
    /// # Errors
    /// as [`set`](Self::set)
    pub fn snooze(&self, alarm: &AlarmRecord, delay: Duration) -> Result<Armed, AlarmError> {
        let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let fire_at = self.now_millis().saturating_add(delay);
        self.set_with(alarm.at(fire_at).into(), Fallback::AllowInexact)
    }

    fn set_with(&self, request: AlarmRequest, fallback: Fallback) -> Result<Armed, AlarmError> {
        let record = request.into_record(&self.fallbacks)?;
        self.store.upsert(record.clone()).map_err(|err| {
            error!("couldn't persist alarm {}: {err}", record.id);
            AlarmError::from(err)
        })?;
        let armed = self.arm(&record, fallback)?;
        info!("alarm set: {record} ({})", armed.precision);
        Ok(armed)
    }

    fn arm(&self, record: &AlarmRecord, fallback: Fallback) -> Result<Armed, AlarmError> {
        self.gateway.arm(record, fallback).map_err(|err| {
            warn!("couldn't arm alarm {}: {err}", record.id);
            AlarmError::from_timer(record.id, err)
        })
    }

    /// removes the alarm, then disarms its timer. cancelling an unknown id succeeds
    ///
    /// # Errors
    /// `Platform` if the store can't be written or the timer facility is gone
    pub fn cancel(&self, id: AlarmId) -> Result<(), AlarmError> {
        if self.store.remove(id)?.is_none() {
            debug!("cancel: alarm {id} not stored");
        }
        self.gateway
            .disarm(id)
            .map_err(|err| AlarmError::from_timer(id, err))?;
        info!("alarm {id} cancelled");
        Ok(())
    }

    /// arms every stored alarm that is still in the future and drops the rest.
    /// each record is handled on its own, an arm failure keeps that record
    ///
    /// # Errors
    /// `Platform` if the store can't be read or written
    pub fn restore_all(&self) -> Result<RestoreReport, AlarmError> {
        let now = self.now_millis();
        let (expired, upcoming): (Vec<_>, Vec<_>) = self
            .store
            .list_all()?
            .into_iter()
            .partition(|alarm| alarm.is_due(now));

        let mut report = RestoreReport::default();
        for alarm in &upcoming {
            match self
                .arm(alarm, self.fallback)
                .and_then(|_| self.recheck_restored(alarm))
            {
                Ok(true) => report.rearmed += 1,
                Ok(false) => {}
                Err(_) => report.failed += 1,
            }
        }
        for alarm in &expired {
            debug!("skipping past alarm {alarm}");
        }
        report.pruned = self.store.prune_if_unchanged(&expired)?;
        Ok(report)
    }

    /// the snapshot a sweep works from can go stale before its timer is armed.
    /// a record cancelled in between is disarmed again, a replaced one is armed
    /// from the stored copy. `false` means nothing is left armed for it
    fn recheck_restored(&self, alarm: &AlarmRecord) -> Result<bool, AlarmError> {
        match self.store.get(alarm.id)? {
            Some(current) if current == *alarm => {
                debug!("restored alarm {alarm}");
                Ok(true)
            }
            Some(current) => {
                debug!("alarm {} changed during restore, arming {current}", alarm.id);
                self.arm(&current, self.fallback)?;
                Ok(true)
            }
            None => {
                debug!("alarm {} cancelled during restore", alarm.id);
                self.gateway
                    .disarm(alarm.id)
                    .map_err(|err| AlarmError::from_timer(alarm.id, err))?;
                Ok(false)
            }
        }
    }

    /// # Errors
    /// `Platform` if the store can't be read
    pub fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>, AlarmError> {
        Ok(self.store.get(id)?)
    }

    /// # Errors
    /// `Platform` if the store can't be read
    pub fn list(&self) -> Result<Vec<AlarmRecord>, AlarmError> {
        Ok(self.store.list_all()?)
    }
}
