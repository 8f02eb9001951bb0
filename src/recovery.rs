use log::{error, info};

use crate::{
    scheduler::{RestoreReport, Scheduler},
    timer::TimerGateway,
};

/// The startup sweep: re-arms every stored alarm that is still ahead and drops
/// the ones that passed while nothing was running. Timers live in the process,
/// so this runs on every start, not only after a reboot.
///
/// Failures are logged and never stop startup.
pub fn sweep<G: TimerGateway>(scheduler: &Scheduler<G>) -> Option<RestoreReport> {
    info!("restoring saved alarms");
    match scheduler.restore_all() {
        Ok(report) => {
            info!("restored alarms: {report}");
            Some(report)
        }
        Err(err) => {
            error!("couldn't restore alarms: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        alarm::AlarmRecord, clock::ManualClock, store::AlarmStore, timer::fake::FakeGateway,
    };

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn sweep_after_corruption_starts_empty() {
        let store = Arc::new(AlarmStore::in_memory());
        store.write_raw("[{\"id\":").unwrap();
        let scheduler = Scheduler::new(
            store,
            FakeGateway::default(),
            Arc::new(ManualClock::new(NOW)),
        );
        assert_eq!(sweep(&scheduler), Some(RestoreReport::default()));
    }

    #[test]
    fn sweep_rearms_future_alarms() {
        let store = Arc::new(AlarmStore::in_memory());
        for (id, fire_at) in [(1, NOW - 5_000), (2, NOW + 5_000), (3, NOW + 50_000)] {
            store
                .upsert(AlarmRecord::new(id, fire_at, "t", "b", "h"))
                .unwrap();
        }
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            FakeGateway::default(),
            Arc::new(ManualClock::new(NOW)),
        );
        let report = sweep(&scheduler).unwrap();
        assert_eq!((report.rearmed, report.pruned), (2, 1));
        assert_eq!(scheduler.gateway().armed_count(), 2);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }
}
