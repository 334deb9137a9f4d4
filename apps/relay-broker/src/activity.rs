use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One Idle -> Active -> Idle cycle of an [`Activity`].
///
/// The loop driving the cycle holds the run and watches its token; a later
/// start gets a new run, so an old loop can never mistake it for its own.
#[derive(Debug, Clone)]
pub struct Run {
    epoch: u64,
    stop: CancellationToken,
}

impl Run {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once this run has been stopped.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

#[derive(Debug, Default)]
struct Cycle {
    epoch: u64,
    current: Option<Run>,
}

/// Idle/Active flag for one capability state machine.
///
/// Transitions happen under one lock so two concurrent starts can never both
/// win; the flag is the only source of truth for whether a loop should run.
#[derive(Debug, Default)]
pub struct Activity {
    cycle: Mutex<Cycle>,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Active. Returns `None` if already active.
    pub fn try_start(&self) -> Option<Run> {
        let mut cycle = self.cycle.lock();
        if cycle.current.is_some() {
            return None;
        }
        cycle.epoch += 1;
        let run = Run {
            epoch: cycle.epoch,
            stop: CancellationToken::new(),
        };
        cycle.current = Some(run.clone());
        Some(run)
    }

    /// Active -> Idle, stopping the current run. Returns `false` if already
    /// idle.
    pub fn try_stop(&self) -> bool {
        match self.cycle.lock().current.take() {
            Some(run) => {
                run.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Ends `run`. Goes Idle only if `run` is still the current one.
    pub fn finish(&self, run: &Run) {
        run.stop.cancel();
        let mut cycle = self.cycle.lock();
        if cycle
            .current
            .as_ref()
            .is_some_and(|current| current.epoch == run.epoch)
        {
            cycle.current = None;
        }
    }

    pub fn is_active(&self) -> bool {
        self.cycle.lock().current.is_some()
    }
}

/// Level-triggered "something is pending" signal with an explicit wake.
///
/// `raise` is coalescing: raising twice before a `take` yields one pending
/// item. `wake` releases a waiter without marking anything pending.
#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Clears the pending mark, returning whether it was set.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolves on the next `raise`/`wake`, or immediately if one arrived
    /// since the last wait.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test_timeout::timeout]
    fn start_and_stop_are_check_and_set() {
        let activity = Activity::new();
        let run = activity.try_start().expect("idle activity starts");
        assert!(activity.try_start().is_none());
        assert!(activity.is_active());
        assert!(activity.try_stop());
        assert!(run.is_stopped());
        assert!(!activity.try_stop());
        assert!(!activity.is_active());
    }

    #[test_timeout::timeout]
    fn finishing_a_stale_run_keeps_the_new_one() {
        let activity = Activity::new();
        let first = activity.try_start().unwrap();
        assert!(activity.try_stop());
        let second = activity.try_start().unwrap();
        assert!(second.epoch() > first.epoch());

        activity.finish(&first);
        assert!(activity.is_active());
        assert!(!second.is_stopped());

        activity.finish(&second);
        assert!(!activity.is_active());
        assert!(second.is_stopped());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn stop_releases_the_run() {
        let activity = Activity::new();
        let run = activity.try_start().unwrap();
        let waiter = tokio::spawn({
            let run = run.clone();
            async move { run.stopped().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        activity.try_stop();
        waiter.await.unwrap();
    }

    #[test_timeout::timeout]
    fn concurrent_starts_admit_one_winner() {
        let activity = Arc::new(Activity::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let activity = Arc::clone(&activity);
                std::thread::spawn(move || activity.try_start().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test_timeout::timeout]
    fn raise_coalesces() {
        let signal = Signal::new();
        signal.raise();
        signal.raise();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn wake_releases_waiter_without_pending() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.wake();
        waiter.await.unwrap();
        assert!(!signal.is_raised());
    }
}
