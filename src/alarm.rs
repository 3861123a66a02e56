use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Armed/disarmed state shared between an [`Alarm`] and its listener.
///
/// The generation counter increments on every arm, re-arm and stop. A listener
/// only fires for a generation it has not fired for yet, so a signal belonging
/// to a cycle that was stopped (or replaced) before being observed is drained
/// rather than waking a later cycle.
#[derive(Debug, Clone, Copy)]
struct AlarmState {
    generation: u64,
    deadline: Option<Instant>,
}

/// The arming side of a single-shot, re-armable timer.
///
/// At most one signal is pending at a time; arming again replaces it
/// atomically. Stopping an alarm that already fired but has not been observed
/// suppresses the stale fire.
pub(crate) struct Alarm {
    state: watch::Sender<AlarmState>,
}

/// The waiting side of an [`Alarm`]. Held by the dispatcher loop.
pub(crate) struct AlarmListener {
    state: watch::Receiver<AlarmState>,
    /// Generation of the most recent fire this listener observed.
    observed: u64,
}

impl Alarm {
    pub fn new() -> (Alarm, AlarmListener) {
        let (tx, rx) = watch::channel(AlarmState {
            generation: 0,
            deadline: None,
        });
        (
            Alarm { state: tx },
            AlarmListener {
                state: rx,
                observed: 0,
            },
        )
    }

    /// Schedules a one-time signal after `ttl`.
    pub fn arm(&self, ttl: Duration) {
        self.set(Some(Instant::now() + ttl));
    }

    /// Cancels any pending signal and schedules a new one after `ttl`. The
    /// replacement is atomic: the listener can never observe the old deadline
    /// once this returns.
    pub fn rearm(&self, ttl: Duration) {
        self.set(Some(Instant::now() + ttl));
    }

    /// Cancels a pending signal. If the alarm already fired without being
    /// observed, the fire is drained and cannot wake a later arm cycle.
    pub fn stop(&self) {
        self.set(None);
    }

    fn set(&self, deadline: Option<Instant>) {
        self.state.send_modify(|state| {
            state.generation += 1;
            state.deadline = deadline;
        });
    }
}

impl AlarmListener {
    /// Resolves once the armed deadline elapses.
    ///
    /// Fires at most once per arm cycle and waits indefinitely while the alarm
    /// is disarmed, already consumed, or dropped.
    pub async fn fired(&mut self) {
        loop {
            let state = *self.state.borrow_and_update();
            let deadline = match state.deadline {
                Some(deadline) if state.generation != self.observed => deadline,
                // Disarmed, or this cycle's fire was already consumed.
                _ => {
                    if self.state.changed().await.is_err() {
                        // Alarm dropped; nothing can fire any more.
                        future::pending::<()>().await;
                    }
                    continue;
                }
            };

            tokio::select! {
                biased;
                // A re-arm or stop racing an elapsed deadline wins: re-read
                // the state rather than delivering the stale fire.
                changed = self.state.changed() => {
                    if changed.is_err() {
                        future::pending::<()>().await;
                    }
                }
                _ = sleep_until(deadline) => {
                    self.observed = state.generation;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const LONG_WAIT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn fires_at_the_armed_deadline() {
        let (alarm, mut listener) = Alarm::new();
        let armed_at = Instant::now();

        alarm.arm(Duration::from_secs(1));
        listener.fired().await;

        assert_eq!(armed_at.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_most_once_per_cycle() {
        let (alarm, mut listener) = Alarm::new();

        alarm.arm(Duration::from_secs(1));
        listener.fired().await;

        // No second fire until the alarm is armed again.
        assert!(timeout(LONG_WAIT, listener.fired()).await.is_err());

        alarm.arm(Duration::from_secs(1));
        let armed_at = Instant::now();
        listener.fired().await;
        assert_eq!(armed_at.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_the_pending_deadline() {
        let (alarm, mut listener) = Alarm::new();
        let armed_at = Instant::now();

        alarm.arm(Duration::from_secs(10));
        alarm.rearm(Duration::from_secs(1));
        listener.fired().await;

        assert_eq!(armed_at.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_alarm_does_not_fire() {
        let (alarm, mut listener) = Alarm::new();

        alarm.arm(Duration::from_secs(1));
        alarm.stop();

        assert!(timeout(LONG_WAIT, listener.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_an_unobserved_fire() {
        let (alarm, mut listener) = Alarm::new();

        // Let the deadline elapse without anyone waiting on the listener,
        // then stop. The elapsed fire must not wake a later wait.
        alarm.arm(Duration::from_secs(1));
        advance(Duration::from_secs(2)).await;
        alarm.stop();

        assert!(timeout(LONG_WAIT, listener.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_alarm_never_fires() {
        let (_alarm, mut listener) = Alarm::new();
        assert!(timeout(LONG_WAIT, listener.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_pending_wait_does_not_lose_the_fire() {
        use std::future::Future;
        use std::task::Context;

        let (alarm, mut listener) = Alarm::new();
        alarm.arm(Duration::from_secs(1));

        // Poll a wait once, then drop it, as a lost `select!` branch would.
        {
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            let mut wait = Box::pin(listener.fired());
            assert!(wait.as_mut().poll(&mut cx).is_pending());
        }

        let armed_at = Instant::now();
        listener.fired().await;
        assert_eq!(armed_at.elapsed(), Duration::from_secs(1));
    }
}
