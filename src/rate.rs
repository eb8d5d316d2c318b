use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::lifecycle::Lifecycle;

/// Hold applied when the upstream rate-limits without naming a window.
pub const NO_WINDOW_HOLD: Duration = Duration::from_millis(500);

/// Shared per-platform throttle deadline. The upstream quota is per
/// platform/credential, so one worker observing a throttle signal must stall
/// the whole pool.
///
/// The deadline is a single epoch-millis atomic advanced with `fetch_max`:
/// concurrent observers can only extend it, never shorten another worker's
/// wait.
#[derive(Debug, Default)]
pub struct RateGate {
    until_ms: AtomicI64,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an upstream-signaled resume instant. Monotonic: keeps the
    /// later of the stored and observed deadlines.
    pub fn throttle_until(&self, deadline: DateTime<Utc>) {
        self.until_ms
            .fetch_max(deadline.timestamp_millis(), Ordering::SeqCst);
    }

    /// Convenience for fixed holds (429 with no explicit window).
    pub fn hold_for(&self, dur: Duration) {
        let deadline = Utc::now() + chrono::Duration::milliseconds(dur.as_millis() as i64);
        self.throttle_until(deadline);
    }

    /// Current deadline, if it is still in the future.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let ms = self.until_ms.load(Ordering::SeqCst);
        if ms <= Utc::now().timestamp_millis() {
            return None;
        }
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Suspend until the gate is open. Re-checks after every sleep because
    /// another worker may have extended the deadline meanwhile. Returns early
    /// on shutdown.
    pub async fn wait_ready(&self, life: &Lifecycle) {
        while !life.is_shutdown() {
            let now_ms = Utc::now().timestamp_millis();
            let until_ms = self.until_ms.load(Ordering::SeqCst);
            if until_ms <= now_ms {
                return;
            }
            let wait = Duration::from_millis((until_ms - now_ms) as u64);
            if life.sleep_unless_shutdown(wait).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn deadline_is_monotonic_max() {
        let gate = RateGate::new();
        let d1 = Utc::now() + chrono::Duration::seconds(5);
        let d2 = Utc::now() + chrono::Duration::seconds(30);
        // Later deadline first; the earlier one must not shorten it.
        gate.throttle_until(d2);
        gate.throttle_until(d1);
        assert_eq!(
            gate.deadline().map(|d| d.timestamp_millis()),
            Some(d2.timestamp_millis())
        );
    }

    #[test]
    fn open_when_deadline_passed() {
        let gate = RateGate::new();
        gate.throttle_until(Utc::now() - chrono::Duration::seconds(1));
        assert!(gate.deadline().is_none());
    }

    #[tokio::test]
    async fn second_worker_observes_first_workers_deadline() {
        let gate = Arc::new(RateGate::new());
        let life = Lifecycle::new();
        gate.hold_for(Duration::from_millis(80));

        // A worker arriving later must wait out the original deadline, not
        // start its own shorter one.
        let started = std::time::Instant::now();
        gate.wait_ready(&life).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60), "released too early: {elapsed:?}");

        // Gate is open afterwards.
        gate.wait_ready(&life).await;
        assert!(gate.deadline().is_none());
    }
}
