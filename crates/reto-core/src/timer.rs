//! Repeating timer with multiplicative backoff
//!
//! Precision is best-effort: firings ride on the tokio timer wheel and may
//! land late under load. Stopping is a hard barrier — once `stop` returns
//! the action will not run again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Action invoked on each firing, with the zero-based execution count
pub type TimerAction = Arc<dyn Fn(u32) + Send + Sync>;

/// Delay schedule: `min(initial_delay * backoff_factor^k, maximum_delay)`
#[derive(Debug, Clone)]
pub struct BackoffSettings {
    /// Delay before the first firing
    pub initial_delay: Duration,
    /// Multiplier applied per firing; must be >= 1.0
    pub backoff_factor: f64,
    /// Upper bound on the delay
    pub maximum_delay: Duration,
}

impl BackoffSettings {
    /// Fixed-delay schedule with no backoff
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            backoff_factor: 1.0,
            maximum_delay: delay,
        }
    }

    /// Delay before firing number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.maximum_delay.as_secs_f64() {
            self.maximum_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            maximum_delay: Duration::from_secs(5),
        }
    }
}

/// Fires an action repeatedly on a backoff schedule
pub struct RepeatingTimer {
    settings: BackoffSettings,
    active: Mutex<Option<ActiveTimer>>,
}

struct ActiveTimer {
    // the firing task checks this under its lock before each invocation,
    // so setting it under the same lock makes `stop` a barrier
    stopped: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl RepeatingTimer {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            active: Mutex::new(None),
        }
    }

    /// Whether the timer is currently armed
    pub fn is_running(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Arm the timer; a no-op if it is already armed
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, action: TimerAction) {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return;
        }

        let stopped = Arc::new(Mutex::new(false));
        let task = tokio::spawn({
            let stopped = Arc::clone(&stopped);
            let settings = self.settings.clone();
            async move {
                let mut attempt = 0u32;
                loop {
                    tokio::time::sleep(settings.delay_for(attempt)).await;
                    {
                        let guard = stopped.lock().unwrap();
                        if *guard {
                            return;
                        }
                        action(attempt);
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        });
        *active = Some(ActiveTimer { stopped, task });
    }

    /// Disarm the timer; idempotent
    ///
    /// Guarantees the action is never invoked again after this returns.
    pub fn stop(&self) {
        let mut active = self.active.lock().unwrap();
        if let Some(timer) = active.take() {
            *timer.stopped.lock().unwrap() = true;
            timer.task.abort();
        }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let settings = BackoffSettings {
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            maximum_delay: Duration::from_millis(500),
        };
        assert_eq!(settings.delay_for(0), Duration::from_millis(100));
        assert_eq!(settings.delay_for(1), Duration::from_millis(200));
        assert_eq!(settings.delay_for(2), Duration::from_millis(400));
        assert_eq!(settings.delay_for(3), Duration::from_millis(500));
        assert_eq!(settings.delay_for(30), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_schedule_is_monotonic_and_capped() {
        let settings = BackoffSettings::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = settings.delay_for(attempt);
            assert!(delay >= previous);
            assert!(delay <= settings.maximum_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_constant_schedule() {
        let settings = BackoffSettings::constant(Duration::from_millis(50));
        assert_eq!(settings.delay_for(0), Duration::from_millis(50));
        assert_eq!(settings.delay_for(10), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_execution_count() {
        let timer = RepeatingTimer::new(BackoffSettings::constant(Duration::from_millis(10)));
        let count = Arc::new(AtomicU32::new(0));

        let seen = Arc::clone(&count);
        timer.start(Arc::new(move |attempt| {
            assert_eq!(attempt, seen.fetch_add(1, Ordering::SeqCst));
        }));

        tokio::time::sleep(Duration::from_millis(35)).await;
        timer.stop();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_firings() {
        let timer = RepeatingTimer::new(BackoffSettings::constant(Duration::from_millis(10)));
        let count = Arc::new(AtomicU32::new(0));

        let seen = Arc::clone(&count);
        timer.start(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(15)).await;
        timer.stop();
        let after_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let timer = RepeatingTimer::new(BackoffSettings::constant(Duration::from_secs(60)));
        timer.start(Arc::new(|_| {}));
        timer.start(Arc::new(|_| panic!("second action must not be armed")));
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.is_running());
        timer.stop();
    }
}
