//! Retryable actions and start/stop intent convergence
//!
//! A [`RetryableActionExecutor`] keeps firing a non-blocking action until it
//! is told the action succeeded. A [`StartStopHelper`] combines two of them
//! so that independently arriving start/stop requests and out-of-band state
//! changes converge on the last requested intent.

use std::sync::{Arc, Mutex};

use crate::timer::{BackoffSettings, RepeatingTimer, TimerAction};

/// Non-blocking action receiving the attempt number (0 for the immediate
/// invocation, 1.. for timer-driven retries). Outcome is reported
/// asynchronously through `on_success` / `on_fail`.
pub type RetryAction = Arc<dyn Fn(u32) + Send + Sync>;

/// Fires an action immediately and retries it on a backoff schedule until
/// success is reported
pub struct RetryableActionExecutor {
    action: RetryAction,
    timer: RepeatingTimer,
    started: Mutex<bool>,
}

impl RetryableActionExecutor {
    pub fn new(action: RetryAction, settings: BackoffSettings) -> Self {
        Self {
            action,
            timer: RepeatingTimer::new(settings),
            started: Mutex::new(false),
        }
    }

    /// Fire attempt 0 and arm the retry timer; idempotent
    pub fn start(&self) {
        {
            let mut started = self.started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }
        (self.action)(0);
        self.arm_timer();
    }

    /// The action reported success; retries stop
    pub fn on_success(&self) {
        self.stop();
    }

    /// The action reported failure; re-arm the retry timer if it is idle
    ///
    /// Results reported after `stop` are advisory and ignored.
    pub fn on_fail(&self) {
        let started = self.started.lock().unwrap();
        if *started && !self.timer.is_running() {
            self.arm_timer();
        }
    }

    /// Stop retrying; idempotent
    pub fn stop(&self) {
        *self.started.lock().unwrap() = false;
        self.timer.stop();
    }

    /// Whether the executor is between `start` and `on_success`/`stop`
    pub fn is_started(&self) -> bool {
        *self.started.lock().unwrap()
    }

    fn arm_timer(&self) {
        let action = Arc::clone(&self.action);
        let timer_action: TimerAction = Arc::new(move |attempt| action(attempt + 1));
        self.timer.start(timer_action);
    }
}

/// The state a [`StartStopHelper`] is converging toward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Started,
    Stopped,
}

/// Drives a pair of executors so the last requested intent wins
///
/// External events may flip the actual state at any time; the confirm
/// methods feed those observations back in, and the helper restarts
/// whichever executor moves the system toward the desired state.
pub struct StartStopHelper {
    starter: RetryableActionExecutor,
    stopper: RetryableActionExecutor,
    desired: Mutex<DesiredState>,
}

impl StartStopHelper {
    pub fn new(
        start_action: RetryAction,
        start_settings: BackoffSettings,
        stop_action: RetryAction,
        stop_settings: BackoffSettings,
    ) -> Self {
        Self {
            starter: RetryableActionExecutor::new(start_action, start_settings),
            stopper: RetryableActionExecutor::new(stop_action, stop_settings),
            desired: Mutex::new(DesiredState::Stopped),
        }
    }

    /// Request the started state
    pub fn start(&self) {
        *self.desired.lock().unwrap() = DesiredState::Started;
        self.stopper.stop();
        self.starter.start();
    }

    /// Request the stopped state
    pub fn stop(&self) {
        *self.desired.lock().unwrap() = DesiredState::Stopped;
        self.starter.stop();
        self.stopper.start();
    }

    /// The system was observed started
    pub fn confirm_start_occurred(&self) {
        self.starter.stop();
        if *self.desired.lock().unwrap() == DesiredState::Stopped {
            self.stopper.start();
        }
    }

    /// The system was observed stopped
    pub fn confirm_stop_occurred(&self) {
        self.stopper.stop();
        if *self.desired.lock().unwrap() == DesiredState::Started {
            self.starter.start();
        }
    }

    /// The in-flight start attempt failed
    pub fn start_failed(&self) {
        self.starter.on_fail();
    }

    /// The in-flight stop attempt failed
    pub fn stop_failed(&self) {
        self.stopper.on_fail();
    }

    pub fn desired_state(&self) -> DesiredState {
        *self.desired.lock().unwrap()
    }

    /// Whether the starter is currently driving
    pub fn starter_running(&self) -> bool {
        self.starter.is_started()
    }

    /// Whether the stopper is currently driving
    pub fn stopper_running(&self) -> bool {
        self.stopper.is_started()
    }
}
