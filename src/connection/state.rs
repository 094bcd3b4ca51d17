// Connection lifecycle as data
//
// idle -> connecting -> open -> { closing -> idle | faulted -> reconnecting -> connecting }
//
// `transition` is pure: the manager feeds it the current state, an event and
// the retry budget, then carries out the returned action.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;

use crate::error::VoiceError;
use crate::protocol::NORMAL_CLOSURE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Faulted,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller `connect()` or a retry whose backoff elapsed
    Connect,
    TransportReady,
    ConnectFailed,
    ConnectTimeout,
    /// Transport closed with a close code
    Closed { code: u16 },
    TransportError,
    /// No inbound message within the staleness threshold
    HeartbeatStale,
    BackoffElapsed,
    CloseRequested,
    CloseComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    /// Dial a new transport
    OpenTransport,
    /// Transport is up: reset the retry counter, start the heartbeat
    StartHeartbeat,
    /// Release the transport without retrying
    Teardown,
    /// Release the transport and retry after the backoff for `attempt`
    ScheduleReconnect { attempt: u32 },
    /// Release the transport; retry budget is spent
    Exhausted { attempts: u32 },
    /// Refuse the request
    Reject(VoiceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub action: Action,
}

impl Transition {
    fn to(next: ConnectionState, action: Action) -> Self {
        Self { next, action }
    }

    fn stay(state: ConnectionState) -> Self {
        Self::to(state, Action::None)
    }
}

/// Reconnects already scheduled vs. allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub max: u32,
}

pub fn transition(state: ConnectionState, event: ConnectionEvent, budget: RetryBudget) -> Transition {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Idle | S::Faulted | S::Reconnecting, E::Connect) => {
            Transition::to(S::Connecting, Action::OpenTransport)
        }
        (S::Connecting, E::Connect) => Transition::to(S::Connecting, Action::Reject(VoiceError::AlreadyConnecting)),
        (S::Open, E::Connect) => Transition::stay(S::Open),
        (S::Closing, E::Connect) => Transition::to(
            S::Closing,
            Action::Reject(VoiceError::Transport("close in progress".to_string())),
        ),

        (S::Connecting, E::TransportReady) => Transition::to(S::Open, Action::StartHeartbeat),
        (S::Connecting, E::ConnectFailed | E::ConnectTimeout | E::TransportError) => fault(budget),
        (S::Connecting, E::Closed { .. }) => fault(budget),

        (S::Open, E::Closed { code }) if code == NORMAL_CLOSURE => {
            Transition::to(S::Idle, Action::Teardown)
        }
        (S::Open, E::Closed { .. } | E::TransportError | E::HeartbeatStale) => fault(budget),

        (S::Faulted, E::BackoffElapsed) => Transition::stay(S::Reconnecting),

        (S::Idle, E::CloseRequested) => Transition::stay(S::Idle),
        (S::Closing, E::CloseRequested) => Transition::stay(S::Closing),
        (_, E::CloseRequested) => Transition::to(S::Closing, Action::Teardown),
        (S::Closing, E::CloseComplete) => Transition::stay(S::Idle),

        // Late events from a transport that is already gone
        (state, _) => Transition::stay(state),
    }
}

fn fault(budget: RetryBudget) -> Transition {
    if budget.attempts >= budget.max {
        Transition::to(
            ConnectionState::Idle,
            Action::Exhausted {
                attempts: budget.attempts,
            },
        )
    } else {
        Transition::to(
            ConnectionState::Faulted,
            Action::ScheduleReconnect {
                attempt: budget.attempts + 1,
            },
        )
    }
}

/// Exponential backoff with a cap plus proportional jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the computed delay added at random (0.3 = up to +30%)
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

impl Backoff {
    /// Delay before retry `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Delay with a caller-supplied jitter sample in [0, 1]
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.base_delay(attempt);
        delay + delay.mul_f64(self.jitter * sample.clamp(0.0, 1.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    const FRESH: RetryBudget = RetryBudget { attempts: 0, max: 5 };

    #[test]
    fn test_connect_from_idle() {
        let t = transition(S::Idle, E::Connect, FRESH);
        assert_eq!(t, Transition::to(S::Connecting, Action::OpenTransport));
    }

    #[test]
    fn test_second_connect_is_rejected() {
        let t = transition(S::Connecting, E::Connect, FRESH);
        assert_eq!(t.action, Action::Reject(VoiceError::AlreadyConnecting));
        assert_eq!(t.next, S::Connecting);
    }

    #[test]
    fn test_connect_when_open_is_noop() {
        assert_eq!(transition(S::Open, E::Connect, FRESH), Transition::stay(S::Open));
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let t = transition(S::Open, E::Closed { code: 1000 }, FRESH);
        assert_eq!(t, Transition::to(S::Idle, Action::Teardown));
    }

    #[test]
    fn test_abnormal_close_schedules_reconnect() {
        for code in [1001, 1006, 1011, 4000] {
            let t = transition(S::Open, E::Closed { code }, FRESH);
            assert_eq!(t, Transition::to(S::Faulted, Action::ScheduleReconnect { attempt: 1 }));
        }
    }

    #[test]
    fn test_stale_heartbeat_faults() {
        let t = transition(S::Open, E::HeartbeatStale, RetryBudget { attempts: 2, max: 5 });
        assert_eq!(t.action, Action::ScheduleReconnect { attempt: 3 });
    }

    #[test]
    fn test_timeout_while_connecting_faults() {
        let t = transition(S::Connecting, E::ConnectTimeout, FRESH);
        assert_eq!(t.next, S::Faulted);
    }

    #[test]
    fn test_budget_exhaustion() {
        let t = transition(S::Connecting, E::ConnectFailed, RetryBudget { attempts: 5, max: 5 });
        assert_eq!(t, Transition::to(S::Idle, Action::Exhausted { attempts: 5 }));
    }

    #[test]
    fn test_reconnect_path() {
        let t = transition(S::Faulted, E::BackoffElapsed, FRESH);
        assert_eq!(t.next, S::Reconnecting);
        let t = transition(S::Reconnecting, E::Connect, FRESH);
        assert_eq!(t, Transition::to(S::Connecting, Action::OpenTransport));
    }

    #[test]
    fn test_close_from_any_state() {
        for state in [S::Connecting, S::Open, S::Faulted, S::Reconnecting] {
            let t = transition(state, E::CloseRequested, FRESH);
            assert_eq!(t, Transition::to(S::Closing, Action::Teardown));
        }
        assert_eq!(transition(S::Idle, E::CloseRequested, FRESH).next, S::Idle);
        assert_eq!(transition(S::Closing, E::CloseComplete, FRESH).next, S::Idle);
    }

    #[test]
    fn test_late_events_are_ignored() {
        assert_eq!(
            transition(S::Idle, E::Closed { code: 1006 }, FRESH),
            Transition::stay(S::Idle)
        );
        assert_eq!(
            transition(S::Faulted, E::TransportReady, FRESH),
            Transition::stay(S::Faulted)
        );
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=6).map(|a| backoff.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_with(3, 0.0), Duration::from_secs(4));
        assert_eq!(backoff.delay_with(3, 1.0), Duration::from_millis(5200));

        for _ in 0..100 {
            let d = backoff.delay(4);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_millis(10_400));
        }
    }
}
