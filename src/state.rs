use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

/// Last observed upstream health, shared between the request path and the
/// background health monitor. Updated by whole-struct replacement only, so
/// readers never see fields from two different observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamStatus {
    pub is_healthy: bool,
    pub last_check: Option<SystemTime>,
    /// Proxy-level forwarded-call failures since the last success. Internal
    /// retry attempts and probe outcomes do not count.
    pub retry_count: u32,
}

/// How a forwarded chat call failed, as far as the status store cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFailureKind {
    /// Upstream rejected the bearer credential (HTTP 401).
    CredentialRejected,
    /// Upstream responded with some other non-2xx status.
    UpstreamHttp,
    /// No response at all: timeout or transport failure.
    Unreachable,
    /// The request could not be constructed locally; upstream was never
    /// contacted, so its health is unknown.
    Local,
}

#[derive(Clone)]
pub struct ProxyState {
    status: Arc<Mutex<UpstreamStatus>>,
    started_at: Instant,
}

impl ProxyState {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(UpstreamStatus::default())),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> UpstreamStatus {
        self.lock().clone()
    }

    pub fn record_chat_success(&self) {
        let mut st = self.lock();
        *st = UpstreamStatus {
            is_healthy: true,
            last_check: Some(SystemTime::now()),
            retry_count: 0,
        };
    }

    /// Counts one proxy-level failure regardless of how many attempts the
    /// upstream client made internally.
    pub fn record_chat_failure(&self, kind: ChatFailureKind) {
        let mut st = self.lock();
        let is_healthy = match kind {
            ChatFailureKind::CredentialRejected | ChatFailureKind::Unreachable => false,
            ChatFailureKind::UpstreamHttp | ChatFailureKind::Local => st.is_healthy,
        };
        *st = UpstreamStatus {
            is_healthy,
            last_check: Some(SystemTime::now()),
            retry_count: st.retry_count.saturating_add(1),
        };
    }

    /// Probe outcomes move `is_healthy` and `last_check` only.
    pub fn record_probe_result(&self, healthy: bool) {
        let mut st = self.lock();
        *st = UpstreamStatus {
            is_healthy: healthy,
            last_check: Some(SystemTime::now()),
            retry_count: st.retry_count,
        };
    }

    fn lock(&self) -> MutexGuard<'_, UpstreamStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn chat_success_resets_retry_count() {
        let state = ProxyState::new();
        state.record_chat_failure(ChatFailureKind::Unreachable);
        state.record_chat_failure(ChatFailureKind::Unreachable);
        assert_eq!(state.snapshot().retry_count, 2);

        state.record_chat_success();
        let st = state.snapshot();
        assert!(st.is_healthy);
        assert_eq!(st.retry_count, 0);
        assert!(st.last_check.is_some());
    }

    #[test]
    fn failure_kinds_affect_health_differently() {
        let state = ProxyState::new();
        state.record_chat_success();

        state.record_chat_failure(ChatFailureKind::UpstreamHttp);
        assert!(state.snapshot().is_healthy, "non-401 HTTP error keeps health");

        state.record_chat_failure(ChatFailureKind::Local);
        assert!(state.snapshot().is_healthy, "local failure keeps health");

        state.record_chat_failure(ChatFailureKind::CredentialRejected);
        assert!(!state.snapshot().is_healthy);

        state.record_chat_success();
        state.record_chat_failure(ChatFailureKind::Unreachable);
        let st = state.snapshot();
        assert!(!st.is_healthy);
        assert_eq!(st.retry_count, 1);
    }

    #[test]
    fn probe_never_touches_retry_count() {
        let state = ProxyState::new();
        state.record_chat_failure(ChatFailureKind::Unreachable);

        state.record_probe_result(true);
        let st = state.snapshot();
        assert!(st.is_healthy);
        assert_eq!(st.retry_count, 1);

        state.record_probe_result(false);
        let st = state.snapshot();
        assert!(!st.is_healthy);
        assert_eq!(st.retry_count, 1);
    }

    #[test]
    fn last_check_is_non_decreasing() {
        let state = ProxyState::new();
        state.record_probe_result(true);
        let first = state.snapshot().last_check.expect("set");
        state.record_chat_failure(ChatFailureKind::Unreachable);
        let second = state.snapshot().last_check.expect("set");
        assert!(second >= first);
    }
}
