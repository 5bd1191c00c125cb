//! # Session Lifecycle
//!
//! One session is one request streamed from start to terminal state. The
//! controller owns the session's cancellation token and its teardown, and is
//! the only place that decides the terminal state.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created, nothing running yet
//! 2. **Active**: engine output is flowing
//! 3. **Completed**: every byte was relayed or rendered
//! 4. **Aborted**: cancelled by the producer, the consumer or an outside caller
//! 5. **Failed**: a framing, process, overflow or sink error ended the session
//!
//! Only an Active session can complete. Aborted and Failed are also reachable
//! from Idle, for a session cancelled or refused before it started.
//! Terminal states absorb every later transition. Whichever transition wins
//! runs teardown, and teardown runs exactly once: the token is cancelled so
//! every stage stops at its next boundary, then the registered release hooks
//! (ring buffer, render resources, engine handle) run in order.

use crate::audio::buffer::RingStats;
use crate::audio::processor::RenderStats;
use crate::error::RelayError;
use crate::protocol::SpeechRequest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cancellation handle shared by every stage of a session.
///
/// `is_cancelled()` is a plain atomic load for the render tick; `cancelled()`
/// is the broadcast side for stages parked in `tokio::select!`.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    flag: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Cancel the token. Returns true only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.tx.send_replace(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. Cancel-safe.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives as long as the token, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Current status of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Completed,
    Aborted(String),
    Failed(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted(_) => "aborted",
            SessionStatus::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted(_) | SessionStatus::Failed(_)
        )
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SessionStatus::Aborted(reason) | SessionStatus::Failed(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Which side of the pipeline asked for an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    /// Engine output or inbound channel
    Producer,
    /// Renderer or sink
    Consumer,
    /// Signal handler, disconnected caller, host shutdown
    External,
}

impl AbortOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortOrigin::Producer => "producer",
            AbortOrigin::Consumer => "consumer",
            AbortOrigin::External => "external",
        }
    }
}

/// The request being served plus the counters the relay stages update.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub text: String,
    pub voice: String,
    pub created_at: DateTime<Utc>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    end_of_stream: AtomicBool,
}

impl Session {
    pub fn new(request: &SpeechRequest) -> Self {
        Self::with_parts(request.text.clone(), request.voice.clone())
    }

    /// A session fed by a remote host: the request text is not known here.
    pub fn inbound() -> Self {
        Self::with_parts(String::new(), "remote".to_string())
    }

    fn with_parts(text: String, voice: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            voice,
            created_at: Utc::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            end_of_stream: AtomicBool::new(false),
        }
    }

    /// PCM bytes that entered this side's ring buffer.
    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// PCM bytes written to the outbound channel.
    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::SeqCst);
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct Lifecycle {
    status: SessionStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_kind: Option<&'static str>,
    ring: Option<RingStats>,
    render: Option<RenderStats>,
}

/// Owns one session's state machine, token and teardown.
pub struct SessionController {
    session: Arc<Session>,
    token: CancelToken,
    lifecycle: Mutex<Lifecycle>,
    hooks: Mutex<Vec<ReleaseHook>>,
    torn_down: AtomicBool,
    releases: AtomicU64,
}

impl SessionController {
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(session),
            token: CancelToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::Idle,
                started_at: None,
                finished_at: None,
                error_kind: None,
                ring: None,
                render: None,
            }),
            hooks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            releases: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lifecycle().status.clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a resource release to run at teardown.
    ///
    /// If the session already tore down, the hook runs immediately.
    pub fn on_teardown(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.torn_down.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Idle → Active. Returns false if the session already left Idle.
    pub fn begin(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.status != SessionStatus::Idle {
            return false;
        }
        lifecycle.status = SessionStatus::Active;
        lifecycle.started_at = Some(Utc::now());
        info!(
            session_id = %self.session.id,
            voice = %self.session.voice,
            chars = self.session.text.chars().count(),
            "Session started"
        );
        true
    }

    /// Natural end of the stream. Refused unless the session is Active.
    pub fn complete(&self) -> bool {
        if self.lifecycle().status != SessionStatus::Active {
            debug!(session_id = %self.session.id, "Completion ignored outside Active");
            return false;
        }
        self.transition(SessionStatus::Completed, None)
    }

    /// Cancel the session. A no-op once the session is terminal.
    pub fn abort(&self, origin: AbortOrigin, reason: &str) -> bool {
        let aborted = self.transition(SessionStatus::Aborted(reason.to_string()), Some("aborted"));
        if aborted {
            info!(
                session_id = %self.session.id,
                origin = origin.as_str(),
                reason,
                "Session aborted"
            );
        }
        aborted
    }

    /// End the session because of an error. Cancellation errors abort instead of fail.
    pub fn fail(&self, origin: AbortOrigin, err: &RelayError) -> bool {
        if !err.is_failure() {
            return self.abort(origin, &err.to_string());
        }
        let failed = self.transition(SessionStatus::Failed(err.to_string()), Some(err.kind()));
        if failed {
            warn!(
                session_id = %self.session.id,
                origin = origin.as_str(),
                kind = err.kind(),
                error = %err,
                "Session failed"
            );
        }
        failed
    }

    /// Abort this session if `signal` fires before the session ends on its own.
    ///
    /// Returns once the session is terminal either way, so it can be joined
    /// with the future driving the session.
    pub async fn abort_on(&self, signal: &CancelToken, reason: &str) {
        tokio::select! {
            _ = signal.cancelled() => {
                self.abort(AbortOrigin::External, reason);
            }
            _ = self.token.cancelled() => {}
        }
    }

    /// Record pipeline statistics for the report. Later calls overwrite earlier ones.
    pub fn record_ring_stats(&self, stats: RingStats) {
        self.lifecycle().ring = Some(stats);
    }

    pub fn record_render_stats(&self, stats: RenderStats) {
        self.lifecycle().render = Some(stats);
    }

    fn transition(&self, next: SessionStatus, error_kind: Option<&'static str>) -> bool {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.status.is_terminal() {
                debug!(
                    session_id = %self.session.id,
                    status = lifecycle.status.as_str(),
                    ignored = next.as_str(),
                    "Session already terminal"
                );
                return false;
            }
            lifecycle.status = next;
            lifecycle.finished_at = Some(Utc::now());
            lifecycle.error_kind = error_kind;
        }
        self.teardown();
        true
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let hooks = {
            let mut hooks = match self.hooks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %self.session.id, "Session resources released");
    }

    /// How many times teardown ran. Always 0 or 1.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> SessionReport {
        let lifecycle = self.lifecycle();
        let elapsed_ms = match (lifecycle.started_at, lifecycle.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        SessionReport {
            id: self.session.id,
            voice: self.session.voice.clone(),
            text_chars: self.session.text.chars().count(),
            status: lifecycle.status.as_str().to_string(),
            reason: lifecycle.status.reason().map(str::to_string),
            error_kind: lifecycle.error_kind,
            bytes_in: self.session.bytes_in(),
            bytes_out: self.session.bytes_out(),
            end_of_stream: self.session.is_end_of_stream(),
            created_at: self.session.created_at,
            finished_at: lifecycle.finished_at,
            elapsed_ms,
            ring: lifecycle.ring,
            render: lifecycle.render,
        }
    }
}

/// Serialisable summary of a finished (or running) session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub voice: String,
    pub text_chars: usize,
    pub status: String,
    pub reason: Option<String>,
    pub error_kind: Option<&'static str>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub end_of_stream: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub ring: Option<RingStats>,
    pub render: Option<RenderStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn controller() -> SessionController {
        SessionController::new(Session::new(&SpeechRequest::new("hi", "male")))
    }

    fn counting_hook(controller: &SessionController) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        controller.on_teardown(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_abort_twice_releases_once() {
        let controller = controller();
        let released = counting_hook(&controller);
        assert!(controller.begin());

        assert!(controller.abort(AbortOrigin::External, "stop"));
        assert!(!controller.abort(AbortOrigin::Consumer, "stop again"));

        assert_eq!(controller.status(), SessionStatus::Aborted("stop".to_string()));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(controller.releases(), 1);
        assert!(controller.token().is_cancelled());
    }

    #[test]
    fn test_abort_after_completion_is_noop() {
        let controller = controller();
        let released = counting_hook(&controller);
        controller.begin();

        assert!(controller.complete());
        assert!(!controller.abort(AbortOrigin::Producer, "late"));
        assert!(!controller.fail(AbortOrigin::Producer, &RelayError::Process("late".to_string())));

        assert_eq!(controller.status(), SessionStatus::Completed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(controller.releases(), 1);
    }

    #[test]
    fn test_abort_error_is_not_a_failure() {
        let controller = controller();
        controller.begin();
        controller.fail(AbortOrigin::External, &RelayError::Aborted("signal".to_string()));
        assert_eq!(controller.status().as_str(), "aborted");
        assert_eq!(controller.report().error_kind, Some("aborted"));
    }

    #[test]
    fn test_failure_report() {
        let controller = controller();
        controller.begin();
        controller.session().add_bytes_out(512);
        controller.fail(
            AbortOrigin::Producer,
            &RelayError::Process("exit status: 1".to_string()),
        );

        let report = controller.report();
        assert_eq!(report.status, "failed");
        assert_eq!(report.error_kind, Some("process"));
        assert_eq!(report.bytes_out, 512);
        assert!(report.reason.unwrap().contains("exit status: 1"));
        assert!(report.elapsed_ms.is_some());
    }

    #[test]
    fn test_hook_registered_after_teardown_runs_immediately() {
        let controller = controller();
        controller.begin();
        controller.complete();
        let released = counting_hook(&controller);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_begin_only_from_idle() {
        let controller = controller();
        assert!(controller.begin());
        assert!(!controller.begin());
        controller.complete();
        assert!(!controller.begin());
    }

    #[test]
    fn test_idle_session_cannot_complete_but_can_abort() {
        let controller = controller();
        let released = counting_hook(&controller);

        assert!(!controller.complete());
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(controller.releases(), 0);

        assert!(controller.abort(AbortOrigin::External, "cancelled before start"));
        assert_eq!(controller.status().as_str(), "aborted");
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!controller.begin());
    }

    #[tokio::test]
    async fn test_abort_on_signal() {
        let controller = controller();
        controller.begin();
        let signal = CancelToken::new();
        signal.cancel();
        controller.abort_on(&signal, "interrupted").await;
        assert_eq!(controller.status(), SessionStatus::Aborted("interrupted".to_string()));

        // Returns without aborting once the session ended on its own
        let done = self::controller();
        done.begin();
        done.complete();
        done.abort_on(&CancelToken::new(), "unused").await;
        assert_eq!(done.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        assert!(token.cancel());
        assert!(!token.cancel());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already-cancelled tokens resolve immediately
        token.cancelled().await;
    }
}
