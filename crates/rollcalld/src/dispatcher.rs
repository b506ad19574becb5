//! Routes bus messages to transfer sessions and hands finished images to
//! the worker pool.
//!
//! Everything here runs on the transport's delivery task, so nothing may
//! block on recognition work: handlers only touch the session registry,
//! the credential table and the rate buckets, then at most enqueue a job.

use crate::access::{fingerprint, AccessGuard};
use crate::config::RateLimit;
use crate::ledger::validate_group;
use crate::pool::{PoolError, PoolHandle, RecognitionReply, ResultSink};
use crate::transfer::{FragmentStatus, SessionRegistry, TransferError, TransferMeta};
use std::sync::Arc;
use std::time::Instant;

/// Topic filters the dispatcher consumes.
pub const SUBSCRIPTIONS: [&str; 3] = ["image/+/meta", "image/+/chunk/+", "image/+/done"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Meta,
    Chunk(usize),
    Done,
}

/// Split an inbound topic into its group and message kind.
pub fn parse_topic(topic: &str) -> Option<(&str, Inbound)> {
    let mut parts = topic.split('/');
    if parts.next()? != "image" {
        return None;
    }
    let group = parts.next().filter(|g| !g.is_empty())?;
    let kind = match (parts.next()?, parts.next()) {
        ("meta", None) => Inbound::Meta,
        ("done", None) => Inbound::Done,
        ("chunk", Some(index)) => Inbound::Chunk(index.parse().ok()?),
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((group, kind))
}

pub fn result_topic(group: &str) -> String {
    format!("result/{group}")
}

pub struct IngestDispatcher {
    sessions: Arc<SessionRegistry>,
    access: Arc<AccessGuard>,
    pool: PoolHandle,
    sink: Arc<dyn ResultSink>,
    auth_limit: RateLimit,
    submit_limit: RateLimit,
}

impl IngestDispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        access: Arc<AccessGuard>,
        pool: PoolHandle,
        sink: Arc<dyn ResultSink>,
        auth_limit: RateLimit,
        submit_limit: RateLimit,
    ) -> Self {
        Self {
            sessions,
            access,
            pool,
            sink,
            auth_limit,
            submit_limit,
        }
    }

    /// Handle one inbound message. Unknown topics are ignored.
    pub fn handle(&self, topic: &str, payload: &[u8]) {
        let Some((group, kind)) = parse_topic(topic) else {
            tracing::debug!(topic, "ignoring message on unexpected topic");
            return;
        };
        let now = Instant::now();
        match kind {
            Inbound::Meta => self.begin(group, payload, now),
            Inbound::Chunk(index) => self.fragment(group, index, payload, now),
            Inbound::Done => self.finish(group),
        }
    }

    fn reject(&self, group: &str, error: impl Into<String>) {
        self.sink.publish(group, &RecognitionReply::unknown(error));
    }

    fn begin(&self, group: &str, payload: &[u8], now: Instant) {
        if !validate_group(group) {
            tracing::warn!(len = group.len(), "rejecting transfer for invalid group name");
            let e = TransferError::InvalidMetadata("invalid group name".into());
            self.reject(group, e.to_string());
            return;
        }

        let meta = match TransferMeta::parse(payload) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(group, error = %e, "rejecting transfer");
                self.reject(group, e.to_string());
                return;
            }
        };
        if meta.group != group {
            let e = TransferError::InvalidMetadata(format!(
                "group {:?} does not match topic group {group:?}",
                meta.group
            ));
            tracing::warn!(group, error = %e, "rejecting transfer");
            self.reject(group, e.to_string());
            return;
        }

        // Only failed attempts count against the group's auth budget.
        if !self.access.verify(&meta.credential, group) {
            let limit = self.auth_limit;
            if !self
                .access
                .rate_limit(&format!("auth:{group}"), limit.limit, limit.window)
            {
                tracing::warn!(group, "authentication attempts rate limited");
                self.reject(group, "rate limited");
            } else {
                tracing::warn!(group, "unauthorized transfer attempt");
                self.reject(group, "unauthorized");
            }
            return;
        }

        let key = fingerprint(&meta.credential);
        let limit = self.submit_limit;
        if !self
            .access
            .rate_limit(&format!("submit:{key}"), limit.limit, limit.window)
        {
            tracing::warn!(group, credential = %key, "submission rate limited");
            self.reject(group, "rate limited");
            return;
        }

        if let Err(e) = self
            .sessions
            .begin(group, meta.chunks, meta.total_size, &key, now)
        {
            tracing::warn!(group, chunks = meta.chunks, error = %e, "rejecting transfer");
            self.reject(group, e.to_string());
        }
    }

    fn fragment(&self, group: &str, index: usize, payload: &[u8], now: Instant) {
        match self.sessions.fragment(group, index, payload, now) {
            Ok(FragmentStatus::Stored { distinct, expected }) => {
                tracing::trace!(group, index, distinct, expected, "fragment stored");
            }
            Ok(FragmentStatus::Ignored) => {}
            Err(e) => self.reject(group, e.to_string()),
        }
    }

    fn finish(&self, group: &str) {
        let done = match self.sessions.finish(group) {
            Ok(Some(done)) => done,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(group, error = %e, "transfer failed");
                self.reject(group, e.to_string());
                return;
            }
        };

        let bytes = done.image.len();
        match self.pool.try_submit(group.to_string(), done.image) {
            Ok(()) => {
                tracing::debug!(
                    group,
                    session = %done.session_id,
                    credential = %done.opened_by,
                    bytes,
                    "image queued for recognition"
                );
            }
            Err(e @ PoolError::Saturated) => {
                tracing::warn!(group, session = %done.session_id, "worker queue full, dropping image");
                self.reject(group, e.to_string());
            }
            Err(e) => {
                tracing::error!(group, error = %e, "cannot queue image");
                self.reject(group, e.to_string());
            }
        }
    }

    /// Discard idle sessions and tell their senders.
    pub fn reap_stale(&self, now: Instant) -> usize {
        let reaped = self.sessions.reap_stale(now);
        for group in &reaped {
            self.reject(group, "session expired");
        }
        reaped.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.live_sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferLimits;
    use crate::pool::tests::{color_png, harness, Harness};
    use crate::transfer::SessionState;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use rollcall_core::Signature;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    struct Setup {
        dispatcher: IngestDispatcher,
        sessions: Arc<SessionRegistry>,
        access: Arc<AccessGuard>,
        harness: Harness,
        key: String,
    }

    fn setup_with(limits: TransferLimits, submit: u32) -> Setup {
        setup_limits(limits, 100, submit)
    }

    fn setup_limits(limits: TransferLimits, auth: u32, submit: u32) -> Setup {
        let harness = harness();
        let access = Arc::new(AccessGuard::in_memory().unwrap());
        let key = access.issue("G1", "gate-cam").unwrap();
        let sessions = Arc::new(SessionRegistry::new(limits));
        let window = Duration::from_secs(60);
        let dispatcher = IngestDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&access),
            harness.pool.clone(),
            Arc::clone(&harness.ctx.sink),
            RateLimit { limit: auth, window },
            RateLimit { limit: submit, window },
        );
        Setup {
            dispatcher,
            sessions,
            access,
            harness,
            key,
        }
    }

    fn setup() -> Setup {
        setup_with(TransferLimits::default(), 100)
    }

    fn meta(key: &str, group: &str, chunks: i64) -> Vec<u8> {
        format!(r#"{{"credential":"{key}","group":"{group}","chunks":{chunks},"totalSize":0}}"#)
            .into_bytes()
    }

    fn next_error(s: &Setup) -> Option<String> {
        let (_, reply) = s.harness.results.recv_timeout(WAIT).unwrap();
        reply.error
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(parse_topic("image/12A1/meta"), Some(("12A1", Inbound::Meta)));
        assert_eq!(parse_topic("image/g/chunk/7"), Some(("g", Inbound::Chunk(7))));
        assert_eq!(parse_topic("image/g/done"), Some(("g", Inbound::Done)));
        assert_eq!(parse_topic("image/g/chunk/x"), None);
        assert_eq!(parse_topic("image/g/chunk"), None);
        assert_eq!(parse_topic("image//meta"), None);
        assert_eq!(parse_topic("image/g/meta/extra"), None);
        assert_eq!(parse_topic("result/g"), None);
        assert_eq!(result_topic("g"), "result/g");
    }

    #[test]
    fn test_out_of_order_transfer_is_recognized() {
        let s = setup();
        s.harness
            .ctx
            .enrollment
            .add_signature("G1", "alice", &Signature::new(vec![0.5, 0.0, 0.0]))
            .unwrap();

        let text = STANDARD.encode(color_png([128, 0, 0]));
        let third = text.len() / 3;
        let parts = [&text[..third], &text[third..2 * third], &text[2 * third..]];

        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 3));
        for idx in [2, 0, 1] {
            s.dispatcher
                .handle(&format!("image/G1/chunk/{idx}"), parts[idx].as_bytes());
        }
        s.dispatcher.handle("image/G1/done", b"");

        let (group, reply) = s.harness.results.recv_timeout(WAIT).unwrap();
        assert_eq!(group, "G1");
        assert_eq!(reply.identity, "alice");
        assert!(reply.error.is_none());
        assert_eq!(s.dispatcher.live_sessions(), 0);
    }

    #[test]
    fn test_unknown_credential_creates_no_session() {
        let s = setup();
        s.dispatcher.handle("image/G1/meta", &meta("bogus", "G1", 2));
        assert_eq!(next_error(&s).as_deref(), Some("unauthorized"));
        assert_eq!(s.sessions.state("G1"), None);
    }

    #[test]
    fn test_credential_for_other_group_rejected() {
        let s = setup();
        s.dispatcher.handle("image/G2/meta", &meta(&s.key, "G2", 2));
        assert_eq!(next_error(&s).as_deref(), Some("unauthorized"));
        assert_eq!(s.sessions.state("G2"), None);
    }

    #[test]
    fn test_meta_group_must_match_topic() {
        let s = setup();
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G9", 2));
        assert!(next_error(&s).unwrap().starts_with("invalid metadata"));
        assert_eq!(s.sessions.state("G1"), None);
    }

    #[test]
    fn test_bad_chunk_count_rejected() {
        let s = setup();
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 0));
        assert!(next_error(&s).unwrap().starts_with("invalid metadata"));
        s.dispatcher.handle("image/G1/meta", b"{}");
        assert!(next_error(&s).unwrap().starts_with("invalid metadata"));
    }

    #[test]
    fn test_missing_fragments_published() {
        let s = setup();
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 3));
        s.dispatcher.handle("image/G1/chunk/0", b"QUJD");
        s.dispatcher.handle("image/G1/done", b"");
        assert!(next_error(&s).unwrap().starts_with("missing fragments"));
        assert_eq!(s.sessions.state("G1"), None);
    }

    #[test]
    fn test_oversized_transfer_aborted() {
        let limits = TransferLimits {
            max_payload_bytes: 8,
            ..TransferLimits::default()
        };
        let s = setup_with(limits, 100);
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 3));
        s.dispatcher.handle("image/G1/chunk/0", b"QUJD");
        assert_eq!(s.sessions.state("G1"), Some(SessionState::Assembling));
        s.dispatcher.handle("image/G1/chunk/1", b"QUJDQUJD");
        assert_eq!(next_error(&s).as_deref(), Some("payload too large"));

        // The group is idle again: neither chunks nor done produce anything.
        s.dispatcher.handle("image/G1/chunk/2", b"QUJD");
        s.dispatcher.handle("image/G1/done", b"");
        assert!(s
            .harness
            .results
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn test_stray_messages_ignored() {
        let s = setup();
        s.dispatcher.handle("image/G1/chunk/0", b"QUJD");
        s.dispatcher.handle("image/G1/done", b"");
        s.dispatcher.handle("elsewhere/G1", b"{}");
        assert!(s
            .harness
            .results
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        assert_eq!(s.dispatcher.live_sessions(), 0);
    }

    #[test]
    fn test_submission_rate_limit() {
        let s = setup_with(TransferLimits::default(), 1);
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 1));
        assert_eq!(s.sessions.state("G1"), Some(SessionState::Open));
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 1));
        assert_eq!(next_error(&s).as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_reaped_session_reports_expiry() {
        let s = setup();
        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 2));
        assert_eq!(s.dispatcher.reap_stale(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(s.dispatcher.reap_stale(later), 1);
        let (group, reply) = s.harness.results.recv_timeout(WAIT).unwrap();
        assert_eq!(group, "G1");
        assert_eq!(reply.error.as_deref(), Some("session expired"));
    }

    #[test]
    fn test_invalid_group_names_leave_no_rate_buckets() {
        let s = setup();
        let long = "x".repeat(1000);
        for i in 0..200 {
            s.dispatcher
                .handle(&format!("image/.bad{i}{long}/meta"), b"not json");
        }
        for _ in 0..200 {
            let err = next_error(&s).unwrap();
            assert!(err.starts_with("invalid metadata"), "{err}");
        }
        assert_eq!(s.access.bucket_count(), 0);
        assert_eq!(s.dispatcher.live_sessions(), 0);
    }

    #[test]
    fn test_bad_keys_do_not_lock_out_valid_device() {
        let s = setup_limits(TransferLimits::default(), 2, 100);
        for _ in 0..2 {
            s.dispatcher.handle("image/G1/meta", &meta("bogus", "G1", 1));
            assert_eq!(next_error(&s).as_deref(), Some("unauthorized"));
        }
        s.dispatcher.handle("image/G1/meta", &meta("bogus", "G1", 1));
        assert_eq!(next_error(&s).as_deref(), Some("rate limited"));

        s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 1));
        assert_eq!(s.sessions.state("G1"), Some(SessionState::Open));
    }

    #[test]
    fn test_successful_opens_spend_no_auth_budget() {
        let s = setup_limits(TransferLimits::default(), 1, 100);
        for _ in 0..3 {
            s.dispatcher.handle("image/G1/meta", &meta(&s.key, "G1", 1));
            assert_eq!(s.sessions.state("G1"), Some(SessionState::Open));
        }
        s.dispatcher.handle("image/G1/meta", &meta("bogus", "G1", 1));
        assert_eq!(next_error(&s).as_deref(), Some("unauthorized"));
    }
}
