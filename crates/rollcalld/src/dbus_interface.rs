use crate::access::{fingerprint, AccessGuard};
use crate::config::RateLimit;
use crate::dispatcher::IngestDispatcher;
use crate::enrollment::EnrollmentStore;
use crate::ledger::{validate_group, AttendanceLedger};
use crate::pool::{PoolError, PoolHandle, RecognitionReply, UNKNOWN};
use chrono::NaiveDate;
use rollcall_core::{MatchError, MatchPolicy, SignatureGallery};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use zbus::interface;
use zbus::message::Header;
use zbus::names::BusName;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Failure classes of the direct path, one per D-Bus error name.
#[derive(Error, Debug, PartialEq)]
pub enum DirectError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("unknown group {0:?}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    Failed(String),
}

impl From<DirectError> for zbus::fdo::Error {
    fn from(e: DirectError) -> Self {
        let msg = e.to_string();
        match e {
            DirectError::Unauthorized => Self::AccessDenied(msg),
            DirectError::NotFound(_) => Self::FileNotFound(msg),
            DirectError::BadRequest(_) => Self::InvalidArgs(msg),
            DirectError::RateLimited => Self::LimitsExceeded(msg),
            DirectError::Failed(_) => Self::Failed(msg),
        }
    }
}

fn failed(e: impl std::fmt::Display) -> DirectError {
    DirectError::Failed(e.to_string())
}

/// Unix uid of the connection that sent `header`, as reported by the bus.
async fn caller_uid(conn: &zbus::Connection, header: &Header<'_>) -> Option<u32> {
    let sender = header.sender()?;
    let dbus = match zbus::fdo::DBusProxy::new(conn).await {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::warn!(error = %e, "cannot reach bus daemon");
            return None;
        }
    };
    match dbus
        .get_connection_unix_user(BusName::from(sender.clone()))
        .await
    {
        Ok(uid) => Some(uid),
        Err(e) => {
            tracing::warn!(sender = %sender, error = %e, "cannot resolve caller uid");
            None
        }
    }
}

fn checked_group(group: &str) -> Result<(), DirectError> {
    if validate_group(group) {
        Ok(())
    } else {
        Err(DirectError::BadRequest(format!("invalid group name {group:?}")))
    }
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub pool: PoolHandle,
    pub access: Arc<AccessGuard>,
    pub enrollment: Arc<EnrollmentStore>,
    pub gallery: Arc<SignatureGallery>,
    pub ledger: Arc<AttendanceLedger>,
    pub dispatcher: Arc<IngestDispatcher>,
    pub policy: MatchPolicy,
    pub auth_limit: RateLimit,
    pub submit_limit: RateLimit,
    /// Unix users allowed to enroll people and manage device keys.
    pub admin_uids: Vec<u32>,
    pub started: Instant,
}

impl AttendanceService {
    fn authorize_admin(&self, caller: Option<u32>, action: &str) -> Result<(), DirectError> {
        match caller {
            Some(uid) if self.admin_uids.contains(&uid) => Ok(()),
            _ => {
                tracing::warn!(?caller, action, "administrative call denied");
                Err(DirectError::Unauthorized)
            }
        }
    }

    async fn run_recognize(
        &self,
        origin: &str,
        credential: &str,
        group: &str,
        image: Vec<u8>,
    ) -> Result<RecognitionReply, DirectError> {
        if credential.is_empty() {
            return Err(DirectError::Unauthorized);
        }
        let auth = self.auth_limit;
        let auth_key = format!("auth:{origin}");
        if self.access.exhausted(&auth_key, auth.limit, auth.window) {
            tracing::warn!(origin, "authentication attempts rate limited");
            return Err(DirectError::RateLimited);
        }
        if !self.access.knows_group(group) {
            return Err(DirectError::NotFound(group.to_string()));
        }
        if !self.access.verify(credential, group) {
            self.access.rate_limit(&auth_key, auth.limit, auth.window);
            tracing::warn!(origin, group, "unauthorized recognize request");
            return Err(DirectError::Unauthorized);
        }
        if image.is_empty() {
            return Err(DirectError::BadRequest("no image data".into()));
        }
        let submit = self.submit_limit;
        if !self.access.rate_limit(
            &format!("submit:{}", fingerprint(credential)),
            submit.limit,
            submit.window,
        ) {
            return Err(DirectError::RateLimited);
        }

        self.pool
            .recognize(group.to_string(), image)
            .await
            .map_err(failed)
    }

    async fn run_enroll(
        &self,
        caller: Option<u32>,
        group: &str,
        identity: &str,
        image: Vec<u8>,
    ) -> Result<i64, DirectError> {
        self.authorize_admin(caller, "enroll")?;
        checked_group(group)?;
        if identity.trim().is_empty() {
            return Err(DirectError::BadRequest("identity must not be empty".into()));
        }
        if identity == UNKNOWN {
            return Err(DirectError::BadRequest(format!("{UNKNOWN:?} is reserved")));
        }
        if image.is_empty() {
            return Err(DirectError::BadRequest("no image data".into()));
        }
        self.pool
            .enroll(group.to_string(), identity.to_string(), image)
            .await
            .map_err(|e| match e {
                PoolError::NoFace | PoolError::Match(MatchError::InvalidImage(_)) => {
                    DirectError::BadRequest(e.to_string())
                }
                other => failed(other),
            })
    }

    fn run_remove_identity(
        &self,
        caller: Option<u32>,
        group: &str,
        identity: &str,
    ) -> Result<u32, DirectError> {
        self.authorize_admin(caller, "remove identity")?;
        let removed = self
            .enrollment
            .remove_identity(group, identity)
            .map_err(failed)?;
        if removed > 0 {
            self.gallery.invalidate(group);
            tracing::info!(group, identity, removed, "identity removed");
        }
        Ok(removed as u32)
    }

    fn run_issue_key(
        &self,
        caller: Option<u32>,
        group: &str,
        device: &str,
    ) -> Result<String, DirectError> {
        self.authorize_admin(caller, "issue key")?;
        checked_group(group)?;
        self.access.issue(group, device).map_err(failed)
    }

    fn run_revoke_key(&self, caller: Option<u32>, key: &str) -> Result<bool, DirectError> {
        self.authorize_admin(caller, "revoke key")?;
        self.access.revoke(key).map_err(failed)
    }

    fn run_list_keys(&self, caller: Option<u32>, group: &str) -> Result<String, DirectError> {
        self.authorize_admin(caller, "list keys")?;
        let keys = self.access.list(group).map_err(failed)?;
        serde_json::to_string(&keys).map_err(failed)
    }

    fn run_attendance(&self, group: &str, date: &str) -> Result<String, DirectError> {
        checked_group(group)?;
        let date = if date.is_empty() {
            chrono::Local::now().date_naive()
        } else {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| DirectError::BadRequest(format!("invalid date {date:?}: {e}")))?
        };
        let records = self.ledger.records_for(group, date).map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }

    fn run_status(&self) -> String {
        let groups = self.enrollment.groups().unwrap_or_else(|e| {
            tracing::error!(error = %e, "cannot list enrolled groups");
            Vec::new()
        });
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "workers": self.pool.workers(),
            "queue_free": self.pool.queue_capacity(),
            "live_sessions": self.dispatcher.live_sessions(),
            "groups": groups,
            "threshold": self.policy.threshold,
            "strictness": format!("{:?}", self.policy.strictness).to_lowercase(),
        })
        .to_string()
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Match a complete image against the group's gallery and record attendance.
    async fn recognize(
        &self,
        #[zbus(header)] header: Header<'_>,
        credential: &str,
        group: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let origin = header
            .sender()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        tracing::debug!(origin = %origin, group, bytes = image.len(), "recognize requested");
        let reply = self.run_recognize(&origin, credential, group, image).await?;
        Ok(reply.to_json())
    }

    /// Add a photo of `identity` to the group's enrollment set.
    async fn enroll(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
        group: &str,
        identity: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let caller = caller_uid(conn, &header).await;
        tracing::info!(?caller, group, identity, bytes = image.len(), "enroll requested");
        let id = self.run_enroll(caller, group, identity, image).await?;
        Ok(serde_json::json!({ "group": group, "identity": identity, "signature_id": id }).to_string())
    }

    /// Remove every enrolled signature of `identity`.
    async fn remove_identity(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
        group: &str,
        identity: &str,
    ) -> zbus::fdo::Result<u32> {
        let caller = caller_uid(conn, &header).await;
        Ok(self.run_remove_identity(caller, group, identity)?)
    }

    /// Enrolled identities of `group`, sorted.
    async fn list_identities(&self, group: &str) -> zbus::fdo::Result<String> {
        let identities = self.enrollment.identities(group).map_err(failed)?;
        Ok(serde_json::to_string(&identities).map_err(failed)?)
    }

    /// Issue a device credential bound to `group`. The key is returned once.
    async fn issue_key(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
        group: &str,
        device: &str,
    ) -> zbus::fdo::Result<String> {
        let caller = caller_uid(conn, &header).await;
        Ok(self.run_issue_key(caller, group, device)?)
    }

    async fn revoke_key(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
        key: &str,
    ) -> zbus::fdo::Result<bool> {
        let caller = caller_uid(conn, &header).await;
        Ok(self.run_revoke_key(caller, key)?)
    }

    async fn list_keys(
        &self,
        #[zbus(connection)] conn: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
        group: &str,
    ) -> zbus::fdo::Result<String> {
        let caller = caller_uid(conn, &header).await;
        Ok(self.run_list_keys(caller, group)?)
    }

    /// Attendance records for `date` (`YYYY-MM-DD`, empty for today).
    async fn attendance(&self, group: &str, date: &str) -> zbus::fdo::Result<String> {
        Ok(self.run_attendance(group, date)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.run_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferLimits;
    use crate::pool::tests::{color_png, harness, Harness};
    use crate::transfer::SessionRegistry;
    use std::time::Duration;

    const ROOT: Option<u32> = Some(0);

    struct Setup {
        service: AttendanceService,
        key: String,
        _harness: Harness,
    }

    fn setup(submit: u32) -> Setup {
        let h = harness();
        let access = Arc::new(AccessGuard::in_memory().unwrap());
        let key = access.issue("G1", "kiosk").unwrap();
        let window = Duration::from_secs(60);
        let auth_limit = RateLimit { limit: 100, window };
        let submit_limit = RateLimit { limit: submit, window };
        let dispatcher = Arc::new(IngestDispatcher::new(
            Arc::new(SessionRegistry::new(TransferLimits::default())),
            Arc::clone(&access),
            h.pool.clone(),
            Arc::clone(&h.ctx.sink),
            auth_limit,
            submit_limit,
        ));
        let service = AttendanceService {
            pool: h.pool.clone(),
            access,
            enrollment: Arc::clone(&h.ctx.enrollment),
            gallery: Arc::clone(&h.ctx.gallery),
            ledger: Arc::clone(&h.ctx.ledger),
            dispatcher,
            policy: MatchPolicy::default(),
            auth_limit,
            submit_limit,
            admin_uids: vec![0],
            started: Instant::now(),
        };
        Setup {
            service,
            key,
            _harness: h,
        }
    }

    #[tokio::test]
    async fn test_recognize_after_enroll() {
        let s = setup(100);
        s.service
            .run_enroll(ROOT, "G1", "alice", color_png([10, 200, 10]))
            .await
            .unwrap();
        let reply = s
            .service
            .run_recognize(":1.5", &s.key, "G1", color_png([10, 200, 10]))
            .await
            .unwrap();
        assert_eq!(reply.identity, "alice");

        let json = s.service.run_attendance("G1", "").unwrap();
        assert!(json.contains(r#""identity":"alice""#));
    }

    #[tokio::test]
    async fn test_error_classes() {
        let s = setup(100);
        let img = color_png([1, 1, 1]);
        assert_eq!(
            s.service.run_recognize("o", "", "G1", img.clone()).await,
            Err(DirectError::Unauthorized)
        );
        assert_eq!(
            s.service.run_recognize("o", &s.key, "nowhere", img.clone()).await,
            Err(DirectError::NotFound("nowhere".into()))
        );
        assert_eq!(
            s.service.run_recognize("o", "wrong", "G1", img).await,
            Err(DirectError::Unauthorized)
        );
        assert!(matches!(
            s.service.run_recognize("o", &s.key, "G1", Vec::new()).await,
            Err(DirectError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_submission_rate_limit() {
        let s = setup(1);
        let img = color_png([1, 1, 1]);
        assert!(s.service.run_recognize("o", &s.key, "G1", img.clone()).await.is_ok());
        assert_eq!(
            s.service.run_recognize("o", &s.key, "G1", img).await,
            Err(DirectError::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_enroll_validation() {
        let s = setup(100);
        assert!(matches!(
            s.service.run_enroll(ROOT, "../etc", "x", color_png([0, 0, 0])).await,
            Err(DirectError::BadRequest(_))
        ));
        assert!(matches!(
            s.service.run_enroll(ROOT, "G1", " ", color_png([0, 0, 0])).await,
            Err(DirectError::BadRequest(_))
        ));
        assert!(matches!(
            s.service.run_enroll(ROOT, "G1", "x", vec![0xde, 0xad]).await,
            Err(DirectError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_identity_invalidates_gallery() {
        let s = setup(100);
        s.service
            .run_enroll(ROOT, "G1", "bob", color_png([50, 50, 50]))
            .await
            .unwrap();
        let reply = s
            .service
            .run_recognize("o", &s.key, "G1", color_png([50, 50, 50]))
            .await
            .unwrap();
        assert_eq!(reply.identity, "bob");

        assert_eq!(s.service.run_remove_identity(ROOT, "G1", "bob").unwrap(), 1);
        let reply = s
            .service
            .run_recognize("o", &s.key, "G1", color_png([50, 50, 50]))
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("no enrollment data"));
    }

    #[test]
    fn test_attendance_rejects_bad_date() {
        let s = setup(100);
        assert!(matches!(
            s.service.run_attendance("G1", "14/03/2024"),
            Err(DirectError::BadRequest(_))
        ));
        assert_eq!(s.service.run_attendance("G1", "2024-03-14").unwrap(), "[]");
    }

    #[test]
    fn test_status_reports_pool() {
        let s = setup(100);
        let status: serde_json::Value = serde_json::from_str(&s.service.run_status()).unwrap();
        assert_eq!(status["workers"], 2);
        assert_eq!(status["strictness"], "nearest");
        assert_eq!(status["live_sessions"], 0);
    }

    #[test]
    fn test_error_mapping() {
        let e: zbus::fdo::Error = DirectError::NotFound("g".into()).into();
        assert!(matches!(e, zbus::fdo::Error::FileNotFound(_)));
        let e: zbus::fdo::Error = DirectError::RateLimited.into();
        assert!(matches!(e, zbus::fdo::Error::LimitsExceeded(_)));
        let e: zbus::fdo::Error = DirectError::Unauthorized.into();
        assert!(matches!(e, zbus::fdo::Error::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_admin_methods_require_admin_uid() {
        let s = setup(100);
        let img = color_png([9, 9, 9]);
        for caller in [None, Some(1000)] {
            assert_eq!(
                s.service.run_enroll(caller, "G1", "mallory", img.clone()).await,
                Err(DirectError::Unauthorized)
            );
            assert_eq!(
                s.service.run_remove_identity(caller, "G1", "alice"),
                Err(DirectError::Unauthorized)
            );
            assert_eq!(
                s.service.run_issue_key(caller, "G1", "rogue"),
                Err(DirectError::Unauthorized)
            );
            assert_eq!(
                s.service.run_revoke_key(caller, &s.key),
                Err(DirectError::Unauthorized)
            );
            assert_eq!(
                s.service.run_list_keys(caller, "G1"),
                Err(DirectError::Unauthorized)
            );
        }
        assert!(s.service.access.verify(&s.key, "G1"));
        assert_eq!(s.service.access.list("G1").unwrap().len(), 1);

        let key = s.service.run_issue_key(ROOT, "G1", "door").unwrap();
        assert!(s.service.access.verify(&key, "G1"));
        assert!(s.service.run_list_keys(ROOT, "G1").unwrap().contains("door"));
        assert_eq!(s.service.run_revoke_key(ROOT, &key), Ok(true));
    }

    #[tokio::test]
    async fn test_unknown_is_not_an_enrollable_identity() {
        let s = setup(100);
        assert!(matches!(
            s.service.run_enroll(ROOT, "G1", UNKNOWN, color_png([0, 0, 0])).await,
            Err(DirectError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_only_failed_attempts_spend_auth_budget() {
        let mut s = setup(100);
        s.service.auth_limit = RateLimit {
            limit: 2,
            window: Duration::from_secs(60),
        };
        let img = color_png([1, 1, 1]);
        assert!(s.service.run_recognize("o", &s.key, "G1", img.clone()).await.is_ok());
        assert!(s.service.run_recognize("o", &s.key, "G1", img.clone()).await.is_ok());
        assert!(s.service.run_recognize("o", &s.key, "G1", img.clone()).await.is_ok());
        for _ in 0..2 {
            assert_eq!(
                s.service.run_recognize("o", "wrong", "G1", img.clone()).await,
                Err(DirectError::Unauthorized)
            );
        }
        assert_eq!(
            s.service.run_recognize("o", &s.key, "G1", img).await,
            Err(DirectError::RateLimited)
        );
    }
}
