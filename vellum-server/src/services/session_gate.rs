//! Session validation at the websocket upgrade boundary.
//!
//! The gate parses the session cookie from the upgrade request, looks the
//! token up in the sessions relation, and enforces both the idle and the
//! absolute session timeout. Expired rows are deleted on the spot; there is
//! no background reaper. On success the gate bumps `last_activity` and
//! yields the authenticated [`Principal`].

use std::time::Duration;

use axum_extra::extract::CookieJar;
use chrono::Utc;
use tracing::instrument;
use vellum_types::Principal;

use crate::services::storage::StorageService;

/// Name of the session cookie.
pub(crate) const SESSION_COOKIE: &str = "session_id";

/// Why a session was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRejection {
    /// No cookie, unknown token, or a storage failure while validating.
    Missing,
    /// No activity for longer than the idle timeout.
    Idle,
    /// Older than the absolute session lifetime.
    Expired,
}

#[derive(Clone)]
pub(crate) struct SessionGate {
    storage: StorageService,
    idle_timeout: Duration,
    max_age: Duration,
}

impl SessionGate {
    pub(crate) fn new(storage: StorageService, idle_timeout: Duration, max_age: Duration) -> Self {
        Self {
            storage,
            idle_timeout,
            max_age,
        }
    }

    /// Validates the session cookie of an upgrade request.
    ///
    /// Timed-out sessions are deleted before rejecting. Storage failures are
    /// indistinguishable from a missing session for the caller; the reason
    /// lands in the logs.
    #[instrument(level = "debug", skip_all)]
    pub(crate) async fn authenticate(
        &self,
        cookies: &CookieJar,
    ) -> Result<Principal, SessionRejection> {
        let Some(cookie) = cookies.get(SESSION_COOKIE) else {
            tracing::debug!("upgrade request without session cookie");
            return Err(SessionRejection::Missing);
        };
        let token = cookie.value();
        let session = match self.storage.fetch_session(token).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!("unknown session token");
                return Err(SessionRejection::Missing);
            }
            Err(err) => {
                tracing::warn!("could not validate session: {err:?}");
                return Err(SessionRejection::Missing);
            }
        };

        let now = Utc::now();
        let idle = (now - session.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let age = (now - session.created_at).to_std().unwrap_or(Duration::ZERO);
        let rejection = if idle > self.idle_timeout {
            Some(SessionRejection::Idle)
        } else if age > self.max_age {
            Some(SessionRejection::Expired)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            tracing::debug!(?rejection, "session timed out, deleting row");
            if let Err(err) = self.storage.delete_session(token).await {
                tracing::warn!("could not delete expired session: {err:?}");
            }
            return Err(rejection);
        }

        if let Err(err) = self.storage.touch_session(token).await {
            // not fatal: the session is valid, the bump will happen on the
            // next gate pass
            tracing::warn!("could not bump session activity: {err:?}");
        }
        Ok(Principal {
            user_id: session.user_id,
            workspace_id: session.workspace_id,
        })
    }
}
