//! Document access resolution.
//!
//! A principal may open a document iff the document belongs to the
//! principal's workspace and at least one of the following holds: the
//! document is workspace-visible, the principal created it, or the
//! principal holds the admin role in that workspace. Missing documents are
//! denied rather than distinguished.

use tracing::instrument;
use uuid::Uuid;
use vellum_types::{Principal, Visibility};

use crate::services::storage::{StorageService, WorkspaceRole};

#[derive(Clone)]
pub(crate) struct AccessGate {
    storage: StorageService,
}

impl AccessGate {
    pub(crate) fn new(storage: StorageService) -> Self {
        Self { storage }
    }

    /// Resolves whether `principal` may access the document.
    ///
    /// Storage failures deny access; the upgrade has not happened yet, so
    /// the client simply sees a 403 and may retry.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn can_access(&self, doc_id: Uuid, principal: Principal) -> bool {
        let record = match self.storage.load_document(doc_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("denying access to missing document");
                return false;
            }
            Err(err) => {
                tracing::warn!("could not resolve document access: {err:?}");
                return false;
            }
        };
        if record.workspace_id != principal.workspace_id {
            return false;
        }
        if record.visibility == Visibility::Workspace || record.created_by == principal.user_id {
            return true;
        }
        self.is_workspace_admin(principal).await
    }

    /// `true` iff the principal holds the admin role in their workspace.
    pub(crate) async fn is_workspace_admin(&self, principal: Principal) -> bool {
        match self
            .storage
            .workspace_role(principal.workspace_id, principal.user_id)
            .await
        {
            Ok(role) => role == Some(WorkspaceRole::Admin),
            Err(err) => {
                tracing::warn!("could not resolve workspace role: {err:?}");
                false
            }
        }
    }
}
