//! Storage interface of the collaboration server.
//!
//! This module defines the [`Storage`] trait, which is the only surface the
//! server uses to talk to the surrounding relational store. The contract is
//! deliberately small:
//!
//! - two operations against the `documents` relation (load by id, write
//!   `crdt_state` + merged `properties`),
//! - a `sessions` lookup/touch/delete triple for the session gate,
//! - a `workspace_members` role lookup for the access gate.
//!
//! Current `Storage` implementations:
//! - Postgres (behind the `postgres` feature)
//! - an in-memory store used by the integration tests

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use vellum_types::Visibility;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Dynamic trait object for the storage service.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type StorageService = Arc<dyn Storage + Send + Sync>;

/// A document row as loaded from the store.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Opaque binary blob encoding the CRDT history; authoritative when
    /// present.
    pub crdt_state: Option<Vec<u8>>,
    /// Denormalized structured content; authoritative when `crdt_state` is
    /// absent.
    pub content: Option<Value>,
    /// Document visibility.
    pub visibility: Visibility,
    /// The principal that created the document.
    pub created_by: Uuid,
    /// The workspace the document belongs to.
    pub workspace_id: Uuid,
}

/// A session row as loaded from the store.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// The user behind the session.
    pub user_id: Uuid,
    /// The workspace the session is scoped to.
    pub workspace_id: Uuid,
    /// Session creation time.
    pub created_at: DateTime<Utc>,
    /// Last observed activity, bumped on every successful gate pass.
    pub last_activity: DateTime<Utc>,
}

/// The role of a workspace member, as stored in the membership relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceRole {
    /// Regular member.
    Member,
    /// Workspace administrator.
    Admin,
}

impl WorkspaceRole {
    /// Parses a role from its stored database value.
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Trait that storage backends must provide.
#[async_trait]
pub trait Storage {
    /// Loads the document with the given id, or `None` if it does not exist.
    async fn load_document(&self, doc_id: Uuid) -> eyre::Result<Option<DocumentRecord>>;

    /// Writes the CRDT state and merges the derived `properties` patch into
    /// the stored properties in a single row update.
    ///
    /// Keys of `properties` whose value is `null` clear the stored field;
    /// keys absent from the patch are left untouched.
    async fn save_document(
        &self,
        doc_id: Uuid,
        crdt_state: &[u8],
        properties: &serde_json::Map<String, Value>,
    ) -> eyre::Result<()>;

    /// Loads the session with the given token, or `None` if it does not
    /// exist.
    async fn fetch_session(&self, token: &str) -> eyre::Result<Option<SessionRecord>>;

    /// Bumps the session's `last_activity` to now.
    async fn touch_session(&self, token: &str) -> eyre::Result<()>;

    /// Deletes an expired session row.
    async fn delete_session(&self, token: &str) -> eyre::Result<()>;

    /// Returns the principal's role in the workspace, or `None` if they are
    /// not a member.
    async fn workspace_role(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> eyre::Result<Option<WorkspaceRole>>;
}
