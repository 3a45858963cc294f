//! This module provides an implementation of [`Storage`] using a Postgres
//! database.
//!
//! The server only ever touches three relations: `documents`, `sessions`,
//! and `workspace_members`. Migrations are owned by the surrounding
//! application; we just read and update.

use std::num::NonZeroU32;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Context as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;
use vellum_types::Visibility;

use crate::services::storage::{
    DocumentRecord, SessionRecord, Storage, WorkspaceRole,
};

/// The postgres storage backend wrapping a `PgPool`.
pub struct PostgresStorage(PgPool);

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    crdt_state: Option<Vec<u8>>,
    content: Option<Value>,
    visibility: String,
    created_by: Uuid,
    workspace_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    user_id: Uuid,
    workspace_id: Uuid,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl PostgresStorage {
    /// Initializes a `PostgresStorage` by connecting to the provided
    /// `connection_string` with a pool of at most `max_connections`.
    #[instrument(level = "info", skip_all)]
    pub async fn init(
        connection_string: &SecretString,
        max_connections: NonZeroU32,
    ) -> eyre::Result<Self> {
        tracing::info!("connecting to DB...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .connect(connection_string.expose_secret())
            .await
            .context("while connecting to postgres DB")?;
        Ok(Self(pool))
    }

    fn document_row_into_record(row: DocumentRow) -> eyre::Result<DocumentRecord> {
        let visibility = Visibility::from_db_value(&row.visibility)
            .ok_or_else(|| eyre::eyre!("invalid visibility '{}' in database", row.visibility))?;
        // an all-zero blob is what a cleared document looks like after the
        // REST escape hatch ran; treat it like an absent state
        let crdt_state = row.crdt_state.filter(|state| !state.is_empty());
        Ok(DocumentRecord {
            crdt_state,
            content: row.content,
            visibility,
            created_by: row.created_by,
            workspace_id: row.workspace_id,
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    #[instrument(level = "debug", skip(self))]
    async fn load_document(&self, doc_id: Uuid) -> eyre::Result<Option<DocumentRecord>> {
        let maybe_row: Option<DocumentRow> = sqlx::query_as(
            r#"
                SELECT
                    crdt_state,
                    content,
                    visibility,
                    created_by,
                    workspace_id
                FROM documents
                WHERE id = $1
            "#,
        )
        .bind(doc_id)
        .fetch_optional(&self.0)
        .await
        .context("while fetching document")?;
        maybe_row.map(Self::document_row_into_record).transpose()
    }

    #[instrument(level = "debug", skip(self, crdt_state, properties))]
    async fn save_document(
        &self,
        doc_id: Uuid,
        crdt_state: &[u8],
        properties: &serde_json::Map<String, Value>,
    ) -> eyre::Result<()> {
        sqlx::query(
            r#"
                UPDATE documents
                SET crdt_state = $2,
                    properties = jsonb_strip_nulls(
                        COALESCE(properties, '{}'::jsonb) || $3
                    ),
                    updated_at = now()
                WHERE id = $1
            "#,
        )
        .bind(doc_id)
        .bind(crdt_state)
        .bind(Value::Object(properties.clone()))
        .execute(&self.0)
        .await
        .context("while persisting document")?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn fetch_session(&self, token: &str) -> eyre::Result<Option<SessionRecord>> {
        let maybe_row: Option<SessionRow> = sqlx::query_as(
            r#"
                SELECT
                    user_id,
                    workspace_id,
                    created_at,
                    last_activity
                FROM sessions
                WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.0)
        .await
        .context("while fetching session")?;
        Ok(maybe_row.map(|row| SessionRecord {
            user_id: row.user_id,
            workspace_id: row.workspace_id,
            created_at: row.created_at,
            last_activity: row.last_activity,
        }))
    }

    #[instrument(level = "debug", skip_all)]
    async fn touch_session(&self, token: &str) -> eyre::Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = now() WHERE token = $1")
            .bind(token)
            .execute(&self.0)
            .await
            .context("while touching session")?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn delete_session(&self, token: &str) -> eyre::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.0)
            .await
            .context("while deleting session")?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn workspace_role(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> eyre::Result<Option<WorkspaceRole>> {
        let role: Option<String> = sqlx::query_scalar(
            r#"
                SELECT role
                FROM workspace_members
                WHERE workspace_id = $1
                  AND user_id = $2
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.0)
        .await
        .context("while querying workspace role")?;
        role.map(|role| {
            WorkspaceRole::from_db_value(&role)
                .ok_or_else(|| eyre::eyre!("invalid workspace role '{role}' in database"))
        })
        .transpose()
    }
}
