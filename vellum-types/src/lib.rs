#![deny(missing_docs)]
//! Core type definitions for the Vellum collaborative document server.
//!
//! This crate groups together the strongly-typed values shared between the
//! server library, the example binary, and embedding applications. It
//! provides:
//!
//! * Room names of the form `type:uuid` with strict parsing (see
//!   [`RoomName`]).
//! * The authenticated [`Principal`] resolved at WebSocket upgrade.
//! * Document [`Visibility`] and the server-initiated WebSocket
//!   [`close_codes`].
//! * The structured-content tree model (see [`content`] module).
//! * The line-delimited JSON protocol of the per-user event channel (see
//!   [`events`] module).
//!
//! Use these types to pass, store, and (de)serialize identifiers throughout
//! your application instead of raw strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod content;
pub mod events;

/// Server-initiated WebSocket close codes.
///
/// Codes in the 4xxx range are application-defined and advisory to the
/// client; the 1xxx codes follow RFC 6455 semantics.
pub mod close_codes {
    /// Rate-limit violations exhausted.
    pub const RATE_LIMITED: u16 = 1008;
    /// A single frame exceeded the maximum accepted size.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// The document was converted to another type. The reason field carries
    /// a JSON payload naming the successor id and type.
    pub const DOCUMENT_CONVERTED: u16 = 4100;
    /// The document content changed out-of-band and the client must reload.
    pub const CONTENT_UPDATED: u16 = 4101;
    /// The principal no longer qualifies to access the document.
    pub const ACCESS_REVOKED: u16 = 4403;
}

/// A parsed room name of the form `type:uuid`.
///
/// Two room names with the same uuid refer to the same logical document; the
/// type prefix is a display hint only and does not participate in identity
/// beyond the full-name registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName {
    kind: String,
    doc_id: Uuid,
}

/// Error returned when parsing a [`RoomName`] fails.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomNameError {
    /// The name does not contain a `:` separator.
    #[error("room name is missing a ':' separator")]
    MissingSeparator,
    /// The type prefix is empty or contains invalid characters.
    #[error("room name has an invalid type prefix")]
    InvalidKind,
    /// The document id is not a valid UUID.
    #[error("room name has an invalid document id")]
    InvalidDocId,
}

impl RoomName {
    /// Maximum accepted length of a raw room name, in bytes.
    pub const MAX_LEN: usize = 128;

    /// Creates a room name from its parts.
    pub fn new(kind: impl Into<String>, doc_id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            doc_id,
        }
    }

    /// The type prefix (`wiki`, `issue`, `project`, ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The logical document id.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }
}

impl FromStr for RoomName {
    type Err = RoomNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > Self::MAX_LEN {
            return Err(RoomNameError::InvalidKind);
        }
        let (kind, id) = s.split_once(':').ok_or(RoomNameError::MissingSeparator)?;
        if kind.is_empty()
            || !kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return Err(RoomNameError::InvalidKind);
        }
        let doc_id = Uuid::parse_str(id).map_err(|_| RoomNameError::InvalidDocId)?;
        Ok(Self {
            kind: kind.to_owned(),
            doc_id,
        })
    }
}

impl TryFrom<String> for RoomName {
    type Error = RoomNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.doc_id)
    }
}

/// The authenticated principal behind a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// The user behind the session cookie.
    pub user_id: Uuid,
    /// The workspace the session is scoped to.
    pub workspace_id: Uuid,
}

/// Document visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to the creator and workspace admins only.
    Private,
    /// Visible to every workspace member.
    Workspace,
}

impl Visibility {
    /// Parses a visibility from its stored database value.
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "private" => Some(Self::Private),
            "workspace" => Some(Self::Workspace),
            _ => None,
        }
    }

    /// The stored database value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Workspace => "workspace",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
