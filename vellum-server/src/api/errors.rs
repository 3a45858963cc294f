//! This module defines the [`Error`] a websocket session may encounter. It
//! further provides a method to transform the encountered errors into a
//! close frame if necessary.
//!
//! Malformed frames are deliberately not represented here: a buggy client
//! is tolerated and its frames dropped without closing the socket. Only the
//! rate-limit and frame-size breaches escalate to a close.

use axum::extract::ws::CloseFrame;
use tracing::instrument;
use vellum_types::close_codes;

/// All errors that may terminate a websocket session from our side.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("rate limit violations exhausted")]
    RateLimitExhausted,
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
}

impl Error {
    /// Transforms the error into a [`CloseFrame`] if necessary.
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            Error::ConnectionClosed => {
                // nothing to do here
                None
            }
            Error::RateLimitExhausted => Some(CloseFrame {
                code: close_codes::RATE_LIMITED,
                reason: "Rate limit exceeded".into(),
            }),
            Error::FrameTooLarge(_) => Some(CloseFrame {
                code: close_codes::MESSAGE_TOO_LARGE,
                reason: "Message too large".into(),
            }),
        }
    }
}
