//! Error taxonomy shared by every component.
//!
//! Each variant maps to exactly one HTTP status in the backend. Raw upstream
//! detail travels inside the variants so it can be logged and attached as a
//! secondary `details` field, but the user-facing text always comes from
//! [`crate::classify`].

use std::io;

use crate::provider::OEmbedInfo;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure reported by the extraction tool, the oEmbed endpoint or a stream
/// download. The optional fields feed the classifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
    pub status_code: Option<u16>,
    pub code: Option<String>,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed client input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upstream metadata exists but nothing matches the format policy.
    #[error("no suitable format found")]
    NoSuitableFormat,

    /// Every client identity and retry was exhausted.
    #[error("upstream unavailable: {source}")]
    UpstreamUnavailable {
        source: UpstreamError,
        preview: Option<OEmbedInfo>,
    },

    /// A cached artifact or served file does not exist.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        suggestion: Option<String>,
    },

    /// The transcoder exited unsuccessfully or produced nothing.
    #[error("transcoding failed: {0}")]
    Transcode(String),

    #[error("io error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn upstream(source: UpstreamError) -> Self {
        Self::UpstreamUnavailable {
            source,
            preview: None,
        }
    }
}

/// Mirrors `anyhow::Context` for the crate error so filesystem calls can stay
/// one-liners.
pub trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::io(context(), source))
    }
}
