//! Error handling utils.
//!
//! [`Error`] is both the crate-wide error type and the rejection reason
//! carried by promises. A rejected promise may be observed by any number of
//! awaiters, each of which receives its own copy of the reason, so the type
//! is [`Clone`]; foreign error values are shared behind an [`Arc`] to keep
//! cloning cheap.
//!
//! Every reason that enters the system is normalized at the rejection
//! boundary: error values keep their identity through [`Error::other`],
//! plain strings become [`Error::Failure`]. No reason is ever dropped
//! silently, and every variant has a printable message.

use std::sync::Arc;
use std::time::Duration;

/// A specialized [`Result`] type for the crate.
///
/// [`Result`]: std::result::Result
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate, including every
/// rejection reason a promise can carry.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The awaited promise was cancelled, or a cancellation token tripped
    /// [`throw_if_cancelled`].
    ///
    /// [`throw_if_cancelled`]: crate::cancel::CancellationToken::throw_if_cancelled
    #[error("operation was cancelled")]
    Cancelled,

    /// The deadline passed to [`timeout`](crate::promise::combine::timeout)
    /// expired before the operand settled.
    #[error("deadline expired after {after:?}")]
    Timeout { after: Duration },

    /// Every input to [`any`](crate::promise::combine::any) was rejected.
    /// Reasons are kept in input order.
    #[error("all promises were rejected ({} rejections)", .0.len())]
    Aggregate(Vec<Error>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fiber-only primitive was used outside of a fiber.
    #[error("not in a fiber: {0}")]
    NotInFiber(String),

    /// The other half of a channel was dropped.
    #[error("channel is disconnected")]
    Disconnected,

    /// A plain message rejection (string reasons, fiber panics).
    #[error("{0}")]
    Failure(String),

    /// An arbitrary user error surfaced as-is through a rejection.
    ///
    /// The error is wrapped in an [`Arc`] so that a single reason can be
    /// delivered to every awaiter of a shared promise.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(Arc::from(error.into()))
    }

    #[inline(always)]
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    #[inline(always)]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[inline(always)]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::Timeout { .. } => "Timeout",
            Self::Aggregate(_) => "Aggregate",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::NotInFiber(_) => "NotInFiber",
            Self::Disconnected => "Disconnected",
            Self::Failure(_) => "Failure",
            Self::Other(_) => "Other",
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Self::Failure(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Self::Failure(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::other(error)
    }
}
