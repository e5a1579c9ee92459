//! Error types for the stream protocol.
//!
//! [`StreamError`] is the error currency of every `on_error` signal. It is
//! cheap to clone so multicast operators can fan the same terminal error out
//! to any number of subscribers.

/// Error delivered through `on_error`.
///
/// Protocol violations and user-callback failures both travel downstream as
/// values of this type; elements and errors are otherwise opaque to the
/// operators that relay them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// `request` was called with a non-positive amount.
    #[error("invalid request amount: {0} (requests must be positive)")]
    InvalidRequest(u64),

    /// A second upstream subscription arrived for a slot that was already
    /// assigned.
    #[error("upstream subscription already set")]
    DuplicateSubscription,

    /// A user callback (mapper, predicate, zipper, lifecycle hook) failed.
    #[error("user callback failed: {0}")]
    Callback(String),

    /// A shared connection was torn down while subscribers were attached.
    #[error("connection disconnected")]
    Disconnected,

    /// A value had to be delivered but the subscriber had no outstanding
    /// demand and no drop policy applied.
    #[error("cannot deliver value: no outstanding demand")]
    MissingDemand,

    /// A terminal hook failed after the primary signal was already
    /// delivered; the hook failure is attached as a suppressed cause.
    #[error("{error} (suppressed: {suppressed})")]
    Suppressed {
        /// The failure being reported.
        error: Box<StreamError>,
        /// The earlier failure it supersedes.
        suppressed: Box<StreamError>,
    },
}

impl StreamError {
    /// Creates a user-callback failure from any printable reason.
    pub fn callback(reason: impl Into<String>) -> Self {
        Self::Callback(reason.into())
    }

    /// Attaches `suppressed` to `self` as a secondary cause.
    #[must_use]
    pub fn with_suppressed(self, suppressed: StreamError) -> Self {
        Self::Suppressed {
            error: Box::new(self),
            suppressed: Box::new(suppressed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            StreamError::InvalidRequest(0).to_string(),
            "invalid request amount: 0 (requests must be positive)"
        );
        assert_eq!(
            StreamError::callback("boom").to_string(),
            "user callback failed: boom"
        );
        assert_eq!(
            StreamError::Disconnected.to_string(),
            "connection disconnected"
        );
    }

    #[test]
    fn test_suppressed_chain() {
        let err = StreamError::callback("after-terminate hook failed")
            .with_suppressed(StreamError::callback("original"));

        let StreamError::Suppressed { error, suppressed } = err else {
            panic!("expected suppressed variant");
        };
        assert_eq!(*error, StreamError::callback("after-terminate hook failed"));
        assert_eq!(*suppressed, StreamError::callback("original"));
    }
}
