//! Error types surfaced by the reactor core (§7).
//!
//! Two disjoint enums: [`CoreError`] for the reactor/scheduler/notifier and
//! [`SerializationError`] for the binary engine. Neither is ever thrown
//! across a component boundary; both are observed via explicit return values.

use snafu::Snafu;

/// Errors surfaced by the reactor, scheduler and readiness notifier.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    /// The readiness notifier failed irrecoverably for one object; the
    /// object is detached and dropped, the reactor continues.
    #[snafu(display("readiness notifier failed: {}", source))]
    NotifierError { source: nix::Error },

    /// `Scheduler::push` was called but every reactor is at capacity.
    #[snafu(display("no free slot in any reactor (capacity {})", capacity))]
    CapacityExceeded { capacity: usize },

    /// The reactor (or scheduler) is shutting down; new work is rejected.
    #[snafu(display("reactor is shutting down"))]
    Shutdown,

    /// Reactor/notifier construction failed.
    #[snafu(display("failed to configure reactor: {}", source))]
    ReactorConfigureFailed { source: nix::Error },

    /// A socket operation failed with an error other than would-block.
    #[snafu(display("socket operation failed: {}", source))]
    SocketError { source: std::io::Error },
}

/// Errors surfaced by the binary serialization engine (§7). Once set on a
/// `Serializer`/`Deserializer` this is latched: every subsequent `run()`
/// call returns the same error without consuming the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum SerializationError {
    #[snafu(display("string exceeds configured max_string limit"))]
    LimitString,

    #[snafu(display("container exceeds configured max_container limit"))]
    LimitContainer,

    #[snafu(display("stream exceeds configured max_stream limit"))]
    LimitStream,

    #[snafu(display("blob exceeds configured max_blob limit"))]
    LimitBlob,

    #[snafu(display("malformed or out-of-range cross-integer encoding"))]
    CrossInteger,

    #[snafu(display("no type registered for wire id {}", id))]
    NoType { id: u64 },

    #[snafu(display("no cast registered from base to derived type"))]
    NoCast,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            SerializationError::LimitContainer.to_string(),
            "container exceeds configured max_container limit"
        );
        assert_eq!(
            SerializationError::NoType { id: 7 }.to_string(),
            "no type registered for wire id 7"
        );
    }
}
