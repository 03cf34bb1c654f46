use thiserror::Error;

/// Failure to hand out a new client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every identifier in the configured range is held by a live session.
    #[error("identifier space exhausted: all {capacity} identifiers are in use")]
    ExhaustedSpace { capacity: usize },
}

/// Failure to queue a line for a session's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The outbound queue is full; the peer stopped reading.
    #[error("outbound queue is full")]
    Backlogged,
    /// The writer task is gone.
    #[error("outbound channel is closed")]
    Closed,
}
