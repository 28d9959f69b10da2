use thiserror::Error;

/// Errors surfaced across the channel boundary (`write`/`read`) and from the
/// bounded queue primitive that backs it.
///
/// Everything that happens *inside* the command dispatcher (malformed
/// G-code, unknown commands, bad debug syntax) is handled on the wire as a
/// response line and never reaches this type — it exists only for the
/// handful of failures a host actually needs to react to.
#[derive(Debug, Error)]
pub enum Error {
    /// The channel has been told to drop the connection (via
    /// `!!DEBUG:drop_connection`) or a queue refused an item within its
    /// deadline.
    #[error("serial operation timed out")]
    Timeout,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("virtual SD filesystem error: {0}")]
    Sd(#[from] std::io::Error),
}

/// Errors internal to [`crate::queue::BoundedQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is empty")]
    Empty,

    #[error("queue has been closed")]
    Closed,

    #[error("timeout must not be negative: {0}")]
    InvalidTimeout(f64),
}

pub type Result<T> = std::result::Result<T, Error>;
