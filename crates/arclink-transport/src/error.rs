/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The I/O runtime could not be started.
    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// An outbound connect failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// An outbound connect didn't complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
}
