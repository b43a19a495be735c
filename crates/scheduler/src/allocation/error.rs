use core::error::Error;

/// Errors surfaced by the allocation engine
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AllocationError {
    #[display("Bad request: {message}")]
    BadRequest { message: String },
    #[display("Request unsatisfiable: {message}")]
    RequestUnsatisfiable { message: String },
    #[display("Capacity on node {node} was taken concurrently, filter again")]
    Oversubscribed { node: String },
    #[display("Node {node} is not registered")]
    UnknownNode { node: String },
    #[display("Node {node} is stale")]
    StaleNode { node: String },
}

impl Error for AllocationError {}

impl AllocationError {
    /// Whether the scheduler should run filtering again
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::Oversubscribed { .. })
    }
}
