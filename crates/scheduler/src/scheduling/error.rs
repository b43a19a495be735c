use core::error::Error;

use crate::allocation::AllocationError;

/// Errors returned by the scheduler extender verbs
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SchedulingError {
    #[display("Bad request: {message}")]
    BadRequest { message: String },
    #[display("Request unsatisfiable: {message}")]
    RequestUnsatisfiable { message: String },
    #[display("Node {node} ran out of vGPU capacity, retry scheduling")]
    Oversubscribed { node: String },
    #[display("Node {node} is not registered")]
    UnknownNode { node: String },
    #[display("Node {node} is stale")]
    StaleNode { node: String },
    #[display("Failed to bind pod {pod} to node {node}")]
    BindFailed { pod: String, node: String },
}

impl Error for SchedulingError {}

impl From<&AllocationError> for SchedulingError {
    fn from(error: &AllocationError) -> Self {
        match error {
            AllocationError::BadRequest { message } => SchedulingError::BadRequest {
                message: message.clone(),
            },
            AllocationError::RequestUnsatisfiable { message } => {
                SchedulingError::RequestUnsatisfiable {
                    message: message.clone(),
                }
            }
            AllocationError::Oversubscribed { node } => {
                SchedulingError::Oversubscribed { node: node.clone() }
            }
            AllocationError::UnknownNode { node } => {
                SchedulingError::UnknownNode { node: node.clone() }
            }
            AllocationError::StaleNode { node } => SchedulingError::StaleNode { node: node.clone() },
        }
    }
}
