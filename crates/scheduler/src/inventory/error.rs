use core::error::Error;

/// Errors of the device record store and the inventory service
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum StoreError {
    #[display("Node {node} is not registered")]
    UnknownNode { node: String },
    #[display("Node {node} was marked stale")]
    StaleNode { node: String },
    #[display("Device {device} not found on node {node}")]
    UnknownDevice { node: String, device: String },
    #[display("Device {device} on node {node} has no room for the reservation")]
    CapacityExceeded { node: String, device: String },
    #[display("Reservation {token} does not exist")]
    UnknownReservation { token: u64 },
    #[display("Invalid device registration: {message}")]
    InvalidDevice { message: String },
}

impl Error for StoreError {}
