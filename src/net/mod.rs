pub mod endpoint;
pub mod protocol;

pub use endpoint::{Endpoint, EndpointOptions, ResetMode};
pub use protocol::ProtocolError;
