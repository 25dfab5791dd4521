//! The Docker Registry v2 client stack: transport, authentication, and the
//! protocol client.

mod auth;
mod registry;
mod transport;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use auth::*;
pub use registry::*;
pub use transport::*;
