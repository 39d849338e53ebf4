//! Session persistence and lifecycle
//!
//! Sessions are stored as one JSON record each, every exchange is also
//! written to a shared append log, and a [`SessionManager`] keeps exactly
//! one session active at a time.

mod log;
mod manager;
#[allow(clippy::module_inception)]
mod session;
mod store;

pub use log::*;
pub use manager::*;
pub use session::*;
pub use store::*;
