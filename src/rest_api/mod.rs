//! Local REST endpoint
//!
//! Reports install progress (proxying the node's own health endpoint once
//! the install finished) and accepts service and drain requests.

mod handlers;
mod server;

pub use handlers::{ApiState, HealthProxy, RestAction};
pub use server::{router, run_server, SERVER_ID};
