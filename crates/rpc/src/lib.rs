//! HTTP endpoints for the ipkey access key registry.

pub mod server;


pub use server::{build_router, start_server, AppState};
