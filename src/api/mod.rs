//! Status API
//!
//! Read-only HTTP endpoints exposing the reverse proxy and pool state.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
