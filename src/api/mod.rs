//! HTTP API layer

mod cache;
mod health;
mod router;
mod state;
pub mod types;

pub use router::create_router;
pub use state::AppState;
