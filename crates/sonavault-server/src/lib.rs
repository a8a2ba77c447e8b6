//! Sonavault HTTP server.
//!
//! Wires the core services behind an axum router. See [`routes`] for the
//! endpoint map and [`stream`] for the decrypt-on-the-fly range engine.

pub mod dto;
pub mod error;
pub mod extract;
pub mod range;
pub mod routes;
pub mod state;
pub mod stream;
pub mod sweeper;

pub use routes::build_router;
pub use state::AppState;
