//! authsync daemon library: shared state and the HTTP surface.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
