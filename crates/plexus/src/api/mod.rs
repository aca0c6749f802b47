//! HTTP surface: health check and the WebSocket upgrade routes.

mod error;
mod extract;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ErrorResponse};
pub use extract::ClientIp;
pub use routes::create_router;
pub use state::{AppState, Services, default_plugins};
