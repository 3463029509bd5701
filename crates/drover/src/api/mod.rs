//! HTTP surface: routes, handlers, auth and the error envelope.

pub mod auth;
pub mod error;
pub mod external;
pub mod handlers;
pub mod routes;
pub mod sse;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
