// HTTP management surface and WebSocket stream multiplexer
pub mod protocol;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod ws;

pub use protocol::{ClientMessage, ServerMessage};
pub use rate_limit::ConnectionRateLimiter;
pub use routes::{create_router, AppError, AppState};
pub use server::{WebServer, WebServerConfig};
