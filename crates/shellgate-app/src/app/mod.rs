pub mod commands;
pub mod web_server;

pub use commands::{classify, print_config};
pub use web_server::run_web_server;
