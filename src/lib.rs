// Library entrypoint for the binary and integration tests.
mod api;
mod core;
mod services;
pub mod storage;

pub use api::build_router;
pub use self::core::{config, identity, shutdown, state};
pub use services::rate_limit;
