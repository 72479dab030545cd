pub mod config;
pub mod identity;
pub mod shutdown;
pub mod state;
