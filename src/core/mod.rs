pub mod config;
pub mod ping;
