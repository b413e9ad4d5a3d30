pub mod core;
pub mod logging;

pub use crate::core::ping::{Pinger, PingConfig, ProbeMethod, ProbeResult};
