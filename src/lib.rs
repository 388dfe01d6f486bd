pub mod cache;
pub mod cli;
pub mod config;
pub mod decision;
pub mod error;
pub mod instrument;
pub mod model;
pub mod pipeline;
pub mod plugins;
pub mod tracker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
