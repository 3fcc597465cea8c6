//! CLI command implementations

pub mod config;
pub mod interface;
pub mod serve;

pub use config::execute as config;
pub use interface::execute as interface;
pub use serve::execute as serve;
