//! serialbus - RFCOMM serial port sessions on a message bus
//!
//! Binds RFCOMM device nodes to remote peers, tracks connected
//! sessions against their owning bus clients, and publishes each
//! port as a queryable object on the bus.

pub mod address;
pub mod audit;
pub mod bus;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod session;

pub use error::{SerialBusError, SerialBusResult};
