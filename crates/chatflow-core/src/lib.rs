pub mod analyzer;
pub mod config;
pub mod correlator;
pub mod counters;
pub mod generator;
pub mod message;
pub mod orchestrator;
pub mod retry;
pub mod sink;
pub mod transport;
pub mod worker;

pub use analyzer::*;
pub use config::*;
pub use counters::*;
pub use generator::*;
pub use message::*;
pub use orchestrator::*;
pub use retry::*;
pub use sink::*;
pub use transport::*;
pub use worker::*;
