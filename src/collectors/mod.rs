//! Metrics collector implementations

pub mod system;

pub use system::{SystemCollector, pick_interface};
