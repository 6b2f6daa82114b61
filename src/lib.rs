//! KopioRapido Engine
//!
//! Resumable file-transfer engine with storage profiling, adaptive
//! parallelism, delta-sync and on-the-wire compression.

pub mod compress;
pub mod config;
pub mod fs;
pub mod operation;
pub mod orchestrator;
pub mod planner;
pub mod profile;
pub mod retry;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use operation::{CopyOperation, OperationStatus, OperationType};
pub use orchestrator::Engine;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
