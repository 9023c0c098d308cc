//! Zeta - a lazy basic-block versioning virtual machine
//!
//! Program images are graphs of basic blocks stored as heap objects. The VM
//! compiles each block into its code heap the first time control can reach
//! it, and resolves branches between blocks when they are first taken.

pub mod config;
pub mod image;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use vm::{VM, Value, VmError};
