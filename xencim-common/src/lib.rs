//! # xencim Common
//!
//! Shared utilities for processes that host the xencim provider.
//!
//! ## Logging
//!
//! ```rust
//! use xencim_common::init_logging;
//!
//! // Initialize with level; RUST_LOG overrides it when set
//! init_logging("info").unwrap();
//! tracing::info!(class_name = "Xen_ComputerSystem", "Enumerating");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    init_logging_json,
    is_valid_level,
    VALID_LEVELS,
};
