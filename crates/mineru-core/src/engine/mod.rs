//! Engine adapter interface for document parsing backends.
//!
//! This module defines the [`EngineAdapter`] trait that all parsing
//! backends implement, plus the supporting types ([`ParseOutcome`],
//! [`EngineError`]) and the [`EngineRegistry`] for runtime lookup by
//! backend name.
//!
//! # Architecture
//!
//! ```text
//! Worker runtime
//!     |
//!     v
//! EngineRegistry --get("default")--> &dyn EngineAdapter
//!     |                                    |
//!     |   parse(input, options, out, cancel)
//!     |        |
//!     |        v
//!     |   ParseOutcome { markdown_rel_path, json_rel_path }
//! ```

pub mod process;
pub mod registry;
pub mod trait_def;
pub mod types;

// Re-export the primary public API at the module level.
pub use process::ProcessEngineAdapter;
pub use registry::EngineRegistry;
pub use trait_def::{CancelSignal, EngineAdapter};
pub use types::{EngineError, ParseOutcome};
