//! Tasks shipped with the server.

mod checksum;
mod summarize;

pub use checksum::ChecksumTask;
pub use summarize::SummarizeTask;

use super::task::TaskRegistry;
use std::sync::Arc;

/// A registry holding every builtin task.
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(ChecksumTask));
    registry.register(Arc::new(SummarizeTask));
    registry
}
