//! Progress reporting for fetch operations.
//!
//! The fetcher reports through this trait so the core never writes to the
//! terminal itself.

use kiln_schema::ComponentLock;

use crate::sources::Local;

/// Receives progress events from [`crate::Fetcher`].
pub trait Reporter: Send + Sync {
    /// A new phase has started (e.g. "Resolving", "Downloading").
    fn section(&self, title: &str);

    /// A download has started.
    fn downloading(&self, lock: &ComponentLock);

    /// A release is on disk and verified.
    fn done(&self, local: &Local);

    /// A release could not be resolved or downloaded.
    fn failed(&self, name: &str, version: &str, reason: &str);

    /// A release file is about to be deleted.
    fn removing(&self, local: &Local);

    /// Final tally.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn downloading(&self, lock: &ComponentLock) {
        (**self).downloading(lock);
    }
    fn done(&self, local: &Local) {
        (**self).done(local);
    }
    fn failed(&self, name: &str, version: &str, reason: &str) {
        (**self).failed(name, version, reason);
    }
    fn removing(&self, local: &Local) {
        (**self).removing(local);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _title: &str) {}
    fn downloading(&self, _lock: &ComponentLock) {}
    fn done(&self, _local: &Local) {}
    fn failed(&self, _name: &str, _version: &str, _reason: &str) {}
    fn removing(&self, _local: &Local) {}
    fn summary(&self, _count: usize, _action: &str, _elapsed_secs: f64) {}
}
