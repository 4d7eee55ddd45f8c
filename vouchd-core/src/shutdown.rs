use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag polled between transport I/O iterations.
///
/// A signal handler's only side effect is flipping the inner boolean; the
/// endpoint loops observe it within one bounded I/O wait.
#[derive(Debug, Clone, Default)]
pub struct QuitToken {
    flag: Arc<AtomicBool>,
}

impl QuitToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
