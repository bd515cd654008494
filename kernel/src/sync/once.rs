//! Lazily-initialised global singletons.
//!
//! The frame allocator, heap, per-CPU table and ACPI info are each a
//! process-wide singleton initialised exactly once, early in boot, and
//! used only afterward (`SPEC_FULL.md` §9: "any use before its `Init`
//! must panic"). `OnceCell` wraps that contract once instead of
//! repeating the "initialized or panic" check in every module.

use spin::Once;

pub struct OnceCell<T> {
    inner: Once<T>,
}

impl<T> OnceCell<T> {
    pub const fn new() -> Self {
        OnceCell { inner: Once::new() }
    }

    /// Runs `init` exactly once across all callers and stores its result.
    pub fn init(&self, init: impl FnOnce() -> T) {
        self.inner.call_once(init);
    }

    /// # Panics
    /// If `init` has not yet been called.
    pub fn get(&self) -> &T {
        self.inner
            .get()
            .expect("OnceCell accessed before initialization")
    }

    pub fn try_get(&self) -> Option<&T> {
        self.inner.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }
}
