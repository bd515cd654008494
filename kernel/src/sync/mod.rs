mod once;
mod spinlock;

pub use once::OnceCell;
pub use spinlock::{SpinLock, SpinLockGuard};
