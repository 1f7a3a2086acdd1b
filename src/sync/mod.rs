pub mod spinlock;

pub use spinlock::{IntrState, SpinGuard, SpinLock};
