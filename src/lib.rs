//! CryoOS process core: the process table, per-cpu scheduler, and
//! two-level virtual memory of a small multitasking kernel, plus an
//! in-kernel checkpoint/restore facility that freezes a running
//! process into five persisted records and rebuilds a schedulable
//! process from them.
//!
//! The core runs against a modeled machine — a frame arena for physical
//! memory, software interrupt flags, and an explicit suspend/resume
//! primitive for the context switch — so the whole protocol is
//! exercised by ordinary tests.

pub mod checkpoint;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod syscalls;

pub use checkpoint::store::SnapshotDir;
pub use checkpoint::{Descriptor, Snapshot};
pub use error::{KernelError, Result};
pub use kernel::{Kernel, DEFAULT_FRAMES, NCPU};
pub use memory::PAGE_SIZE;
pub use scheduler::context::Context;
pub use scheduler::task::{ProcState, ProcessId, TrapFrame, NPROC};
pub use syscalls::{CurrentProc, WaitOutcome};
