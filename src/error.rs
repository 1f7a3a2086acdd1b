use thiserror::Error;

/// Recoverable kernel errors: resource exhaustion and snapshot I/O.
///
/// Invariant violations (remapping a present page, bad lock state in the
/// scheduler, the root process exiting) are not represented here; those
/// halt the kernel via panic.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("process table is full")]
    TableFull,

    #[error("out of physical frames")]
    OutOfFrames,

    #[error("process has no children to wait for")]
    NoChildren,

    #[error("no such process: pid {0}")]
    NoSuchProcess(u32),

    #[error("virtual address {0:#x} is not mapped")]
    BadVirtualAddress(usize),

    #[error("record too short: expected {expected} bytes, got {got}")]
    TruncatedRecord { expected: usize, got: usize },

    #[error("bad record header: {reason}")]
    BadRecordHeader { reason: String },

    #[error("snapshot page count mismatch: descriptor implies {expected} pages, record carries {got}")]
    PageCountMismatch { expected: usize, got: usize },

    #[error("snapshot record {0} is missing")]
    MissingRecord(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
