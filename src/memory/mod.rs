pub mod frame_allocator;
pub mod paging;

pub use frame_allocator::{FrameArena, PhysFrame};
pub use paging::{AddrSpace, PageFlags, Pte};

/// Size of one physical frame / virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Round `n` up to a whole number of pages.
pub fn page_round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to hold `bytes` bytes.
pub fn page_count(bytes: usize) -> usize {
    page_round_up(bytes) / PAGE_SIZE
}
