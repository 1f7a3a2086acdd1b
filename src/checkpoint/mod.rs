pub mod image;
pub mod restore;
pub mod store;

pub use restore::CandidateImage;

use crate::error::Result;
use crate::memory::paging::Pte;
use crate::memory::{page_count, PAGE_SIZE};
use crate::scheduler::context::Context;
use crate::scheduler::task::TrapFrame;
use crate::syscalls::CurrentProc;

/// Identity half of the descriptor record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub pid: u32,
    pub name: String,
    pub size: u64,
}

/// A point-in-time, self-consistent copy of one process: the five
/// records that together are sufficient to reinstantiate it. Capture is
/// copy-on-capture — producing a snapshot never disturbs the source.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub descriptor: Descriptor,
    pub frame: TrapFrame,
    pub context: Context,
    /// One entry per page of the image, in page order.
    pub page_table: Vec<Pte>,
    /// Raw page contents, packed in the same order.
    pub pages: Vec<u8>,
}

impl Snapshot {
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }
}

impl CurrentProc<'_> {
    /// Self-snapshot: copy this process's size, name, register frame,
    /// and context record verbatim, then walk its address space and copy
    /// every live page together with its leaf entry. Runs synchronously
    /// on the caller's own slice and has no effect on process state.
    pub fn capture(&self) -> Result<Snapshot> {
        self.check_on_cpu();
        let cpu = self.cpu();
        debug_assert_eq!(
            cpu.aspace.get(),
            Some(self.slot()),
            "capture: caller's address space not installed"
        );
        let guard = self.kernel().table.lock(&cpu.intr);
        let p = guard.get(self.slot());

        // The page count comes from the live size field, never from a
        // constant.
        let count = page_count(p.size);
        let descriptor = Descriptor {
            pid: p.pid.0,
            name: p.name.clone(),
            size: p.size as u64,
        };
        let frame = p.frame;
        let context = p.context;

        let space = p.space.as_ref().expect("capture: no address space");
        let arena = self.kernel().frames.lock();
        let mut page_table = Vec::with_capacity(count);
        let mut pages = vec![0u8; count * PAGE_SIZE];
        for i in 0..count {
            let va = i * PAGE_SIZE;
            let pte = space.lookup(va);
            if !pte.is_present() {
                panic!("capture: page {va:#x} expected present");
            }
            page_table.push(pte);
            pages[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(arena.frame(pte.frame()));
        }

        log::debug!(
            "capture: pid {} '{}', {count} pages",
            descriptor.pid,
            descriptor.name
        );
        Ok(Snapshot {
            descriptor,
            frame,
            context,
            page_table,
            pages,
        })
    }
}
