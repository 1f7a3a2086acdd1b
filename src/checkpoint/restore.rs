//! Rebuilding a live process from persisted records: replay the
//! page-table description against fresh frames, copy the raw page
//! contents back in, and install the result as a new schedulable
//! process with fork's return convention.

use super::Snapshot;
use crate::error::Result;
use crate::fs::fd;
use crate::kernel::Kernel;
use crate::memory::paging::AddrSpace;
use crate::memory::PAGE_SIZE;
use crate::scheduler::context::Context;
use crate::scheduler::task::{clamp_name, ProcState, ProcessId, TrapFrame};
use crate::syscalls::CurrentProc;

/// A process image rebuilt from a snapshot but not yet installed in the
/// table: everything a slot needs except a slot.
pub struct CandidateImage {
    pub name: String,
    pub size: usize,
    pub frame: TrapFrame,
    pub context: Context,
    pub(crate) space: AddrSpace,
}

impl Kernel {
    /// Allocate fresh frames, replay the snapshot's page-table
    /// description against them, and copy the raw page contents in.
    /// Old frame numbers in the record are meaningless here; only the
    /// permissions carry over.
    pub(crate) fn rebuild_image(&self, snap: &Snapshot) -> Result<CandidateImage> {
        let mut space = AddrSpace::new();
        let mut arena = self.frames.lock();
        for (i, pte) in snap.page_table.iter().enumerate() {
            let va = i * PAGE_SIZE;
            let frame = match arena.alloc() {
                Ok(f) => f,
                Err(e) => {
                    space.release(&mut arena);
                    return Err(e);
                }
            };
            arena
                .frame_mut(frame)
                .copy_from_slice(&snap.pages[va..va + PAGE_SIZE]);
            space.map_range(va, PAGE_SIZE, frame, pte.flags());
        }
        Ok(CandidateImage {
            name: snap.descriptor.name.clone(),
            size: snap.descriptor.size as usize,
            frame: snap.frame,
            context: snap.context,
            space,
        })
    }
}

impl CurrentProc<'_> {
    /// Install a rebuilt candidate image as a new process. Behaves like
    /// fork, except the frame, size, and page contents come from the
    /// image instead of the caller: the caller gets the child's pid,
    /// the reconstructed process observes zero in its return-value
    /// register, and the caller may wait on it like any other child.
    pub fn reinstantiate(&mut self, snap: &Snapshot) -> Result<ProcessId> {
        self.check_on_cpu();
        let kernel = self.kernel();
        let cpu = self.cpu();

        let image = kernel.rebuild_image(snap)?;
        let child = match kernel.allocate(cpu) {
            Ok(slot) => slot,
            Err(e) => {
                let mut space = image.space;
                space.release(&mut kernel.frames.lock());
                return Err(e);
            }
        };

        let mut guard = kernel.table.lock(&cpu.intr);
        let (me, cp) = guard.pair_mut(self.slot(), child);
        cp.space = Some(image.space);
        cp.size = image.size;
        cp.name = clamp_name(&image.name);
        cp.frame = image.frame;
        cp.frame.rax = 0; // the reconstructed process observes zero
        // The persisted continuation resumes through the same switch
        // paths as a first run, so it is installed verbatim.
        cp.context = image.context;
        cp.files = fd::dup_table(&me.files);
        cp.cwd = me.cwd.clone();
        cp.parent = Some(self.slot());
        let pid = cp.pid;
        cp.state = ProcState::Runnable;
        me.frame.rax = pid.0 as u64;
        log::info!(
            "reinstantiate: pid {pid} '{}' from snapshot of pid {}",
            guard.get(child).name,
            snap.descriptor.pid
        );
        Ok(pid)
    }
}
