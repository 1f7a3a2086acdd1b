use core::cell::Cell;

use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::memory::frame_allocator::FrameArena;
use crate::scheduler::context::Context;
use crate::scheduler::task::{ProcState, ProcTable, ProcessId, Slot, TrapFrame, NPROC};
use crate::sync::{IntrState, SpinLock};

/// Number of execution units the machine models.
pub const NCPU: usize = 2;

/// Default physical-memory size, in 4 KiB frames.
pub const DEFAULT_FRAMES: usize = 512;

/// Per-cpu state: interrupt discipline, the process currently on the
/// cpu, the address space installed in its MMU, and the scheduler's own
/// continuation.
pub(crate) struct Cpu {
    pub(crate) intr: IntrState,
    pub(crate) current: Cell<Option<Slot>>,
    pub(crate) aspace: Cell<Option<Slot>>,
    pub(crate) scheduler_ctx: Cell<Context>,
}

impl Cpu {
    fn new() -> Self {
        Cpu {
            intr: IntrState::new(),
            current: Cell::new(None),
            aspace: Cell::new(None),
            scheduler_ctx: Cell::new(Context::default()),
        }
    }
}

/// The process-management core: process table, physical-memory arena,
/// and one scheduler per cpu.
///
/// Construction is the defined initialization point; there is no
/// teardown. The table lock is the single shared-state lock of the
/// core, and it disables interrupts on the holding cpu.
pub struct Kernel {
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) table: SpinLock<ProcTable>,
    pub(crate) frames: Mutex<FrameArena>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_frames(DEFAULT_FRAMES)
    }

    pub fn with_frames(total: usize) -> Self {
        log::info!(
            "process core: {} table slots, {} physical frames",
            NPROC,
            total
        );
        Kernel {
            cpus: (0..NCPU).map(|_| Cpu::new()).collect(),
            table: SpinLock::new("ptable", ProcTable::new()),
            frames: Mutex::new(FrameArena::new(total)),
        }
    }

    pub(crate) fn cpu(&self, id: usize) -> &Cpu {
        &self.cpus[id]
    }

    /// Frames still available in the arena.
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// Pid of the process on `cpu`, if one is on it right now.
    pub fn current_pid(&self, cpu_id: usize) -> Option<ProcessId> {
        let cpu = self.cpu(cpu_id);
        let slot = cpu.current.get()?;
        let guard = self.table.lock(&cpu.intr);
        Some(guard.get(slot).pid)
    }

    // ── Diagnostics: the `ps`/debugger surface. Read-mostly accessors
    // over the table, all keyed by pid. ──

    /// (pid, name, state) for every occupied slot, in table order.
    pub fn process_listing(&self, cpu_id: usize) -> Vec<(ProcessId, String, ProcState)> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        guard
            .procs
            .iter()
            .filter(|p| p.state != ProcState::Unused)
            .map(|p| (p.pid, p.name.clone(), p.state))
            .collect()
    }

    pub fn process_state(&self, cpu_id: usize, pid: ProcessId) -> Option<ProcState> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        guard.find_pid(pid).map(|s| guard.get(s).state)
    }

    pub fn process_size(&self, cpu_id: usize, pid: ProcessId) -> Option<usize> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        guard.find_pid(pid).map(|s| guard.get(s).size)
    }

    pub fn process_frame(&self, cpu_id: usize, pid: ProcessId) -> Option<TrapFrame> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        guard.find_pid(pid).map(|s| guard.get(s).frame)
    }

    pub fn process_context(&self, cpu_id: usize, pid: ProcessId) -> Option<Context> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        guard.find_pid(pid).map(|s| guard.get(s).context)
    }

    /// Debugger peek into a process's memory.
    pub fn read_process_bytes(
        &self,
        cpu_id: usize,
        pid: ProcessId,
        va: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let cpu = self.cpu(cpu_id);
        let guard = self.table.lock(&cpu.intr);
        let slot = guard.find_pid(pid).ok_or(KernelError::NoSuchProcess(pid.0))?;
        let space = guard
            .get(slot)
            .space
            .as_ref()
            .ok_or(KernelError::BadVirtualAddress(va))?;
        let arena = self.frames.lock();
        space.read_bytes(&arena, va, buf)
    }

    /// Debugger poke into a process's memory.
    pub fn write_process_bytes(
        &self,
        cpu_id: usize,
        pid: ProcessId,
        va: usize,
        data: &[u8],
    ) -> Result<()> {
        let cpu = self.cpu(cpu_id);
        let mut guard = self.table.lock(&cpu.intr);
        let slot = guard.find_pid(pid).ok_or(KernelError::NoSuchProcess(pid.0))?;
        let space = guard
            .get_mut(slot)
            .space
            .as_mut()
            .ok_or(KernelError::BadVirtualAddress(va))?;
        let mut arena = self.frames.lock();
        space.write_bytes(&mut arena, va, data)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
