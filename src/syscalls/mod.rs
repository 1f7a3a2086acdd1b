use crate::error::Result;
use crate::kernel::{Cpu, Kernel};
use crate::scheduler::task::{ProcessId, Slot};

/// Result of one wait attempt by the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A zombie child was collected; its slot is UNUSED again.
    Reaped(ProcessId),
    /// The caller went to SLEEPING until a child exits; retry on the
    /// next slice.
    Blocked,
}

/// The currently executing process's view of the kernel — the surface a
/// trap dispatcher would expose to user code. Handed to a process body
/// for the duration of one time slice.
///
/// Calls that give up the cpu (`yield_now`, `exit`, a blocking `wait`)
/// end the slice; issuing further syscalls afterwards is a contract
/// violation and halts the kernel.
pub struct CurrentProc<'a> {
    kernel: &'a Kernel,
    cpu_id: usize,
    slot: Slot,
    off_cpu: bool,
}

impl<'a> CurrentProc<'a> {
    pub(crate) fn new(kernel: &'a Kernel, cpu_id: usize, slot: Slot) -> Self {
        CurrentProc {
            kernel,
            cpu_id,
            slot,
            off_cpu: false,
        }
    }

    pub(crate) fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub(crate) fn cpu(&self) -> &'a Cpu {
        self.kernel.cpu(self.cpu_id)
    }

    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn check_on_cpu(&self) {
        if self.off_cpu {
            panic!("syscall from a process that already left the cpu");
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.check_on_cpu();
        let guard = self.kernel.table.lock(&self.cpu().intr);
        guard.get(self.slot).pid
    }

    pub fn name(&self) -> String {
        self.check_on_cpu();
        let guard = self.kernel.table.lock(&self.cpu().intr);
        guard.get(self.slot).name.clone()
    }

    pub fn size(&self) -> usize {
        self.check_on_cpu();
        let guard = self.kernel.table.lock(&self.cpu().intr);
        guard.get(self.slot).size
    }

    /// Voluntarily give up the remaining quantum. Ends the slice.
    pub fn yield_now(&mut self) {
        self.check_on_cpu();
        self.kernel.yield_slot(self.cpu(), self.slot);
        self.off_cpu = true;
    }

    /// Duplicate this process. The caller sees the child's pid; the
    /// child's frame carries zero in its return-value register.
    pub fn fork(&mut self) -> Result<ProcessId> {
        self.check_on_cpu();
        self.kernel.fork_slot(self.cpu(), self.slot)
    }

    /// Terminate this process. Control never re-enters it; the slice is
    /// over.
    pub fn exit(&mut self) {
        self.check_on_cpu();
        self.kernel.exit_slot(self.cpu(), self.slot);
        self.off_cpu = true;
    }

    /// Collect a zombie child, or block until one appears. A blocking
    /// outcome ends the slice; the body retries on its next run.
    pub fn wait(&mut self) -> Result<WaitOutcome> {
        self.check_on_cpu();
        let outcome = self.kernel.wait_slot(self.cpu(), self.slot);
        if let Ok(WaitOutcome::Blocked) = outcome {
            self.off_cpu = true;
        }
        outcome
    }

    pub fn kill(&mut self, pid: ProcessId) -> Result<()> {
        self.check_on_cpu();
        self.kernel.kill(self.cpu_id, pid)
    }

    /// Grow or shrink this process's memory by `delta` bytes; reports
    /// the new size.
    pub fn grow(&mut self, delta: isize) -> Result<usize> {
        self.check_on_cpu();
        self.kernel.grow_slot(self.cpu(), self.slot, delta)
    }

    /// Copy bytes out of this process's own memory.
    pub fn read_bytes(&self, va: usize, buf: &mut [u8]) -> Result<()> {
        self.check_on_cpu();
        let guard = self.kernel.table.lock(&self.cpu().intr);
        let p = guard.get(self.slot);
        let space = p.space.as_ref().expect("process has no address space");
        let arena = self.kernel.frames.lock();
        space.read_bytes(&arena, va, buf)
    }

    /// Copy bytes into this process's own memory.
    pub fn write_bytes(&mut self, va: usize, data: &[u8]) -> Result<()> {
        self.check_on_cpu();
        let mut guard = self.kernel.table.lock(&self.cpu().intr);
        let p = guard.get_mut(self.slot);
        let space = p.space.as_mut().expect("process has no address space");
        let mut arena = self.kernel.frames.lock();
        space.write_bytes(&mut arena, va, data)
    }
}
