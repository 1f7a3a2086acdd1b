pub mod context;
pub mod task;

use crate::error::{KernelError, Result};
use crate::fs::fd;
use crate::fs::fd::File;
use crate::kernel::{Cpu, Kernel};
use crate::memory::paging::AddrSpace;
use crate::memory::PAGE_SIZE;
use crate::syscalls::{CurrentProc, WaitOutcome};
use task::{clamp_name, Body, Channel, ProcState, ProcTable, ProcessId, Slot, TrapFrame, NPROC};

impl Kernel {
    // ── Boot-time process creation ──

    /// Set up the root process: one page of zeroed memory, a fresh user
    /// frame, and the given body. Everything later orphaned is
    /// reparented to it, and it must never exit.
    pub fn spawn_init(
        &self,
        cpu_id: usize,
        name: &str,
        body: impl FnMut(&mut CurrentProc<'_>) + 'static,
    ) -> Result<ProcessId> {
        self.spawn_inner(cpu_id, name, 1, Box::new(body), true)
    }

    /// Create an additional named process with an n-page zeroed address
    /// space, parented to the root process.
    pub fn spawn(
        &self,
        cpu_id: usize,
        name: &str,
        pages: usize,
        body: impl FnMut(&mut CurrentProc<'_>) + 'static,
    ) -> Result<ProcessId> {
        self.spawn_inner(cpu_id, name, pages, Box::new(body), false)
    }

    fn spawn_inner(
        &self,
        cpu_id: usize,
        name: &str,
        pages: usize,
        body: Body,
        is_init: bool,
    ) -> Result<ProcessId> {
        let cpu = self.cpu(cpu_id);
        if is_init {
            let guard = self.table.lock(&cpu.intr);
            assert!(guard.init_slot.is_none(), "root process already exists");
        }
        let slot = self.allocate(cpu)?;

        let size = pages * PAGE_SIZE;
        let mut space = AddrSpace::new();
        {
            let mut arena = self.frames.lock();
            if let Err(e) = space.alloc_range(&mut arena, 0, size) {
                space.release(&mut arena);
                drop(arena);
                self.release_embryo(cpu, slot);
                return Err(e);
            }
        }

        let mut guard = self.table.lock(&cpu.intr);
        let parent = if is_init { None } else { guard.init_slot };
        let p = guard.get_mut(slot);
        p.name = clamp_name(name);
        p.size = size;
        p.space = Some(space);
        p.frame = TrapFrame::new_user(size as u64);
        p.files = fd::default_files();
        p.cwd = Some(File::directory("/"));
        p.parent = parent;
        p.body = Some(body);
        let pid = p.pid;
        p.state = ProcState::Runnable;
        if is_init {
            guard.init_slot = Some(slot);
        }
        log::info!("spawned '{}' as pid {pid} ({pages} pages)", guard.get(slot).name);
        Ok(pid)
    }

    // ── Per-cpu scheduler loop ──

    /// Scheduler loop for one execution unit: enable interrupts, scan
    /// the table in slot order for a RUNNABLE process, switch into it,
    /// and go idle again when it comes back. Returns after `max_slices`
    /// slices, or early once nothing is runnable — the hosted stand-in
    /// for a loop that otherwise never exits.
    pub fn run(&self, cpu_id: usize, max_slices: usize) -> usize {
        let cpu = self.cpu(cpu_id);
        let mut executed = 0;
        loop {
            // Enable interrupts on this processor.
            cpu.intr.enable();
            let mut guard = self.table.lock(&cpu.intr);
            let mut ran = false;
            for i in 0..NPROC {
                if executed == max_slices {
                    drop(guard);
                    return executed;
                }
                if guard.get(Slot(i)).state != ProcState::Runnable {
                    continue;
                }
                ran = true;
                executed += 1;
                guard = self.run_slice(cpu, cpu_id, guard, Slot(i));
            }
            drop(guard);
            if !ran {
                return executed;
            }
        }
    }

    /// Switch into `slot` for one time slice and back out again.
    /// Takes the held table lock and returns it re-acquired.
    fn run_slice<'a>(
        &'a self,
        cpu: &'a Cpu,
        cpu_id: usize,
        mut guard: crate::sync::SpinGuard<'a, ProcTable>,
        slot: Slot,
    ) -> crate::sync::SpinGuard<'a, ProcTable> {
        // Install the address space, mark the process RUNNING, and hand
        // the cpu over through its context record.
        cpu.current.set(Some(slot));
        cpu.aspace.set(Some(slot));
        let (pid, entry, killed) = {
            let mut sctx = cpu.scheduler_ctx.get();
            let p = guard.get_mut(slot);
            p.state = ProcState::Running;
            let entry = context::switch(&mut sctx, &p.context);
            cpu.scheduler_ctx.set(sctx);
            (p.pid, entry, p.killed)
        };
        if entry == context::FIRST_RETURN {
            log::trace!("first scheduling of pid {pid}");
        }
        let mut body = guard.get_mut(slot).body.take();
        // The process side of the switch releases the table lock on its
        // way back to user mode (first-run and resumed paths alike).
        drop(guard);

        if killed {
            // The kill flag is observed at the return-to-user checkpoint;
            // a killed process's slice becomes its exit path.
            drop(body);
            self.exit_slot(cpu, slot);
        } else {
            if let Some(b) = body.as_mut() {
                let mut cp = CurrentProc::new(self, cpu_id, slot);
                b(&mut cp);
            }
            let mut guard = self.table.lock(&cpu.intr);
            if guard.get(slot).state == ProcState::Running {
                // The slice ran out with the process still on the cpu: a
                // timer preemption forces it through the yield path.
                guard.get_mut(slot).state = ProcState::Runnable;
                self.sched(cpu, &mut guard, slot);
            }
            match guard.get(slot).state {
                ProcState::Unused | ProcState::Zombie => drop(body),
                _ => guard.get_mut(slot).body = body,
            }
        }

        // Back on the scheduler side: the cpu is idle again.
        cpu.current.set(None);
        cpu.aspace.set(None);
        self.table.lock(&cpu.intr)
    }

    // ── Context-switch protocol ──

    /// Enter the scheduler. The caller must hold the table lock exactly
    /// once, must already have moved itself out of RUNNING, and must
    /// have interrupts disabled; any violation halts the kernel. The
    /// interrupt-enable state recorded before the lock was taken
    /// survives the switch.
    pub(crate) fn sched(&self, cpu: &Cpu, table: &mut ProcTable, slot: Slot) {
        if !self.table.holding() {
            panic!("sched: table lock not held");
        }
        if cpu.intr.depth() != 1 {
            panic!("sched: locks");
        }
        if table.get(slot).state == ProcState::Running {
            panic!("sched: running");
        }
        if cpu.intr.enabled() {
            panic!("sched: interruptible");
        }
        let intena = cpu.intr.saved_enable();
        let sctx = cpu.scheduler_ctx.get();
        let p = table.get_mut(slot);
        let mut ctx = p.context;
        context::switch(&mut ctx, &sctx);
        p.context = ctx;
        cpu.intr.restore_saved(intena);
    }

    /// Voluntarily give up the rest of the quantum.
    pub(crate) fn yield_slot(&self, cpu: &Cpu, slot: Slot) {
        let mut guard = self.table.lock(&cpu.intr);
        guard.get_mut(slot).state = ProcState::Runnable;
        self.sched(cpu, &mut guard, slot);
    }

    /// Move `slot` to SLEEPING on `chan` and enter the scheduler.
    ///
    /// The caller holds the table lock, and wakeup's scan takes the same
    /// lock, so no wakeup issued between deciding to sleep and actually
    /// sleeping can be missed.
    pub(crate) fn sleep(&self, cpu: &Cpu, table: &mut ProcTable, slot: Slot, chan: Channel) {
        let p = table.get_mut(slot);
        p.chan = Some(chan);
        p.state = ProcState::Sleeping;
        self.sched(cpu, table, slot);
    }

    /// Flag `pid` as killed and unblock it if it is sleeping so the flag
    /// is noticed at the next cooperative checkpoint. Never forces
    /// immediate termination.
    pub fn kill(&self, cpu_id: usize, pid: ProcessId) -> Result<()> {
        let cpu = self.cpu(cpu_id);
        let mut guard = self.table.lock(&cpu.intr);
        let slot = guard
            .find_pid(pid)
            .ok_or(KernelError::NoSuchProcess(pid.0))?;
        let p = guard.get_mut(slot);
        p.killed = true;
        if p.state == ProcState::Sleeping {
            p.state = ProcState::Runnable;
            p.chan = None;
        }
        log::debug!("kill: pid {pid} flagged");
        Ok(())
    }

    // ── Process lifecycle ──

    /// Claim an UNUSED slot: mark it EMBRYO with a fresh pid while the
    /// table lock is held, so no second allocator can reuse it, then
    /// allocate the kernel stack and prearrange the context record.
    /// The slot reverts to UNUSED if the stack allocation fails.
    pub(crate) fn allocate(&self, cpu: &Cpu) -> Result<Slot> {
        let mut guard = self.table.lock(&cpu.intr);
        let slot = guard.find_unused().ok_or(KernelError::TableFull)?;
        let pid = guard.assign_pid();
        let p = guard.get_mut(slot);
        p.state = ProcState::Embryo;
        p.pid = pid;
        drop(guard);

        let kstack = match self.frames.lock().alloc() {
            Ok(frame) => frame,
            Err(e) => {
                let mut guard = self.table.lock(&cpu.intr);
                guard.get_mut(slot).reset_unused();
                return Err(e);
            }
        };

        let mut guard = self.table.lock(&cpu.intr);
        let p = guard.get_mut(slot);
        p.kstack = Some(kstack);
        // First scheduling resumes at the fixed first-return entry, which
        // hands control back to user mode through the register frame.
        p.context = context::Context::first_run();
        p.frame = TrapFrame::default();
        Ok(slot)
    }

    /// Undo a claim made by `allocate`.
    fn release_embryo(&self, cpu: &Cpu, slot: Slot) {
        let mut guard = self.table.lock(&cpu.intr);
        let p = guard.get_mut(slot);
        if let Some(kstack) = p.kstack.take() {
            self.frames.lock().free(kstack);
        }
        p.reset_unused();
    }

    /// Duplicate `parent` into a new process: deep page-by-page copy of
    /// the address space, the register frame verbatim except a zeroed
    /// return-value register, and refcount-bumped handles. The child
    /// becomes RUNNABLE only after every step has succeeded.
    pub(crate) fn fork_slot(&self, cpu: &Cpu, parent: Slot) -> Result<ProcessId> {
        let child = self.allocate(cpu)?;

        let mut guard = self.table.lock(&cpu.intr);
        let size = guard.get(parent).size;
        let mut space = AddrSpace::new();
        let copied = {
            let mut arena = self.frames.lock();
            let src = guard
                .get(parent)
                .space
                .as_ref()
                .expect("fork: parent has no address space");
            src.duplicate_range(&mut space, &mut arena, size)
        };
        if let Err(e) = copied {
            space.release(&mut self.frames.lock());
            drop(guard);
            self.release_embryo(cpu, child);
            return Err(e);
        }

        let (pp, cp) = guard.pair_mut(parent, child);
        cp.space = Some(space);
        cp.size = pp.size;
        cp.frame = pp.frame;
        cp.frame.rax = 0; // the child observes zero from fork
        cp.files = fd::dup_table(&pp.files);
        cp.cwd = pp.cwd.clone();
        cp.name = pp.name.clone();
        cp.parent = Some(parent);
        let pid = cp.pid;
        cp.state = ProcState::Runnable;
        // The syscall return path delivers results through the frame's
        // return-value register: the child's pid here, zero in the child.
        pp.frame.rax = pid.0 as u64;
        log::debug!("fork: pid {} duplicated into pid {pid}", pp.pid);
        Ok(pid)
    }

    /// Terminate the current process: close every handle, hand children
    /// to the root process, become a ZOMBIE, and enter the scheduler for
    /// good. The root process itself must never get here.
    pub(crate) fn exit_slot(&self, cpu: &Cpu, slot: Slot) {
        // Handle teardown happens outside the critical section.
        let (files, cwd) = {
            let mut guard = self.table.lock(&cpu.intr);
            if guard.init_slot == Some(slot) {
                panic!("init exiting");
            }
            let p = guard.get_mut(slot);
            let files = core::mem::replace(&mut p.files, core::array::from_fn(|_| None));
            (files, p.cwd.take())
        };
        drop(files);
        drop(cwd);

        let mut guard = self.table.lock(&cpu.intr);
        let init = guard.init_slot.expect("exit before the root process exists");
        let pid = guard.get(slot).pid;

        // Parent might be sleeping in wait().
        if let Some(parent) = guard.get(slot).parent {
            guard.wakeup(Channel::child_exit(parent));
        }

        // Pass abandoned children to the root process.
        for i in 0..NPROC {
            if guard.get(Slot(i)).parent == Some(slot) {
                guard.get_mut(Slot(i)).parent = Some(init);
                if guard.get(Slot(i)).state == ProcState::Zombie {
                    guard.wakeup(Channel::child_exit(init));
                }
            }
        }

        // Jump into the scheduler, never to be run again.
        guard.get_mut(slot).state = ProcState::Zombie;
        self.sched(cpu, &mut guard, slot);
        log::debug!("exit: pid {pid} is now a zombie");
    }

    /// Reap one ZOMBIE child: reclaim its kernel stack and address
    /// space, return the slot to UNUSED, and report the child's pid.
    /// Fails immediately when the caller has no children; otherwise
    /// sleeps until some child exits.
    pub(crate) fn wait_slot(&self, cpu: &Cpu, slot: Slot) -> Result<WaitOutcome> {
        let mut guard = self.table.lock(&cpu.intr);

        let mut have_kids = false;
        for i in 0..NPROC {
            let s = Slot(i);
            if guard.get(s).parent != Some(slot) {
                continue;
            }
            have_kids = true;
            if guard.get(s).state == ProcState::Zombie {
                let p = guard.get_mut(s);
                let pid = p.pid;
                let kstack = p.kstack.take();
                let space = p.space.take();
                p.reset_unused();
                let mut arena = self.frames.lock();
                if let Some(frame) = kstack {
                    arena.free(frame);
                }
                if let Some(mut space) = space {
                    space.release(&mut arena);
                }
                drop(arena);
                guard.get_mut(slot).frame.rax = pid.0 as u64;
                log::debug!("wait: reaped pid {pid}");
                return Ok(WaitOutcome::Reaped(pid));
            }
        }

        // No point waiting without children, or once killed.
        if !have_kids || guard.get(slot).killed {
            return Err(KernelError::NoChildren);
        }

        // Block until some child exits; see the wakeup in exit.
        self.sleep(cpu, &mut guard, slot, Channel::child_exit(slot));
        Ok(WaitOutcome::Blocked)
    }

    /// Grow (or shrink) the current process's memory by `delta` bytes.
    pub(crate) fn grow_slot(&self, cpu: &Cpu, slot: Slot, delta: isize) -> Result<usize> {
        let mut guard = self.table.lock(&cpu.intr);
        let p = guard.get_mut(slot);
        let old = p.size;
        let new = {
            let space = p.space.as_mut().expect("grow: no address space");
            let mut arena = self.frames.lock();
            if delta >= 0 {
                space.alloc_range(&mut arena, old, old + delta as usize)?
            } else {
                let target = old.saturating_sub(delta.unsigned_abs());
                space.dealloc_range(&mut arena, old, target)
            }
        };
        p.size = new;
        Ok(new)
    }
}
