use core::fmt;

use super::context::Context;
use crate::fs::fd::{FileHandle, NOFILE};
use crate::memory::frame_allocator::PhysFrame;
use crate::memory::paging::AddrSpace;
use crate::syscalls::CurrentProc;

/// Capacity of the process table.
pub const NPROC: usize = 64;

/// Maximum process-name length as persisted in snapshot records.
pub const NAME_LEN: usize = 16;

/// Interrupt-enable bit of the flags register.
pub const FLAG_IF: u64 = 0x200;

/// Ring-3 code and data segment selectors.
pub const UCODE_SEL: u64 = 0x1b;
pub const UDATA_SEL: u64 = 0x23;

/// Unique process identifier, assigned monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle to one process-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub(crate) usize);

impl Slot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// Opaque tag identifying the condition a sleeping process waits on,
/// matched exactly by wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(usize);

impl Channel {
    /// The tag a parent sleeps on until one of its children exits.
    pub(crate) fn child_exit(parent: Slot) -> Channel {
        Channel(parent.0)
    }
}

/// Number of 8-byte words in an encoded register frame.
pub const FRAME_WORDS: usize = 26;

/// Encoded size of a register frame.
pub const FRAME_BYTES: usize = FRAME_WORDS * 8;

/// User-mode register state captured on every kernel entry and restored
/// on the way back out. The byte layout is fixed: snapshot records must
/// round-trip this structure bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl TrapFrame {
    /// Initial user frame: entry at address 0, stack at the top of the
    /// process image, interrupts enabled, ring-3 selectors.
    pub fn new_user(stack_top: u64) -> Self {
        TrapFrame {
            rip: 0,
            rsp: stack_top,
            rflags: FLAG_IF,
            cs: UCODE_SEL,
            ss: UDATA_SEL,
            ds: UDATA_SEL,
            es: UDATA_SEL,
            fs: UDATA_SEL,
            gs: UDATA_SEL,
            ..TrapFrame::default()
        }
    }

    fn words(&self) -> [u64; FRAME_WORDS] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.r8,
            self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15, self.trapno,
            self.err, self.rip, self.cs, self.rflags, self.rsp, self.ss, self.ds, self.es,
            self.fs, self.gs,
        ]
    }

    fn from_words(w: [u64; FRAME_WORDS]) -> Self {
        TrapFrame {
            rax: w[0],
            rbx: w[1],
            rcx: w[2],
            rdx: w[3],
            rsi: w[4],
            rdi: w[5],
            rbp: w[6],
            r8: w[7],
            r9: w[8],
            r10: w[9],
            r11: w[10],
            r12: w[11],
            r13: w[12],
            r14: w[13],
            r15: w[14],
            trapno: w[15],
            err: w[16],
            rip: w[17],
            cs: w[18],
            rflags: w[19],
            rsp: w[20],
            ss: w[21],
            ds: w[22],
            es: w[23],
            fs: w[24],
            gs: w[25],
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_BYTES] {
        let mut out = [0u8; FRAME_BYTES];
        for (i, word) in self.words().into_iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; FRAME_BYTES]) -> Self {
        let mut words = [0u64; FRAME_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        }
        Self::from_words(words)
    }
}

/// Modeled user-mode execution: invoked once per time slice while the
/// process is RUNNING.
pub(crate) type Body = Box<dyn FnMut(&mut CurrentProc<'_>)>;

/// One schedulable unit of execution. Every resource hanging off the
/// descriptor (kernel stack, address-space frames) is owned exclusively
/// by the slot and released when the slot returns to UNUSED.
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    pub size: usize,
    pub state: ProcState,
    pub parent: Option<Slot>,
    pub killed: bool,
    pub chan: Option<Channel>,
    pub files: [Option<FileHandle>; NOFILE],
    pub cwd: Option<FileHandle>,
    pub kstack: Option<PhysFrame>,
    pub frame: TrapFrame,
    pub context: Context,
    pub space: Option<AddrSpace>,
    pub(crate) body: Option<Body>,
}

impl Process {
    fn unused() -> Process {
        Process {
            pid: ProcessId(0),
            name: String::new(),
            size: 0,
            state: ProcState::Unused,
            parent: None,
            killed: false,
            chan: None,
            files: core::array::from_fn(|_| None),
            cwd: None,
            kstack: None,
            frame: TrapFrame::default(),
            context: Context::default(),
            space: None,
            body: None,
        }
    }

    /// Return the slot to UNUSED. The kernel stack and address space
    /// must already have been taken out and released by the caller.
    pub(crate) fn reset_unused(&mut self) {
        debug_assert!(self.kstack.is_none(), "reset with live kernel stack");
        debug_assert!(self.space.is_none(), "reset with live address space");
        *self = Process::unused();
    }
}

/// Fixed-capacity arena of process slots plus the monotonic pid source.
/// Shared across every cpu and guarded by the table lock.
pub struct ProcTable {
    pub(crate) procs: Vec<Process>,
    next_pid: u32,
    pub(crate) init_slot: Option<Slot>,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        ProcTable {
            procs: (0..NPROC).map(|_| Process::unused()).collect(),
            next_pid: 1,
            init_slot: None,
        }
    }

    pub(crate) fn assign_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub(crate) fn get(&self, slot: Slot) -> &Process {
        &self.procs[slot.0]
    }

    pub(crate) fn get_mut(&mut self, slot: Slot) -> &mut Process {
        &mut self.procs[slot.0]
    }

    /// Mutable access to two distinct slots at once.
    pub(crate) fn pair_mut(&mut self, a: Slot, b: Slot) -> (&mut Process, &mut Process) {
        assert_ne!(a.0, b.0, "pair_mut: identical slots");
        if a.0 < b.0 {
            let (lo, hi) = self.procs.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.procs.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub(crate) fn find_unused(&self) -> Option<Slot> {
        self.procs
            .iter()
            .position(|p| p.state == ProcState::Unused)
            .map(Slot)
    }

    pub(crate) fn find_pid(&self, pid: ProcessId) -> Option<Slot> {
        self.procs
            .iter()
            .position(|p| p.state != ProcState::Unused && p.pid == pid)
            .map(Slot)
    }

    /// Promote every process sleeping on `chan` to RUNNABLE. Processes
    /// sleeping on other tags are untouched. Caller holds the table lock.
    pub(crate) fn wakeup(&mut self, chan: Channel) {
        for p in self.procs.iter_mut() {
            if p.state == ProcState::Sleeping && p.chan == Some(chan) {
                p.state = ProcState::Runnable;
                p.chan = None;
            }
        }
    }
}

/// Truncate a requested process name to what the descriptor record can
/// carry.
pub(crate) fn clamp_name(name: &str) -> String {
    let mut end = name.len().min(NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_byte_encoding_is_stable() {
        let mut frame = TrapFrame::new_user(0x2000);
        frame.rax = 0x1122_3344_5566_7788;
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        // rip is word 17, rsp word 20.
        assert_eq!(&bytes[17 * 8..18 * 8], &0u64.to_le_bytes());
        assert_eq!(&bytes[20 * 8..21 * 8], &0x2000u64.to_le_bytes());
        assert_eq!(TrapFrame::from_bytes(&bytes), frame);
    }

    #[test]
    fn pair_mut_handles_either_order() {
        let mut table = ProcTable::new();
        table.get_mut(Slot(1)).pid = ProcessId(11);
        table.get_mut(Slot(3)).pid = ProcessId(33);

        let (a, b) = table.pair_mut(Slot(3), Slot(1));
        assert_eq!(a.pid, ProcessId(33));
        assert_eq!(b.pid, ProcessId(11));
    }

    #[test]
    fn wakeup_only_matches_the_exact_tag() {
        let mut table = ProcTable::new();
        table.get_mut(Slot(0)).state = ProcState::Sleeping;
        table.get_mut(Slot(0)).chan = Some(Channel::child_exit(Slot(5)));
        table.get_mut(Slot(1)).state = ProcState::Sleeping;
        table.get_mut(Slot(1)).chan = Some(Channel::child_exit(Slot(6)));

        table.wakeup(Channel::child_exit(Slot(5)));
        assert_eq!(table.get(Slot(0)).state, ProcState::Runnable);
        assert_eq!(table.get(Slot(1)).state, ProcState::Sleeping);
    }

    #[test]
    fn clamp_name_respects_the_record_limit() {
        assert_eq!(clamp_name("worker"), "worker");
        assert_eq!(clamp_name("a-very-long-process-name"), "a-very-long-proc");
    }
}
