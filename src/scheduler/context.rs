/// Kernel-private register snapshot used only for voluntary switches
/// between a process and the scheduler: the base pointer, three
/// callee-saved registers, and the instruction pointer. Nothing outside
/// `switch` interprets it, and it carries no meaning across address
/// spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Context {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Encoded size of a context record.
pub const CONTEXT_BYTES: usize = 40;

/// Fixed kernel entry taken on a process's very first scheduling; it
/// releases the table lock and returns to user mode through the
/// register frame.
pub const FIRST_RETURN: u64 = 0xffff_8000_0010_0000;

/// Resume point of a continuation suspended inside `sched`.
pub const SCHED_RESUME: u64 = 0xffff_8000_0010_0040;

impl Context {
    /// Continuation prearranged by process allocation: the first
    /// scheduling resumes at the fixed first-return entry.
    pub fn first_run() -> Self {
        Context {
            rip: FIRST_RETURN,
            ..Context::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; CONTEXT_BYTES] {
        let mut out = [0u8; CONTEXT_BYTES];
        let words = [self.rbx, self.r12, self.r13, self.rbp, self.rip];
        for (i, word) in words.into_iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; CONTEXT_BYTES]) -> Self {
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        Context {
            rbx: word(0),
            r12: word(1),
            r13: word(2),
            rbp: word(3),
            rip: word(4),
        }
    }
}

/// One-shot continuation handoff, legal only inside the scheduler's
/// critical section. Records where `from` suspends and reports the
/// entry point at which `to` resumes; the caller transfers control
/// there. No fairness beyond the caller's own scan order.
pub fn switch(from: &mut Context, to: &Context) -> u64 {
    from.rip = SCHED_RESUME;
    to.rip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_encoding_is_stable() {
        let ctx = Context {
            rbx: 1,
            r12: 2,
            r13: 3,
            rbp: 4,
            rip: 5,
        };
        let bytes = ctx.to_bytes();
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &5u64.to_le_bytes());
        assert_eq!(Context::from_bytes(&bytes), ctx);
    }

    #[test]
    fn switch_suspends_from_and_resumes_to() {
        let mut from = Context::first_run();
        let to = Context {
            rip: FIRST_RETURN,
            ..Context::default()
        };
        let entry = switch(&mut from, &to);
        assert_eq!(entry, FIRST_RETURN);
        assert_eq!(from.rip, SCHED_RESUME);
    }
}
