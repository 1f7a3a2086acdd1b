use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Per-CPU interrupt-enable state.
///
/// The machine model keeps the hardware interrupt flag in software. Locks
/// nest through `push_off`/`pop_off`: the first `push_off` records whether
/// interrupts were on so the last `pop_off` can restore them.
pub struct IntrState {
    /// The modeled hardware interrupt-enable flag.
    on: Cell<bool>,
    /// Depth of push_off nesting.
    ncli: Cell<u32>,
    /// Were interrupts enabled before the first push_off?
    intena: Cell<bool>,
}

impl IntrState {
    pub const fn new() -> Self {
        IntrState {
            on: Cell::new(false),
            ncli: Cell::new(0),
            intena: Cell::new(false),
        }
    }

    /// Enable interrupts on this cpu (sti).
    pub fn enable(&self) {
        assert_eq!(self.ncli.get(), 0, "sti inside a critical section");
        self.on.set(true);
    }

    /// Disable interrupts on this cpu (cli).
    pub fn disable(&self) {
        self.on.set(false);
    }

    pub fn enabled(&self) -> bool {
        self.on.get()
    }

    /// Nesting depth of interrupt-disabling sections.
    pub fn depth(&self) -> u32 {
        self.ncli.get()
    }

    pub fn push_off(&self) {
        let was_on = self.on.get();
        self.on.set(false);
        if self.ncli.get() == 0 {
            self.intena.set(was_on);
        }
        self.ncli.set(self.ncli.get() + 1);
    }

    pub fn pop_off(&self) {
        assert!(!self.on.get(), "pop_off: interrupts enabled");
        let n = self.ncli.get();
        assert!(n > 0, "pop_off: unbalanced");
        self.ncli.set(n - 1);
        if n == 1 && self.intena.get() {
            self.on.set(true);
        }
    }

    /// The interrupt-enable state recorded by the outermost push_off.
    /// The scheduler saves and restores this across a context switch.
    pub(crate) fn saved_enable(&self) -> bool {
        self.intena.get()
    }

    pub(crate) fn restore_saved(&self, value: bool) {
        self.intena.set(value);
    }
}

impl Default for IntrState {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy-wait mutual-exclusion lock that disables interrupts while held.
///
/// Interrupts stay off on the holding cpu for the lifetime of the guard,
/// so an interrupt handler on the same cpu can never reenter the critical
/// section.
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        SpinLock {
            name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts on the calling cpu first.
    ///
    /// A single-image machine that reacquires its own lock would spin
    /// forever; that is an invariant violation, so it halts instead.
    pub fn lock<'a>(&'a self, intr: &'a IntrState) -> SpinGuard<'a, T> {
        intr.push_off();
        if self.locked.swap(true, Ordering::Acquire) {
            panic!("{}: lock already held", self.name);
        }
        SpinGuard { lock: self, intr }
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    intr: &'a IntrState,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.intr.pop_off();
    }
}
