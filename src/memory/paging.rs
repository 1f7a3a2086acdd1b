use bit_field::BitField;
use bitflags::bitflags;

use super::frame_allocator::{FrameArena, PhysFrame};
use super::{page_count, page_round_up, PAGE_SIZE};
use crate::error::{KernelError, Result};

/// Entries per table at each of the two levels.
pub const ENTRIES: usize = 512;

const LEAF_SHIFT: usize = 12;
const ROOT_SHIFT: usize = 21;

/// Largest mappable virtual address: 512 * 512 * 4 KiB.
pub const MAX_VA: usize = ENTRIES * ENTRIES * PAGE_SIZE;

bitflags! {
    /// Access permissions carried in the low bits of a leaf entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// One leaf page-table entry: frame number in bits 12.., flags below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Self {
        let mut bits: u64 = 0;
        bits.set_bits(12..64, frame.0 as u64);
        bits |= (flags | PageFlags::PRESENT).bits();
        Pte(bits)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame(self.0.get_bits(12..64) as usize)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0.get_bits(0..12))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Pte(bits)
    }
}

/// Second-level table: one entry per 4 KiB page.
struct LeafTable {
    entries: [Pte; ENTRIES],
}

impl LeafTable {
    fn new() -> Self {
        LeafTable {
            entries: [Pte::EMPTY; ENTRIES],
        }
    }
}

/// Two-level virtual-to-physical page mapping owned by one process.
///
/// A virtual page is mapped by at most one present leaf entry at a time;
/// installing over a present entry is a consistency violation and halts.
pub struct AddrSpace {
    root: Vec<Option<Box<LeafTable>>>,
}

impl AddrSpace {
    pub fn new() -> Self {
        AddrSpace {
            root: (0..ENTRIES).map(|_| None).collect(),
        }
    }

    /// Walk to the leaf entry for `va`. When the second-level table is
    /// absent and `create` is set, a fresh zeroed table is installed
    /// present/writable/user-accessible.
    pub fn translate(&mut self, va: usize, create: bool) -> Option<&mut Pte> {
        if va >= MAX_VA {
            return None;
        }
        let ri = (va >> ROOT_SHIFT) & (ENTRIES - 1);
        let li = (va >> LEAF_SHIFT) & (ENTRIES - 1);
        if self.root[ri].is_none() {
            if !create {
                return None;
            }
            self.root[ri] = Some(Box::new(LeafTable::new()));
        }
        Some(&mut self.root[ri].as_mut().unwrap().entries[li])
    }

    /// Read-only walk; absent mappings come back as the empty entry.
    pub fn lookup(&self, va: usize) -> Pte {
        if va >= MAX_VA {
            return Pte::EMPTY;
        }
        match &self.root[(va >> ROOT_SHIFT) & (ENTRIES - 1)] {
            Some(table) => table.entries[(va >> LEAF_SHIFT) & (ENTRIES - 1)],
            None => Pte::EMPTY,
        }
    }

    /// Install one leaf mapping per page covering `[va, va + len)`, with
    /// frames taken contiguously from `start`. A present target entry is
    /// fatal; mappings are never silently overwritten.
    pub fn map_range(&mut self, va: usize, len: usize, start: PhysFrame, flags: PageFlags) {
        assert!(len > 0, "map_range: empty range");
        assert_eq!(va % PAGE_SIZE, 0, "map_range: unaligned va {va:#x}");
        for i in 0..page_count(len) {
            let addr = va + i * PAGE_SIZE;
            let pte = self
                .translate(addr, true)
                .unwrap_or_else(|| panic!("map_range: va {addr:#x} out of range"));
            if pte.is_present() {
                panic!("map_range: remap of {addr:#x}");
            }
            *pte = Pte::new(PhysFrame(start.0 + i), flags);
        }
    }

    /// Grow the mapped region from `old_size` to `new_size` bytes with
    /// fresh zeroed frames. On exhaustion every page added so far is
    /// given back and the space is as it was.
    pub fn alloc_range(
        &mut self,
        arena: &mut FrameArena,
        old_size: usize,
        new_size: usize,
    ) -> Result<usize> {
        if new_size < old_size {
            return Ok(old_size);
        }
        let mut va = page_round_up(old_size);
        while va < new_size {
            match arena.alloc() {
                Ok(frame) => {
                    self.map_range(va, PAGE_SIZE, frame, PageFlags::WRITABLE | PageFlags::USER);
                }
                Err(e) => {
                    self.dealloc_range(arena, va, old_size);
                    return Err(e);
                }
            }
            va += PAGE_SIZE;
        }
        Ok(new_size)
    }

    /// Shrink the mapped region from `old_size` down to `new_size` bytes,
    /// returning every page in between to the arena.
    pub fn dealloc_range(
        &mut self,
        arena: &mut FrameArena,
        old_size: usize,
        new_size: usize,
    ) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let mut va = page_round_up(new_size);
        while va < old_size {
            if let Some(pte) = self.translate(va, false) {
                if pte.is_present() {
                    let frame = pte.frame();
                    *pte = Pte::EMPTY;
                    arena.free(frame);
                }
            }
            va += PAGE_SIZE;
        }
        new_size
    }

    /// Copy the first `len` bytes of this space page-by-page into `dst`:
    /// fresh frame, full byte copy, same permissions. Copy, not share —
    /// afterwards the two spaces are independently mutable. An absent
    /// source page is fatal.
    pub fn duplicate_range(
        &self,
        dst: &mut AddrSpace,
        arena: &mut FrameArena,
        len: usize,
    ) -> Result<()> {
        for va in (0..page_round_up(len)).step_by(PAGE_SIZE) {
            let src = self.lookup(va);
            if !src.is_present() {
                panic!("duplicate_range: page {va:#x} expected present");
            }
            let frame = arena.alloc()?;
            let bytes = *arena.frame(src.frame());
            arena.frame_mut(frame).copy_from_slice(&bytes);
            dst.map_range(va, PAGE_SIZE, frame, src.flags());
        }
        Ok(())
    }

    /// Return every mapped frame to the arena and drop the tables.
    pub fn release(&mut self, arena: &mut FrameArena) {
        for slot in self.root.iter_mut() {
            if let Some(table) = slot {
                for pte in table.entries.iter_mut() {
                    if pte.is_present() {
                        let frame = pte.frame();
                        *pte = Pte::EMPTY;
                        arena.free(frame);
                    }
                }
            }
            *slot = None;
        }
    }

    /// Copy bytes out of the space starting at `va`, crossing page
    /// boundaries as needed.
    pub fn read_bytes(&self, arena: &FrameArena, va: usize, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let addr = va + off;
            let pte = self.lookup(addr);
            if !pte.is_present() {
                return Err(KernelError::BadVirtualAddress(addr));
            }
            let page_off = addr % PAGE_SIZE;
            let n = (PAGE_SIZE - page_off).min(buf.len() - off);
            buf[off..off + n].copy_from_slice(&arena.frame(pte.frame())[page_off..page_off + n]);
            off += n;
        }
        Ok(())
    }

    /// Copy bytes into the space starting at `va`.
    pub fn write_bytes(&mut self, arena: &mut FrameArena, va: usize, data: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < data.len() {
            let addr = va + off;
            let pte = self.lookup(addr);
            if !pte.is_present() {
                return Err(KernelError::BadVirtualAddress(addr));
            }
            let page_off = addr % PAGE_SIZE;
            let n = (PAGE_SIZE - page_off).min(data.len() - off);
            arena.frame_mut(pte.frame())[page_off..page_off + n]
                .copy_from_slice(&data[off..off + n]);
            off += n;
        }
        Ok(())
    }
}

impl Default for AddrSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_packs_frame_and_flags() {
        let pte = Pte::new(PhysFrame(42), PageFlags::WRITABLE | PageFlags::USER);
        assert!(pte.is_present());
        assert_eq!(pte.frame(), PhysFrame(42));
        assert!(pte.flags().contains(PageFlags::WRITABLE));
        assert_eq!(Pte::from_bits(pte.bits()), pte);
    }

    #[test]
    fn translate_creates_second_level_tables_on_demand() {
        let mut space = AddrSpace::new();
        assert!(space.translate(0x2000, false).is_none());
        assert!(space.translate(0x2000, true).is_some());
        // The table now exists, but the leaf entry itself is still empty.
        assert!(!space.lookup(0x2000).is_present());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remapping_a_present_page_is_fatal() {
        let mut arena = FrameArena::new(4);
        let mut space = AddrSpace::new();
        let f = arena.alloc().unwrap();
        space.map_range(0, PAGE_SIZE, f, PageFlags::WRITABLE);
        let g = arena.alloc().unwrap();
        space.map_range(0, PAGE_SIZE, g, PageFlags::WRITABLE);
    }

    #[test]
    fn duplicate_range_leaves_spaces_independently_mutable() {
        let mut arena = FrameArena::new(8);
        let mut src = AddrSpace::new();
        src.alloc_range(&mut arena, 0, 2 * PAGE_SIZE).unwrap();
        src.write_bytes(&mut arena, 100, b"original").unwrap();

        let mut dst = AddrSpace::new();
        src.duplicate_range(&mut dst, &mut arena, 2 * PAGE_SIZE)
            .unwrap();

        dst.write_bytes(&mut arena, 100, b"changed!").unwrap();

        let mut buf = [0u8; 8];
        src.read_bytes(&arena, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"original");
        dst.read_bytes(&arena, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"changed!");

        src.release(&mut arena);
        dst.release(&mut arena);
        assert_eq!(arena.free_frames(), 8);
    }

    #[test]
    fn alloc_range_rolls_back_on_exhaustion() {
        let mut arena = FrameArena::new(2);
        let mut space = AddrSpace::new();
        let err = space.alloc_range(&mut arena, 0, 3 * PAGE_SIZE);
        assert!(matches!(err, Err(KernelError::OutOfFrames)));
        assert_eq!(arena.free_frames(), 2);
        assert!(!space.lookup(0).is_present());
    }

    #[test]
    fn dealloc_range_returns_frames() {
        let mut arena = FrameArena::new(4);
        let mut space = AddrSpace::new();
        space.alloc_range(&mut arena, 0, 3 * PAGE_SIZE).unwrap();
        assert_eq!(arena.free_frames(), 1);

        let new_size = space.dealloc_range(&mut arena, 3 * PAGE_SIZE, PAGE_SIZE);
        assert_eq!(new_size, PAGE_SIZE);
        assert_eq!(arena.free_frames(), 3);
        assert!(space.lookup(0).is_present());
        assert!(!space.lookup(PAGE_SIZE).is_present());
    }

    #[test]
    fn read_write_cross_page_boundaries() {
        let mut arena = FrameArena::new(4);
        let mut space = AddrSpace::new();
        space.alloc_range(&mut arena, 0, 2 * PAGE_SIZE).unwrap();

        let data = b"straddles the page boundary";
        let va = PAGE_SIZE - 10;
        space.write_bytes(&mut arena, va, data).unwrap();

        let mut buf = vec![0u8; data.len()];
        space.read_bytes(&arena, va, &mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn access_to_unmapped_memory_is_an_error() {
        let mut arena = FrameArena::new(2);
        let mut space = AddrSpace::new();
        space.alloc_range(&mut arena, 0, PAGE_SIZE).unwrap();

        let mut buf = [0u8; 16];
        let err = space.read_bytes(&arena, PAGE_SIZE - 8, &mut buf);
        assert!(matches!(err, Err(KernelError::BadVirtualAddress(_))));
    }
}
