//! Binary form of the five snapshot records. Every record is a 12-byte
//! header (magic, kind, payload length) followed by an opaque payload
//! whose layout is fixed: records must survive save and restore
//! byte-for-byte.

use super::{Descriptor, Snapshot};
use crate::error::{KernelError, Result};
use crate::memory::paging::Pte;
use crate::memory::{page_count, PAGE_SIZE};
use crate::scheduler::context::{Context, CONTEXT_BYTES};
use crate::scheduler::task::{TrapFrame, FRAME_BYTES, NAME_LEN};

pub const RECORD_MAGIC: u32 = 0x4352_594f;
pub const RECORD_HEADER: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Descriptor,
    Frame,
    Context,
    PageTable,
    Pages,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Descriptor,
        RecordKind::Frame,
        RecordKind::Context,
        RecordKind::PageTable,
        RecordKind::Pages,
    ];

    fn code(self) -> u32 {
        match self {
            RecordKind::Descriptor => 1,
            RecordKind::Frame => 2,
            RecordKind::Context => 3,
            RecordKind::PageTable => 4,
            RecordKind::Pages => 5,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Descriptor => "descriptor.img",
            RecordKind::Frame => "frame.img",
            RecordKind::Context => "context.img",
            RecordKind::PageTable => "pagetable.img",
            RecordKind::Pages => "pages.img",
        }
    }
}

fn wrap(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER + payload.len());
    out.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    out.extend_from_slice(&kind.code().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn unwrap(kind: RecordKind, bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < RECORD_HEADER {
        return Err(KernelError::TruncatedRecord {
            expected: RECORD_HEADER,
            got: bytes.len(),
        });
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Err(KernelError::BadRecordHeader {
            reason: format!("bad magic {magic:#x}"),
        });
    }
    let code = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if code != kind.code() {
        return Err(KernelError::BadRecordHeader {
            reason: format!("expected {} record, got kind {code}", kind.file_name()),
        });
    }
    let len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let payload = &bytes[RECORD_HEADER..];
    if payload.len() != len {
        return Err(KernelError::TruncatedRecord {
            expected: RECORD_HEADER + len,
            got: bytes.len(),
        });
    }
    Ok(payload)
}

/// Fixed-width name field: truncated or zero-padded to NAME_LEN.
fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn decode_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(KernelError::TruncatedRecord {
                expected: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl Snapshot {
    /// The descriptor record: identity plus embedded copies of the frame
    /// and context, fixed-size.
    pub fn descriptor_record(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + NAME_LEN + 8 + FRAME_BYTES + CONTEXT_BYTES);
        payload.extend_from_slice(&self.descriptor.pid.to_le_bytes());
        payload.extend_from_slice(&encode_name(&self.descriptor.name));
        payload.extend_from_slice(&self.descriptor.size.to_le_bytes());
        payload.extend_from_slice(&self.frame.to_bytes());
        payload.extend_from_slice(&self.context.to_bytes());
        wrap(RecordKind::Descriptor, &payload)
    }

    pub fn frame_record(&self) -> Vec<u8> {
        wrap(RecordKind::Frame, &self.frame.to_bytes())
    }

    pub fn context_record(&self) -> Vec<u8> {
        wrap(RecordKind::Context, &self.context.to_bytes())
    }

    /// One leaf entry per page, in page order.
    pub fn page_table_record(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.page_table.len() * 8);
        for pte in &self.page_table {
            payload.extend_from_slice(&pte.bits().to_le_bytes());
        }
        wrap(RecordKind::PageTable, &payload)
    }

    pub fn pages_record(&self) -> Vec<u8> {
        wrap(RecordKind::Pages, &self.pages)
    }

    /// Decode and cross-validate the five records. The page-table and
    /// pages records must both agree with the page count implied by the
    /// descriptor's size field; a record produced with a fixed page
    /// constant instead of the live size fails here.
    pub fn from_records(
        descriptor: &[u8],
        frame: &[u8],
        context: &[u8],
        page_table: &[u8],
        pages: &[u8],
    ) -> Result<Snapshot> {
        let payload = unwrap(RecordKind::Descriptor, descriptor)?;
        let mut r = Reader::new(payload);
        let pid = r.u32()?;
        let name = decode_name(r.take(NAME_LEN)?);
        let size = r.u64()?;
        // The embedded frame/context copies exist for the descriptor's
        // fixed layout; the standalone records are authoritative.
        let _ = r.take(FRAME_BYTES)?;
        let _ = r.take(CONTEXT_BYTES)?;
        let descriptor = Descriptor { pid, name, size };

        let payload = unwrap(RecordKind::Frame, frame)?;
        let bytes: &[u8; FRAME_BYTES] =
            payload
                .try_into()
                .map_err(|_| KernelError::TruncatedRecord {
                    expected: FRAME_BYTES,
                    got: payload.len(),
                })?;
        let frame = TrapFrame::from_bytes(bytes);

        let payload = unwrap(RecordKind::Context, context)?;
        let bytes: &[u8; CONTEXT_BYTES] =
            payload
                .try_into()
                .map_err(|_| KernelError::TruncatedRecord {
                    expected: CONTEXT_BYTES,
                    got: payload.len(),
                })?;
        let context = Context::from_bytes(bytes);

        let payload = unwrap(RecordKind::PageTable, page_table)?;
        if payload.len() % 8 != 0 {
            return Err(KernelError::BadRecordHeader {
                reason: format!("page-table record length {} not entry-aligned", payload.len()),
            });
        }
        let entries: Vec<Pte> = payload
            .chunks_exact(8)
            .map(|c| Pte::from_bits(u64::from_le_bytes(c.try_into().unwrap())))
            .collect();

        let payload = unwrap(RecordKind::Pages, pages)?;
        if payload.len() % PAGE_SIZE != 0 {
            return Err(KernelError::TruncatedRecord {
                expected: (payload.len() / PAGE_SIZE + 1) * PAGE_SIZE,
                got: payload.len(),
            });
        }

        let expected = page_count(size as usize);
        if entries.len() != expected {
            return Err(KernelError::PageCountMismatch {
                expected,
                got: entries.len(),
            });
        }
        if payload.len() / PAGE_SIZE != expected {
            return Err(KernelError::PageCountMismatch {
                expected,
                got: payload.len() / PAGE_SIZE,
            });
        }

        Ok(Snapshot {
            descriptor,
            frame,
            context,
            page_table: entries,
            pages: payload.to_vec(),
        })
    }
}
