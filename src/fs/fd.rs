use spin::Mutex;
use std::sync::Arc;

/// Per-process open-handle limit.
pub const NOFILE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Console,
    Directory,
    Regular,
}

/// An open file or directory handle. Handles are reference-counted:
/// duplicating processes share them, and the last close releases the
/// underlying object. Actual storage I/O lives outside this core.
pub struct File {
    pub kind: FileKind,
    pub path: String,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
}

pub type FileHandle = Arc<Mutex<File>>;

impl File {
    pub fn console() -> FileHandle {
        Arc::new(Mutex::new(File {
            kind: FileKind::Console,
            path: String::from("console"),
            offset: 0,
            readable: true,
            writable: true,
        }))
    }

    pub fn directory(path: &str) -> FileHandle {
        Arc::new(Mutex::new(File {
            kind: FileKind::Directory,
            path: String::from(path),
            offset: 0,
            readable: true,
            writable: false,
        }))
    }
}

/// Fresh handle table with the console preopened on 0/1/2.
pub fn default_files() -> [Option<FileHandle>; NOFILE] {
    let mut table: [Option<FileHandle>; NOFILE] = core::array::from_fn(|_| None);
    table[0] = Some(File::console());
    table[1] = Some(File::console());
    table[2] = Some(File::console());
    table
}

/// Duplicate a handle table by bumping each handle's refcount.
pub fn dup_table(table: &[Option<FileHandle>; NOFILE]) -> [Option<FileHandle>; NOFILE] {
    core::array::from_fn(|i| table[i].clone())
}
