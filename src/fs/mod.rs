pub mod fd;

pub use fd::{default_files, dup_table, File, FileHandle, FileKind, NOFILE};
