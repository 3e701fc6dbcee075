//! Append-only key -> blob stores.
//!
//! A store `X` is a flat data file `X` plus an ASCII index `X.index` with
//! one `key \t offset \t len` line per blob. Keys are decimal `u64`. Blobs
//! are NUL-terminated in the data file; `len` counts the terminator.

pub mod reader;
pub mod writer;

pub use reader::{DBReader, OpenMode};
pub use writer::DBWriter;

use std::path::{Path, PathBuf};

/// Index file path for a store data path.
pub fn index_path(data: &Path) -> PathBuf {
    let mut os = data.as_os_str().to_owned();
    os.push(".index");
    PathBuf::from(os)
}
