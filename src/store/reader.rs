//! Read side of the key -> blob store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

/// How entry ids are assigned at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Ids ordered by descending blob length. Required for the target
    /// store: the matcher's null model reads `get_seq_lens()` as a
    /// descending array.
    Sort,
    /// Ids in index-file order.
    NoSort,
    /// Ids in index-file order, access expected to be sequential.
    LinearAccess,
}

struct Entry {
    key: u64,
    offset: usize,
    len: usize,
}

pub struct DBReader {
    data: Vec<u8>,
    entries: Vec<Entry>,
    key_to_id: FxHashMap<u64, usize>,
    seq_lens: Vec<u32>,
    data_path: PathBuf,
}

impl DBReader {
    pub fn open(data_path: &Path, index_path: &Path, mode: OpenMode) -> Result<Self> {
        let data = fs::read(data_path)
            .with_context(|| format!("failed to read store data {}", data_path.display()))?;
        let index = fs::read_to_string(index_path)
            .with_context(|| format!("failed to read store index {}", index_path.display()))?;

        let mut entries = Vec::new();
        for (lineno, line) in index.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let mut cols = line.split('\t');
            let parse = |tok: Option<&str>| -> Result<u64> {
                tok.with_context(|| format!("short index line {}", lineno + 1))?
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("bad index line {}", lineno + 1))
            };
            let key = parse(cols.next())?;
            let offset = parse(cols.next())? as usize;
            let len = parse(cols.next())? as usize;
            anyhow::ensure!(
                offset + len <= data.len(),
                "index entry for key {} points past the data file",
                key
            );
            entries.push(Entry { key, offset, len });
        }

        if mode == OpenMode::Sort {
            entries.sort_by(|a, b| b.len.cmp(&a.len).then(a.key.cmp(&b.key)));
        }

        let mut key_to_id = FxHashMap::default();
        let mut seq_lens = Vec::with_capacity(entries.len());
        for (id, e) in entries.iter().enumerate() {
            key_to_id.insert(e.key, id);
            seq_lens.push(e.len.saturating_sub(1) as u32);
        }

        Ok(Self {
            data,
            entries,
            key_to_id,
            seq_lens,
            data_path: data_path.to_owned(),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Blob for an id, without the NUL terminator.
    #[inline]
    pub fn get_data(&self, id: usize) -> &[u8] {
        let e = &self.entries[id];
        let blob = &self.data[e.offset..e.offset + e.len];
        match blob.last() {
            Some(0) => &blob[..blob.len() - 1],
            _ => blob,
        }
    }

    #[inline]
    pub fn get_db_key(&self, id: usize) -> u64 {
        self.entries[id].key
    }

    /// Blob lengths (terminator excluded) in id order. Descending when the
    /// store was opened with [`OpenMode::Sort`].
    #[inline]
    pub fn get_seq_lens(&self) -> &[u32] {
        &self.seq_lens
    }

    #[inline]
    pub fn get_id(&self, key: u64) -> Option<usize> {
        self.key_to_id.get(&key).copied()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Drop the in-memory data. The reader is unusable afterwards; callers
    /// hold it only to release memory at a deterministic point.
    pub fn close(&mut self) {
        self.data = Vec::new();
        self.entries = Vec::new();
        self.key_to_id = FxHashMap::default();
    }
}
