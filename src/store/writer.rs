//! Write side of the key -> blob store.
//!
//! Workers append to per-thread shard files without contention; `close`
//! concatenates the shards in shard order and writes the index sorted by
//! key. Partial shard files left behind by an aborted run are safe to
//! delete.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};

use super::reader::{DBReader, OpenMode};

struct Shard {
    file: BufWriter<fs::File>,
    entries: Vec<(u64, u64, u64)>,
    offset: u64,
}

pub struct DBWriter {
    data_path: PathBuf,
    index_path: PathBuf,
    shard_paths: Vec<PathBuf>,
    shards: Vec<Mutex<Shard>>,
}

impl DBWriter {
    /// Fail fast when an output file is already present.
    pub fn error_if_exists(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("output file {} already exists", path.display());
        }
        Ok(())
    }

    pub fn open(data_path: &Path, index_path: &Path, shard_count: usize) -> Result<Self> {
        let mut shard_paths = Vec::with_capacity(shard_count);
        let mut shards = Vec::with_capacity(shard_count);
        for s in 0..shard_count {
            let mut os = data_path.as_os_str().to_owned();
            os.push(format!(".{s}"));
            let path = PathBuf::from(os);
            let file = fs::File::create(&path)
                .with_context(|| format!("failed to create shard {}", path.display()))?;
            shard_paths.push(path);
            shards.push(Mutex::new(Shard {
                file: BufWriter::new(file),
                entries: Vec::new(),
                offset: 0,
            }));
        }
        Ok(Self {
            data_path: data_path.to_owned(),
            index_path: index_path.to_owned(),
            shard_paths,
            shards,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Append one blob under `key` to a shard. The NUL terminator is added
    /// here. Threads writing to distinct shards never contend.
    pub fn write(&self, data: &[u8], key: u64, shard: usize) -> Result<()> {
        let mut s = self.shards[shard].lock().expect("shard lock poisoned");
        s.file.write_all(data)?;
        s.file.write_all(b"\0")?;
        let len = data.len() as u64 + 1;
        let offset = s.offset;
        s.entries.push((key, offset, len));
        s.offset += len;
        Ok(())
    }

    /// Concatenate the shards into the final data file and write the index
    /// sorted by key. Consumes the writer; shard temp files are removed.
    pub fn close(self) -> Result<()> {
        let mut entries: Vec<(u64, u64, u64)> = Vec::new();
        let mut out = BufWriter::new(
            fs::File::create(&self.data_path)
                .with_context(|| format!("failed to create {}", self.data_path.display()))?,
        );

        let mut base = 0u64;
        for (shard, path) in self.shards.into_iter().zip(&self.shard_paths) {
            let shard = shard.into_inner().expect("shard lock poisoned");
            let mut file = shard.file.into_inner().context("shard flush failed")?;
            file.flush()?;
            drop(file);

            let bytes = fs::read(path)?;
            out.write_all(&bytes)?;
            for &(key, offset, len) in &shard.entries {
                entries.push((key, base + offset, len));
            }
            base += shard.offset;
            fs::remove_file(path)?;
        }
        out.flush()?;

        entries.sort_unstable_by_key(|&(key, _, _)| key);
        let mut index = BufWriter::new(
            fs::File::create(&self.index_path)
                .with_context(|| format!("failed to create {}", self.index_path.display()))?,
        );
        for (key, offset, len) in entries {
            writeln!(index, "{key}\t{offset}\t{len}")?;
        }
        index.flush()?;
        Ok(())
    }

    /// Merge split stores into one: for every key present in any split, the
    /// blobs are handed to `combine` in split order and its result is
    /// written under that key. Keys are processed in ascending order.
    pub fn merge_files<F>(
        data_path: &Path,
        index_path: &Path,
        splits: &[(PathBuf, PathBuf)],
        mut combine: F,
    ) -> Result<()>
    where
        F: FnMut(&[&[u8]]) -> Vec<u8>,
    {
        let readers: Vec<DBReader> = splits
            .iter()
            .map(|(d, i)| DBReader::open(d, i, OpenMode::NoSort))
            .collect::<Result<_>>()?;

        let mut keys: Vec<u64> = readers
            .iter()
            .flat_map(|r| (0..r.size()).map(|id| r.get_db_key(id)))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        let writer = DBWriter::open(data_path, index_path, 1)?;
        let mut blobs: Vec<&[u8]> = Vec::with_capacity(readers.len());
        for &key in &keys {
            blobs.clear();
            for r in &readers {
                if let Some(id) = r.get_id(key) {
                    blobs.push(r.get_data(id));
                }
            }
            let merged = combine(&blobs);
            writer.write(&merged, key, 0)?;
        }
        writer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_concatenate_and_index_sorts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("out");
        let index = dir.path().join("out.index");

        let w = DBWriter::open(&data, &index, 2).unwrap();
        w.write(b"beta", 20, 1).unwrap();
        w.write(b"alpha", 10, 0).unwrap();
        w.close().unwrap();

        let r = DBReader::open(&data, &index, OpenMode::NoSort).unwrap();
        assert_eq!(r.size(), 2);
        let id10 = r.get_id(10).unwrap();
        let id20 = r.get_id(20).unwrap();
        assert_eq!(r.get_data(id10), b"alpha");
        assert_eq!(r.get_data(id20), b"beta");
        // Index order is by key.
        assert_eq!(r.get_db_key(0), 10);
    }

    #[test]
    fn error_if_exists_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("present");
        fs::write(&path, b"x").unwrap();
        assert!(DBWriter::error_if_exists(&path).is_err());
        assert!(DBWriter::error_if_exists(&dir.path().join("absent")).is_ok());
    }

    #[test]
    fn merge_combines_per_key_in_split_order() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str, rows: &[(u64, &[u8])]| {
            let d = dir.path().join(name);
            let i = dir.path().join(format!("{name}.index"));
            let w = DBWriter::open(&d, &i, 1).unwrap();
            for &(k, b) in rows {
                w.write(b, k, 0).unwrap();
            }
            w.close().unwrap();
            (d, i)
        };
        let s1 = mk("s1", &[(1, b"a"), (2, b"b")]);
        let s2 = mk("s2", &[(2, b"c"), (3, b"d")]);

        let data = dir.path().join("merged");
        let index = dir.path().join("merged.index");
        DBWriter::merge_files(&data, &index, &[s1, s2], |blobs| blobs.concat()).unwrap();

        let r = DBReader::open(&data, &index, OpenMode::NoSort).unwrap();
        assert_eq!(r.size(), 3);
        assert_eq!(r.get_data(r.get_id(2).unwrap()), b"bc");
        assert_eq!(r.get_data(r.get_id(3).unwrap()), b"d");
    }
}
