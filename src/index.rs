//! Inverted k-mer index over a target-id range.
//!
//! Built in two passes so the entries live in one contiguous backing array:
//! pass one counts occurrences per k-mer, `init` turns the counts into
//! prefix-sum offsets and allocates the backing array, pass two writes the
//! target ids. `remove_duplicate_entries` then sorts every run and
//! collapses repeats. The table is immutable afterwards and shared
//! read-only across workers; it is dropped wholesale at the end of a split,
//! so the compaction never shrinks the physical allocation.

use crate::sequence::Sequence;

pub struct IndexTable {
    pub alphabet_size: usize,
    pub kmer_size: usize,
    /// Index stride: every `skip + 1`-th sequence position contributes.
    pub skip: usize,
    table_size: usize,
    counts: Vec<u32>,
    offsets: Vec<usize>,
    cursors: Vec<u32>,
    entries: Vec<u32>,
    initialized: bool,
}

impl IndexTable {
    pub fn new(alphabet_size: usize, kmer_size: usize, skip: usize) -> Self {
        let table_size = alphabet_size.pow(kmer_size as u32);
        Self {
            alphabet_size,
            kmer_size,
            skip,
            table_size,
            counts: vec![0; table_size],
            offsets: Vec::new(),
            cursors: Vec::new(),
            entries: Vec::new(),
            initialized: false,
        }
    }

    /// First pass: count the k-mers of one target sequence. K-mers covering
    /// an unknown residue are excluded.
    pub fn add_kmer_count(&mut self, seq: &Sequence) {
        debug_assert!(!self.initialized);
        for (pos, kmer, valid) in seq.kmer_windows(self.kmer_size) {
            if valid && pos % (self.skip + 1) == 0 {
                self.counts[kmer] += 1;
            }
        }
    }

    /// Prefix-sum the counts into offsets and allocate the backing array.
    pub fn init(&mut self) {
        debug_assert!(!self.initialized);
        let mut offsets = Vec::with_capacity(self.table_size + 1);
        let mut total = 0usize;
        for &c in &self.counts {
            offsets.push(total);
            total += c as usize;
        }
        offsets.push(total);
        self.offsets = offsets;
        self.cursors = vec![0; self.table_size];
        self.entries = vec![0; total];
        self.initialized = true;
    }

    /// Second pass: write the target id of `seq` under each of its k-mers.
    /// Must see the exact sequences of the counting pass, in any order.
    pub fn add_sequence(&mut self, seq: &Sequence) {
        debug_assert!(self.initialized);
        let id = seq.id as u32;
        for (pos, kmer, valid) in seq.kmer_windows(self.kmer_size) {
            if valid && pos % (self.skip + 1) == 0 {
                let at = self.offsets[kmer] + self.cursors[kmer] as usize;
                self.entries[at] = id;
                self.cursors[kmer] += 1;
            }
        }
    }

    /// Sort every k-mer run ascending and collapse duplicate target ids.
    /// Runs are compacted toward the front of the backing array; the stale
    /// tail stays allocated.
    pub fn remove_duplicate_entries(&mut self) {
        debug_assert!(self.initialized);
        let mut write = 0usize;
        let mut new_offsets = Vec::with_capacity(self.table_size + 1);
        for w in 0..self.table_size {
            let (start, end) = (self.offsets[w], self.offsets[w + 1]);
            new_offsets.push(write);
            self.entries[start..end].sort_unstable();
            let mut prev: Option<u32> = None;
            for i in start..end {
                let id = self.entries[i];
                if prev != Some(id) {
                    self.entries[write] = id;
                    write += 1;
                    prev = Some(id);
                }
            }
        }
        new_offsets.push(write);
        self.offsets = new_offsets;
        self.counts = Vec::new();
        self.cursors = Vec::new();
    }

    /// Target-id run for a k-mer.
    #[inline(always)]
    pub fn lookup(&self, kmer: usize) -> &[u32] {
        &self.entries[self.offsets[kmer]..self.offsets[kmer + 1]]
    }

    /// Total entries over all k-mers.
    pub fn entry_count(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }
}
