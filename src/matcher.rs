//! Per-query candidate scoring.
//!
//! One `QueryTemplateMatcher` per worker. It borrows the shared read-only
//! search state (matrices, index table, target lengths) and owns all
//! per-query scratch: the saturating hit counters over the whole target
//! range, the touched-id stack that makes resets O(touched), the bounded
//! candidate heap and the similar-k-mer buffer. Nothing here allocates on
//! the per-query path.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::index::IndexTable;
use crate::kmer_gen::SimilarKmerGen;
use crate::matrix::{ExtendedMatrix, ResidueMatrix};
use crate::sequence::{SeqType, Sequence};

/// Window width of the compositional bias correction.
const BIAS_WINDOW: usize = 40;

/// One prefilter hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub target_id: u32,
    /// Saturated raw k-mer hit count.
    pub pref_score: i16,
    pub z_score: f32,
}

/// Where per-position k-mer scores come from.
#[derive(Clone, Copy)]
pub enum ScoringSource<'a> {
    /// Global substitution model through the extended k-mer tables.
    Extended {
        ext2: &'a ExtendedMatrix,
        ext3: &'a ExtendedMatrix,
    },
    /// Position-specific scores carried by the query itself.
    Profile,
}

/// Shared read-only state for one target split.
#[derive(Clone, Copy)]
pub struct SearchContext<'a> {
    pub matrix: &'a ResidueMatrix,
    pub source: ScoringSource<'a>,
    pub index: &'a IndexTable,
    /// Lengths per target id over the whole target store.
    pub target_seq_lens: &'a [u32],
}

/// Scoring tunables, fixed for the lifetime of a matcher.
#[derive(Debug, Clone, Copy)]
pub struct MatcherParams {
    pub kmer_thr: i32,
    pub kmer_match_prob: f64,
    pub kmer_size: usize,
    /// Total number of targets in the store (counter capacity).
    pub db_size: usize,
    pub aa_bias_correction: bool,
    pub max_seq_len: usize,
    pub z_thr: f32,
    pub max_res_list_len: usize,
}

/// Heap entry ordered so that the *worst* candidate is at the top:
/// lowest z-score first, ties broken by larger target id.
#[derive(Clone, Copy)]
struct Worst {
    z: f32,
    target_id: u32,
    raw: u16,
}

impl PartialEq for Worst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Worst {}
impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .z
            .total_cmp(&self.z)
            .then(self.target_id.cmp(&other.target_id))
    }
}

pub struct QueryTemplateMatcher<'a> {
    ctx: SearchContext<'a>,
    params: MatcherParams,
    counters: Vec<u16>,
    touched: Vec<u32>,
    heap: BinaryHeap<Worst>,
    bias: Vec<f32>,
    gen: SimilarKmerGen,
    results: Vec<Hit>,
}

impl<'a> QueryTemplateMatcher<'a> {
    pub fn new(ctx: SearchContext<'a>, params: MatcherParams) -> Self {
        let gen = SimilarKmerGen::new(params.kmer_size, ctx.matrix.alphabet_size);
        Self {
            counters: vec![0; params.db_size],
            touched: Vec::with_capacity(params.db_size.min(1 << 16)),
            heap: BinaryHeap::with_capacity(params.max_res_list_len + 1),
            bias: vec![0.0; params.max_seq_len],
            results: Vec::with_capacity(params.max_res_list_len),
            gen,
            ctx,
            params,
        }
    }

    /// Score one query against the split. `self_id` suppresses the query's
    /// own target id from the results. Hits are returned sorted by
    /// descending z-score, ties by ascending target id, capped at
    /// `max_res_list_len`. Workload counters are written to `seq.stats`.
    pub fn match_query(&mut self, seq: &mut Sequence, self_id: Option<u32>) -> &[Hit] {
        let k = self.params.kmer_size;
        self.reset_counters();
        self.heap.clear();
        self.results.clear();

        let use_bias = self.params.aa_bias_correction && seq.seq_type() != SeqType::HmmProfile;
        if use_bias {
            self.compute_bias(seq);
        }

        let query_len = seq.len;
        if query_len < k {
            seq.stats.kmers_per_pos = 0.0;
            seq.stats.db_matches = 0;
            return &self.results;
        }

        let mut kmers_generated = 0usize;
        let mut db_matches = 0usize;
        let unknown = self.ctx.matrix.unknown;
        let codes = seq.codes();

        for (pos, _, valid) in seq.kmer_windows(k) {
            if !valid {
                continue;
            }
            let mut threshold = self.params.kmer_thr;
            if use_bias {
                // Raise the threshold where the local composition inflates
                // match scores.
                let local: f32 = self.bias[pos..pos + k].iter().sum();
                threshold += local.round() as i32;
            }

            let similar = match self.ctx.source {
                ScoringSource::Extended { ext2, ext3 } => {
                    self.gen
                        .generate(&codes[pos..pos + k], unknown, ext2, ext3, threshold)
                }
                ScoringSource::Profile => {
                    self.gen.generate_profile(seq, pos, unknown, threshold)
                }
            };
            kmers_generated += similar.len();

            for &(kmer, _) in similar {
                let run = self.ctx.index.lookup(kmer);
                db_matches += run.len();
                for &target in run {
                    let counter = &mut self.counters[target as usize];
                    if *counter == 0 {
                        self.touched.push(target);
                    }
                    *counter = counter.saturating_add(1);
                }
            }
        }

        let positions = (query_len - k + 1) as f64;
        seq.stats.kmers_per_pos = kmers_generated as f64 / positions;
        seq.stats.db_matches = db_matches;

        self.collect_hits(query_len, self_id);
        &self.results
    }

    fn reset_counters(&mut self) {
        for &t in &self.touched {
            self.counters[t as usize] = 0;
        }
        self.touched.clear();
    }

    /// Windowed mean pairwise score of each residue against its
    /// neighborhood (window [`BIAS_WINDOW`], centered, clipped at the
    /// sequence ends).
    fn compute_bias(&mut self, seq: &Sequence) {
        let codes = seq.codes();
        let half = BIAS_WINDOW / 2;
        for i in 0..codes.len() {
            let start = i.saturating_sub(half);
            let end = (i + half).min(codes.len());
            let mut sum = 0i32;
            let mut n = 0i32;
            for j in start..end {
                if j != i {
                    sum += self.ctx.matrix.score(codes[i], codes[j]) as i32;
                    n += 1;
                }
            }
            self.bias[i] = if n > 0 { sum as f32 / n as f32 } else { 0.0 };
        }
    }

    /// Turn raw counters into z-scores against the Poisson null and keep
    /// the best `max_res_list_len`.
    fn collect_hits(&mut self, query_len: usize, self_id: Option<u32>) {
        let cap = self.params.max_res_list_len;
        let p = self.params.kmer_match_prob;

        for &target in &self.touched {
            if Some(target) == self_id {
                continue;
            }
            let raw = self.counters[target as usize];
            let target_len = self.ctx.target_seq_lens[target as usize] as f64;
            let mu = query_len as f64 * target_len * p;
            let z = if mu > 0.0 {
                ((raw as f64 - mu) / mu.sqrt()) as f32
            } else {
                raw as f32
            };
            if z < self.params.z_thr {
                continue;
            }
            let entry = Worst {
                z,
                target_id: target,
                raw,
            };
            if self.heap.len() < cap {
                self.heap.push(entry);
            } else if let Some(worst) = self.heap.peek() {
                // `entry < *worst` means entry is better under the
                // worst-first ordering.
                if entry < *worst {
                    self.heap.pop();
                    self.heap.push(entry);
                }
            }
        }

        self.results.extend(self.heap.iter().map(|w| Hit {
            target_id: w.target_id,
            pref_score: w.raw.min(i16::MAX as u16) as i16,
            z_score: w.z,
        }));
        self.results
            .sort_unstable_by(|a, b| b.z_score.total_cmp(&a.z_score).then(a.target_id.cmp(&b.target_id)));
    }
}
