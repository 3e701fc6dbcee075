//! Similar-k-mer enumeration.
//!
//! For a query k-mer `u` and threshold `T`, yield every k-mer `v` whose
//! summed substitution score against `u` is at least `T`, in descending
//! score order, without materializing the `|A|^k` space.
//!
//! The traversal runs over *stages*: pre-sorted candidate lists that each
//! cover a fixed number of positions. Matrix queries decompose `u` into
//! 2-mer/3-mer chunks and use the sorted extended-matrix rows as stages
//! (4 -> 2+2, 5 -> 3+2, 6 -> 3+3, 7 -> 3+2+2); profile queries use one
//! stage per position, sorted from the profile row. Because stages are
//! sorted descending, a branch whose accumulated score plus the maximum
//! remaining stage score falls below `T` cuts the whole sibling tail.

use crate::matrix::ExtendedMatrix;
use crate::sequence::Sequence;

/// One similar k-mer: integer index and total match score.
pub type SimilarKmer = (usize, i32);

/// Decomposition of a k-mer length into extended-matrix chunk widths.
fn chunk_widths(kmer_size: usize) -> &'static [usize] {
    match kmer_size {
        2 => &[2],
        3 => &[3],
        4 => &[2, 2],
        5 => &[3, 2],
        6 => &[3, 3],
        7 => &[3, 2, 2],
        _ => panic!("unsupported k-mer size {kmer_size}"),
    }
}

/// A pre-sorted candidate list covering a span of k-mer positions.
#[derive(Clone, Copy, Default)]
struct Stage<'a> {
    indices: &'a [u32],
    scores: &'a [i16],
    /// `alphabet_size ^ span`: shift applied when appending this stage's
    /// candidate to the combined k-mer index.
    span_pow: usize,
}

pub struct SimilarKmerGen {
    kmer_size: usize,
    alphabet_size: usize,
    /// Survivors for the current query k-mer, sorted descending by score.
    out: Vec<SimilarKmer>,
    /// Per-position sorted rows for profile mode, reused across calls.
    row_indices: Vec<Vec<u32>>,
    row_scores: Vec<Vec<i16>>,
    row_tmp: Vec<(u32, i16)>,
}

impl SimilarKmerGen {
    pub fn new(kmer_size: usize, alphabet_size: usize) -> Self {
        Self {
            kmer_size,
            alphabet_size,
            out: Vec::new(),
            row_indices: vec![Vec::with_capacity(alphabet_size); kmer_size],
            row_scores: vec![Vec::with_capacity(alphabet_size); kmer_size],
            row_tmp: Vec::with_capacity(alphabet_size),
        }
    }

    /// Enumerate similar k-mers for a matrix query k-mer given as residue
    /// codes `u` (`u.len() == kmer_size`). Returns an empty slice when `u`
    /// contains the unknown residue.
    pub fn generate(
        &mut self,
        u: &[u8],
        unknown: u8,
        ext2: &ExtendedMatrix,
        ext3: &ExtendedMatrix,
        threshold: i32,
    ) -> &[SimilarKmer] {
        debug_assert_eq!(u.len(), self.kmer_size);
        self.out.clear();
        if u.contains(&unknown) {
            return &self.out;
        }

        let mut stages = [Stage::default(); 4];
        let mut stage_count = 0usize;
        let mut at = 0usize;
        for &width in chunk_widths(self.kmer_size) {
            let ext = if width == 3 { ext3 } else { ext2 };
            let chunk = u[at..at + width]
                .iter()
                .fold(0usize, |acc, &c| acc * self.alphabet_size + c as usize);
            let (indices, scores) = ext.row(chunk);
            stages[stage_count] = Stage {
                indices,
                scores,
                span_pow: self.alphabet_size.pow(width as u32),
            };
            stage_count += 1;
            at += width;
        }

        run_stages(&stages[..stage_count], threshold, &mut self.out);
        &self.out
    }

    /// Enumerate similar k-mers for the profile query k-mer starting at
    /// `pos`. Scores come from the profile rows, one stage per position;
    /// the traversal shape is identical to matrix mode. The unknown
    /// residue is never offered as a candidate.
    pub fn generate_profile(
        &mut self,
        seq: &Sequence,
        pos: usize,
        unknown: u8,
        threshold: i32,
    ) -> &[SimilarKmer] {
        self.out.clear();

        for offset in 0..self.kmer_size {
            let row = seq.profile_row(pos + offset);
            self.row_tmp.clear();
            self.row_tmp.extend(
                row.iter()
                    .enumerate()
                    .filter(|&(residue, _)| residue as u8 != unknown)
                    .map(|(residue, &score)| (residue as u32, score)),
            );
            self.row_tmp
                .sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let indices = &mut self.row_indices[offset];
            let scores = &mut self.row_scores[offset];
            indices.clear();
            scores.clear();
            for &(residue, score) in &self.row_tmp {
                indices.push(residue);
                scores.push(score);
            }
        }

        let mut stages = [Stage::default(); 7];
        for offset in 0..self.kmer_size {
            stages[offset] = Stage {
                indices: &self.row_indices[offset],
                scores: &self.row_scores[offset],
                span_pow: self.alphabet_size,
            };
        }
        run_stages(&stages[..self.kmer_size], threshold, &mut self.out);
        &self.out
    }
}

/// Branch-and-bound over the stages, then sort survivors descending by
/// score with ties broken by ascending k-mer index.
fn run_stages(stages: &[Stage<'_>], threshold: i32, out: &mut Vec<SimilarKmer>) {
    // suffix_max[i] = best attainable score over stages after stage i.
    let mut suffix_max = [0i32; 8];
    for i in (0..stages.len()).rev() {
        suffix_max[i] = suffix_max[i + 1] + stages[i].scores.first().copied().unwrap_or(0) as i32;
    }
    descend(stages, &suffix_max, 0, 0, threshold, out);
    out.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
}

fn descend(
    stages: &[Stage<'_>],
    suffix_max: &[i32],
    acc_index: usize,
    acc_score: i32,
    threshold: i32,
    out: &mut Vec<SimilarKmer>,
) {
    let stage = &stages[0];
    let remaining = suffix_max[1];
    for (slot, &score) in stage.scores.iter().enumerate() {
        let score = acc_score + score as i32;
        // Entries are sorted descending: once even the best completion
        // misses the threshold, the whole tail does.
        if score + remaining < threshold {
            break;
        }
        let index = acc_index * stage.span_pow + stage.indices[slot] as usize;
        if stages.len() == 1 {
            out.push((index, score));
        } else {
            descend(&stages[1..], &suffix_max[1..], index, score, threshold, out);
        }
    }
}
