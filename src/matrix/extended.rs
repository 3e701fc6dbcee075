//! Dense extended score tables over short k-mers.
//!
//! For k in {2, 3} the table holds, per source k-mer, every target k-mer of
//! the same length together with the summed per-position score, sorted by
//! descending score (ties by ascending k-mer index). The first entry of a
//! row is therefore the row maximum. The similar-k-mer generator walks
//! these rows as pre-sorted stages.

use super::substitution::ResidueMatrix;

pub struct ExtendedMatrix {
    pub kmer_size: usize,
    pub alphabet_size: usize,
    /// Number of k-mers: `alphabet_size ^ kmer_size`. Rows and columns.
    pub row_len: usize,
    indices: Vec<u32>,
    scores: Vec<i16>,
}

impl ExtendedMatrix {
    /// Build the full table. Quadratic in the k-mer space; meant for
    /// k-mer sizes 2 and 3 only.
    pub fn new(matrix: &ResidueMatrix, kmer_size: usize) -> Self {
        assert!((1..=3).contains(&kmer_size), "extended k-mer size {kmer_size} unsupported");
        let a = matrix.alphabet_size;
        let row_len = a.pow(kmer_size as u32);

        let mut indices = vec![0u32; row_len * row_len];
        let mut scores = vec![0i16; row_len * row_len];
        let mut row: Vec<(i16, u32)> = Vec::with_capacity(row_len);

        let mut src_digits = vec![0u8; kmer_size];
        for src in 0..row_len {
            decode(src, a, &mut src_digits);

            row.clear();
            let mut tgt_digits = vec![0u8; kmer_size];
            for tgt in 0..row_len {
                decode(tgt, a, &mut tgt_digits);
                let mut s = 0i16;
                for p in 0..kmer_size {
                    s += matrix.score(src_digits[p], tgt_digits[p]);
                }
                row.push((s, tgt as u32));
            }
            row.sort_unstable_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)));

            let base = src * row_len;
            for (i, &(s, t)) in row.iter().enumerate() {
                scores[base + i] = s;
                indices[base + i] = t;
            }
        }

        Self {
            kmer_size,
            alphabet_size: a,
            row_len,
            indices,
            scores,
        }
    }

    /// Sorted row for a source k-mer: co-indexed target k-mers and scores,
    /// descending by score.
    #[inline]
    pub fn row(&self, kmer: usize) -> (&[u32], &[i16]) {
        let base = kmer * self.row_len;
        (
            &self.indices[base..base + self.row_len],
            &self.scores[base..base + self.row_len],
        )
    }

    /// Row maximum, i.e. the self-match score of `kmer`.
    #[inline]
    pub fn row_max(&self, kmer: usize) -> i16 {
        self.scores[kmer * self.row_len]
    }
}

#[inline]
fn decode(mut kmer: usize, alphabet_size: usize, out: &mut [u8]) {
    for slot in out.iter_mut().rev() {
        *slot = (kmer % alphabet_size) as u8;
        kmer /= alphabet_size;
    }
}
