//! Fixed scoring matrix for the 5-letter nucleotide alphabet.

use super::substitution::ResidueMatrix;
use super::NUCLEOTIDE_ALPHABET;

/// Match/mismatch scores in half-bit units, blastn-style.
const MATCH: i32 = 2;
const MISMATCH: i32 = -3;
const VS_UNKNOWN: i32 = -1;

/// Build the nucleotide matrix. `N` is the unknown symbol; every pairing
/// with it scores [`VS_UNKNOWN`].
pub fn nucleotide_matrix(bit_factor: f64) -> ResidueMatrix {
    let n = NUCLEOTIDE_ALPHABET.len();
    let mut raw = vec![0i32; n * n];
    for a in 0..n {
        for b in 0..n {
            raw[a * n + b] = if a == n - 1 || b == n - 1 {
                VS_UNKNOWN
            } else if a == b {
                MATCH
            } else {
                MISMATCH
            };
        }
    }
    // Uniform base composition, a small floor for N.
    let background = vec![0.2499, 0.2499, 0.2499, 0.2499, 0.0004];
    ResidueMatrix::from_raw_scores(NUCLEOTIDE_ALPHABET, &raw, &background, bit_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_beats_mismatch() {
        let m = nucleotide_matrix(8.0);
        let (a, c) = (m.encode(b'A'), m.encode(b'C'));
        assert!(m.score(a, a) > m.score(a, c));
    }

    #[test]
    fn n_is_unknown() {
        let m = nucleotide_matrix(8.0);
        assert_eq!(m.encode(b'N'), m.unknown);
        assert_eq!(m.encode(b'n'), m.unknown);
        assert_eq!(m.encode(b'U'), m.unknown);
    }
}
