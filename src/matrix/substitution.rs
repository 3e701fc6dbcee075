//! Substitution matrix loading and the probability model behind it.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::AMINO_ALPHABET;

/// Robinson-Robinson amino acid background frequencies, in prescan code
/// order (ACDEFGHIKLMNPQRSTVWY). The unknown symbol gets a small floor
/// probability and the vector is renormalized on construction.
const AMINO_BACKGROUND: [f64; 20] = [
    0.07805, 0.01925, 0.05364, 0.06295, 0.03856, 0.07377, 0.02199, 0.05142, 0.05744, 0.09019,
    0.02243, 0.04487, 0.05203, 0.04264, 0.05129, 0.07120, 0.05841, 0.06441, 0.01330, 0.03216,
];

const UNKNOWN_BACKGROUND: f64 = 1e-4;

/// A residue alphabet with its pairwise score table and probability model.
///
/// Scores are integers scaled by `bit_factor`: a stored score `s`
/// corresponds to `s / bit_factor` bits, so the joint model satisfies
/// `p(a,b) = p(a) * p(b) * 2^(s(a,b) / bit_factor)`.
pub struct ResidueMatrix {
    pub alphabet_size: usize,
    /// Byte -> residue code, both cases; out-of-alphabet bytes map to `unknown`.
    pub to_code: [u8; 256],
    /// Residue code -> display byte.
    pub to_char: Vec<u8>,
    /// Code of the unknown symbol (always the last code).
    pub unknown: u8,
    /// Background probability per residue code.
    pub background: Vec<f64>,
    /// Joint probability per residue code pair, row-major.
    pub joint: Vec<f64>,
    /// Scale of the integer scores, in score units per bit.
    pub bit_factor: f64,
    scores: Vec<i16>,
}

impl ResidueMatrix {
    /// Load an NCBI-format scoring matrix file (comment lines starting with
    /// `#`, a header row of residue letters, one score row per residue) and
    /// scale its half-bit scores to `bit_factor` units per bit.
    pub fn from_file(path: &Path, bit_factor: f64) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read scoring matrix {}", path.display()))?;
        Self::parse(&text, bit_factor)
            .with_context(|| format!("failed to parse scoring matrix {}", path.display()))
    }

    fn parse(text: &str, bit_factor: f64) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim_start().starts_with('#'));
        let header = lines.next().context("matrix file is empty")?;
        let columns: Vec<u8> = header
            .split_whitespace()
            .map(|tok| tok.as_bytes()[0].to_ascii_uppercase())
            .collect();
        if columns.is_empty() {
            bail!("matrix header has no residue columns");
        }

        // Full letter-pair score map from the file, then projected onto the
        // prescan alphabet below.
        let mut table: Vec<Vec<Option<i32>>> = vec![vec![None; 128]; 128];
        for line in lines {
            let mut toks = line.split_whitespace();
            let row_letter = match toks.next() {
                Some(tok) => tok.as_bytes()[0].to_ascii_uppercase(),
                None => continue,
            };
            for (col, tok) in toks.enumerate() {
                if col >= columns.len() {
                    bail!("row {} has more scores than header columns", row_letter as char);
                }
                let score: i32 = tok
                    .parse()
                    .with_context(|| format!("bad score entry {tok:?}"))?;
                table[row_letter as usize][columns[col] as usize] = Some(score);
            }
        }

        let mut raw = vec![0i32; AMINO_ALPHABET.len() * AMINO_ALPHABET.len()];
        for (i, &a) in AMINO_ALPHABET.iter().enumerate() {
            for (j, &b) in AMINO_ALPHABET.iter().enumerate() {
                raw[i * AMINO_ALPHABET.len() + j] = match table[a as usize][b as usize] {
                    Some(s) => s,
                    // X columns are optional in some matrix files.
                    None if a == b'X' || b == b'X' => -1,
                    None => bail!("matrix file is missing entry {}/{}", a as char, b as char),
                };
            }
        }

        let mut background: Vec<f64> = AMINO_BACKGROUND.to_vec();
        background.push(UNKNOWN_BACKGROUND);
        Ok(Self::from_raw_scores(
            AMINO_ALPHABET,
            &raw,
            &background,
            bit_factor,
        ))
    }

    /// Build a matrix from raw half-bit scores and background frequencies.
    /// The joint probabilities are derived from the scaled scores.
    pub(crate) fn from_raw_scores(
        chars: &[u8],
        raw: &[i32],
        background: &[f64],
        bit_factor: f64,
    ) -> Self {
        let n = chars.len();
        debug_assert_eq!(raw.len(), n * n);
        debug_assert_eq!(background.len(), n);

        let total: f64 = background.iter().sum();
        let background: Vec<f64> = background.iter().map(|p| p / total).collect();

        // Half-bit file scores -> bit_factor units per bit.
        let scores: Vec<i16> = raw
            .iter()
            .map(|&s| (s as f64 * bit_factor / 2.0).round() as i16)
            .collect();

        let mut joint = vec![0.0f64; n * n];
        for a in 0..n {
            for b in 0..n {
                let s = scores[a * n + b] as f64 / bit_factor;
                joint[a * n + b] = background[a] * background[b] * s.exp2();
            }
        }

        Self::from_parts(chars, scores, background, joint, bit_factor)
    }

    /// Assemble a matrix from already-consistent parts. Shared by the file
    /// loader, the nucleotide matrix and the alphabet reduction.
    pub(crate) fn from_parts(
        chars: &[u8],
        scores: Vec<i16>,
        background: Vec<f64>,
        joint: Vec<f64>,
        bit_factor: f64,
    ) -> Self {
        let n = chars.len();
        let unknown = (n - 1) as u8;
        let mut to_code = [unknown; 256];
        for (code, &c) in chars.iter().enumerate() {
            to_code[c.to_ascii_uppercase() as usize] = code as u8;
            to_code[c.to_ascii_lowercase() as usize] = code as u8;
        }
        Self {
            alphabet_size: n,
            to_code,
            to_char: chars.to_vec(),
            unknown,
            background,
            joint,
            bit_factor,
            scores,
        }
    }

    /// Pairwise score of two residue codes.
    #[inline(always)]
    pub fn score(&self, a: u8, b: u8) -> i16 {
        self.scores[a as usize * self.alphabet_size + b as usize]
    }

    /// Translate one input byte to a residue code.
    #[inline(always)]
    pub fn encode(&self, byte: u8) -> u8 {
        self.to_code[byte as usize]
    }

    /// Maximum score in row `a`. Used for branch-and-bound pruning.
    pub fn row_max(&self, a: u8) -> i16 {
        let row = &self.scores[a as usize * self.alphabet_size..][..self.alphabet_size];
        row.iter().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOY_MATRIX: &str = "\
# toy matrix
   A  R  N  D  C  Q  E  G  H  I  L  K  M  F  P  S  T  W  Y  V  B  Z  X  *
A  4 -1 -2 -2  0 -1 -1  0 -2 -1 -1 -1 -1 -2 -1  1  0 -3 -2  0 -2 -1  0 -4
R -1  5  0 -2 -3  1  0 -2  0 -3 -2  2 -1 -3 -2 -1 -1 -3 -2 -3 -1  0 -1 -4
N -2  0  6  1 -3  0  0  0  1 -3 -3  0 -2 -3 -2  1  0 -4 -2 -3  3  0 -1 -4
D -2 -2  1  6 -3  0  2 -1 -1 -3 -4 -1 -3 -3 -1  0 -1 -4 -3 -3  4  1 -1 -4
C  0 -3 -3 -3  9 -3 -4 -3 -3 -1 -1 -3 -1 -2 -3 -1 -1 -2 -2 -1 -3 -3 -2 -4
Q -1  1  0  0 -3  5  2 -2  0 -3 -2  1  0 -3 -1  0 -1 -2 -1 -2  0  3 -1 -4
E -1  0  0  2 -4  2  5 -2  0 -3 -3  1 -2 -3 -1  0 -1 -3 -2 -2  1  4 -1 -4
G  0 -2  0 -1 -3 -2 -2  6 -2 -4 -4 -2 -3 -3 -2  0 -2 -2 -3 -3 -1 -2 -1 -4
H -2  0  1 -1 -3  0  0 -2  8 -3 -3 -1 -2 -1 -2 -1 -2 -2  2 -3  0  0 -1 -4
I -1 -3 -3 -3 -1 -3 -3 -4 -3  4  2 -3  1  0 -3 -2 -1 -3 -1  3 -3 -3 -1 -4
L -1 -2 -3 -4 -1 -2 -3 -4 -3  2  4 -2  2  0 -3 -2 -1 -2 -1  1 -4 -3 -1 -4
K -1  2  0 -1 -3  1  1 -2 -1 -3 -2  5 -1 -3 -1  0 -1 -3 -2 -2  0  1 -1 -4
M -1 -1 -2 -3 -1  0 -2 -3 -2  1  2 -1  5  0 -2 -1 -1 -1 -1  1 -3 -1 -1 -4
F -2 -3 -3 -3 -2 -3 -3 -3 -1  0  0 -3  0  6 -4 -2 -2  1  3 -1 -3 -3 -1 -4
P -1 -2 -2 -1 -3 -1 -1 -2 -2 -3 -3 -1 -2 -4  7 -1 -1 -4 -3 -2 -2 -1 -2 -4
S  1 -1  1  0 -1  0  0  0 -1 -2 -2  0 -1 -2 -1  4  1 -3 -2 -2  0  0  0 -4
T  0 -1  0 -1 -1 -1 -1 -2 -2 -1 -1 -1 -1 -2 -1  1  5 -2 -2  0 -1 -1  0 -4
W -3 -3 -4 -4 -2 -2 -3 -2 -2 -3 -2 -3 -1  1 -4 -3 -2 11  2 -3 -4 -3 -2 -4
Y -2 -2 -2 -3 -2 -1 -2 -3  2 -1 -1 -2 -1  3 -3 -2 -2  2  7 -1 -3 -2 -1 -4
V  0 -3 -3 -3 -1 -2 -2 -3 -3  3  1 -2  1 -1 -2 -2  0 -3 -1  4 -3 -2 -1 -4
B -2 -1  3  4 -3  0  1 -1  0 -3 -4  0 -3 -3 -2  0 -1 -4 -3 -3  4  1 -1 -4
Z -1  0  0  1 -3  3  4 -2  0 -3 -3  1 -1 -3 -1  0 -1 -3 -2 -2  1  4 -1 -4
X  0 -1 -1 -1 -2 -1 -1 -1 -1 -1 -1 -1 -1 -1 -2  0  0 -2 -1 -1 -1 -1 -1 -4
* -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4 -4
";

    #[test]
    fn parses_ncbi_format() {
        let m = ResidueMatrix::parse(TOY_MATRIX, 8.0).unwrap();
        assert_eq!(m.alphabet_size, 21);
        // A vs A: 4 half-bits -> 16 units at bit_factor 8.
        let a = m.encode(b'A');
        assert_eq!(m.score(a, a), 16);
        // W vs W is the file maximum.
        let w = m.encode(b'W');
        assert_eq!(m.score(w, w), 44);
        // Lowercase folds to the same code.
        assert_eq!(m.encode(b'a'), a);
    }

    #[test]
    fn unmapped_bytes_become_unknown() {
        let m = ResidueMatrix::parse(TOY_MATRIX, 8.0).unwrap();
        assert_eq!(m.encode(b'@'), m.unknown);
        assert_eq!(m.encode(b'X'), m.unknown);
    }

    #[test]
    fn joint_model_matches_scores() {
        let m = ResidueMatrix::parse(TOY_MATRIX, 8.0).unwrap();
        let (a, c) = (m.encode(b'A'), m.encode(b'C'));
        let p = m.joint[a as usize * m.alphabet_size + c as usize];
        let expect = m.background[a as usize]
            * m.background[c as usize]
            * ((m.score(a, c) as f64 / 8.0).exp2());
        assert!((p - expect).abs() < 1e-12);
    }

    #[test]
    fn background_is_normalized() {
        let m = ResidueMatrix::parse(TOY_MATRIX, 8.0).unwrap();
        let sum: f64 = m.background.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
