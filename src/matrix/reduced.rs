//! Alphabet reduction by greedy clustering on joint probabilities.
//!
//! Residue pairs with the highest joint odds ratio `p(a,b) / (p(a) p(b))`
//! are the most interchangeable under the scoring model, so they are merged
//! first. The unknown symbol is never merged.

use super::substitution::ResidueMatrix;

/// Reduce `base` to `target_size` effective residues (including the unknown
/// symbol). Scores are recomputed from the merged probability model at the
/// same `bit_factor` scale. `target_size` must be at least 2 and no larger
/// than the base alphabet.
pub fn reduce_alphabet(base: &ResidueMatrix, target_size: usize) -> ResidueMatrix {
    assert!(
        (2..=base.alphabet_size).contains(&target_size),
        "reduced alphabet size {} out of range",
        target_size
    );

    let n = base.alphabet_size;
    let unknown = base.unknown as usize;

    // Groups of original residue codes. The unknown symbol stays a
    // singleton and is kept last.
    let mut groups: Vec<Vec<usize>> = (0..n).filter(|&c| c != unknown).map(|c| vec![c]).collect();

    let group_prob = |g: &[usize]| -> f64 { g.iter().map(|&c| base.background[c]).sum() };
    let pair_prob = |ga: &[usize], gb: &[usize]| -> f64 {
        let mut p = 0.0;
        for &a in ga {
            for &b in gb {
                p += base.joint[a * n + b];
            }
        }
        p
    };

    while groups.len() + 1 > target_size {
        let mut best = (0usize, 1usize);
        let mut best_ratio = f64::NEG_INFINITY;
        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                let ratio =
                    pair_prob(&groups[i], &groups[j]) / (group_prob(&groups[i]) * group_prob(&groups[j]));
                if ratio > best_ratio {
                    best_ratio = ratio;
                    best = (i, j);
                }
            }
        }
        let merged = groups.remove(best.1);
        groups[best.0].extend(merged);
    }
    groups.push(vec![unknown]);

    // Representative of a group is its highest-background member.
    let mut chars = Vec::with_capacity(groups.len());
    for g in &groups {
        let rep = g
            .iter()
            .copied()
            .max_by(|&a, &b| base.background[a].total_cmp(&base.background[b]))
            .unwrap();
        chars.push(base.to_char[rep]);
    }

    let m = groups.len();
    let mut background = vec![0.0f64; m];
    let mut joint = vec![0.0f64; m * m];
    for (gi, g) in groups.iter().enumerate() {
        background[gi] = group_prob(g);
        for (gj, h) in groups.iter().enumerate() {
            joint[gi * m + gj] = pair_prob(g, h);
        }
    }

    let scores: Vec<i16> = (0..m * m)
        .map(|idx| {
            let (a, b) = (idx / m, idx % m);
            let odds = joint[idx] / (background[a] * background[b]);
            (base.bit_factor * odds.log2()).round() as i16
        })
        .collect();

    let mut reduced = ResidueMatrix::from_parts(&chars, scores, background, joint, base.bit_factor);

    // Every original byte must still encode, mapped through its group.
    let mut to_code = [reduced.unknown; 256];
    for (gi, g) in groups.iter().enumerate() {
        for &orig in g {
            let c = base.to_char[orig];
            to_code[c.to_ascii_uppercase() as usize] = gi as u8;
            to_code[c.to_ascii_lowercase() as usize] = gi as u8;
        }
    }
    reduced.to_code = to_code;
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::nucleotide_matrix;

    #[test]
    fn reduces_to_requested_size() {
        let base = nucleotide_matrix(8.0);
        let reduced = reduce_alphabet(&base, 3);
        assert_eq!(reduced.alphabet_size, 3);
        // Unknown survives as its own last code.
        assert_eq!(reduced.unknown, 2);
        assert_eq!(reduced.encode(b'N'), reduced.unknown);
    }

    #[test]
    fn merged_members_share_a_code() {
        let base = nucleotide_matrix(8.0);
        let reduced = reduce_alphabet(&base, 2);
        // All four bases collapse into one group.
        let a = reduced.encode(b'A');
        assert_eq!(reduced.encode(b'C'), a);
        assert_eq!(reduced.encode(b'G'), a);
        assert_eq!(reduced.encode(b'T'), a);
        assert_ne!(reduced.encode(b'N'), a);
    }

    #[test]
    fn probabilities_stay_normalized() {
        let base = nucleotide_matrix(8.0);
        let reduced = reduce_alphabet(&base, 3);
        let sum: f64 = reduced.background.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
