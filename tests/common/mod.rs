//! Shared fixtures for the integration tests: temp stores, a scoring
//! matrix file and output parsing.

use std::fs;
use std::path::{Path, PathBuf};

use prescan::store::{index_path, DBReader, DBWriter, OpenMode};

pub const BLOSUM62: &str = "\
#  Matrix made by matblas from blosum62.iij
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

/// Write a key -> blob store under `dir/name`, returning the data path.
pub fn write_store(dir: &Path, name: &str, entries: &[(u64, &[u8])]) -> PathBuf {
    let data = dir.join(name);
    let index = index_path(&data);
    let writer = DBWriter::open(&data, &index, 1).unwrap();
    for &(key, blob) in entries {
        writer.write(blob, key, 0).unwrap();
    }
    writer.close().unwrap();
    data
}

/// Write the BLOSUM62 fixture and return its path.
pub fn write_matrix_file(dir: &Path) -> PathBuf {
    let path = dir.join("blosum62.out");
    fs::write(&path, BLOSUM62).unwrap();
    path
}

/// Parse a merged output store into per-key hit lists.
pub fn read_hits(out_db: &Path) -> Vec<(u64, Vec<(u64, f32, i32)>)> {
    let reader = DBReader::open(out_db, &index_path(out_db), OpenMode::NoSort).unwrap();
    (0..reader.size())
        .map(|id| {
            let text = std::str::from_utf8(reader.get_data(id)).unwrap();
            let hits = text
                .lines()
                .map(|line| {
                    let mut cols = line.split('\t');
                    (
                        cols.next().unwrap().parse().unwrap(),
                        cols.next().unwrap().parse().unwrap(),
                        cols.next().unwrap().parse().unwrap(),
                    )
                })
                .collect();
            (reader.get_db_key(id), hits)
        })
        .collect()
}

/// The 20 standard residues, used to spin deterministic toy sequences.
pub const RESIDUES: &[u8] = b"ACDEFGHIKLMNPQRSTVWY";

/// Rotation `shift` of the standard residue cycle, `len` residues long.
pub fn rotated_sequence(shift: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| RESIDUES[(i + shift) % RESIDUES.len()]).collect()
}

/// Seeded random residue sequences.
pub fn random_sequences(count: usize, len: usize, seed: u64) -> Vec<Vec<u8>> {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..len).map(|_| RESIDUES[rng.gen_range(0..RESIDUES.len())]).collect())
        .collect()
}
