//! Threshold calibration against synthetic stores.

mod common;

use common::{random_sequences, write_matrix_file, write_store};
use prescan::calibrate::{set_kmer_threshold, CalibrationInput};
use prescan::matrix::{reduce_alphabet, ExtendedMatrix, ResidueMatrix};
use prescan::sequence::SeqType;
use prescan::store::{index_path, DBReader, OpenMode};

struct Setup {
    qdbr: DBReader,
    tdbr: DBReader,
    matrix: ResidueMatrix,
    ext2: ExtendedMatrix,
    ext3: ExtendedMatrix,
}

fn setup(dir: &std::path::Path, queries: &[Vec<u8>], targets: &[Vec<u8>]) -> Setup {
    let target_rows: Vec<(u64, &[u8])> =
        targets.iter().enumerate().map(|(i, s)| (i as u64, s.as_slice())).collect();
    let query_rows: Vec<(u64, &[u8])> =
        queries.iter().enumerate().map(|(i, s)| (1000 + i as u64, s.as_slice())).collect();
    let target_db = write_store(dir, "targets", &target_rows);
    let query_db = write_store(dir, "queries", &query_rows);

    let full = ResidueMatrix::from_file(&write_matrix_file(dir), 8.0).unwrap();
    let matrix = reduce_alphabet(&full, 13);
    let ext2 = ExtendedMatrix::new(&matrix, 2);
    let ext3 = ExtendedMatrix::new(&matrix, 3);
    Setup {
        qdbr: DBReader::open(&query_db, &index_path(&query_db), OpenMode::NoSort).unwrap(),
        tdbr: DBReader::open(&target_db, &index_path(&target_db), OpenMode::Sort).unwrap(),
        matrix,
        ext2,
        ext3,
    }
}

fn input<'a>(s: &'a Setup, kmer_size: usize) -> CalibrationInput<'a> {
    CalibrationInput {
        qdbr: &s.qdbr,
        tdbr: &s.tdbr,
        matrix: &s.matrix,
        ext2: Some(&s.ext2),
        ext3: Some(&s.ext3),
        query_seq_type: SeqType::AminoAcids,
        target_seq_type: SeqType::AminoAcids,
        kmer_size,
        max_seq_len: 1000,
        aa_bias_correction: false,
        verbose: false,
    }
}

#[test]
fn converges_into_the_time_band() {
    let dir = tempfile::tempdir().unwrap();
    let queries = random_sequences(1000, 40, 7);
    let targets = random_sequences(100, 350, 11);
    let s = setup(dir.path(), &queries, &targets);

    let calibration = set_kmer_threshold(&input(&s, 6), 4.0, 0.1).unwrap();
    assert!(calibration.in_band);
    let timeval = 2f64.powf(calibration.achieved_sensitivity);
    assert!(
        (14.4..=17.6).contains(&timeval),
        "time value {timeval} outside the sensitivity-4 band"
    );
    assert!(calibration.kmer_thr >= 18 && calibration.kmer_thr <= 480);
    assert!(calibration.kmer_match_prob > 0.0);
}

#[test]
fn degenerate_input_falls_back_with_best_effort() {
    let dir = tempfile::tempdir().unwrap();
    // Queries of pure unknowns generate no k-mers at any threshold, so the
    // cost model is pinned at gamma and the band is unreachable.
    let queries = vec![vec![b'X'; 40]; 5];
    let targets = vec![b"ACDEFGH".to_vec()];
    let s = setup(dir.path(), &queries, &targets);

    let calibration = set_kmer_threshold(&input(&s, 6), 4.0, 0.1).unwrap();
    assert!(!calibration.in_band);
    assert!((calibration.achieved_sensitivity - 4.0).abs() > 0.5);
}

#[test]
fn higher_thresholds_generate_less_work() {
    // Monotonicity of the workload observables in the threshold.
    let dir = tempfile::tempdir().unwrap();
    let queries = random_sequences(20, 40, 3);
    let targets = random_sequences(20, 40, 5);
    let s = setup(dir.path(), &queries, &targets);

    use prescan::matcher::{MatcherParams, QueryTemplateMatcher, ScoringSource, SearchContext};
    use prescan::prefilter::build_index_table;
    use prescan::sequence::Sequence;

    let index = build_index_table(
        &s.tdbr,
        &s.matrix,
        SeqType::AminoAcids,
        6,
        0,
        0,
        s.tdbr.size(),
        1000,
        false,
    );
    let ctx = SearchContext {
        matrix: &s.matrix,
        source: ScoringSource::Extended {
            ext2: &s.ext2,
            ext3: &s.ext3,
        },
        index: &index,
        target_seq_lens: s.tdbr.get_seq_lens(),
    };

    let mut previous: Option<(f64, usize)> = None;
    for kmer_thr in [40, 80, 120, 160, 200] {
        let params = MatcherParams {
            kmer_thr,
            kmer_match_prob: 1.0,
            kmer_size: 6,
            db_size: s.tdbr.size(),
            aa_bias_correction: false,
            max_seq_len: 1000,
            z_thr: 500.0,
            max_res_list_len: 1,
        };
        let mut matcher = QueryTemplateMatcher::new(ctx, params);
        let mut seq = Sequence::new(1000, SeqType::AminoAcids, &s.matrix);
        let mut kmers_per_pos = 0.0;
        let mut db_matches = 0;
        for id in 0..s.qdbr.size() {
            seq.map_sequence(id, s.qdbr.get_db_key(id), s.qdbr.get_data(id), &s.matrix);
            matcher.match_query(&mut seq, None);
            kmers_per_pos += seq.stats.kmers_per_pos;
            db_matches += seq.stats.db_matches;
        }
        if let Some((prev_kpp, prev_matches)) = previous {
            assert!(kmers_per_pos <= prev_kpp);
            assert!(db_matches <= prev_matches);
        }
        previous = Some((kmers_per_pos, db_matches));
    }
}
