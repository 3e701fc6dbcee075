//! Prefiltering orchestration.
//!
//! Drives the two-phase run: calibrate the k-mer similarity threshold
//! once, then stream every query against the target store split by split,
//! writing per-query result blobs keyed by the query's store key. Splits
//! bound peak memory: each gets its own index table and temp output store,
//! and the final merge re-ranks the per-query union.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::calibrate::{set_kmer_threshold, Calibration, CalibrationInput};
use crate::index::IndexTable;
use crate::matcher::{Hit, MatcherParams, QueryTemplateMatcher, ScoringSource, SearchContext};
use crate::matrix::{nucleotide_matrix, reduce_alphabet, ExtendedMatrix, ResidueMatrix};
use crate::sequence::{SeqType, Sequence};
use crate::store::{index_path, DBReader, DBWriter, OpenMode};

/// Score scale handed to matrix construction.
const BIT_FACTOR: f64 = 8.0;
/// Calibration band half-width.
const TOLERANCE: f64 = 0.1;
/// Queries per parallel work unit.
const QUERY_CHUNK: usize = 100;

pub struct PrefilterConfig {
    pub query_db: PathBuf,
    pub target_db: PathBuf,
    pub out_db: PathBuf,
    pub scoring_matrix_file: Option<PathBuf>,
    pub sensitivity: f64,
    pub kmer_size: usize,
    pub max_res_list_len: usize,
    pub alphabet_size: usize,
    pub z_score_thr: f32,
    pub max_seq_len: usize,
    pub query_seq_type: SeqType,
    pub target_seq_type: SeqType,
    pub aa_bias_correction: bool,
    /// Targets per split; 0 processes the whole store in one split.
    pub split_size: usize,
    /// Index-build position stride.
    pub skip: usize,
    /// Worker threads; 0 uses all available cores.
    pub threads: usize,
    /// Per-query output blob cap in bytes.
    pub buffer_size: usize,
    pub verbose: bool,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            query_db: PathBuf::new(),
            target_db: PathBuf::new(),
            out_db: PathBuf::new(),
            scoring_matrix_file: None,
            sensitivity: 4.0,
            kmer_size: 6,
            max_res_list_len: 300,
            alphabet_size: 21,
            z_score_thr: 50.0,
            max_seq_len: 50_000,
            query_seq_type: SeqType::AminoAcids,
            target_seq_type: SeqType::AminoAcids,
            aa_bias_correction: true,
            split_size: 0,
            skip: 0,
            threads: 0,
            buffer_size: 1_048_576,
            verbose: false,
        }
    }
}

struct SplitStats {
    kmers_per_pos: f64,
    db_matches: usize,
    res_size: usize,
    reslens: Vec<usize>,
    empty: usize,
    skipped: usize,
}

pub struct Prefiltering {
    config: PrefilterConfig,
    qdbr: DBReader,
    tdbr: DBReader,
    /// Query and target name the same store; close it once.
    same_store: bool,
    matrix: ResidueMatrix,
    ext2: Option<ExtendedMatrix>,
    ext3: Option<ExtendedMatrix>,
    kmer_thr: i32,
    kmer_match_prob: f64,
}

impl Prefiltering {
    /// Open the stores, build the scoring model and calibrate the k-mer
    /// threshold. Configuration errors and store I/O errors are fatal here.
    pub fn new(config: PrefilterConfig) -> Result<Self> {
        let threads = if config.threads == 0 {
            num_cpus::get()
        } else {
            config.threads
        };
        // A pool may already exist (tests, embedding callers); that one wins.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global();
        if config.verbose {
            eprintln!("[INFO] using {threads} threads");
        }

        DBWriter::error_if_exists(&config.out_db)?;
        DBWriter::error_if_exists(&index_path(&config.out_db))?;

        let qdbr = DBReader::open(&config.query_db, &index_path(&config.query_db), OpenMode::NoSort)?;
        let tdbr = DBReader::open(&config.target_db, &index_path(&config.target_db), OpenMode::Sort)?;
        let same_store = same_file(&config.query_db, &config.target_db);
        if config.verbose {
            eprintln!(
                "[INFO] query store {} (size {}), target store {} (size {})",
                config.query_db.display(),
                qdbr.size(),
                config.target_db.display(),
                tdbr.size()
            );
        }

        let matrix = match config.query_seq_type {
            SeqType::Nucleotides => nucleotide_matrix(BIT_FACTOR),
            SeqType::AminoAcids | SeqType::HmmProfile => {
                let path = config
                    .scoring_matrix_file
                    .as_deref()
                    .context("a scoring matrix file is required for amino acid searches")?;
                let full = ResidueMatrix::from_file(path, BIT_FACTOR)?;
                if config.alphabet_size < full.alphabet_size {
                    reduce_alphabet(&full, config.alphabet_size)
                } else {
                    full
                }
            }
        };

        // Profile queries score against their own position-specific rows;
        // the extended tables are only needed for sequence queries.
        let (ext2, ext3) = match config.query_seq_type {
            SeqType::HmmProfile => (None, None),
            _ => (
                Some(ExtendedMatrix::new(&matrix, 2)),
                Some(ExtendedMatrix::new(&matrix, 3)),
            ),
        };

        eprintln!(
            "[INFO] adjusting k-mer similarity threshold within +-{:.0}% of the time target, sensitivity {}",
            TOLERANCE * 100.0,
            config.sensitivity
        );
        let Calibration {
            kmer_thr,
            kmer_match_prob,
            ..
        } = set_kmer_threshold(
            &CalibrationInput {
                qdbr: &qdbr,
                tdbr: &tdbr,
                matrix: &matrix,
                ext2: ext2.as_ref(),
                ext3: ext3.as_ref(),
                query_seq_type: config.query_seq_type,
                target_seq_type: config.target_seq_type,
                kmer_size: config.kmer_size,
                max_seq_len: config.max_seq_len,
                aa_bias_correction: config.aa_bias_correction,
                verbose: config.verbose,
            },
            config.sensitivity,
            TOLERANCE,
        )?;
        eprintln!("[INFO] k-mer similarity threshold {kmer_thr}, match probability {kmer_match_prob:.4e}");

        Ok(Self {
            config,
            qdbr,
            tdbr,
            same_store,
            matrix,
            ext2,
            ext3,
            kmer_thr,
            kmer_match_prob,
        })
    }

    /// Full run: every target split in sequence, then merge.
    pub fn run(&mut self) -> Result<()> {
        let total = self.tdbr.size();
        let split_size = if self.config.split_size == 0 {
            total.max(1)
        } else {
            self.config.split_size
        };
        let step_count = (total + split_size - 1) / split_size;

        let mut split_files = Vec::new();
        for (step, split_start) in (0..total).step_by(split_size).enumerate() {
            eprintln!("[INFO] prefiltering step {} of {}", step + 1, step_count);
            let files = self.tmp_file_names(step + 1);
            let stats = self.run_split(
                split_start,
                split_size.min(total - split_start),
                &files.0,
                &files.1,
            )?;
            self.print_statistics(&stats);
            split_files.push(files);
        }

        self.merge_output(&split_files)?;
        remove_stores(&split_files)?;
        self.close_readers();
        Ok(())
    }

    /// Sharded run for a distributed host: this process covers the target
    /// range of `rank` out of `world_size`. The host must guarantee all
    /// ranks have finished before rank 0 runs the merge, e.g. by calling
    /// rank 0 after a barrier.
    pub fn run_sharded(&mut self, rank: usize, world_size: usize) -> Result<()> {
        let (start, size) = decompose_domain(self.tdbr.size(), rank, world_size);
        let files = self.tmp_file_names(rank);
        let stats = self.run_split(start, size, &files.0, &files.1)?;
        self.print_statistics(&stats);

        if rank == 0 {
            let split_files: Vec<_> = (0..world_size).map(|r| self.tmp_file_names(r)).collect();
            self.merge_output(&split_files)?;
            remove_stores(&split_files)?;
        }
        self.close_readers();
        Ok(())
    }

    fn tmp_file_names(&self, step: usize) -> (PathBuf, PathBuf) {
        let mut os = self.config.out_db.as_os_str().to_owned();
        os.push(format!("_tmp_{step}"));
        let data = PathBuf::from(os);
        let index = index_path(&data);
        (data, index)
    }

    /// Process queries against targets `[db_from, db_from + db_size)` into
    /// a temp store.
    fn run_split(
        &self,
        db_from: usize,
        db_size: usize,
        result_db: &Path,
        result_index: &Path,
    ) -> Result<SplitStats> {
        let index = build_index_table(
            &self.tdbr,
            &self.matrix,
            self.config.target_seq_type,
            self.config.kmer_size,
            self.config.skip,
            db_from,
            db_from + db_size,
            self.config.max_seq_len,
            self.config.verbose,
        );

        let writer = DBWriter::open(result_db, result_index, rayon::current_num_threads())?;
        let query_count = self.qdbr.size();
        let not_empty: Vec<AtomicU8> = (0..query_count).map(|_| AtomicU8::new(0)).collect();

        let source = match self.config.query_seq_type {
            SeqType::HmmProfile => ScoringSource::Profile,
            _ => ScoringSource::Extended {
                ext2: self.ext2.as_ref().expect("extended matrices built for sequence queries"),
                ext3: self.ext3.as_ref().expect("extended matrices built for sequence queries"),
            },
        };
        let ctx = SearchContext {
            matrix: &self.matrix,
            source,
            index: &index,
            target_seq_lens: self.tdbr.get_seq_lens(),
        };
        let params = MatcherParams {
            kmer_thr: self.kmer_thr,
            kmer_match_prob: self.kmer_match_prob,
            kmer_size: self.config.kmer_size,
            db_size: self.tdbr.size(),
            aa_bias_correction: self.config.aa_bias_correction,
            max_seq_len: self.config.max_seq_len,
            z_thr: self.config.z_score_thr,
            max_res_list_len: self.config.max_res_list_len,
        };

        let started = Instant::now();
        let progress = ProgressBar::new(query_count as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap(),
        );

        let ids: Vec<usize> = (0..query_count).collect();
        let stats = ids
            .par_chunks(QUERY_CHUNK)
            .map_init(
                || {
                    (
                        Sequence::new(self.config.max_seq_len, self.config.query_seq_type, &self.matrix),
                        QueryTemplateMatcher::new(ctx, params),
                        String::with_capacity(self.config.buffer_size.min(1 << 16)),
                    )
                },
                |(seq, matcher, out), chunk| -> Result<SplitStats> {
                    let shard = rayon::current_thread_index().unwrap_or(0);
                    let mut stats = SplitStats {
                        kmers_per_pos: 0.0,
                        db_matches: 0,
                        res_size: 0,
                        reslens: Vec::with_capacity(chunk.len()),
                        empty: 0,
                        skipped: 0,
                    };
                    for &id in chunk {
                        let key = self.qdbr.get_db_key(id);
                        if seq.map_sequence(id, key, self.qdbr.get_data(id), &self.matrix) {
                            eprintln!(
                                "[WARN] query {key} longer than {} residues, truncated",
                                self.config.max_seq_len
                            );
                        }
                        let self_id = self.tdbr.get_id(key).map(|t| t as u32);
                        let hits = matcher.match_query(seq, self_id);

                        if !self.write_prefilter_output(&writer, out, shard, key, hits)? {
                            stats.skipped += 1;
                            continue;
                        }
                        if !hits.is_empty() {
                            not_empty[id].store(1, Ordering::Relaxed);
                        }
                        stats.kmers_per_pos += seq.stats.kmers_per_pos;
                        stats.db_matches += seq.stats.db_matches;
                        stats.res_size += hits.len();
                        stats.reslens.push(hits.len());
                    }
                    progress.inc(chunk.len() as u64);
                    Ok(stats)
                },
            )
            .try_reduce(
                || SplitStats {
                    kmers_per_pos: 0.0,
                    db_matches: 0,
                    res_size: 0,
                    reslens: Vec::new(),
                    empty: 0,
                    skipped: 0,
                },
                |mut a, mut b| {
                    a.kmers_per_pos += b.kmers_per_pos;
                    a.db_matches += b.db_matches;
                    a.res_size += b.res_size;
                    a.reslens.append(&mut b.reslens);
                    a.skipped += b.skipped;
                    Ok(a)
                },
            )?;
        progress.finish_and_clear();

        let mut stats = stats;
        stats.empty = not_empty
            .iter()
            .filter(|flag| flag.load(Ordering::Relaxed) == 0)
            .count();

        writer.close()?;
        if self.config.verbose {
            eprintln!(
                "[INFO] prefiltering scores calculated in {:.1}s",
                started.elapsed().as_secs_f64()
            );
        }
        Ok(stats)
    }

    /// Format one query's hits and write the blob under its key. Returns
    /// false when the formatted blob exceeds the output buffer cap and the
    /// query had to be skipped.
    fn write_prefilter_output(
        &self,
        writer: &DBWriter,
        out: &mut String,
        shard: usize,
        query_key: u64,
        hits: &[Hit],
    ) -> Result<bool> {
        out.clear();
        for hit in hits {
            if (hit.target_id as usize) >= self.tdbr.size() {
                eprintln!(
                    "[WARN] suspicious prefiltering result: query {} -> target id {} (store size {})",
                    query_key,
                    hit.target_id,
                    self.tdbr.size()
                );
            }
            let target_key = self.tdbr.get_db_key(hit.target_id as usize);
            writeln!(out, "{}\t{:.4}\t{}", target_key, hit.z_score, hit.pref_score)
                .expect("formatting into a String cannot fail");
        }
        if out.len() > self.config.buffer_size {
            eprintln!(
                "[WARN] prefiltering result for query {} ({} hits, {} bytes) exceeds the output buffer ({} bytes); skipping",
                query_key,
                hits.len(),
                out.len(),
                self.config.buffer_size
            );
            return Ok(false);
        }
        writer.write(out.as_bytes(), query_key, shard)?;
        Ok(true)
    }

    /// Merge the split stores: per query key, the union of the splits'
    /// hits re-sorted by descending z-score (ties by ascending target key)
    /// and truncated to the result list cap.
    fn merge_output(&self, split_files: &[(PathBuf, PathBuf)]) -> Result<()> {
        let cap = self.config.max_res_list_len;
        DBWriter::merge_files(
            &self.config.out_db,
            &index_path(&self.config.out_db),
            split_files,
            |blobs| merge_hit_blobs(blobs, cap),
        )
    }

    fn close_readers(&mut self) {
        self.qdbr.close();
        if !self.same_store {
            self.tdbr.close();
        }
    }

    fn print_statistics(&self, stats: &SplitStats) {
        let query_count = self.qdbr.size().max(1);
        eprintln!(
            "[INFO] {:.2} k-mers per position",
            stats.kmers_per_pos / query_count as f64
        );
        eprintln!(
            "[INFO] {} DB matches per sequence",
            stats.db_matches / query_count
        );
        let passed_per_query = stats.res_size / query_count;
        if passed_per_query > self.config.max_res_list_len {
            eprintln!(
                "[INFO] {} sequences passed prefiltering per query (ATTENTION: max {} best scoring sequences were written)",
                passed_per_query, self.config.max_res_list_len
            );
        } else {
            eprintln!("[INFO] {passed_per_query} sequences passed prefiltering per query");
        }

        let mut reslens = stats.reslens.clone();
        reslens.sort_unstable();
        let median = reslens.get(reslens.len() / 2).copied().unwrap_or(0);
        eprintln!("[INFO] median result list length {median}");
        eprintln!("[INFO] {} queries with empty result lists", stats.empty);
        if stats.skipped > 0 {
            eprintln!("[INFO] {} queries skipped (output buffer overflow)", stats.skipped);
        }
    }
}

/// Two store paths alias the same file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}

/// Balanced contiguous partition of `total` items over `world_size` ranks;
/// the remainder goes to the lowest ranks.
pub fn decompose_domain(total: usize, rank: usize, world_size: usize) -> (usize, usize) {
    assert!(world_size > 0 && rank < world_size, "invalid shard rank {rank}/{world_size}");
    let base = total / world_size;
    let remainder = total % world_size;
    let size = base + usize::from(rank < remainder);
    let start = rank * base + rank.min(remainder);
    (start, size)
}

/// Build an index table over targets `[db_from, db_to)` in two passes.
#[allow(clippy::too_many_arguments)]
pub fn build_index_table(
    dbr: &DBReader,
    matrix: &ResidueMatrix,
    seq_type: SeqType,
    kmer_size: usize,
    skip: usize,
    db_from: usize,
    db_to: usize,
    max_seq_len: usize,
    verbose: bool,
) -> IndexTable {
    let started = Instant::now();
    let db_to = db_to.min(dbr.size());
    let mut table = IndexTable::new(matrix.alphabet_size, kmer_size, skip);
    let mut seq = Sequence::new(max_seq_len, seq_type, matrix);

    for id in db_from..db_to {
        if seq.map_sequence(id, dbr.get_db_key(id), dbr.get_data(id), matrix) {
            eprintln!(
                "[WARN] target {} longer than {max_seq_len} residues, truncated",
                dbr.get_db_key(id)
            );
        }
        table.add_kmer_count(&seq);
    }
    table.init();
    for id in db_from..db_to {
        seq.map_sequence(id, dbr.get_db_key(id), dbr.get_data(id), matrix);
        table.add_sequence(&seq);
    }
    table.remove_duplicate_entries();

    if verbose {
        eprintln!(
            "[INFO] index table over targets [{db_from}:{db_to}): {} entries, built in {:.1}s",
            table.entry_count(),
            started.elapsed().as_secs_f64()
        );
    }
    table
}

/// Parse a `key \t zscore \t prefscore` hit line.
fn parse_hit_line(line: &str) -> Option<(u64, f32, i32)> {
    let mut cols = line.split('\t');
    let key = cols.next()?.parse().ok()?;
    let z = cols.next()?.parse().ok()?;
    let pref = cols.next()?.parse().ok()?;
    Some((key, z, pref))
}

/// Merge hit blobs from several splits into one ranked blob.
fn merge_hit_blobs(blobs: &[&[u8]], cap: usize) -> Vec<u8> {
    let mut hits: Vec<(u64, f32, i32)> = Vec::new();
    for blob in blobs {
        let text = std::str::from_utf8(blob).unwrap_or("");
        hits.extend(text.lines().filter_map(parse_hit_line));
    }
    hits.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    hits.truncate(cap);

    let mut out = String::new();
    for (key, z, pref) in hits {
        writeln!(out, "{}\t{:.4}\t{}", key, z, pref).expect("formatting into a String cannot fail");
    }
    out.into_bytes()
}

/// Delete temp stores after a successful merge.
fn remove_stores(split_files: &[(PathBuf, PathBuf)]) -> Result<()> {
    for (data, index) in split_files {
        fs::remove_file(data).with_context(|| format!("failed to remove {}", data.display()))?;
        fs::remove_file(index).with_context(|| format!("failed to remove {}", index.display()))?;
    }
    Ok(())
}

/// Configuration sanity checks shared by the CLI and embedding callers.
pub fn validate_config(config: &PrefilterConfig) -> Result<()> {
    if !(4..=7).contains(&config.kmer_size) {
        bail!("k-mer size {} is not valid (supported: 4-7)", config.kmer_size);
    }
    if config.max_seq_len == 0 || config.max_res_list_len == 0 {
        bail!("max-seq-len and max-res-list-len must be positive");
    }
    if config.alphabet_size < 2 {
        bail!("alphabet size {} is not valid", config.alphabet_size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_decomposition_is_balanced_and_contiguous() {
        let total = 10;
        let world = 3;
        let parts: Vec<_> = (0..world).map(|r| decompose_domain(total, r, world)).collect();
        assert_eq!(parts, vec![(0, 4), (4, 3), (7, 3)]);
        let covered: usize = parts.iter().map(|&(_, s)| s).sum();
        assert_eq!(covered, total);
        for w in parts.windows(2) {
            assert_eq!(w[0].0 + w[0].1, w[1].0);
        }
    }

    #[test]
    fn domain_decomposition_handles_more_ranks_than_items() {
        let parts: Vec<_> = (0..4).map(|r| decompose_domain(2, r, 4)).collect();
        assert_eq!(parts, vec![(0, 1), (1, 1), (2, 0), (2, 0)]);
    }

    #[test]
    fn hit_lines_round_trip_through_merge() {
        let a = b"7\t12.5000\t9\n3\t4.0000\t2\n" as &[u8];
        let b = b"5\t8.2500\t6\n" as &[u8];
        let merged = merge_hit_blobs(&[a, b], 10);
        let text = String::from_utf8(merged).unwrap();
        let keys: Vec<u64> = text
            .lines()
            .map(|l| parse_hit_line(l).unwrap().0)
            .collect();
        assert_eq!(keys, vec![7, 5, 3]);
    }

    #[test]
    fn merge_truncates_to_cap() {
        let a = b"1\t3.0000\t1\n2\t2.0000\t1\n3\t1.0000\t1\n" as &[u8];
        let merged = merge_hit_blobs(&[a], 2);
        let text = String::from_utf8(merged).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn merge_breaks_z_ties_by_key() {
        let a = b"9\t5.0000\t3\n" as &[u8];
        let b = b"2\t5.0000\t3\n" as &[u8];
        let merged = merge_hit_blobs(&[a, b], 10);
        let text = String::from_utf8(merged).unwrap();
        let keys: Vec<u64> = text.lines().map(|l| parse_hit_line(l).unwrap().0).collect();
        assert_eq!(keys, vec![2, 9]);
    }

    #[test]
    fn config_validation_rejects_bad_k() {
        let mut config = PrefilterConfig::default();
        config.kmer_size = 3;
        assert!(validate_config(&config).is_err());
        config.kmer_size = 6;
        assert!(validate_config(&config).is_ok());
    }
}
