//! Command line arguments for the prefilter tool.

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::prefilter::PrefilterConfig;
use crate::sequence::SeqType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SeqTypeArg {
    Nucleotides,
    AminoAcids,
    HmmProfile,
}

impl From<SeqTypeArg> for SeqType {
    fn from(value: SeqTypeArg) -> Self {
        match value {
            SeqTypeArg::Nucleotides => SeqType::Nucleotides,
            SeqTypeArg::AminoAcids => SeqType::AminoAcids,
            SeqTypeArg::HmmProfile => SeqType::HmmProfile,
        }
    }
}

#[derive(Args, Debug)]
pub struct PrefilterArgs {
    /// Query store prefix (expects <path> and <path>.index)
    #[arg(short, long)]
    pub query_db: PathBuf,
    /// Target store prefix (expects <path> and <path>.index)
    #[arg(short, long)]
    pub target_db: PathBuf,
    /// Output store prefix; temp splits land at <path>_tmp_<n>
    #[arg(short, long)]
    pub out_db: PathBuf,
    /// Scoring matrix file (required for amino acid and profile searches)
    #[arg(short = 'm', long)]
    pub scoring_matrix_file: Option<PathBuf>,
    /// Time target exponent: the calibrator aims at 2^sensitivity
    #[arg(short, long, default_value_t = 4.0)]
    pub sensitivity: f64,
    #[arg(short, long, default_value_t = 6)]
    pub kmer_size: usize,
    /// Maximum hits kept per query
    #[arg(long, default_value_t = 300)]
    pub max_res_list_len: usize,
    /// Effective alphabet size; amino acid alphabets smaller than 21 are
    /// reduced by clustering
    #[arg(short, long, default_value_t = 21)]
    pub alphabet_size: usize,
    /// Minimum z-score to emit a hit
    #[arg(short, long, default_value_t = 50.0)]
    pub zscore_thr: f32,
    /// Longer sequences are truncated to this length
    #[arg(long, default_value_t = 50_000)]
    pub max_seq_len: usize,
    #[arg(long, value_enum, default_value = "amino-acids")]
    pub query_seq_type: SeqTypeArg,
    #[arg(long, value_enum, default_value = "amino-acids")]
    pub target_seq_type: SeqTypeArg,
    /// Window-mean compositional bias correction
    #[arg(long, default_value_t = true)]
    pub aa_bias_correction: bool,
    /// Targets per split; 0 processes the whole target store at once
    #[arg(long, default_value_t = 0)]
    pub split_size: usize,
    /// Index-build stride: every skip+1-th position contributes
    #[arg(long, default_value_t = 0)]
    pub skip: usize,
    #[arg(short = 'n', long, default_value_t = 0)]
    pub num_threads: usize,
    /// Per-query output blob cap in bytes
    #[arg(long, default_value_t = 1_048_576)]
    pub buffer_size: usize,
    /// Shard rank when a distributed host drives the run
    #[arg(long, requires = "shard_count")]
    pub shard_rank: Option<usize>,
    /// Total shard count when a distributed host drives the run
    #[arg(long, requires = "shard_rank")]
    pub shard_count: Option<usize>,
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,
}

impl PrefilterArgs {
    pub fn to_config(&self) -> PrefilterConfig {
        PrefilterConfig {
            query_db: self.query_db.clone(),
            target_db: self.target_db.clone(),
            out_db: self.out_db.clone(),
            scoring_matrix_file: self.scoring_matrix_file.clone(),
            sensitivity: self.sensitivity,
            kmer_size: self.kmer_size,
            max_res_list_len: self.max_res_list_len,
            alphabet_size: self.alphabet_size,
            z_score_thr: self.zscore_thr,
            max_seq_len: self.max_seq_len,
            query_seq_type: self.query_seq_type.into(),
            target_seq_type: self.target_seq_type.into(),
            aa_bias_correction: self.aa_bias_correction,
            split_size: self.split_size,
            skip: self.skip,
            threads: self.num_threads,
            buffer_size: self.buffer_size,
            verbose: self.verbose,
        }
    }
}
