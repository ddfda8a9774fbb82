use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::engine::{DedupConfig, DedupEngine, EngineError, UmiConfig};
use crate::io::{BamIoError, BamReader, BamWriter, Region};

const CHANNEL_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// The input bam file. fragmark reads from stdin when omitted
    #[clap(short, long)]
    pub bam: Option<PathBuf>,

    /// The output bam file. fragmark writes to stdout when omitted
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// The duplication metrics file, if missing metrics will be written to stderr
    #[clap(short = 'm', long)]
    pub metrics: Option<PathBuf>,

    /// Genomic span in bases of one partition, the unit used to share
    /// fragment state across chromosome workers
    #[clap(long, default_value_t = 1_000_000)]
    pub partition_size: i64,

    /// Sliding window in bases a position may still receive mates within
    #[clap(long, default_value_t = 1_000)]
    pub buffer_size: i64,

    /// Expected read length, bounds the mate start distance when grouping
    /// reads whose duplicate status is not yet decidable
    #[clap(long, default_value_t = 151)]
    pub read_length: i64,

    /// Enable UMI aware grouping and consensus generation
    #[clap(short = 'u', long)]
    pub umi: bool,

    /// UMI distance. The maximum hamming distance between the UMI sequences
    /// used to consider read(pairs) copies of one molecule
    #[clap(short = 'd', long, default_value_t = 1)]
    pub umi_distance: usize,

    /// Number of worker threads
    #[clap(short = 't', long, default_value_t = 4)]
    pub threads: usize,

    /// Restrict processing to these regions (chrom or chrom:start-end).
    /// Reads outside are copied through unmodified
    #[clap(short = 'r', long)]
    pub regions: Vec<String>,
}

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> App {
        App { config }
    }

    pub async fn run(self) -> Result<(), AppError> {
        let regions = self
            .config
            .regions
            .iter()
            .map(|s| parse_region(s))
            .collect::<Result<Vec<_>, _>>()?;

        let reader = BamReader::open(self.config.bam.as_deref())?;
        let header = reader.header().clone();
        let writer = BamWriter::create(self.config.output.as_deref(), header)?;

        let engine = DedupEngine::new(DedupConfig {
            partition_size: self.config.partition_size.max(1),
            buffer_size: self.config.buffer_size.max(1),
            read_length: self.config.read_length.max(1),
            umi: self.config.umi.then(|| UmiConfig {
                max_distance: self.config.umi_distance,
            }),
        });

        let (record_tx, record_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let bypass = output_tx.clone();
        let reader_task = tokio::task::spawn_blocking(move || reader.pump(regions, record_tx, bypass));
        let writer_task = tokio::task::spawn_blocking(move || writer.drain(output_rx));

        let engine_result = engine.run(record_rx, output_tx).await;
        let reader_result = reader_task.await;
        let writer_result = writer_task.await;

        let metrics = engine_result?;
        join_result(reader_result)?;
        join_result(writer_result)?;

        if let Some(path) = &self.config.metrics {
            use std::io::Write;
            let mut mout = std::fs::File::create(path)?;
            write!(mout, "{}", metrics)?;
        } else {
            eprintln!("{}", metrics);
        }

        Ok(())
    }
}

fn join_result(
    joined: Result<Result<(), BamIoError>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(AppError::TaskPanic(e.to_string())),
    }
}

static REGION_RE: OnceLock<Regex> = OnceLock::new();

fn parse_region(s: &str) -> Result<Region, AppError> {
    let re = REGION_RE.get_or_init(|| {
        Regex::new(r"^([0-9A-Za-z_.\-]+)(?::([0-9]+)-([0-9]+))?$").expect("static region pattern")
    });
    let caps = re
        .captures(s)
        .ok_or_else(|| AppError::InvalidRegion(s.to_string()))?;

    let chrom = caps[1].to_string();
    let (start, end) = match (caps.get(2), caps.get(3)) {
        (Some(start), Some(end)) => {
            let start: i64 = start
                .as_str()
                .parse()
                .map_err(|_| AppError::InvalidRegion(s.to_string()))?;
            let end: i64 = end
                .as_str()
                .parse()
                .map_err(|_| AppError::InvalidRegion(s.to_string()))?;
            if start > end {
                return Err(AppError::InvalidRegion(s.to_string()));
            }
            (Some(start), Some(end))
        }
        _ => (None, None),
    };

    Ok(Region { chrom, start, end })
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IoError")]
    Io(#[from] std::io::Error),
    #[error("error in BAM io")]
    BamIo(#[from] BamIoError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("background task failed: {0}")]
    TaskPanic(String),
}
