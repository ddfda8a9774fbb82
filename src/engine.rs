use std::sync::Arc;

use ahash::AHashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::classify::classify_fragments;
use crate::consensus::UmiConsensusBuilder;
use crate::fragment::{Fragment, FragmentStatus};
use crate::metrics::{Metrics, Status};
use crate::partition::PartitionStore;
use crate::record::AlignmentRecord;
use crate::worker::{ChromosomeWorker, OutputRecord};

const RECORD_CHANNEL_CAPACITY: usize = 1024;

/// Engine configuration, independent of any command line surface.
#[derive(Clone, Debug)]
pub struct DedupConfig {
    /// Genomic span of one partition, the sharding unit for cross-boundary
    /// fragment state.
    pub partition_size: i64,
    /// How many bases behind the stream a position may still receive mates.
    pub buffer_size: i64,
    /// Expected read length, bounds the mate start distance of unclear pairs.
    pub read_length: i64,
    pub umi: Option<UmiConfig>,
}

#[derive(Clone, Debug)]
pub struct UmiConfig {
    pub max_distance: usize,
}

impl Default for DedupConfig {
    fn default() -> DedupConfig {
        DedupConfig {
            partition_size: 1_000_000,
            buffer_size: 1_000,
            read_length: 151,
            umi: None,
        }
    }
}

/// Orchestrates one deduplication run: demultiplexes the coordinate sorted
/// record stream into per-chromosome workers sharing one [`PartitionStore`],
/// harvests their results, and sweeps the store when all streams are done.
pub struct DedupEngine {
    config: Arc<DedupConfig>,
    store: Arc<PartitionStore>,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> DedupEngine {
        DedupEngine {
            config: Arc::new(config),
            store: Arc::new(PartitionStore::new()),
        }
    }

    /// Consume `records` until the channel closes and push every resolved
    /// fragment and consensus group into `sink`. Returns the merged metrics.
    pub async fn run(
        &self,
        mut records: mpsc::Receiver<AlignmentRecord>,
        sink: mpsc::Sender<OutputRecord>,
    ) -> Result<Metrics, EngineError> {
        let mut tasks: JoinSet<Result<(Arc<str>, Metrics), EngineError>> = JoinSet::new();
        let mut current: Option<(u32, mpsc::Sender<AlignmentRecord>)> = None;
        let mut seen: AHashSet<u32> = AHashSet::new();

        while let Some(record) = records.recv().await {
            let Some((chrom, chrom_index)) = record.chrom().cloned().zip(record.chrom_index())
            else {
                // unplaced records skip the workers entirely
                sink.send(OutputRecord::Fragment(Fragment::passthrough(record)))
                    .await
                    .map_err(|_| EngineError::SinkClosed)?;
                continue;
            };

            let stale = match &current {
                Some((index, _)) => *index != chrom_index,
                None => true,
            };
            if stale {
                if !seen.insert(chrom_index) {
                    return Err(EngineError::UnsortedInput(chrom.to_string()));
                }
                let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
                let worker = ChromosomeWorker::new(
                    chrom.clone(),
                    chrom_index,
                    Arc::clone(&self.config),
                    Arc::clone(&self.store),
                );
                tasks.spawn(run_worker(worker, rx, sink.clone()));
                current = Some((chrom_index, tx));
            }

            if let Some((_, tx)) = &current {
                tx.send(record)
                    .await
                    .map_err(|_| EngineError::WorkerStopped(chrom.to_string()))?;
            }
        }
        drop(current);

        let mut metrics = Metrics::default();
        let mut failure: Option<EngineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((chrom, worker_metrics))) => {
                    log::info!(
                        "{}: {} records, {} resolved, {} duplicates, {} deferred",
                        chrom,
                        worker_metrics.total_records,
                        worker_metrics.fragments_resolved(),
                        worker_metrics.duplicate_fragments,
                        worker_metrics.deferred_fragments,
                    );
                    metrics.merge(&worker_metrics);
                }
                Ok(Err(e)) => {
                    log::error!("chromosome worker failed: {e}");
                    failure = Some(e);
                }
                Err(e) => {
                    log::error!("chromosome worker panicked: {e}");
                    failure = Some(EngineError::WorkerPanic(e.to_string()));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let sweep_metrics = self.sweep(&sink).await?;
        metrics.merge(&sweep_metrics);

        Ok(metrics)
    }

    /// Resolve whatever is left in the store once every chromosome finished:
    /// deferred groups classify with what they gathered, fragments whose mate
    /// never arrived go out unresolved, orphan deposits are written as-is.
    async fn sweep(&self, sink: &mpsc::Sender<OutputRecord>) -> Result<Metrics, EngineError> {
        let mut metrics = Metrics::default();
        let consensus = self
            .config
            .umi
            .as_ref()
            .map(|umi| UmiConsensusBuilder::new(umi.max_distance));

        for (key, entry) in self.store.drain() {
            let (groups, statuses, mates) = entry.into_parts();
            if !statuses.is_empty() {
                log::debug!("{}: {} mate statuses were never claimed", key, statuses.len());
            }

            for group in groups {
                let outcome = classify_fragments(group.fragments, self.config.read_length);
                if !outcome.balanced {
                    metrics.count(Status::IntegrityFailure);
                }

                if let Some(builder) = &consensus {
                    for cluster in &outcome.clusters {
                        let members: Vec<&Fragment> =
                            cluster.iter().map(|&i| &outcome.resolved[i]).collect();
                        let (umi_groups, missing) = builder.build_groups(&members);
                        metrics.count_many(Status::MissingUmi, missing);
                        for umi_group in umi_groups {
                            metrics.count(Status::UmiGroup);
                            if umi_group.dual_strand {
                                metrics.count(Status::DualStrandGroup);
                            }
                            sink.send(OutputRecord::Consensus(umi_group))
                                .await
                                .map_err(|_| EngineError::SinkClosed)?;
                        }
                    }
                }

                for fragment in outcome.resolved {
                    match fragment.status() {
                        FragmentStatus::None => metrics.count(Status::UniqueFragment),
                        FragmentStatus::Duplicate => metrics.count(Status::DuplicateFragment),
                        FragmentStatus::Primary => metrics.count(Status::PrimaryFragment),
                        FragmentStatus::Unresolved | FragmentStatus::Unclear => {}
                    }
                    sink.send(OutputRecord::Fragment(fragment))
                        .await
                        .map_err(|_| EngineError::SinkClosed)?;
                }

                for deferred in outcome.deferred {
                    for mut fragment in deferred.fragments {
                        log::warn!(
                            "{}: mate for {} never arrived; writing unresolved",
                            key,
                            fragment.name()
                        );
                        metrics.count(Status::ForcedUnresolved);
                        fragment.resolve(FragmentStatus::None);
                        sink.send(OutputRecord::Fragment(fragment))
                            .await
                            .map_err(|_| EngineError::SinkClosed)?;
                    }
                }
            }

            for (name, record) in mates {
                log::warn!("{}: no fragment ever registered for {}; writing as-is", key, name);
                metrics.count(Status::ForcedUnresolved);
                sink.send(OutputRecord::Fragment(Fragment::passthrough(record)))
                    .await
                    .map_err(|_| EngineError::SinkClosed)?;
            }
        }

        Ok(metrics)
    }
}

async fn run_worker(
    mut worker: ChromosomeWorker,
    mut records: mpsc::Receiver<AlignmentRecord>,
    sink: mpsc::Sender<OutputRecord>,
) -> Result<(Arc<str>, Metrics), EngineError> {
    let mut out = Vec::new();

    while let Some(record) = records.recv().await {
        worker.ingest(record, &mut out);
        for output in out.drain(..) {
            sink.send(output).await.map_err(|_| EngineError::SinkClosed)?;
        }
    }

    worker.finish(&mut out);
    for output in out.drain(..) {
        sink.send(output).await.map_err(|_| EngineError::SinkClosed)?;
    }

    Ok((worker.chrom().clone(), worker.take_metrics()))
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("output sink closed before the run finished")]
    SinkClosed,
    #[error("worker for {0} stopped accepting records")]
    WorkerStopped(String),
    #[error("input revisits chromosome {0}; input must be coordinate sorted")]
    UnsortedInput(String),
    #[error("chromosome worker panicked: {0}")]
    WorkerPanic(String),
}
