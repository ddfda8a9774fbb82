use std::collections::BTreeMap;
use std::sync::Arc;

use noodles::core::Position;
use noodles::sam::alignment::record::cigar::{op::Kind, Op};
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::{QualityScores, Sequence};
use noodles::sam::alignment::RecordBuf;
use tokio::sync::mpsc;

use fragmark::engine::{DedupConfig, DedupEngine, UmiConfig};
use fragmark::fragment::FragmentStatus;
use fragmark::metrics::Metrics;
use fragmark::record::AlignmentRecord;
use fragmark::worker::OutputRecord;

fn ops(text: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut len = 0usize;
    for b in text.bytes() {
        if b.is_ascii_digit() {
            len = len * 10 + (b - b'0') as usize;
        } else {
            let kind = match b {
                b'M' => Kind::Match,
                b'S' => Kind::SoftClip,
                b'D' => Kind::Deletion,
                _ => panic!("unexpected cigar op {}", b as char),
            };
            ops.push(Op::new(kind, len));
            len = 0;
        }
    }
    ops
}

#[allow(clippy::too_many_arguments)]
fn record(
    name: &str,
    chrom: &str,
    chrom_index: u32,
    start: i64,
    cigar: &str,
    reverse: bool,
    quality: u8,
    mate: Option<(&str, u32, i64, bool, bool)>,
) -> AlignmentRecord {
    let mut flags = Flags::empty();
    if reverse {
        flags |= Flags::REVERSE_COMPLEMENTED;
    }

    let mut buf = RecordBuf::default();
    *buf.name_mut() = Some(name.as_bytes().to_vec().into());
    *buf.reference_sequence_id_mut() = Some(chrom_index as usize);
    *buf.alignment_start_mut() = Some(Position::try_from(start as usize).unwrap());

    let ops = ops(cigar);
    let qlen: usize = ops
        .iter()
        .filter(|op| op.kind().consumes_read())
        .map(|op| op.len())
        .sum();
    *buf.cigar_mut() = ops.into_iter().collect();
    *buf.sequence_mut() = Sequence::from(vec![b'A'; qlen]);
    *buf.quality_scores_mut() = QualityScores::from(vec![quality; qlen]);

    let mate_parts = mate.map(|(mate_chrom, mate_index, mate_start, mate_reverse, first)| {
        flags |= Flags::SEGMENTED;
        if mate_reverse {
            flags |= Flags::MATE_REVERSE_COMPLEMENTED;
        }
        flags |= if first {
            Flags::FIRST_SEGMENT
        } else {
            Flags::LAST_SEGMENT
        };
        *buf.mate_reference_sequence_id_mut() = Some(mate_index as usize);
        *buf.mate_alignment_start_mut() = Some(Position::try_from(mate_start as usize).unwrap());
        (Arc::<str>::from(mate_chrom), Some(mate_index))
    });
    *buf.flags_mut() = flags;

    let umi = AlignmentRecord::resolve_umi(&buf);
    AlignmentRecord::from_parts(buf, Some((Arc::from(chrom), chrom_index)), mate_parts, umi)
}

fn config() -> DedupConfig {
    DedupConfig {
        partition_size: 1_000_000,
        buffer_size: 1_000,
        read_length: 151,
        umi: None,
    }
}

async fn run_engine(
    config: DedupConfig,
    records: Vec<AlignmentRecord>,
) -> (Vec<OutputRecord>, Metrics) {
    let engine = DedupEngine::new(config);
    let (record_tx, record_rx) = mpsc::channel(64);
    let (output_tx, mut output_rx) = mpsc::channel(64);

    let feeder = tokio::spawn(async move {
        for record in records {
            record_tx.send(record).await.unwrap();
        }
    });
    let collector = tokio::spawn(async move {
        let mut outputs = Vec::new();
        while let Some(output) = output_rx.recv().await {
            outputs.push(output);
        }
        outputs
    });

    let metrics = engine.run(record_rx, output_tx).await.unwrap();
    feeder.await.unwrap();
    let outputs = collector.await.unwrap();
    (outputs, metrics)
}

fn statuses(outputs: &[OutputRecord]) -> BTreeMap<String, FragmentStatus> {
    let mut map = BTreeMap::new();
    for output in outputs {
        if let OutputRecord::Fragment(f) = output {
            // keep the fragment-level status; adopted mates repeat it
            map.entry(f.name().to_string()).or_insert_with(|| f.status());
        }
    }
    map
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_pairs_mark_one_primary() {
    // two pairs with identical fragment geometry, the better mean quality wins
    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 1200, true, true))),
        record("t2", "chr1", 0, 1000, "100M", false, 35, Some(("chr1", 0, 1200, true, true))),
        record("t1", "chr1", 0, 1200, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
        record("t2", "chr1", 0, 1200, "100M", true, 35, Some(("chr1", 0, 1000, false, false))),
    ];

    let (outputs, metrics) = run_engine(config(), records).await;
    let statuses = statuses(&outputs);

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses["t2"], FragmentStatus::Primary);
    assert_eq!(statuses["t1"], FragmentStatus::Duplicate);
    assert_eq!(metrics.duplicate_fragments, 1);
    assert_eq!(metrics.primary_fragments, 1);
    assert_eq!(metrics.total_records, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn soft_clipped_starts_still_match() {
    // t2 is soft clipped back to the same unclipped start and fragment end
    // as t1, so the two templates are copies of one molecule
    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 1200, true, true))),
        record("t2", "chr1", 0, 1005, "5S95M", false, 35, Some(("chr1", 0, 1200, true, true))),
        record("t1", "chr1", 0, 1200, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
        record("t2", "chr1", 0, 1200, "100M", true, 35, Some(("chr1", 0, 1005, false, false))),
    ];

    let (outputs, _) = run_engine(config(), records).await;
    let statuses = statuses(&outputs);

    assert_eq!(statuses["t2"], FragmentStatus::Primary);
    assert_eq!(statuses["t1"], FragmentStatus::Duplicate);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn far_mate_defers_and_resolves() {
    // mates beyond the window: groups defer as candidates and resolve when
    // the mates stream in
    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 250_000, true, true))),
        record("t2", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 250_000, true, true))),
        record("t1", "chr1", 0, 250_000, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
        record("t2", "chr1", 0, 250_000, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
    ];

    let (outputs, metrics) = run_engine(config(), records).await;
    let statuses = statuses(&outputs);

    assert_eq!(metrics.deferred_fragments, 2);
    assert_eq!(
        statuses.values().filter(|s| **s == FragmentStatus::Primary).count(),
        1
    );
    assert_eq!(
        statuses.values().filter(|s| **s == FragmentStatus::Duplicate).count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_chromosome_mates_resolve() {
    // fragments on chr1 whose mates map into chr2 partition 42
    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, Some(("chr2", 1, 42_000_500, true, true))),
        record("t2", "chr1", 0, 1000, "100M", false, 30, Some(("chr2", 1, 42_000_500, true, true))),
        record("t3", "chr1", 0, 5000, "100M", false, 30, None),
        record("t1", "chr2", 1, 42_000_500, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
        record("t2", "chr2", 1, 42_000_500, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
    ];

    let (outputs, metrics) = run_engine(config(), records).await;
    let statuses = statuses(&outputs);

    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses["t3"], FragmentStatus::None);
    assert_eq!(
        statuses.values().filter(|s| **s == FragmentStatus::Primary).count(),
        1
    );
    assert_eq!(
        statuses.values().filter(|s| **s == FragmentStatus::Duplicate).count(),
        1
    );
    assert_eq!(metrics.cross_partition_records, 2);
    assert_eq!(metrics.forced_unresolved, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_mates_force_unresolved_at_sweep() {
    // compatible mates that never arrive: the deferred group is swept out
    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 500_000, true, true))),
        record("t2", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 500_010, true, true))),
    ];

    let (outputs, metrics) = run_engine(config(), records).await;
    let statuses = statuses(&outputs);

    assert_eq!(metrics.forced_unresolved, 2);
    assert_eq!(statuses["t1"], FragmentStatus::None);
    assert_eq!(statuses["t2"], FragmentStatus::None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unmapped_records_pass_through() {
    let mut unmapped = RecordBuf::default();
    *unmapped.name_mut() = Some(b"t9".to_vec().into());
    *unmapped.flags_mut() = Flags::UNMAPPED;
    let unmapped = AlignmentRecord::from_parts(unmapped, None, None, None);

    let records = vec![
        record("t1", "chr1", 0, 1000, "100M", false, 30, None),
        unmapped,
    ];

    let (outputs, metrics) = run_engine(config(), records).await;
    assert_eq!(outputs.len(), 2);
    assert_eq!(metrics.unique_fragments, 1);
}

#[test]
fn statuses_identical_across_thread_counts() {
    let stream = || {
        vec![
            record("a1", "chr1", 0, 1000, "100M", false, 30, Some(("chr1", 0, 1200, true, true))),
            record("a2", "chr1", 0, 1000, "100M", false, 35, Some(("chr1", 0, 1200, true, true))),
            record("a1", "chr1", 0, 1200, "100M", true, 30, Some(("chr1", 0, 1000, false, false))),
            record("a2", "chr1", 0, 1200, "100M", true, 35, Some(("chr1", 0, 1000, false, false))),
            record("b1", "chr1", 0, 2000, "100M", false, 30, Some(("chr2", 1, 500, true, true))),
            record("b2", "chr1", 0, 2000, "100M", false, 31, Some(("chr2", 1, 500, true, true))),
            record("c1", "chr1", 0, 3000, "50M", false, 30, None),
            record("c2", "chr1", 0, 3000, "50M", false, 32, None),
            record("d1", "chr1", 0, 4000, "100M", false, 30, Some(("chr1", 0, 700_000, true, true))),
            record("b1", "chr2", 1, 500, "100M", true, 30, Some(("chr1", 0, 2000, false, false))),
            record("b2", "chr2", 1, 500, "100M", true, 31, Some(("chr1", 0, 2000, false, false))),
            record("e1", "chr2", 1, 600, "100M", true, 30, None),
        ]
    };

    let run = |threads: usize| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .build()
            .unwrap();
        runtime.block_on(async {
            let (outputs, _) = run_engine(config(), stream()).await;
            statuses(&outputs)
        })
    };

    let single = run(1);
    let multi = run(4);
    assert_eq!(single, multi);
    assert_eq!(single.len(), 8);
    assert_eq!(single["a2"], FragmentStatus::Primary);
    assert_eq!(single["a1"], FragmentStatus::Duplicate);
    assert_eq!(single["c2"], FragmentStatus::Primary);
    assert_eq!(single["c1"], FragmentStatus::Duplicate);
    assert_eq!(single["d1"], FragmentStatus::None);
    assert_eq!(single["e1"], FragmentStatus::None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn umi_mode_emits_consensus_groups() {
    let umi_config = DedupConfig {
        umi: Some(UmiConfig { max_distance: 1 }),
        ..config()
    };

    // same molecule twice; UMIs are parsed from the trailing name segment
    let records = vec![
        record("r1:GATTACAA", "chr1", 0, 1000, "50M", false, 30, None),
        record("r2:GATTACAT", "chr1", 0, 1000, "50M", false, 35, None),
    ];

    let (outputs, metrics) = run_engine(umi_config, records).await;

    let consensus: Vec<_> = outputs
        .iter()
        .filter_map(|o| match o {
            OutputRecord::Consensus(group) => Some(group),
            _ => None,
        })
        .collect();
    assert_eq!(consensus.len(), 1);
    assert_eq!(consensus[0].fragments.len(), 2);
    assert_eq!(consensus[0].consensus.len(), 1);
    assert!(!consensus[0].dual_strand);
    assert_eq!(metrics.umi_groups, 1);
}
