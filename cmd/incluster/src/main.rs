//! incluster - Replays an embedding dataset through the incremental
//! clustering pipeline and reports how items were placed.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use incluster::{Assignment, Config, PassReport, PendingItem, Pipeline, PipelineStats};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Incremental semantic clustering tool.
#[derive(Parser)]
#[command(name = "incluster")]
#[command(about = "Incremental semantic clustering tool")]
#[command(version)]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap on part of a dataset and stream the rest
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Pipeline config file (YAML). Without it, defaults are used and the
    /// dimension is taken from the data.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input file, one JSON record per line: {"id", "embedding", "content"}
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Fraction of records used to bootstrap the initial clusters
    #[arg(long, default_value_t = 0.7)]
    initial_ratio: f64,

    /// Shuffle records (seeded by the config seed) before splitting
    #[arg(long)]
    shuffle: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// One line of the input file.
#[derive(Deserialize)]
struct Record {
    id: RecordId,
    embedding: Vec<f32>,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordId {
    Text(String),
    Number(i64),
}

impl From<Record> for PendingItem {
    fn from(r: Record) -> Self {
        let id = match r.id {
            RecordId::Text(s) => s,
            RecordId::Number(n) => n.to_string(),
        };
        PendingItem::new(id, r.embedding).with_payload(r.content)
    }
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    min: f64,
    max: f64,
    mean: f64,
    median: f64,
}

impl Summary {
    fn of(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        Some(Self {
            min: values[0],
            max: values[n - 1],
            mean: values.iter().sum::<f64>() / n as f64,
            median,
        })
    }
}

#[derive(Serialize)]
struct BootstrapReport {
    items: usize,
    clusters: usize,
    covered: usize,
}

#[derive(Serialize)]
struct StreamReport {
    threshold: f32,
    items: usize,
    direct: usize,
    deferred: usize,
    reconciled: usize,
    outliers: usize,
    coverage: f64,
    confidence: Option<Summary>,
}

#[derive(Serialize)]
struct Report {
    bootstrap: BootstrapReport,
    stream: StreamReport,
    cluster_sizes: Option<Summary>,
    pipeline: PipelineStats,
}

fn read_records(path: &Path) -> Result<Vec<PendingItem>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut items = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), n + 1))?;
        items.push(record.into());
    }
    Ok(items)
}

async fn simulate(args: &SimulateArgs) -> Result<Report> {
    if !(0.0..=1.0).contains(&args.initial_ratio) {
        bail!("--initial-ratio must be within [0, 1], got {}", args.initial_ratio);
    }

    let mut items = read_records(&args.input)?;
    let Some(first) = items.first() else {
        bail!("{}: no records", args.input.display());
    };
    let data_dim = first.embedding.len();

    let cfg = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("load {}", path.display()))?,
        None => Config::new(data_dim),
    };
    if cfg.dim != data_dim {
        bail!("config dim {} does not match data dim {}", cfg.dim, data_dim);
    }

    if args.shuffle {
        items.shuffle(&mut StdRng::seed_from_u64(cfg.seed));
    }

    let split = (items.len() as f64 * args.initial_ratio).round() as usize;
    let stream = items.split_off(split);
    let seed = items;
    info!(seed = seed.len(), stream = stream.len(), "simulate: loaded records");

    let pipeline = Pipeline::new(cfg)?;

    let seeded = if seed.is_empty() {
        PassReport::default()
    } else {
        pipeline.bootstrap(&seed).await?
    };
    let bootstrap = BootstrapReport {
        items: seed.len(),
        clusters: seeded.new_clusters.len(),
        covered: seeded.assigned(),
    };

    let mut placed: Vec<Assignment> = Vec::new();
    let mut direct = 0;
    let mut deferred = 0;
    for item in stream.iter().cloned() {
        let id = item.item_id.clone();
        let decision = pipeline.assign(item)?;
        match decision.assignment(&id) {
            Some(a) => {
                direct += 1;
                placed.push(a);
            }
            None => deferred += 1,
        }
    }

    let reconciled = pipeline.reconcile_all().await?;
    let outliers = reconciled.outliers;
    let reconciled_count = reconciled.assigned();
    placed.extend(reconciled.assignments.into_iter().filter(|a| !a.is_outlier()));

    let coverage = if stream.is_empty() {
        0.0
    } else {
        placed.len() as f64 / stream.len() as f64
    };

    let stats = pipeline.stats();
    Ok(Report {
        bootstrap,
        stream: StreamReport {
            threshold: pipeline.config().threshold,
            items: stream.len(),
            direct,
            deferred,
            reconciled: reconciled_count,
            outliers,
            coverage,
            confidence: Summary::of(placed.iter().map(|a| a.confidence as f64).collect()),
        },
        cluster_sizes: Summary::of(stats.registry.sizes.values().map(|&s| s as f64).collect()),
        pipeline: stats,
    })
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn print_text(r: &Report) {
    println!("Bootstrap:");
    println!("  items:     {}", r.bootstrap.items);
    println!("  clusters:  {}", r.bootstrap.clusters);
    println!(
        "  covered:   {}/{} ({:.1}%)",
        r.bootstrap.covered,
        r.bootstrap.items,
        pct(r.bootstrap.covered, r.bootstrap.items)
    );

    let s = &r.stream;
    let a = &r.pipeline.assigner;
    println!("\nReal-time assignment (threshold {}):", s.threshold);
    println!("  items:     {}", s.items);
    println!("  direct:    {} ({:.1}%)", s.direct, pct(s.direct, s.items));
    println!("  deferred:  {} ({:.1}%)", s.deferred, pct(s.deferred, s.items));
    println!("  latency:   {:.1} us avg", a.avg_latency_us);

    let b = &r.pipeline.reconciler;
    println!("\nMicro-batch reconciliation:");
    println!("  batches:       {}", b.batches_processed);
    println!("  reconciled:    {}", s.reconciled);
    println!("  new clusters:  {}", b.new_clusters_created);
    println!("  outliers:      {}", s.outliers);

    println!("\nClusters:");
    println!("  total:     {}", r.pipeline.registry.total_clusters);
    println!("  members:   {}", r.pipeline.registry.total_members);
    if let Some(sz) = &r.cluster_sizes {
        println!(
            "  sizes:     min {} / max {} / mean {:.1} / median {:.1}",
            sz.min, sz.max, sz.mean, sz.median
        );
    }

    println!("\nStreamed items:");
    println!("  coverage:  {:.1}%", s.coverage * 100.0);
    if let Some(c) = &s.confidence {
        println!(
            "  confidence: min {:.3} / max {:.3} / mean {:.3}",
            c.min, c.max, c.mean
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Simulate(args) => {
            let report = simulate(args).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_text(&report);
            }
        }
    }
    Ok(())
}
