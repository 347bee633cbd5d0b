use anyhow::{Context, Result};
use chatflow_core::{analyze, read_records, throughput_over_time, write_throughput, MetricRecord, Statistics};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatflow-analyze")]
#[command(about = "Latency and throughput statistics over chatflow metric CSVs")]
struct Args {
    /// Metric CSV files; every metrics_*.csv under --results-dir when omitted
    files: Vec<PathBuf>,

    /// Directory scanned when no files are given
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Throughput bucket width in seconds
    #[arg(long, default_value_t = 10)]
    bucket_secs: u64,

    /// Write the analysis as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write the throughput series to this path
    #[arg(long)]
    throughput: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnalysisResult {
    timestamp: String,
    files: Vec<String>,
    bucket_secs: u64,
    statistics: Statistics,
    throughput_over_time: BTreeMap<u64, u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.bucket_secs == 0 {
        anyhow::bail!("--bucket-secs must be non-zero");
    }

    let files = if args.files.is_empty() {
        collect_metric_files(&args.results_dir)?
    } else {
        args.files.clone()
    };
    if files.is_empty() {
        anyhow::bail!("No metrics_*.csv files found in {:?}", args.results_dir);
    }

    let mut records: Vec<MetricRecord> = Vec::new();
    for path in &files {
        records.extend(read_records(path)?);
    }
    info!("Analyzing {} records from {} file(s)", records.len(), files.len());

    let statistics = analyze(&records).context("No valid metric records found")?;
    let buckets = throughput_over_time(&records, args.bucket_secs);

    println!("{}", statistics);
    print_throughput(&buckets, args.bucket_secs);

    if let Some(path) = &args.throughput {
        write_throughput(path, &buckets, args.bucket_secs)?;
        info!("Throughput series written to {:?}", path);
    }

    if let Some(path) = &args.json {
        let result = AnalysisResult {
            timestamp: chrono::Utc::now().to_rfc3339(),
            files: files.iter().map(|p| p.display().to_string()).collect(),
            bucket_secs: args.bucket_secs,
            statistics,
            throughput_over_time: buckets,
        };
        std::fs::write(path, serde_json::to_string_pretty(&result)?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        info!("Analysis written to {:?}", path);
    }

    Ok(())
}

fn collect_metric_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("csv") {
            continue;
        }
        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with("metrics_") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn print_throughput(buckets: &BTreeMap<u64, u64>, bucket_secs: u64) {
    println!("=== Throughput Over Time ({}s buckets) ===", bucket_secs);
    for (start, count) in buckets {
        println!(
            "{:>6}s: {:>8} messages ({:.2} msg/s)",
            start,
            count,
            *count as f64 / bucket_secs as f64
        );
    }
    println!();
}
