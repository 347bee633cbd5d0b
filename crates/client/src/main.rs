use anyhow::{Context, Result};
use chatflow_core::{
    analyze, read_records, throughput_over_time, write_throughput, Config, CsvRecordWriter,
    MockTransport, Orchestrator, RunCounters, RunReport, Statistics, Transport, WebSocketTransport,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatflow-client")]
#[command(about = "Chat server load test - warmup then measurement over persistent WebSockets")]
struct Args {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket base URL (overrides config), e.g. ws://localhost:8080
    #[arg(long)]
    server_url: Option<String>,

    /// Transport: websocket or mock
    #[arg(long, default_value = "websocket")]
    mode: String,

    /// Log progress every N milliseconds (0 disables)
    #[arg(long, default_value = "5000")]
    print_every_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunSummary {
    timestamp: String,
    server_url: String,
    mode: String,
    metrics_csv: String,
    throughput_msgs_per_sec: f64,
    run: RunReport,
    statistics: Option<Statistics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(url) = args.server_url {
        config.target.server_url = url;
    }
    config.validate().context("Invalid configuration")?;

    print_config(&config, &args.mode);

    let transport: Arc<dyn Transport> = match args.mode.as_str() {
        "websocket" => Arc::new(WebSocketTransport::new(
            config.target.server_url.clone(),
            Duration::from_millis(config.target.connect_timeout_ms),
        )),
        "mock" => Arc::new(MockTransport::with_latency(Duration::from_millis(2))),
        other => anyhow::bail!("Invalid mode: {}, must be 'websocket' or 'mock'", other),
    };
    info!("Using transport: {}", transport.name());

    let output_dir = config.metrics.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let metrics_path = output_dir.join(format!("metrics_{}.csv", stamp));
    let writer = CsvRecordWriter::create(&metrics_path)?;

    let orchestrator = Orchestrator::new(config.clone(), transport);
    let progress = spawn_progress(orchestrator.counters(), args.print_every_ms);
    let report = orchestrator.run(writer).await?;
    if let Some(progress) = progress {
        progress.abort();
    }
    info!("Metrics written to {:?}", metrics_path);

    print_run_summary(&report);

    let records = read_records(&metrics_path)?;
    let statistics = analyze(&records);
    match &statistics {
        Some(stats) => println!("{}", stats),
        None => warn!("No metric records to analyze"),
    }

    let buckets = throughput_over_time(&records, config.metrics.bucket_secs);
    let throughput_path = output_dir.join(format!("throughput_{}.txt", stamp));
    write_throughput(&throughput_path, &buckets, config.metrics.bucket_secs)?;
    info!(
        "Throughput over time ({} buckets) written to {:?}",
        buckets.len(),
        throughput_path
    );

    let summary = RunSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        server_url: config.target.server_url.clone(),
        mode: args.mode,
        metrics_csv: metrics_path.display().to_string(),
        throughput_msgs_per_sec: report.throughput(),
        run: report,
        statistics,
    };
    let summary_path = output_dir.join(format!("summary_{}.json", stamp));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write {:?}", summary_path))?;
    info!("Summary written to {:?}", summary_path);

    Ok(())
}

fn spawn_progress(counters: Arc<RunCounters>, every_ms: u64) -> Option<tokio::task::JoinHandle<()>> {
    if every_ms == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(every_ms));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snap = counters.snapshot();
            info!(
                "Progress: dequeued={} success={} failed={} connections={} reconnections={} metrics_dropped={}",
                snap.dequeued,
                snap.successes,
                snap.failures,
                snap.connections_opened,
                snap.reconnections,
                snap.metrics_dropped
            );
        }
    }))
}

fn print_config(config: &Config, mode: &str) {
    println!("\n=== Chat Load Test ===");
    println!("Server: {} ({})", config.target.server_url, mode);
    println!("Rooms: {}..={}", config.target.room_min, config.target.room_max);
    println!("Total messages: {}", config.generator.total_messages);
    println!(
        "Warmup: {} workers x {} messages",
        config.warmup.workers, config.warmup.messages_per_worker
    );
    println!(
        "Measurement: {} workers, {} messages",
        config.measurement_workers(),
        config.measurement_messages()
    );
    println!(
        "Retry: {} attempts, {}ms base backoff, {}ms response timeout",
        config.retry.max_attempts, config.retry.base_delay_ms, config.target.response_timeout_ms
    );
    println!();
}

fn print_run_summary(report: &RunReport) {
    let totals = &report.totals;
    println!("\n=== Run Summary ===");
    println!("Generated: {}", report.generated);
    println!("Successful messages: {}", totals.successes);
    println!("Failed messages: {}", totals.failures);
    println!("Total runtime: {}ms", report.elapsed_ms);
    println!("Overall throughput: {:.2} msg/s", report.throughput());
    for phase in [&report.warmup, &report.measurement] {
        println!(
            "{} phase: {} workers, {} messages in {}ms ({:.2} msg/s), {} failed to connect",
            phase.name,
            phase.workers,
            phase.counters.classified(),
            phase.elapsed_ms,
            phase.throughput(),
            phase.failed_connections()
        );
    }
    println!("Connections opened: {}", totals.connections_opened);
    println!("Connection failures: {}", totals.connection_failures);
    println!("Reconnections: {}", totals.reconnections);
    println!("Stale responses: {}", totals.stale_responses);
    println!("Metric records written: {}", report.metrics_written);
    if totals.metrics_dropped > 0 {
        println!("Metric records dropped: {}", totals.metrics_dropped);
    }
    println!();
}
