use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::counters::{CountersSnapshot, RunCounters};
use crate::generator::MessageGenerator;
use crate::sink::{MetricsSink, RecordWriter};
use crate::transport::Transport;
use crate::worker::{ConnectionWorker, WorkerContext, WorkerExit, WorkerReport};

/// Records between sink flushes.
const SINK_FLUSH_EVERY: u64 = 10_000;

/// Per-worker message quotas for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub name: String,
    pub quotas: Vec<u64>,
    pub join_timeout: Duration,
}

impl PhasePlan {
    /// `workers` workers with the same quota each.
    pub fn uniform(name: &str, workers: usize, per_worker: u64, join_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            quotas: vec![per_worker; workers],
            join_timeout,
        }
    }

    /// Split `total` across `workers`; the integer remainder goes to worker 0.
    pub fn split(name: &str, workers: usize, total: u64, join_timeout: Duration) -> Self {
        if workers == 0 {
            return Self::uniform(name, 0, 0, join_timeout);
        }
        let base = total / workers as u64;
        let rem = total % workers as u64;
        let mut quotas = vec![base; workers];
        quotas[0] += rem;
        Self {
            name: name.to_string(),
            quotas,
            join_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.quotas.len()
    }

    pub fn total(&self) -> u64 {
        self.quotas.iter().sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub workers: usize,
    pub planned_messages: u64,
    pub elapsed_ms: u64,
    pub counters: CountersSnapshot,
    /// Workers still running at the join deadline; they were aborted.
    pub abandoned_workers: usize,
    pub worker_reports: Vec<WorkerReport>,
}

impl PhaseReport {
    pub fn failed_connections(&self) -> usize {
        self.worker_reports
            .iter()
            .filter(|r| r.exit == WorkerExit::ConnectFailed)
            .count()
    }

    /// Messages classified during the phase per second of wall time.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.counters.classified() as f64 * 1000.0 / self.elapsed_ms as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub generated: u64,
    pub elapsed_ms: u64,
    pub warmup: PhaseReport,
    pub measurement: PhaseReport,
    pub totals: CountersSnapshot,
    pub metrics_written: u64,
}

impl RunReport {
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.totals.classified() as f64 * 1000.0 / self.elapsed_ms as f64
    }
}

/// Runs the message source, the warmup phase, the measurement phase and the
/// metrics sink, in that order.
pub struct Orchestrator {
    config: Config,
    transport: Arc<dyn Transport>,
    counters: Arc<RunCounters>,
    rooms: StdRng,
}

impl Orchestrator {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let rooms = match config.generator.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            transport,
            counters: Arc::new(RunCounters::new()),
            rooms,
        }
    }

    /// Live view of the run's counters, for progress reporting.
    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    pub fn warmup_plan(&self) -> PhasePlan {
        PhasePlan::uniform(
            "warmup",
            self.config.warmup.workers,
            self.config.warmup.messages_per_worker,
            Duration::from_millis(self.config.warmup.join_timeout_ms),
        )
    }

    pub fn measurement_plan(&self) -> PhasePlan {
        PhasePlan::split(
            "measurement",
            self.config.measurement_workers(),
            self.config.measurement_messages(),
            Duration::from_millis(self.config.measurement.join_timeout_ms),
        )
    }

    pub async fn run<W>(mut self, writer: W) -> Result<RunReport>
    where
        W: RecordWriter + 'static,
    {
        self.config.validate()?;
        let start = Instant::now();

        let (metrics_tx, metrics_rx) = mpsc::channel(self.config.metrics.channel_capacity);
        let sink = MetricsSink::spawn(metrics_rx, writer, SINK_FLUSH_EVERY);

        let (message_tx, message_rx) = async_channel::bounded(self.config.generator.channel_capacity);
        let generator = MessageGenerator::new(&self.config.generator);
        let generator_handle = tokio::spawn(generator.run(message_tx));

        let ctx = WorkerContext {
            transport: self.transport.clone(),
            messages: message_rx.clone(),
            metrics: metrics_tx,
            counters: self.counters.clone(),
            policy: self.config.retry_policy(),
        };

        let warmup_plan = self.warmup_plan();
        let measurement_plan = self.measurement_plan();
        info!(
            "Warmup: {} workers x {} messages; measurement: {} workers, {} messages",
            warmup_plan.workers(),
            self.config.warmup.messages_per_worker,
            measurement_plan.workers(),
            measurement_plan.total()
        );

        let warmup = self.run_phase(&warmup_plan, &ctx, 0).await;
        info!(
            "Warmup phase completed in {} ms ({:.2} msg/s)",
            warmup.elapsed_ms,
            warmup.throughput()
        );

        let measurement = self
            .run_phase(&measurement_plan, &ctx, warmup_plan.workers())
            .await;
        info!(
            "Measurement phase completed in {} ms ({:.2} msg/s)",
            measurement.elapsed_ms,
            measurement.throughput()
        );

        // No worker is draining any more; release a generator blocked on a full channel.
        drop(ctx);
        message_rx.close();
        let generated = generator_handle
            .await
            .context("message generator task panicked")?;

        let metrics_written = sink.finish().await?;
        let totals = self.counters.snapshot();

        Ok(RunReport {
            generated,
            elapsed_ms: start.elapsed().as_millis() as u64,
            warmup,
            measurement,
            totals,
            metrics_written,
        })
    }

    async fn run_phase(&mut self, plan: &PhasePlan, ctx: &WorkerContext, first_id: usize) -> PhaseReport {
        info!("Starting {} phase with {} workers", plan.name, plan.workers());
        let before = self.counters.snapshot();
        let start = Instant::now();

        let mut handles = Vec::with_capacity(plan.workers());
        for (i, &quota) in plan.quotas.iter().enumerate() {
            let room_id = self
                .rooms
                .gen_range(self.config.target.room_min..=self.config.target.room_max);
            let worker = ConnectionWorker::new(first_id + i, room_id, quota, ctx.clone());
            handles.push(tokio::spawn(worker.run()));
        }

        let deadline = tokio::time::Instant::now() + plan.join_timeout;
        let mut worker_reports = Vec::with_capacity(handles.len());
        let mut abandoned_workers = 0;
        for mut handle in handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(report)) => worker_reports.push(report),
                Ok(Err(e)) => error!("Worker task failed in {} phase: {}", plan.name, e),
                Err(_) => {
                    handle.abort();
                    // Resolves once the task is dropped and its in-flight message counted.
                    let _ = handle.await;
                    abandoned_workers += 1;
                }
            }
        }
        if abandoned_workers > 0 {
            warn!(
                "{} phase: {} worker(s) still running at the join deadline were aborted",
                plan.name, abandoned_workers
            );
        }

        let report = PhaseReport {
            name: plan.name.clone(),
            workers: plan.workers(),
            planned_messages: plan.total(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            counters: self.counters.snapshot().since(&before),
            abandoned_workers,
            worker_reports,
        };
        let failed = report.failed_connections();
        if failed > 0 {
            warn!(
                "{} phase: {} of {} workers could not connect",
                plan.name, failed, report.workers
            );
        }
        report
    }
}
