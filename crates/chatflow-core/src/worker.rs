use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::correlator::{Correlator, Resolution};
use crate::counters::RunCounters;
use crate::message::{ChatMessage, ChatResponse, ResponseStatus};
use crate::retry::RetryPolicy;
use crate::sink::MetricRecord;
use crate::transport::{FrameSink, FrameStream, Inbound, Transport, TransportError};

/// Lifecycle of a worker's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Connected,
    Sending,
    AwaitingResponse,
    Closing,
    Closed,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Sending)
                | (Connected, Closing)
                | (Connected, Closed)
                | (Sending, AwaitingResponse)
                | (Sending, Connected)
                | (Sending, Closed)
                | (AwaitingResponse, Sending)
                | (AwaitingResponse, Connected)
                | (AwaitingResponse, Closed)
                | (Closing, Closed)
                | (Closed, Connecting)
        )
    }
}

/// Everything a worker shares with the rest of the run.
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub messages: async_channel::Receiver<ChatMessage>,
    pub metrics: mpsc::Sender<MetricRecord>,
    pub counters: Arc<RunCounters>,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// Sent its whole quota.
    Completed,
    /// Never connected; consumed nothing.
    ConnectFailed,
    /// The server closed the connection and no reconnect was allowed or possible.
    ConnectionLost,
    /// The message channel closed before the quota was reached.
    ChannelClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub room_id: u8,
    pub quota: u64,
    pub dequeued: u64,
    pub successes: u64,
    pub failures: u64,
    pub reconnections: u32,
    pub exit: WorkerExit,
}

/// Result of one send-and-wait.
#[derive(Debug)]
enum Attempt {
    Success { latency_ms: u64 },
    Rejected { latency_ms: u64, errors: Vec<String> },
    Timeout,
    Malformed,
    UnexpectedStatus(Option<String>),
    Transmit(TransportError),
    ConnectionClosed,
}

/// Final classification of one message after all its attempts.
#[derive(Debug)]
enum Delivery {
    Success { sent_at_ms: i64, latency_ms: u64 },
    Rejected { sent_at_ms: i64, latency_ms: u64 },
    Exhausted,
    ConnectionLost,
}

/// A live connection: write half, the correlator fed by its read half, and the
/// task doing the reading. Dropping it tears everything down.
struct LiveConnection {
    sink: FrameSink,
    correlator: Arc<Correlator>,
    reader: JoinHandle<()>,
}

impl LiveConnection {
    fn start(sink: FrameSink, stream: FrameStream, counters: Arc<RunCounters>) -> Self {
        let correlator = Arc::new(Correlator::new());
        let reader = tokio::spawn(read_frames(stream, correlator.clone(), counters).in_current_span());
        Self {
            sink,
            correlator,
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    async fn close(mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("Close handshake failed: {}", e);
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.correlator.close_all();
    }
}

async fn read_frames(mut stream: FrameStream, correlator: Arc<Correlator>, counters: Arc<RunCounters>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Inbound::Text(text)) => {
                let received_at = Instant::now();
                let matched = match ChatResponse::parse(&text) {
                    Ok(response) => correlator.resolve(response, received_at),
                    Err(e) => {
                        debug!("Unparseable response ({}): {}", e, text);
                        correlator.resolve_malformed()
                    }
                };
                if !matched {
                    counters.record_stale_responses(1);
                }
            }
            Ok(Inbound::Closed { code, reason }) => {
                debug!("Server closed connection: {:?} {}", code, reason);
                break;
            }
            Err(e) => {
                warn!("Connection error: {}", e);
                break;
            }
        }
    }

    let orphaned = correlator.close_all();
    if orphaned > 0 {
        debug!("{} in-flight request(s) resolved as connection_closed", orphaned);
    }
}

/// A dequeued message that has not been classified yet. Dropping it unclassified
/// (the worker task was aborted mid-delivery) counts it as a failure.
struct InFlight {
    counters: Option<Arc<RunCounters>>,
}

impl InFlight {
    fn take(counters: &Arc<RunCounters>) -> Self {
        counters.record_dequeued();
        Self {
            counters: Some(counters.clone()),
        }
    }

    fn succeed(mut self) {
        if let Some(counters) = self.counters.take() {
            counters.record_success();
        }
    }

    fn fail(mut self) {
        if let Some(counters) = self.counters.take() {
            counters.record_failure();
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(counters) = self.counters.take() {
            counters.record_failure();
        }
    }
}

/// Owns one persistent connection and sends `quota` messages over it.
pub struct ConnectionWorker {
    id: usize,
    room_id: u8,
    quota: u64,
    ctx: WorkerContext,
    state: WorkerState,
}

impl ConnectionWorker {
    pub fn new(id: usize, room_id: u8, quota: u64, ctx: WorkerContext) -> Self {
        Self {
            id,
            room_id,
            quota,
            ctx,
            state: WorkerState::Disconnected,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal worker transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run(self) -> WorkerReport {
        let span = info_span!("worker", id = self.id, room = self.room_id);
        self.run_inner().instrument(span).await
    }

    async fn connect(&mut self) -> Result<LiveConnection, TransportError> {
        self.transition(WorkerState::Connecting);
        match self.ctx.transport.connect(self.room_id).await {
            Ok(conn) => {
                self.ctx.counters.record_connection_opened();
                self.transition(WorkerState::Connected);
                Ok(LiveConnection::start(
                    conn.sink,
                    conn.stream,
                    self.ctx.counters.clone(),
                ))
            }
            Err(e) => {
                self.transition(WorkerState::Closed);
                Err(e)
            }
        }
    }

    async fn run_inner(mut self) -> WorkerReport {
        let mut report = WorkerReport {
            worker_id: self.id,
            room_id: self.room_id,
            quota: self.quota,
            dequeued: 0,
            successes: 0,
            failures: 0,
            reconnections: 0,
            exit: WorkerExit::Completed,
        };

        let mut conn = match self.connect().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                error!("Failed to connect to server: {}", e);
                self.ctx.counters.record_connection_failure();
                report.exit = WorkerExit::ConnectFailed;
                return report;
            }
        };
        debug!("Connected, quota {}", self.quota);

        while report.dequeued < self.quota {
            if conn.as_ref().map_or(true, LiveConnection::is_closed) {
                if self.state != WorkerState::Closed {
                    self.transition(WorkerState::Closed);
                }
                conn = None;
                match self.reconnect(&mut report).await {
                    Some(fresh) => conn = Some(fresh),
                    None => {
                        report.exit = WorkerExit::ConnectionLost;
                        break;
                    }
                }
            }
            let Some(live) = conn.as_mut() else {
                break;
            };

            let message = match self.ctx.messages.recv().await {
                Ok(message) => message,
                Err(_) => {
                    warn!("Message channel closed after {} messages", report.dequeued);
                    report.exit = WorkerExit::ChannelClosed;
                    break;
                }
            };
            let in_flight = InFlight::take(&self.ctx.counters);
            report.dequeued += 1;

            match self.deliver(live, &message).await {
                Delivery::Success {
                    sent_at_ms,
                    latency_ms,
                } => {
                    in_flight.succeed();
                    report.successes += 1;
                    self.emit(&message, sent_at_ms, latency_ms, ResponseStatus::Success);
                }
                Delivery::Rejected {
                    sent_at_ms,
                    latency_ms,
                } => {
                    in_flight.fail();
                    report.failures += 1;
                    self.emit(&message, sent_at_ms, latency_ms, ResponseStatus::Error);
                }
                Delivery::Exhausted => {
                    in_flight.fail();
                    report.failures += 1;
                    warn!(
                        "Failed to send message after {} attempts",
                        self.ctx.policy.max_attempts
                    );
                }
                Delivery::ConnectionLost => {
                    in_flight.fail();
                    report.failures += 1;
                    warn!("Connection lost with a message in flight");
                }
            }
        }

        match conn.take() {
            Some(live) if self.state != WorkerState::Closed => {
                self.transition(WorkerState::Closing);
                live.close().await;
                self.transition(WorkerState::Closed);
            }
            _ => {}
        }

        debug!(
            "Worker finished: {} ok, {} failed, exit {:?}",
            report.successes, report.failures, report.exit
        );
        report
    }

    async fn reconnect(&mut self, report: &mut WorkerReport) -> Option<LiveConnection> {
        if report.reconnections >= self.ctx.policy.max_reconnects {
            return None;
        }
        report.reconnections += 1;
        match self.connect().await {
            Ok(conn) => {
                self.ctx.counters.record_reconnection();
                info!("Reconnected to room {}", self.room_id);
                Some(conn)
            }
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                self.ctx.counters.record_connection_failure();
                None
            }
        }
    }

    async fn deliver(&mut self, conn: &mut LiveConnection, message: &ChatMessage) -> Delivery {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode message: {}", e);
                return Delivery::Exhausted;
            }
        };

        let policy = self.ctx.policy.clone();
        for attempt in 0..policy.max_attempts {
            let sent_at_ms = chrono::Utc::now().timestamp_millis();
            match self.attempt(conn, message, &json).await {
                Attempt::Success { latency_ms } => {
                    return Delivery::Success {
                        sent_at_ms,
                        latency_ms,
                    }
                }
                Attempt::Rejected { latency_ms, errors } => {
                    debug!("Server rejected message: {:?}", errors);
                    return Delivery::Rejected {
                        sent_at_ms,
                        latency_ms,
                    };
                }
                Attempt::ConnectionClosed => return Delivery::ConnectionLost,
                transient => {
                    warn!("Send attempt {} failed: {:?}", attempt + 1, transient);
                    if policy.has_next(attempt) {
                        sleep(policy.backoff(attempt)).await;
                    }
                }
            }
        }
        Delivery::Exhausted
    }

    async fn attempt(&mut self, conn: &mut LiveConnection, message: &ChatMessage, json: &str) -> Attempt {
        self.transition(WorkerState::Sending);
        let mut ticket = match conn.correlator.register(message.echo_key()) {
            Ok(ticket) => ticket,
            Err(_) => {
                self.transition(WorkerState::Closed);
                return Attempt::ConnectionClosed;
            }
        };

        if let Err(e) = conn.sink.send(json.to_string()).await {
            conn.correlator.cancel(ticket.id);
            if conn.is_closed() {
                self.transition(WorkerState::Closed);
                return Attempt::ConnectionClosed;
            }
            self.transition(WorkerState::Connected);
            return Attempt::Transmit(e);
        }

        self.transition(WorkerState::AwaitingResponse);
        let resolution = match timeout(self.ctx.policy.response_timeout, &mut ticket.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::ConnectionClosed,
            Err(_) => {
                if conn.correlator.expire(ticket.id) {
                    self.transition(WorkerState::Connected);
                    return Attempt::Timeout;
                }
                // Lost the race to a response that landed right at the deadline.
                match ticket.rx.try_recv() {
                    Ok(resolution) => resolution,
                    Err(_) => Resolution::ConnectionClosed,
                }
            }
        };

        let outcome = match resolution {
            Resolution::Response {
                response,
                received_at,
            } => {
                let latency_ms = received_at.saturating_duration_since(ticket.sent_at).as_millis() as u64;
                match response.status() {
                    ResponseStatus::Success => Attempt::Success { latency_ms },
                    ResponseStatus::Error => Attempt::Rejected {
                        latency_ms,
                        errors: response.errors,
                    },
                    _ => Attempt::UnexpectedStatus(response.status),
                }
            }
            Resolution::Malformed => Attempt::Malformed,
            Resolution::ConnectionClosed => Attempt::ConnectionClosed,
        };

        if matches!(outcome, Attempt::ConnectionClosed) {
            self.transition(WorkerState::Closed);
        } else {
            self.transition(WorkerState::Connected);
        }
        outcome
    }

    fn emit(&self, message: &ChatMessage, sent_at_ms: i64, latency_ms: u64, status: ResponseStatus) {
        let record = MetricRecord {
            timestamp: sent_at_ms,
            message_type: message.message_type,
            latency_ms,
            status,
            room_id: self.room_id,
        };
        match self.ctx.metrics.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.ctx.counters.record_metric_dropped();
            }
        }
    }
}
