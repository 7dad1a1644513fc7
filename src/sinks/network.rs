//! Batching network sink
//!
//! Results are enqueued as tagged measurement points and written to a remote
//! address in batches by a dedicated collector task. The collector owns the
//! batch buffer and the network connection exclusively; no other task ever
//! touches either, so no locking is involved.
//!
//! ## Flush triggers
//!
//! - **Time**: the flush interval elapses and the buffer is non-empty.
//! - **Size**: the buffer reaches the flush count after an enqueue.
//!
//! Delivery is lossy at-most-once: a batch that fails to write is logged and
//! discarded, never redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, instrument, trace};

use crate::CheckResult;

use super::Emitter;

/// Capacity of the enqueue channel. A full channel blocks the emitting
/// fan-out unit until the collector drains a point, which deliberately
/// couples sink health to scheduler responsiveness.
const ENQUEUE_CAPACITY: usize = 16;

const MEASUREMENT: &str = "healthcheck";

/// One buffered measurement point.
#[derive(Debug, Clone)]
struct Point {
    check_name: String,
    check_type: String,
    result: CheckResult,
}

impl Point {
    /// Render the point in tagged-measurement line format, duration in whole
    /// milliseconds, timestamp in nanoseconds.
    fn to_line(&self) -> String {
        format!(
            "{},name={},type={} result={}i,duration={}i {}",
            MEASUREMENT,
            escape_tag(&self.check_name),
            escape_tag(&self.check_type),
            self.result.outcome.code(),
            self.result.duration.as_millis(),
            self.result.timestamp.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

/// Tag values must not carry unescaped commas, spaces, or equals signs.
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Sink that batches points and ships them over TCP.
pub struct NetworkSink {
    points_tx: mpsc::Sender<Point>,
    collector_started: AtomicBool,
}

impl NetworkSink {
    /// Constructor for the registry. Required args: `address` (host:port),
    /// `flushInterval` (seconds), `flushCount`.
    ///
    /// Spawns the collector task, so this must run inside a tokio runtime.
    pub fn from_args(args: &HashMap<String, String>) -> anyhow::Result<Arc<dyn Emitter>> {
        let address = args
            .get("address")
            .context("network sink missing 'address' parameter")?
            .clone();

        let flush_interval = args
            .get("flushInterval")
            .context("network sink missing 'flushInterval' parameter")?
            .parse::<u64>()
            .context("network sink 'flushInterval' is not a number of seconds")?;

        let flush_count = args
            .get("flushCount")
            .context("network sink missing 'flushCount' parameter")?
            .parse::<usize>()
            .context("network sink 'flushCount' is not a number")?;

        anyhow::ensure!(flush_count > 0, "network sink 'flushCount' must be positive");
        anyhow::ensure!(
            flush_interval > 0,
            "network sink 'flushInterval' must be positive"
        );

        let (points_tx, points_rx) = mpsc::channel(ENQUEUE_CAPACITY);
        let sink = Self {
            points_tx,
            collector_started: AtomicBool::new(false),
        };
        sink.start_collector(points_rx, address, Duration::from_secs(flush_interval), flush_count);
        Ok(Arc::new(sink))
    }

    /// Start the background collector for this sink instance.
    ///
    /// Starting a second collector on one instance violates the ownership
    /// contract of the buffer and connection and is a programming error,
    /// hence the panic.
    fn start_collector(
        &self,
        points_rx: mpsc::Receiver<Point>,
        address: String,
        flush_interval: Duration,
        flush_count: usize,
    ) {
        assert!(
            !self.collector_started.swap(true, Ordering::SeqCst),
            "collector already started for this network sink"
        );

        let collector = Collector {
            address,
            flush_count,
            buffer: Vec::with_capacity(flush_count),
            points_rx,
        };
        tokio::spawn(collector.run(flush_interval));
    }
}

#[async_trait]
impl Emitter for NetworkSink {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn emit(&self, check_name: &str, check_type: &str, result: &CheckResult) {
        let point = Point {
            check_name: check_name.to_string(),
            check_type: check_type.to_string(),
            result: *result,
        };

        // blocks while the enqueue channel is full
        if self.points_tx.send(point).await.is_err() {
            error!("collector for network sink is gone; dropping point for {check_name}");
        }
    }
}

/// Background task owning the batch buffer and the network writes for one
/// [`NetworkSink`] instance.
struct Collector {
    address: String,
    flush_count: usize,
    buffer: Vec<Point>,
    points_rx: mpsc::Receiver<Point>,
}

impl Collector {
    #[instrument(skip_all, fields(address = %self.address))]
    async fn run(mut self, flush_interval: Duration) {
        debug!("starting collector");

        let mut ticker = interval(flush_interval);
        // the first tick of a fresh interval resolves immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                // time-based flush trigger; empty buffers are never written
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        trace!("time-based flush ({} points)", self.buffer.len());
                        self.flush().await;
                    }
                }

                point = self.points_rx.recv() => match point {
                    Some(point) => {
                        self.buffer.push(point);
                        if self.buffer.len() >= self.flush_count {
                            trace!("size-based flush ({} points)", self.buffer.len());
                            self.flush().await;
                        }
                    }

                    // sink dropped - final flush, then exit
                    None => {
                        if !self.buffer.is_empty() {
                            debug!("final flush before shutdown ({} points)", self.buffer.len());
                            self.flush().await;
                        }
                        break;
                    }
                }
            }
        }

        debug!("collector stopped");
    }

    /// Write the current batch and reset the buffer. The buffer is reset
    /// even when the write fails; a failed batch is never redelivered.
    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.buffer);
        if let Err(e) = self.write_batch(&batch).await {
            error!(
                "failed to write batch of {} points to {}: {e:#}",
                batch.len(),
                self.address
            );
        }
    }

    async fn write_batch(&mut self, batch: &[Point]) -> anyhow::Result<()> {
        let mut payload = String::new();
        for point in batch {
            payload.push_str(&point.to_line());
            payload.push('\n');
        }

        let mut stream = TcpStream::connect(&self.address)
            .await
            .context("connect failed")?;
        stream
            .write_all(payload.as_bytes())
            .await
            .context("write failed")?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}
