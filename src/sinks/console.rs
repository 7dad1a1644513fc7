use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use tracing::error;

use crate::CheckResult;

use super::Emitter;

/// Sink that writes one formatted line per result to a stream. Backs both
/// the `console` sink (stdout/stderr) and the `file` sink.
pub struct ConsoleSink {
    name: &'static str,
    stream: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    /// Constructor for the `console` sink type. Recognized args: `useStderr`
    /// ("true" switches the target stream from stdout to stderr).
    pub fn from_args(args: &HashMap<String, String>) -> anyhow::Result<Arc<dyn Emitter>> {
        let use_stderr = args.get("useStderr").is_some_and(|v| v == "true");
        let stream: Box<dyn Write + Send> = if use_stderr {
            Box::new(std::io::stderr())
        } else {
            Box::new(std::io::stdout())
        };
        Ok(Arc::new(Self::with_stream(stream)))
    }

    /// Constructor for the `file` sink type. Required args: `path`. The file
    /// is opened in append mode and kept open for the sink's lifetime.
    pub fn file_from_args(args: &HashMap<String, String>) -> anyhow::Result<Arc<dyn Emitter>> {
        let path = args
            .get("path")
            .context("file sink missing 'path' parameter")?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open sink file '{path}'"))?;
        Ok(Arc::new(Self {
            name: "file",
            stream: Mutex::new(Box::new(file)),
        }))
    }

    /// Build a sink writing to an arbitrary stream. Tests use this to
    /// capture output in a buffer.
    pub fn with_stream(stream: Box<dyn Write + Send>) -> Self {
        Self {
            name: "console",
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Emitter for ConsoleSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn emit(&self, check_name: &str, check_type: &str, result: &CheckResult) {
        let line = format!(
            "{} [{}:{}]: {} {:?}\n",
            result.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            check_type,
            check_name,
            result.outcome,
            result.duration
        );

        let Ok(mut stream) = self.stream.lock() else {
            error!("console sink stream lock poisoned; dropping result for {check_name}");
            return;
        };
        if let Err(e) = stream.write_all(line.as_bytes()) {
            error!("console sink write failed for {check_name}: {e}");
        }
    }
}
