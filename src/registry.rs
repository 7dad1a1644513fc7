//! Check registry and scheduler
//!
//! The registry maps declarative check definitions onto runtime [`Task`]s:
//! constructor tables are populated once during single-threaded startup,
//! definitions are resolved against them, and sinks referenced by id are
//! de-duplicated through an identity cache. Once running, every task ticks
//! on its own interval and fans each result out to its bound sinks.
//!
//! ## Lifecycle
//!
//! ```text
//! register_*_constructor → register_from_definitions → start_running
//!                                                           ↑
//!                                            stop_running ──┘ (signal, don't wait)
//! ```
//!
//! Registration is strictly sequential; the constructor tables and the sink
//! identity cache are never mutated after [`Registry::start_running`] is
//! called, so the running phase reads them without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, interval, timeout_at};
use tracing::{debug, error, info, instrument, trace};

use crate::config::CheckDefinition;
use crate::sinks::Emitter;
use crate::CheckFn;

/// Builds a check closure from string-keyed arguments.
pub type CheckConstructor =
    Box<dyn Fn(&HashMap<String, String>) -> anyhow::Result<CheckFn> + Send + Sync>;

/// Builds a sink instance from string-keyed arguments.
pub type SinkConstructor =
    Box<dyn Fn(&HashMap<String, String>) -> anyhow::Result<Arc<dyn Emitter>> + Send + Sync>;

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while resolving definitions into tasks
#[derive(Debug)]
pub enum RegistryError {
    /// The definition names a check type with no registered constructor
    UnknownCheckType(String),

    /// A sink reference names a sink type with no registered constructor
    UnknownSinkType(String),

    /// A constructor rejected its arguments
    Constructor {
        name: String,
        source: anyhow::Error,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownCheckType(name) => {
                write!(f, "check type '{}' is not registered", name)
            }
            RegistryError::UnknownSinkType(name) => {
                write!(f, "sink type '{}' is not registered", name)
            }
            RegistryError::Constructor { name, source } => {
                write!(f, "constructor for '{}' failed: {:#}", name, source)
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Constructor { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

/// A check bound to its interval and resolved sinks.
///
/// Created once by the registry at startup and never mutated afterwards.
pub struct Task {
    pub name: String,
    pub check_type: String,
    check: CheckFn,
    pub interval: Duration,
    sinks: Vec<Arc<dyn Emitter>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("check_type", &self.check_type)
            .field("interval", &self.interval)
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Execute one iteration: run the closure, then fan the result out to
    /// every bound sink concurrently.
    ///
    /// Both the closure and each individual emit share a single deadline
    /// equal to the task interval. A closure overrun drops the iteration's
    /// result; an emit overrun drops the result for that sink only. Fan-out
    /// units are spawned and not awaited, so there is no ordering between
    /// sinks receiving the same result.
    #[instrument(skip_all, fields(check = %self.name))]
    async fn run_once(&self) {
        let deadline = Instant::now() + self.interval;

        let result = match timeout_at(deadline, (self.check)()).await {
            Ok(result) => result,
            Err(_) => {
                error!("check '{}' did not finish within {:?}", self.name, self.interval);
                return;
            }
        };

        for sink in &self.sinks {
            debug!(
                "emitting {} result ({}) to {}",
                self.name,
                result.outcome,
                sink.name()
            );

            let sink = Arc::clone(sink);
            let check_name = self.name.clone();
            let check_type = self.check_type.clone();

            tokio::spawn(async move {
                if timeout_at(deadline, sink.emit(&check_name, &check_type, &result))
                    .await
                    .is_err()
                {
                    error!(
                        "emitting result from {} to sink {} timed out",
                        check_name,
                        sink.name()
                    );
                }
            });
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}: {})", self.check_type, self.name)
    }
}

/// Registry of check and sink constructors plus the live task list.
pub struct Registry {
    check_constructors: HashMap<String, CheckConstructor>,
    sink_constructors: HashMap<String, SinkConstructor>,
    tasks: Vec<Arc<Task>>,
    sink_cache: HashMap<String, Arc<dyn Emitter>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Registry {
    pub fn new() -> Self {
        debug!("creating new check registry");
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            check_constructors: HashMap::new(),
            sink_constructors: HashMap::new(),
            tasks: Vec::new(),
            sink_cache: HashMap::new(),
            stop_tx,
            stop_rx,
        }
    }

    /// Register a check constructor under a type name. Last writer wins.
    pub fn register_check_constructor(&mut self, check_type: &str, constructor: CheckConstructor) {
        trace!("registering check constructor '{check_type}'");
        self.check_constructors
            .insert(check_type.to_string(), constructor);
    }

    /// Register a sink constructor under a type name. Last writer wins.
    pub fn register_sink_constructor(&mut self, sink_type: &str, constructor: SinkConstructor) {
        trace!("registering sink constructor '{sink_type}'");
        self.sink_constructors
            .insert(sink_type.to_string(), constructor);
    }

    /// Construct a task from its parts and append it to the live list.
    pub fn add_check(
        &mut self,
        name: &str,
        check_type: &str,
        args: &HashMap<String, String>,
        interval: Duration,
        sinks: Vec<Arc<dyn Emitter>>,
    ) -> RegistryResult<Arc<Task>> {
        info!("creating health check: {check_type} ({name})");

        if interval.is_zero() {
            return Err(RegistryError::Constructor {
                name: name.to_string(),
                source: anyhow::anyhow!("check interval must be positive"),
            });
        }

        let constructor = self
            .check_constructors
            .get(check_type)
            .ok_or_else(|| RegistryError::UnknownCheckType(check_type.to_string()))?;

        let check = constructor(args).map_err(|source| RegistryError::Constructor {
            name: name.to_string(),
            source,
        })?;

        let task = Arc::new(Task {
            name: name.to_string(),
            check_type: check_type.to_string(),
            check,
            interval,
            sinks,
        });
        self.tasks.push(Arc::clone(&task));
        Ok(task)
    }

    /// Resolve one sink reference to an instance.
    ///
    /// If the args carry an `id` that is already cached, the cached instance
    /// is returned and the constructor is not invoked, even if the other
    /// args differ. Otherwise the constructor runs (with `id` stripped from
    /// its args) and the new instance is cached under the id, if any.
    pub fn resolve_sink(
        &mut self,
        sink_type: &str,
        args: &HashMap<String, String>,
    ) -> RegistryResult<Arc<dyn Emitter>> {
        let id = args.get("id").cloned();

        if let Some(id) = &id
            && let Some(sink) = self.sink_cache.get(id)
        {
            trace!("reusing sink '{id}' for type '{sink_type}'");
            return Ok(Arc::clone(sink));
        }

        let constructor = self
            .sink_constructors
            .get(sink_type)
            .ok_or_else(|| RegistryError::UnknownSinkType(sink_type.to_string()))?;

        let mut sink_args = args.clone();
        sink_args.remove("id");

        let sink = constructor(&sink_args).map_err(|source| RegistryError::Constructor {
            name: sink_type.to_string(),
            source,
        })?;

        if let Some(id) = id {
            self.sink_cache.insert(id, Arc::clone(&sink));
        }
        Ok(sink)
    }

    /// Register every definition, skipping (and logging) the ones whose
    /// sinks or check constructor cannot be resolved. A bad definition never
    /// aborts processing of the remaining ones.
    pub fn register_from_definitions(&mut self, definitions: &[CheckDefinition]) {
        for definition in definitions {
            debug!("creating sinks for {}", definition.name);

            let sinks = match self.setup_sinks(&definition.sinks) {
                Ok(sinks) => sinks,
                Err(e) => {
                    error!("could not register {}: {e}", definition.name);
                    continue;
                }
            };

            if let Err(e) = self.add_check(
                &definition.name,
                &definition.check_type,
                &definition.args,
                Duration::from_secs(definition.interval),
                sinks,
            ) {
                error!("could not register {}: {e}", definition.name);
            }
        }
    }

    fn setup_sinks(
        &mut self,
        references: &[HashMap<String, HashMap<String, String>>],
    ) -> RegistryResult<Vec<Arc<dyn Emitter>>> {
        let mut sinks = Vec::new();
        for reference in references {
            for (sink_type, sink_args) in reference {
                sinks.push(self.resolve_sink(sink_type, sink_args)?);
            }
        }
        Ok(sinks)
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Number of distinct sink ids currently cached.
    pub fn cached_sinks(&self) -> usize {
        self.sink_cache.len()
    }

    /// Spawn one execution loop per registered task and block until all of
    /// them have observed the stop signal and exited.
    pub async fn start_running(&self) {
        info!("starting {} health checks", self.tasks.len());

        let mut handles = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let task = Arc::clone(task);
            let stop = self.stop_rx.clone();
            handles.push(tokio::spawn(run_check_loop(task, stop)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("check loop panicked: {e}");
            }
        }
    }

    /// Signal every check loop to stop at its next tick and return
    /// immediately. In-flight iterations and fan-out units are allowed to
    /// run to completion (bounded by their own iteration deadline).
    pub fn stop_running(&self) {
        info!("stopping health checks");
        let _ = self.stop_tx.send(true);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task execution loop: run immediately, then re-fire on every interval
/// tick until the stop signal is observed.
///
/// The signal is checked once per tick, after the tick and before the run,
/// so stopping never interrupts an iteration that has already started.
#[instrument(skip_all, fields(check = %task.name))]
async fn run_check_loop(task: Arc<Task>, stop: watch::Receiver<bool>) {
    info!("running check: {}", task.name);
    task.run_once().await;

    let mut ticker = interval(task.interval);
    // the first tick of a fresh interval resolves immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if *stop.borrow() {
            info!("stopping check: {}", task.name);
            return;
        }
        trace!("running check: {}", task.name);
        task.run_once().await;
    }
}
