//! Observation loop
//!
//! One cycle lists every container, inspects each one, records new
//! observations and saves the record file at most once. Cycles are
//! separated by a single fixed sleep.

use super::build_observation;
use crate::labels::LabelSchema;
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::runtime::{ContainerRuntime, InspectedContainer, RuntimeError};
use crate::store::{CsvStore, KnownSet, StoreError};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the observation loop
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Delay between the end of one cycle and the start of the next (default: 5 seconds)
    pub poll_interval: Duration,
    /// Upper bound on a single inspect call (default: 10 seconds)
    pub inspect_timeout: Duration,
    /// List stopped containers too; they are filtered out after inspection
    pub include_stopped: bool,
    /// Label keys used to build workload identities
    pub schema: LabelSchema,
    /// Where to write Prometheus text-format metrics after each cycle
    pub metrics_textfile: Option<PathBuf>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            inspect_timeout: Duration::from_secs(10),
            include_stopped: true,
            schema: LabelSchema::default(),
            metrics_textfile: None,
        }
    }
}

/// Outcome of a single poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub list_failed: bool,
    pub listed: usize,
    pub inspect_errors: usize,
    pub skipped_not_running: usize,
    pub new_records: usize,
    pub saved: bool,
}

/// Observation loop that owns the known set and its store
pub struct ObservationLoop {
    runtime: Arc<dyn ContainerRuntime>,
    store: CsvStore,
    known: KnownSet,
    config: ObserverConfig,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl ObservationLoop {
    /// Create a loop seeded with an already loaded known set
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: CsvStore,
        known: KnownSet,
        config: ObserverConfig,
    ) -> Self {
        let metrics = ObserverMetrics::new();
        metrics.set_known_records(known.len());
        let logger = StructuredLogger::new(store.path());

        Self {
            runtime,
            store,
            known,
            config,
            metrics,
            logger,
        }
    }

    pub fn known(&self) -> &KnownSet {
        &self.known
    }

    /// Run poll cycles until `shutdown` fires or its sender is dropped.
    ///
    /// Shutdown is only observed between cycles, so a cycle that is saving
    /// always finishes its write. Returns an error when the record file
    /// cannot be written after all retries.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StoreError> {
        info!(
            interval_secs = self.config.poll_interval.as_secs_f64(),
            known = self.known.len(),
            destination = %self.store.path().display(),
            "Starting observation loop"
        );

        loop {
            let report = self.poll_cycle().await?;
            debug!(
                listed = report.listed,
                new_records = report.new_records,
                inspect_errors = report.inspect_errors,
                skipped = report.skipped_not_running,
                "Poll cycle complete"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down observation loop");
                    break;
                }
            }
        }

        Ok(())
    }

    /// List, inspect and record every visible container once
    pub async fn poll_cycle(&mut self) -> Result<CycleReport, StoreError> {
        let start = Instant::now();
        let mut report = CycleReport::default();

        let ids = match self.runtime.list(self.config.include_stopped).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Error listing containers");
                self.metrics.inc_list_errors();
                report.list_failed = true;
                self.finish_cycle(start);
                return Ok(report);
            }
        };
        report.listed = ids.len();

        for id in &ids {
            let container = match self.inspect(id).await {
                Ok(container) => container,
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Error inspecting container");
                    self.metrics.inc_inspect_errors();
                    report.inspect_errors += 1;
                    continue;
                }
            };

            if !container.running {
                report.skipped_not_running += 1;
                continue;
            }

            let observation = build_observation(container, &self.config.schema);
            if !self.known.contains(&observation) {
                self.known.add(observation);
                report.new_records += 1;
            }
        }

        if report.new_records > 0 {
            self.persist().await?;
            report.saved = true;

            let added = &self.known.as_slice()[self.known.len() - report.new_records..];
            for observation in added {
                self.metrics.inc_records_added();
                self.logger.log_new_record(
                    observation.pid,
                    &observation.identity.pod_name,
                    &observation.identity.container_name,
                );
            }
        }

        self.finish_cycle(start);
        Ok(report)
    }

    async fn inspect(&self, id: &str) -> Result<InspectedContainer, RuntimeError> {
        let timeout = self.config.inspect_timeout;
        match tokio::time::timeout(timeout, self.runtime.inspect(id)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout {
                id: id.to_string(),
                after: timeout,
            }),
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let start = Instant::now();

        if let Err(e) = self.store.save_with_retry(&self.known).await {
            self.metrics.inc_save_failures();
            error!(
                path = %self.store.path().display(),
                error = %e,
                "Giving up on writing record file"
            );
            return Err(e);
        }

        self.metrics
            .observe_save_duration(start.elapsed().as_secs_f64());
        self.metrics.set_known_records(self.known.len());
        Ok(())
    }

    fn finish_cycle(&self, start: Instant) {
        self.metrics.inc_cycles();
        self.metrics
            .observe_cycle_duration(start.elapsed().as_secs_f64());

        if let Some(ref path) = self.config.metrics_textfile {
            if let Err(e) = self.metrics.write_textfile(path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }
    }
}

/// Builder for creating the observation loop
pub struct ObservationLoopBuilder {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    store: Option<CsvStore>,
    known: Option<KnownSet>,
    config: ObserverConfig,
}

impl ObservationLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            runtime: None,
            store: None,
            known: None,
            config: ObserverConfig::default(),
        }
    }

    /// Set the container runtime
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the record store
    pub fn store(mut self, store: CsvStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed with a known set instead of loading it from the store
    pub fn known_set(mut self, known: KnownSet) -> Self {
        self.known = Some(known);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the per-container inspect timeout
    pub fn inspect_timeout(mut self, timeout: Duration) -> Self {
        self.config.inspect_timeout = timeout;
        self
    }

    /// Choose whether stopped containers are listed
    pub fn include_stopped(mut self, include: bool) -> Self {
        self.config.include_stopped = include;
        self
    }

    /// Set the label schema
    pub fn schema(mut self, schema: LabelSchema) -> Self {
        self.config.schema = schema;
        self
    }

    /// Build the loop, loading the known set from the store unless one was given
    pub fn build(self) -> Result<ObservationLoop> {
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("Container runtime is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Record store is required"))?;

        let known = match self.known {
            Some(known) => known,
            None => {
                let known = store.load().with_context(|| {
                    format!("Failed to load record file {}", store.path().display())
                })?;
                StructuredLogger::new(store.path()).log_seeded(known.len());
                known
            }
        };

        Ok(ObservationLoop::new(runtime, store, known, self.config))
    }
}

impl Default for ObservationLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
