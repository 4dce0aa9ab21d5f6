use anyhow::{Context, Result};
use chrono::Utc;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, TextEncoder};
use slog::{error, info, Logger};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::runtime::Runtime;
use warp::{http::Response, Filter};

/// Starts listening on an HTTP endpoint so that Prometheus can scrape
/// metrics from this instance. On success, returns a Runtime value that the
/// caller must keep live, or the task that handles Prometheus scrapes will
/// not run. Returns an error if something goes wrong setting up the
/// endpoint.
pub fn start_metrics_scrape_endpoint(port: u16, parent_logger: &Logger) -> Result<Runtime> {
    // The default, multi-threaded runtime should suffice for our needs
    let runtime = Runtime::new().context("failed to create runtime for metrics endpoint")?;
    let logger = parent_logger.clone();

    // This task will run for the remaining life of the process, so we
    // intentionally drop the returned handle
    runtime.spawn(async move {
        let scrape_logger = logger.clone();
        let endpoint = warp::get().and(warp::path("metrics")).map(move || {
            match handle_scrape() {
                Ok(body) => {
                    Response::builder()
                        // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(body)
                }
                Err(err) => {
                    error!(
                        scrape_logger, "unable to scrape Prometheus metrics";
                        "error" => format!("{err:?}"),
                    );
                    Response::builder().status(500).body(vec![])
                }
            }
        });

        info!(logger, "serving metrics scrapes on 0.0.0.0:{}", port);
        warp::serve(endpoint)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

fn handle_scrape() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Records when a one-shot process last succeeded or failed. These are
/// gauges rather than counters because each invocation is a fresh process:
/// what monitoring can alert on is the age of the last success.
#[derive(Clone, Debug)]
pub struct RunOutcomeGauges {
    last_success_seconds: IntGauge,
    last_failure_seconds: IntGauge,
}

impl RunOutcomeGauges {
    pub fn new(process: &str) -> Result<RunOutcomeGauges> {
        Ok(RunOutcomeGauges {
            last_success_seconds: IntGauge::with_opts(Opts::new(
                format!("{process}_last_success_seconds"),
                "Time of last successful run in seconds since UNIX epoch",
            ))
            .context("failed to create last success gauge")?,
            last_failure_seconds: IntGauge::with_opts(Opts::new(
                format!("{process}_last_failure_seconds"),
                "Time of last failed run in seconds since UNIX epoch",
            ))
            .context("failed to create last failure gauge")?,
        })
    }

    /// Registers the gauges with the process-wide Prometheus registry so
    /// they appear in scrapes. Call once per process; tests leave their
    /// collectors unregistered.
    pub fn register(&self) -> Result<()> {
        let registry = prometheus::default_registry();
        registry
            .register(Box::new(self.last_success_seconds.clone()))
            .context("failed to register last success gauge")?;
        registry
            .register(Box::new(self.last_failure_seconds.clone()))
            .context("failed to register last failure gauge")?;
        Ok(())
    }

    pub fn record_success(&self) {
        self.last_success_seconds.set(Utc::now().timestamp());
    }

    pub fn record_failure(&self) {
        self.last_failure_seconds.set(Utc::now().timestamp());
    }
}

/// A group of collectors for the workflow manager.
#[derive(Clone, Debug)]
pub struct WorkflowManagerMetrics {
    pub intake_batches_discovered: IntGaugeVec,
    pub intake_tasks_scheduled: IntGaugeVec,
    pub intake_tasks_skipped_due_to_marker: IntGaugeVec,
    pub aggregate_tasks_scheduled: IntGaugeVec,
    pub aggregate_tasks_skipped_due_to_marker: IntGaugeVec,
}

impl WorkflowManagerMetrics {
    pub fn new() -> Result<WorkflowManagerMetrics> {
        let gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            IntGaugeVec::new(Opts::new(name, help), &["aggregation_id"])
                .with_context(|| format!("failed to create metrics gauge {name}"))
        };

        Ok(WorkflowManagerMetrics {
            intake_batches_discovered: gauge(
                "workflow_manager_intake_batches_discovered",
                "Number of ready intake batches discovered this run",
            )?,
            intake_tasks_scheduled: gauge(
                "workflow_manager_intake_tasks_scheduled",
                "Number of intake-batch tasks scheduled this run",
            )?,
            intake_tasks_skipped_due_to_marker: gauge(
                "workflow_manager_intake_tasks_skipped_due_to_marker",
                "Number of intake-batch tasks skipped this run because a task marker exists",
            )?,
            aggregate_tasks_scheduled: gauge(
                "workflow_manager_aggregate_tasks_scheduled",
                "Number of aggregate tasks scheduled this run",
            )?,
            aggregate_tasks_skipped_due_to_marker: gauge(
                "workflow_manager_aggregate_tasks_skipped_due_to_marker",
                "Number of aggregate tasks skipped this run because a task marker exists",
            )?,
        })
    }

    /// Registers the gauges with the process-wide Prometheus registry.
    /// Call once per process; tests leave their collectors unregistered.
    pub fn register(&self) -> Result<()> {
        let registry = prometheus::default_registry();
        for collector in [
            &self.intake_batches_discovered,
            &self.intake_tasks_scheduled,
            &self.intake_tasks_skipped_due_to_marker,
            &self.aggregate_tasks_scheduled,
            &self.aggregate_tasks_skipped_due_to_marker,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .context("failed to register workflow manager gauge")?;
        }
        Ok(())
    }
}

/// A group of collectors for the key rotator.
#[derive(Clone, Debug)]
pub struct KeyRotatorMetrics {
    pub keys_written: IntGauge,
    pub manifests_written: IntGauge,
}

impl KeyRotatorMetrics {
    pub fn new() -> Result<KeyRotatorMetrics> {
        Ok(KeyRotatorMetrics {
            keys_written: IntGauge::with_opts(Opts::new(
                "key_rotator_keys_written",
                "Number of keys written to secret storage this run",
            ))
            .context("failed to create metrics gauge for keys written")?,
            manifests_written: IntGauge::with_opts(Opts::new(
                "key_rotator_manifests_written",
                "Number of manifests written this run",
            ))
            .context("failed to create metrics gauge for manifests written")?,
        })
    }

    /// Registers the gauges with the process-wide Prometheus registry.
    /// Call once per process; tests leave their collectors unregistered.
    pub fn register(&self) -> Result<()> {
        let registry = prometheus::default_registry();
        registry
            .register(Box::new(self.keys_written.clone()))
            .context("failed to register keys written gauge")?;
        registry
            .register(Box::new(self.manifests_written.clone()))
            .context("failed to register manifests written gauge")?;
        Ok(())
    }
}
