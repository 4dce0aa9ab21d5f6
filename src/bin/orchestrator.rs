#![allow(clippy::too_many_arguments)]

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use clap::{value_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use slog::{error, info, o, Logger};
use std::{fs, process, str::FromStr, sync::Arc};
use tokio::runtime::Runtime;
use uuid::Uuid;

use orchestrator::{
    config::{Identity, SimpleDuration, StoragePath},
    gcp_oauth::GcpOauthTokenProvider,
    keys::RotationConfig,
    logging::{setup_logging, LoggingConfiguration},
    manifest::{IngestorGlobalManifest, SpecificManifest},
    metrics::{
        start_metrics_scrape_endpoint, KeyRotatorMetrics, RunOutcomeGauges,
        WorkflowManagerMetrics,
    },
    rotator::{KeyRotator, ManifestTemplate},
    secrets::KubernetesSecretStore,
    storage::Bucket,
    task::{
        AggregationTask, IntakeBatchTask, PubSubTopicPublisher, SnsTopicPublisher, Task,
        TaskEnqueuer, TopicPublisher, WorkerPoolEnqueuer, DEFAULT_ENQUEUE_WORKERS,
    },
    workflow::WorkflowManager,
    DATE_FORMAT,
};

fn num_validator<F: FromStr>(s: String) -> Result<(), String> {
    s.parse::<F>()
        .map(|_| ())
        .map_err(|_| "could not parse value as number".to_owned())
}

fn date_validator(s: String) -> Result<(), String> {
    NaiveDateTime::parse_from_str(&s, DATE_FORMAT)
        .map(|_| ())
        .map_err(|e| format!("{s} {e}"))
}

fn duration_validator(s: String) -> Result<(), String> {
    SimpleDuration::from_str(&s).map(|_| ())
}

fn path_validator(s: String) -> Result<(), String> {
    StoragePath::from_str(&s)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

// Trait applied to clap::App to extend its builder pattern with helpers for
// arguments shared between subcommands.
trait AppArgumentAdder {
    fn add_common_arguments(self) -> Self;

    fn add_bucket_arguments(self, name: &'static str, help: &'static str) -> Self;

    fn add_task_queue_arguments(self) -> Self;

    fn add_rotation_config_arguments(self, key_kind: &'static str) -> Self;

    fn add_metrics_scrape_port_argument(self) -> Self;
}

impl<'a, 'b> AppArgumentAdder for App<'a, 'b> {
    fn add_common_arguments(self) -> Self {
        self.arg(
            Arg::with_name("force-json-log-output")
                .long("force-json-log-output")
                .env("FORCE_JSON_LOG_OUTPUT")
                .help("Force log output to JSON format")
                .possible_values(&["true", "false"])
                .default_value("false"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .env("LOG_LEVEL")
                .help("Log messages above this level will be discarded")
                .possible_values(&["critical", "error", "warning", "info", "debug", "trace"])
                .default_value("info"),
        )
    }

    fn add_bucket_arguments(self, name: &'static str, help: &'static str) -> Self {
        // The identity flag name is leaked so it can be derived from the
        // bucket flag name at build time; the few bytes live as long as the
        // process anyway.
        let identity_flag: &'static str =
            Box::leak(format!("{name}-identity").into_boxed_str());
        self.arg(
            Arg::with_name(name)
                .long(name)
                .value_name("PATH")
                .help(help)
                .long_help(
                    "Storage arguments may be an S3 bucket (s3://{region}/{bucket}), \
                     a Google Storage bucket (gs://{bucket}), or a local directory.",
                )
                .required(true)
                .validator(path_validator),
        )
        .arg(
            Arg::with_name(identity_flag)
                .long(identity_flag)
                .value_name("IAM_ROLE_OR_SERVICE_ACCOUNT")
                .help("Identity to use when accessing the bucket, if not the ambient one")
                .default_value(""),
        )
    }

    fn add_task_queue_arguments(self) -> Self {
        self.arg(
            Arg::with_name("task-queue-kind")
                .long("task-queue-kind")
                .value_name("KIND")
                .help("Kind of task queue to publish tasks to")
                .possible_values(&["gcp-pubsub", "aws-sns"])
                .required(true),
        )
        .arg(
            Arg::with_name("intake-tasks-topic")
                .long("intake-tasks-topic")
                .value_name("TOPIC")
                .help(
                    "Topic onto which intake-batch tasks are published: a PubSub \
                     topic ID or an SNS topic ARN",
                )
                .required(true),
        )
        .arg(
            Arg::with_name("aggregate-tasks-topic")
                .long("aggregate-tasks-topic")
                .value_name("TOPIC")
                .help(
                    "Topic onto which aggregate tasks are published: a PubSub topic \
                     ID or an SNS topic ARN",
                )
                .required(true),
        )
        .arg(
            Arg::with_name("gcp-project-id")
                .long("gcp-project-id")
                .value_name("PROJECT")
                .help("GCP project owning the PubSub topics")
                .required_if("task-queue-kind", "gcp-pubsub"),
        )
        .arg(
            Arg::with_name("pubsub-api-endpoint")
                .long("pubsub-api-endpoint")
                .value_name("URL")
                .help("Alternate PubSub API endpoint, e.g. a local emulator"),
        )
        .arg(
            Arg::with_name("task-queue-identity")
                .long("task-queue-identity")
                .value_name("SERVICE_ACCOUNT")
                .help("GCP service account to impersonate when publishing, if any")
                .default_value(""),
        )
        .arg(
            Arg::with_name("enqueue-workers")
                .long("enqueue-workers")
                .value_name("COUNT")
                .help("Number of concurrent task publishes")
                .validator(num_validator::<usize>)
                .default_value("100"),
        )
    }

    fn add_rotation_config_arguments(self, key_kind: &'static str) -> Self {
        let flag = |suffix: &str| -> &'static str {
            Box::leak(format!("{key_kind}-{suffix}").into_boxed_str())
        };
        self.arg(
            Arg::with_name(flag("create-min-age"))
                .long(flag("create-min-age"))
                .value_name("DURATION")
                .help("Create a new key version once the newest is older than this")
                .validator(duration_validator)
                .default_value("270d"),
        )
        .arg(
            Arg::with_name(flag("primary-min-age"))
                .long(flag("primary-min-age"))
                .value_name("DURATION")
                .help("A key version must be at least this old to become primary")
                .validator(duration_validator)
                .default_value("7d"),
        )
        .arg(
            Arg::with_name(flag("delete-min-age"))
                .long(flag("delete-min-age"))
                .value_name("DURATION")
                .help("A key version must be at least this old to be deleted")
                .validator(duration_validator)
                .default_value("395d"),
        )
        .arg(
            Arg::with_name(flag("delete-min-count"))
                .long(flag("delete-min-count"))
                .value_name("COUNT")
                .help("Keep at least this many key versions, regardless of age")
                .validator(num_validator::<usize>)
                .default_value("2"),
        )
    }

    fn add_metrics_scrape_port_argument(self) -> Self {
        self.arg(
            Arg::with_name("metrics-scrape-port")
                .long("metrics-scrape-port")
                .value_name("PORT")
                .help("TCP port on which to serve Prometheus metrics scrapes")
                .validator(num_validator::<u16>),
        )
    }
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("orchestrator")
        .about("Orchestration core for a Prio data share processor deployment")
        .version(env!("CARGO_PKG_VERSION"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("workflow-manager")
                .about(
                    "Discover ready batches in cloud storage and schedule intake and \
                     aggregate tasks, at most once each, onto task queues",
                )
                .add_common_arguments()
                .add_bucket_arguments("intake-bucket", "Bucket into which ingestors write batches")
                .add_bucket_arguments(
                    "own-validation-bucket",
                    "Bucket into which this data share processor writes validations and \
                     task markers",
                )
                .add_bucket_arguments(
                    "peer-validation-bucket",
                    "Bucket into which the peer data share processor writes validations",
                )
                .arg(
                    Arg::with_name("is-first")
                        .long("is-first")
                        .value_name("BOOL")
                        .help(
                            "Whether this data share processor is the \"first\" or PHA \
                             server. Determines which peer validation batches are \
                             aggregated.",
                        )
                        .possible_values(&["true", "false"])
                        .required(true),
                )
                .arg(
                    Arg::with_name("intake-max-age")
                        .long("intake-max-age")
                        .value_name("DURATION")
                        .help("How far back to look for batches to schedule intake tasks for")
                        .validator(duration_validator)
                        .default_value("6h"),
                )
                .arg(
                    Arg::with_name("aggregation-period")
                        .long("aggregation-period")
                        .value_name("DURATION")
                        .help("Width of the aggregation windows")
                        .validator(duration_validator)
                        .default_value("8h"),
                )
                .arg(
                    Arg::with_name("grace-period")
                        .long("grace-period")
                        .value_name("DURATION")
                        .help(
                            "How long after an aggregation window closes before its \
                             aggregate task may be scheduled, to let late batches land",
                        )
                        .validator(duration_validator)
                        .default_value("4h"),
                )
                .arg(
                    Arg::with_name("aggregation-override-timestamp")
                        .long("aggregation-override-timestamp")
                        .value_name("TIMESTAMP")
                        .help(
                            "Schedule the aggregation window containing this timestamp \
                             (YYYY/mm/dd/HH/MM) instead of the one implied by the \
                             current time",
                        )
                        .validator(date_validator),
                )
                .add_task_queue_arguments()
                .add_metrics_scrape_port_argument(),
        )
        .subcommand(
            SubCommand::with_name("key-rotator")
                .about(
                    "Rotate batch signing and packet encryption keys in secret storage \
                     and synchronize their public portions into manifests",
                )
                .add_common_arguments()
                .arg(
                    Arg::with_name("environment")
                        .long("environment")
                        .value_name("NAME")
                        .help("Name of this deployment environment, used in secret names")
                        .required(true),
                )
                .arg(
                    Arg::with_name("kubernetes-namespace")
                        .long("kubernetes-namespace")
                        .value_name("NAMESPACE")
                        .help("Kubernetes namespace holding the key secrets")
                        .required(true),
                )
                .arg(
                    Arg::with_name("locality")
                        .long("locality")
                        .value_name("LOCALITY")
                        .help("The locality whose keys should be rotated")
                        .required(true),
                )
                .arg(
                    Arg::with_name("ingestor")
                        .long("ingestor")
                        .value_name("NAME")
                        .help("Name of an ingestion server. May be specified multiple times.")
                        .multiple(true)
                        .use_delimiter(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("csr-fqdn")
                        .long("csr-fqdn")
                        .value_name("FQDN")
                        .help(
                            "FQDN used as the common name in generated certificate \
                             signing requests",
                        )
                        .required(true),
                )
                .add_bucket_arguments("manifest-bucket", "Bucket holding manifest documents")
                .arg(
                    Arg::with_name("ingestion-bucket-template")
                        .long("ingestion-bucket-template")
                        .value_name("URL")
                        .help(
                            "Ingestion bucket URL advertised in newly created manifests. \
                             {locality} and {ingestor} are substituted.",
                        )
                        .required(true),
                )
                .arg(
                    Arg::with_name("ingestion-identity")
                        .long("ingestion-identity")
                        .value_name("IAM_ROLE")
                        .help("Ingestion identity advertised in newly created manifests")
                        .default_value(""),
                )
                .arg(
                    Arg::with_name("peer-validation-bucket-template")
                        .long("peer-validation-bucket-template")
                        .value_name("URL")
                        .help(
                            "Peer validation bucket URL advertised in newly created \
                             manifests. {locality} and {ingestor} are substituted.",
                        )
                        .required(true),
                )
                .arg(
                    Arg::with_name("peer-validation-identity")
                        .long("peer-validation-identity")
                        .value_name("IAM_ROLE")
                        .help("Peer validation identity advertised in newly created manifests")
                        .default_value(""),
                )
                .add_rotation_config_arguments("batch-signing-key")
                .add_rotation_config_arguments("packet-encryption-key")
                .arg(
                    Arg::with_name("dry-run")
                        .long("dry-run")
                        .value_name("BOOL")
                        .help("Perform all reads and validations but skip all writes")
                        .possible_values(&["true", "false"])
                        .default_value("false"),
                )
                .add_metrics_scrape_port_argument(),
        )
        .subcommand(
            SubCommand::with_name("lint-manifest")
                .about("Parse and validate a manifest document from a local file")
                .add_common_arguments()
                .arg(
                    Arg::with_name("manifest-path")
                        .long("manifest-path")
                        .value_name("PATH")
                        .help("Path to the manifest file to validate")
                        .required(true),
                )
                .arg(
                    Arg::with_name("manifest-kind")
                        .long("manifest-kind")
                        .value_name("KIND")
                        .help("The kind of manifest to expect")
                        .possible_values(&["data-share-processor-specific", "ingestor-global"])
                        .required(true),
                ),
        )
}

fn main() {
    let matches = app().get_matches();
    let (sub_name, sub_matches) = match matches.subcommand() {
        (name, Some(sub_matches)) => (name, sub_matches),
        _ => unreachable!("SubcommandRequiredElseHelp"),
    };

    let (root_logger, _guard) = setup_logging(&LoggingConfiguration {
        force_json_output: sub_matches.value_of("force-json-log-output") == Some("true"),
        version_string: env!("CARGO_PKG_VERSION"),
        log_level: sub_matches.value_of("log-level").unwrap_or("info"),
    })
    .expect("failed to initialize logging");

    let result = match sub_name {
        "workflow-manager" => run_workflow_manager(sub_matches, &root_logger),
        "key-rotator" => run_key_rotator(sub_matches, &root_logger),
        "lint-manifest" => run_lint_manifest(sub_matches, &root_logger),
        _ => unreachable!("unknown subcommand"),
    };

    if let Err(error) = result {
        error!(
            root_logger, "{sub_name} failed";
            "error" => format!("{error:?}"),
        );
        process::exit(1);
    }
}

fn duration_flag(matches: &ArgMatches, name: &str) -> Result<Duration> {
    Ok(value_t!(matches, name, SimpleDuration)?.to_duration())
}

fn identity_flag(matches: &ArgMatches, name: &str) -> Result<Identity> {
    Identity::from_str(matches.value_of(name).unwrap_or(""))
}

fn bucket_from_flags(
    matches: &ArgMatches,
    name: &str,
    runtime: &Runtime,
    logger: &Logger,
) -> Result<Bucket> {
    let path = value_t!(matches, name, StoragePath)?;
    let identity = identity_flag(matches, &format!("{name}-identity"))?;
    Ok(Bucket::from_path(
        path,
        identity,
        runtime.handle(),
        logger,
    )?)
}

fn topic_publisher(
    matches: &ArgMatches,
    topic_flag: &str,
    runtime: &Runtime,
    logger: &Logger,
) -> Result<Arc<dyn TopicPublisher>> {
    let topic = matches
        .value_of(topic_flag)
        .ok_or_else(|| anyhow!("missing {topic_flag}"))?;
    match matches.value_of("task-queue-kind") {
        Some("gcp-pubsub") => {
            let project = matches
                .value_of("gcp-project-id")
                .ok_or_else(|| anyhow!("gcp-project-id is required for gcp-pubsub"))?;
            let impersonate = matches
                .value_of("task-queue-identity")
                .filter(|s| !s.is_empty())
                .map(str::to_owned);
            Ok(Arc::new(PubSubTopicPublisher::new(
                matches.value_of("pubsub-api-endpoint"),
                project,
                topic,
                GcpOauthTokenProvider::new(impersonate),
                logger,
            )))
        }
        Some("aws-sns") => Ok(Arc::new(SnsTopicPublisher::new(
            topic,
            runtime.handle(),
            logger,
        )?)),
        kind => Err(anyhow!("unsupported task queue kind {kind:?}")),
    }
}

fn enqueuer<T: Task>(
    matches: &ArgMatches,
    topic_flag: &str,
    runtime: &Runtime,
    logger: &Logger,
) -> Result<Box<dyn TaskEnqueuer<T>>> {
    let workers = matches
        .value_of("enqueue-workers")
        .map(|w| w.parse::<usize>())
        .transpose()
        .context("bad enqueue-workers")?
        .unwrap_or(DEFAULT_ENQUEUE_WORKERS);
    let publisher = topic_publisher(matches, topic_flag, runtime, logger)?;
    Ok(Box::new(WorkerPoolEnqueuer::new(publisher, workers, logger)))
}

/// Keeps the metrics scrape endpoint alive for the life of the process if
/// one was requested.
fn maybe_start_metrics_endpoint(matches: &ArgMatches, logger: &Logger) -> Result<Option<Runtime>> {
    match matches.value_of("metrics-scrape-port") {
        Some(port) => {
            let port: u16 = port.parse().context("bad metrics-scrape-port")?;
            Ok(Some(start_metrics_scrape_endpoint(port, logger)?))
        }
        None => Ok(None),
    }
}

fn run_workflow_manager(matches: &ArgMatches, root_logger: &Logger) -> Result<()> {
    let logger = root_logger.new(o!("process" => "workflow-manager"));
    let runtime = Runtime::new().context("failed to create runtime")?;
    let _metrics_runtime = maybe_start_metrics_endpoint(matches, &logger)?;

    let outcome_gauges = RunOutcomeGauges::new("workflow_manager")?;
    outcome_gauges.register()?;
    let metrics = WorkflowManagerMetrics::new()?;
    metrics.register()?;

    let aggregation_override_timestamp = matches
        .value_of("aggregation-override-timestamp")
        .map(|timestamp| {
            NaiveDateTime::parse_from_str(timestamp, DATE_FORMAT)
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .transpose()
        .context("bad aggregation-override-timestamp")?;

    let mut manager = WorkflowManager::new(
        bucket_from_flags(matches, "intake-bucket", &runtime, &logger)?,
        bucket_from_flags(matches, "own-validation-bucket", &runtime, &logger)?,
        bucket_from_flags(matches, "peer-validation-bucket", &runtime, &logger)?,
        value_t!(matches, "is-first", bool)?,
        duration_flag(matches, "intake-max-age")?,
        duration_flag(matches, "aggregation-period")?,
        duration_flag(matches, "grace-period")?,
        aggregation_override_timestamp,
        enqueuer::<IntakeBatchTask>(matches, "intake-tasks-topic", &runtime, &logger)?,
        enqueuer::<AggregationTask>(matches, "aggregate-tasks-topic", &runtime, &logger)?,
        metrics,
        &logger,
    );

    let trace_id = Uuid::new_v4();
    info!(logger, "starting sweep"; "trace_id" => trace_id.to_string());
    match manager.run(Utc::now()) {
        Ok(()) => {
            outcome_gauges.record_success();
            info!(logger, "sweep complete");
            Ok(())
        }
        Err(error) => {
            outcome_gauges.record_failure();
            Err(error.into())
        }
    }
}

fn rotation_config(matches: &ArgMatches, key_kind: &str) -> Result<RotationConfig> {
    let delete_min_count_flag = format!("{key_kind}-delete-min-count");
    let delete_min_count: usize = matches
        .value_of(delete_min_count_flag.as_str())
        .unwrap()
        .parse()
        .with_context(|| format!("bad {delete_min_count_flag}"))?;
    Ok(RotationConfig::new(
        duration_flag(matches, &format!("{key_kind}-create-min-age"))?,
        duration_flag(matches, &format!("{key_kind}-primary-min-age"))?,
        duration_flag(matches, &format!("{key_kind}-delete-min-age"))?,
        delete_min_count,
    ))
}

fn run_key_rotator(matches: &ArgMatches, root_logger: &Logger) -> Result<()> {
    let logger = root_logger.new(o!("process" => "key-rotator"));
    let runtime = Runtime::new().context("failed to create runtime")?;
    let _metrics_runtime = maybe_start_metrics_endpoint(matches, &logger)?;

    let outcome_gauges = RunOutcomeGauges::new("key_rotator")?;
    outcome_gauges.register()?;
    let metrics = KeyRotatorMetrics::new()?;
    metrics.register()?;

    let environment = matches.value_of("environment").unwrap();
    let secret_store = KubernetesSecretStore::new(
        environment,
        matches.value_of("kubernetes-namespace").unwrap(),
        &logger,
    );

    let rotator = KeyRotator::new(
        environment,
        matches.value_of("locality").unwrap(),
        matches
            .values_of("ingestor")
            .unwrap()
            .map(str::to_owned)
            .collect(),
        matches.value_of("csr-fqdn").unwrap(),
        Box::new(secret_store),
        bucket_from_flags(matches, "manifest-bucket", &runtime, &logger)?,
        rotation_config(matches, "batch-signing-key")?,
        rotation_config(matches, "packet-encryption-key")?,
        ManifestTemplate {
            ingestion_bucket: matches
                .value_of("ingestion-bucket-template")
                .unwrap()
                .to_owned(),
            ingestion_identity: identity_flag(matches, "ingestion-identity")?,
            peer_validation_bucket: matches
                .value_of("peer-validation-bucket-template")
                .unwrap()
                .to_owned(),
            peer_validation_identity: identity_flag(matches, "peer-validation-identity")?,
        },
        matches.value_of("dry-run") == Some("true"),
        metrics,
        &logger,
    );

    match rotator.run(Utc::now()) {
        Ok(summary) => {
            outcome_gauges.record_success();
            info!(
                logger, "rotation succeeded";
                "keys_written" => summary.keys_written,
                "manifests_written" => summary.manifests_written,
            );
            Ok(())
        }
        Err(error) => {
            outcome_gauges.record_failure();
            Err(error.into())
        }
    }
}

fn run_lint_manifest(matches: &ArgMatches, root_logger: &Logger) -> Result<()> {
    let logger = root_logger.new(o!("process" => "lint-manifest"));
    let path = matches.value_of("manifest-path").unwrap();
    let json = fs::read(path).with_context(|| format!("failed to read {path}"))?;

    match matches.value_of("manifest-kind") {
        Some("data-share-processor-specific") => {
            let manifest = SpecificManifest::from_slice(&json)?;
            manifest.validate()?;
            info!(
                logger, "valid data share processor manifest";
                "batch_signing_keys" => manifest.batch_signing_public_keys().len(),
                "packet_encryption_keys" => manifest.packet_encryption_keys().len(),
            );
        }
        Some("ingestor-global") => {
            let manifest = IngestorGlobalManifest::from_slice(&json)?;
            manifest.validate()?;
            info!(
                logger, "valid ingestor global manifest";
                "batch_signing_keys" => manifest.batch_signing_public_keys().len(),
            );
        }
        kind => return Err(anyhow!("unsupported manifest kind {kind:?}")),
    }
    Ok(())
}
