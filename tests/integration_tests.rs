use chrono::{DateTime, Duration, TimeZone, Utc};
use std::{collections::HashSet, sync::Arc};

use orchestrator::{
    config::Identity,
    keys::RotationConfig,
    logging::setup_test_logging,
    manifest::SpecificManifest,
    metrics::{KeyRotatorMetrics, WorkflowManagerMetrics},
    rotator::{KeyRotator, ManifestTemplate},
    secrets::{batch_signing_key_name, packet_encryption_key_name, MemorySecretStore, SecretStore},
    storage::{Bucket, MemoryObjectStore, ObjectStore, PutOptions},
    task::{AggregationTask, IntakeBatchTask, MemoryTopicPublisher, WorkerPoolEnqueuer},
    workflow::WorkflowManager,
};

const BATCH_ID: &str = "6891ce17-623f-41f7-9c1d-20fc2f98248b";
const OTHER_BATCH_ID: &str = "1e466686-9815-40a7-9647-7deb1a6f6dbf";

fn time(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// A complete in-memory deployment for the workflow manager: intake, own
/// validation and peer validation buckets plus intake and aggregate topics.
struct Deployment {
    intake_store: MemoryObjectStore,
    own_validation_store: MemoryObjectStore,
    peer_validation_store: MemoryObjectStore,
    intake_publisher: MemoryTopicPublisher,
    aggregate_publisher: MemoryTopicPublisher,
}

impl Deployment {
    fn new() -> Deployment {
        Deployment {
            intake_store: MemoryObjectStore::new(),
            own_validation_store: MemoryObjectStore::new(),
            peer_validation_store: MemoryObjectStore::new(),
            intake_publisher: MemoryTopicPublisher::new(),
            aggregate_publisher: MemoryTopicPublisher::new(),
        }
    }

    fn manager(&self) -> WorkflowManager {
        let logger = setup_test_logging();
        WorkflowManager::new(
            Bucket::new(Box::new(self.intake_store.clone()), &logger),
            Bucket::new(Box::new(self.own_validation_store.clone()), &logger),
            Bucket::new(Box::new(self.peer_validation_store.clone()), &logger),
            true,
            Duration::hours(6),
            Duration::hours(8),
            Duration::hours(4),
            None,
            Box::new(WorkerPoolEnqueuer::new(
                Arc::new(self.intake_publisher.clone()),
                4,
                &logger,
            )),
            Box::new(WorkerPoolEnqueuer::new(
                Arc::new(self.aggregate_publisher.clone()),
                4,
                &logger,
            )),
            WorkflowManagerMetrics::new().unwrap(),
            &logger,
        )
    }

    /// One scheduler sweep at the provided instant. A new WorkflowManager
    /// is built per sweep, mirroring the one-shot process model.
    fn sweep(&self, now: DateTime<Utc>) {
        self.manager().run(now).unwrap();
    }

    fn put_intake_batch(&self, aggregation_id: &str, date: &str, batch_id: &str) {
        let prefix = format!("{aggregation_id}/{date}/{batch_id}");
        for extension in [".batch", ".batch.avro", ".batch.sig"] {
            self.intake_store
                .put(
                    &format!("{prefix}{extension}"),
                    b"fake contents",
                    &PutOptions::task_marker(),
                )
                .unwrap();
        }
    }

    fn put_peer_validation(&self, aggregation_id: &str, date: &str, batch_id: &str) {
        // We are the first data share processor, so the peer writes
        // validity_1 batches. Signature only: the payload may not have been
        // mirrored yet.
        self.peer_validation_store
            .put(
                &format!("{aggregation_id}/{date}/{batch_id}.validity_1.sig"),
                b"fake signature",
                &PutOptions::task_marker(),
            )
            .unwrap();
    }

    fn markers(&self) -> Vec<String> {
        self.own_validation_store
            .keys()
            .into_iter()
            .filter(|key| key.starts_with("task-markers/"))
            .collect()
    }
}

#[test]
fn batch_lifecycle_across_sweeps() {
    let deployment = Deployment::new();

    // An ingestor delivers a batch at 00:30. A sweep within the intake
    // window schedules its intake task.
    deployment.put_intake_batch("flock", "2021/01/01/00/30", BATCH_ID);
    deployment.sweep(time(2021, 1, 1, 4, 0));

    let intake_tasks = deployment
        .intake_publisher
        .published_tasks::<IntakeBatchTask>();
    assert_eq!(intake_tasks.len(), 1);
    assert_eq!(intake_tasks[0].batch_id, BATCH_ID);
    assert_eq!(
        deployment.markers(),
        vec![format!(
            "task-markers/intake-flock-2021-01-01-00-30-{BATCH_ID}"
        )]
    );

    // A later sweep with the intake batch still in the window does not
    // schedule it again: the marker holds.
    deployment.sweep(time(2021, 1, 1, 5, 0));
    assert_eq!(deployment.intake_publisher.published().len(), 1);

    // The peer's validation for the batch lands. Once the 8h aggregation
    // window [00:00, 08:00) is past its 4h grace period, the sweep
    // schedules the aggregate task.
    deployment.put_peer_validation("flock", "2021/01/01/00/30", BATCH_ID);
    deployment.sweep(time(2021, 1, 1, 12, 30));

    let aggregate_tasks = deployment
        .aggregate_publisher
        .published_tasks::<AggregationTask>();
    assert_eq!(aggregate_tasks.len(), 1);
    assert_eq!(aggregate_tasks[0].aggregation_start, "2021/01/01/00/00");
    assert_eq!(aggregate_tasks[0].aggregation_end, "2021/01/01/08/00");
    assert_eq!(aggregate_tasks[0].batches.len(), 1);
    assert_eq!(aggregate_tasks[0].batches[0].id, BATCH_ID);

    // Sweeping again in the same window does not schedule another
    // aggregate task.
    deployment.sweep(time(2021, 1, 1, 13, 0));
    assert_eq!(deployment.aggregate_publisher.published().len(), 1);

    // Across all sweeps, exactly one marker exists per scheduled task.
    let markers: HashSet<String> = deployment.markers().into_iter().collect();
    assert_eq!(
        markers,
        HashSet::from([
            format!("task-markers/intake-flock-2021-01-01-00-30-{BATCH_ID}"),
            "task-markers/aggregate-flock-2021-01-01-00-00".to_owned(),
        ])
    );
}

#[test]
fn failed_publish_retried_on_next_sweep() {
    let deployment = Deployment::new();
    deployment.put_intake_batch("flock", "2021/01/01/00/30", BATCH_ID);
    deployment.put_intake_batch("flock", "2021/01/01/00/45", OTHER_BATCH_ID);

    // The first sweep fails one of the two publishes. The run reports
    // failure but still publishes the other task and records its marker.
    deployment.intake_publisher.fail_next(1);
    deployment
        .manager()
        .run(time(2021, 1, 1, 4, 0))
        .unwrap_err();
    assert_eq!(deployment.intake_publisher.published().len(), 1);
    assert_eq!(deployment.markers().len(), 1);

    // The next sweep publishes only the unmarked batch.
    deployment.sweep(time(2021, 1, 1, 5, 0));
    let tasks = deployment
        .intake_publisher
        .published_tasks::<IntakeBatchTask>();
    assert_eq!(tasks.len(), 2);
    let batch_ids: HashSet<String> = tasks.iter().map(|t| t.batch_id.clone()).collect();
    assert_eq!(
        batch_ids,
        HashSet::from([BATCH_ID.to_owned(), OTHER_BATCH_ID.to_owned()])
    );
    assert_eq!(deployment.markers().len(), 2);
}

#[test]
fn multiple_aggregations_scheduled_independently() {
    let deployment = Deployment::new();
    deployment.put_intake_batch("flock", "2021/01/01/00/30", BATCH_ID);
    deployment.put_peer_validation("flock", "2021/01/01/00/30", BATCH_ID);
    deployment.put_intake_batch("herd", "2021/01/01/01/00", OTHER_BATCH_ID);
    deployment.put_peer_validation("herd", "2021/01/01/01/00", OTHER_BATCH_ID);

    deployment.sweep(time(2021, 1, 1, 12, 30));

    let aggregate_tasks = deployment
        .aggregate_publisher
        .published_tasks::<AggregationTask>();
    let aggregation_ids: HashSet<String> = aggregate_tasks
        .iter()
        .map(|task| task.aggregation_id.clone())
        .collect();
    assert_eq!(
        aggregation_ids,
        HashSet::from(["flock".to_owned(), "herd".to_owned()])
    );
}

/// A complete in-memory deployment for the key rotator.
struct RotatorDeployment {
    secret_store: MemorySecretStore,
    manifest_store: MemoryObjectStore,
}

impl RotatorDeployment {
    fn new() -> RotatorDeployment {
        RotatorDeployment {
            secret_store: MemorySecretStore::new("fake-env"),
            manifest_store: MemoryObjectStore::new(),
        }
    }

    fn rotate(&self, now: DateTime<Utc>) {
        let logger = setup_test_logging();
        let rotator = KeyRotator::new(
            "fake-env",
            "us-ca",
            vec!["ingestor-1".to_owned(), "ingestor-2".to_owned()],
            "us-ca.fake-env.example.com",
            Box::new(self.secret_store.clone()),
            Bucket::new(Box::new(self.manifest_store.clone()), &logger),
            RotationConfig::new(
                Duration::days(90),
                Duration::days(7),
                Duration::days(365),
                2,
            ),
            RotationConfig::new(
                Duration::days(90),
                Duration::days(7),
                Duration::days(365),
                2,
            ),
            ManifestTemplate {
                ingestion_bucket: "gs://fake-env-ingestion-{locality}-{ingestor}".to_owned(),
                ingestion_identity: Identity::none(),
                peer_validation_bucket: "gs://fake-env-peer-validation-{locality}-{ingestor}"
                    .to_owned(),
                peer_validation_identity: Identity::none(),
            },
            false,
            KeyRotatorMetrics::new().unwrap(),
            &logger,
        );
        rotator.run(now).unwrap();
    }

    fn manifest(&self, ingestor: &str) -> SpecificManifest {
        let json = self
            .manifest_store
            .get(&format!("us-ca-{ingestor}-manifest.json"))
            .unwrap();
        SpecificManifest::from_slice(&json).unwrap()
    }

    /// Checks the invariant that, for each ingestor, the manifest's kids are
    /// exactly the batch signing key's versions plus the packet encryption
    /// key's primary version.
    fn assert_manifest_matches_keys(&self, ingestor: &str) {
        let manifest = self.manifest(ingestor);
        manifest.validate().unwrap();

        let batch_signing_key = self
            .secret_store
            .get_batch_signing_key("us-ca", ingestor)
            .unwrap();
        let bsk_prefix = batch_signing_key_name("fake-env", "us-ca", ingestor);
        let expected_bsk_kids: HashSet<String> = batch_signing_key
            .versions()
            .iter()
            .map(|version| version.kid(&bsk_prefix))
            .collect();
        let actual_bsk_kids: HashSet<String> = manifest
            .batch_signing_public_keys()
            .keys()
            .cloned()
            .collect();
        assert_eq!(actual_bsk_kids, expected_bsk_kids);

        let packet_encryption_key = self
            .secret_store
            .get_packet_encryption_key("us-ca")
            .unwrap();
        let pek_prefix = packet_encryption_key_name("fake-env", "us-ca");
        assert_eq!(
            manifest
                .packet_encryption_keys()
                .keys()
                .collect::<Vec<_>>(),
            vec![&packet_encryption_key.primary().unwrap().kid(&pek_prefix)]
        );
    }
}

#[test]
fn rotation_lifecycle_across_runs() {
    let deployment = RotatorDeployment::new();
    let t0 = time(2021, 1, 1, 0, 0);

    // First run seeds every key and manifest.
    deployment.rotate(t0);
    for ingestor in ["ingestor-1", "ingestor-2"] {
        let key = deployment
            .secret_store
            .get_batch_signing_key("us-ca", ingestor)
            .unwrap();
        assert_eq!(key.versions().len(), 1);
        deployment.assert_manifest_matches_keys(ingestor);
    }

    // 100 days later, create_min_age has elapsed: a new version is minted
    // but the seed version stays primary (the new one is younger than
    // primary_min_age).
    let t1 = t0 + Duration::days(100);
    deployment.rotate(t1);
    for ingestor in ["ingestor-1", "ingestor-2"] {
        let key = deployment
            .secret_store
            .get_batch_signing_key("us-ca", ingestor)
            .unwrap();
        assert_eq!(key.versions().len(), 2);
        assert_eq!(key.primary().unwrap().creation_time, t0.timestamp());
        deployment.assert_manifest_matches_keys(ingestor);
    }

    // Ten more days: the new version has matured and takes over as
    // primary. Its kid was advertised by the previous run, so the
    // orphaning check passes.
    let t2 = t1 + Duration::days(10);
    deployment.rotate(t2);
    for ingestor in ["ingestor-1", "ingestor-2"] {
        let key = deployment
            .secret_store
            .get_batch_signing_key("us-ca", ingestor)
            .unwrap();
        assert_eq!(key.primary().unwrap().creation_time, t1.timestamp());
        deployment.assert_manifest_matches_keys(ingestor);
    }

    // Far in the future, old versions age out but delete_min_count keeps
    // at least two versions around, and exactly one primary persists
    // throughout.
    let t3 = t2 + Duration::days(400);
    deployment.rotate(t3);
    for ingestor in ["ingestor-1", "ingestor-2"] {
        let key = deployment
            .secret_store
            .get_batch_signing_key("us-ca", ingestor)
            .unwrap();
        assert!(key.versions().len() >= 2);
        assert_eq!(key.versions().iter().filter(|v| v.primary).count(), 1);
        deployment.assert_manifest_matches_keys(ingestor);
    }
}

#[test]
fn rotation_preserves_existing_manifest_entries() {
    let deployment = RotatorDeployment::new();
    let t0 = time(2021, 1, 1, 0, 0);
    deployment.rotate(t0);

    let before = deployment.manifest("ingestor-1");
    let (kid, entry_before) = before
        .batch_signing_public_keys()
        .iter()
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
        .unwrap();

    // A later run adds a version but must keep the existing entry
    // byte-identical, expiration included.
    deployment.rotate(t0 + Duration::days(100));
    let after = deployment.manifest("ingestor-1");
    assert_eq!(after.batch_signing_public_keys()[&kid], entry_before);

    // The CSR is likewise carried over verbatim.
    assert_eq!(
        before.packet_encryption_keys(),
        after.packet_encryption_keys()
    );
}
