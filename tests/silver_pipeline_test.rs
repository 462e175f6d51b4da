use analytics_pipeline::app::ports::SilverStorePort;
use analytics_pipeline::app::{RunContext, RunStatus, SilverUseCase};
use analytics_pipeline::config::Config;
use analytics_pipeline::domain::CanonicalValue;
use analytics_pipeline::error::PipelineError;
use analytics_pipeline::idempotency::sha256_hex;
use analytics_pipeline::infra::FsSilverStore;
use analytics_pipeline::pipeline::storage::RejectionStage;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    bronze: TempDir,
    silver: TempDir,
    config: Arc<Config>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        Self {
            bronze: tempfile::tempdir().unwrap(),
            silver: tempfile::tempdir().unwrap(),
            config: Arc::new(config),
        }
    }

    fn partition(&self, name: &str) -> PathBuf {
        let dir = self.bronze.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(&self, partition: &Path, file: &str, body: impl AsRef<[u8]>) {
        fs::write(partition.join(file), body).unwrap();
    }

    fn store(&self) -> FsSilverStore {
        FsSilverStore::new(self.silver.path())
    }

    fn use_case(&self) -> SilverUseCase {
        SilverUseCase::new(&self.config, Box::new(self.store())).unwrap()
    }

    fn context(&self, partition_id: &str) -> RunContext {
        RunContext::new(self.config.clone(), Some(partition_id.to_string())).unwrap()
    }

    fn bronze_digests(&self) -> BTreeMap<PathBuf, String> {
        let mut digests = BTreeMap::new();
        for dir in fs::read_dir(self.bronze.path()).unwrap() {
            let dir = dir.unwrap().path();
            for file in fs::read_dir(&dir).unwrap() {
                let path = file.unwrap().path();
                digests.insert(path.clone(), sha256_hex(&fs::read(&path).unwrap()));
            }
        }
        digests
    }

    fn silver_partitions(&self) -> Vec<String> {
        fs::read_dir(self.silver.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect()
    }
}

/// Two API snapshots of station S1 at the same hour, a day apart in ingestion
fn seed_duplicate_snapshots(fx: &Fixture) -> PathBuf {
    let part = fx.partition("2024-01-02");
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([
            {"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": 5},
            {"station_id": "S2", "ts": "2024-01-01T00:00", "bikes": 3}
        ])
        .to_string(),
    );
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T010000Z.json",
        json!([{"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": 7}]).to_string(),
    );
    part
}

#[tokio::test]
async fn later_ingestion_wins_and_lineage_is_merged() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.counts.read, 3);
    assert_eq!(report.counts.duplicates_collapsed, 1);

    let partition = fx.store().read_partition("p1").await.unwrap();
    assert_eq!(partition.records.len(), 2);
    let s1 = partition
        .records
        .iter()
        .find(|r| r.get("station_id") == Some(&CanonicalValue::String("S1".into())))
        .unwrap();
    assert_eq!(s1.get("bikes"), Some(&CanonicalValue::Integer(7)));
    assert_eq!(s1.lineage.len(), 2);
}

#[tokio::test]
async fn rerun_over_same_bronze_is_equivalent() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    let use_case = fx.use_case();

    let first = use_case.run(&fx.context("p1"), &[part.clone()]).await.unwrap();
    let second = use_case.run(&fx.context("p2"), &[part]).await.unwrap();

    assert_eq!(first.manifest.records_sha256, second.manifest.records_sha256);
    assert_eq!(first.manifest.inputs_sha256, second.manifest.inputs_sha256);
    let a = fx.store().read_partition("p1").await.unwrap();
    let b = fx.store().read_partition("p2").await.unwrap();
    assert_eq!(a.records, b.records);
}

#[tokio::test]
async fn identity_keys_unique_and_lineage_points_at_inputs() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();

    let partition = fx.store().read_partition("p1").await.unwrap();
    let keys: HashSet<_> = partition.records.iter().map(|r| r.identity_key.clone()).collect();
    assert_eq!(keys.len(), partition.records.len());

    let inputs: HashSet<_> = partition
        .manifest
        .input_files
        .iter()
        .map(|f| f.locator.clone())
        .collect();
    for record in &partition.records {
        assert!(!record.lineage.is_empty());
        assert!(record.lineage.iter().all(|p| inputs.contains(&p.origin_locator)));
    }
}

#[tokio::test]
async fn bronze_is_never_modified() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    fx.write(&part, "paris_bike_counts_p0009_20240102T020000Z.json", "{not json");
    let before = fx.bronze_digests();

    fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();

    assert_eq!(before, fx.bronze_digests());
}

#[tokio::test]
async fn missing_station_id_is_reported_and_run_is_partial() {
    let fx = Fixture::new();
    let part = fx.partition("2024-01-02");
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([
            {"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": 5},
            {"ts": "2024-01-01T00:00", "bikes": 2}
        ])
        .to_string(),
    );

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.status.exit_code(), 2);
    assert_eq!(report.manifest.record_count, 1);
    assert_eq!(report.rejections.len(), 1);

    let rejection = &report.rejections[0];
    assert_eq!(rejection.stage, RejectionStage::Normalize);
    assert_eq!(rejection.field.as_deref(), Some("station_id"));
    assert_eq!(rejection.provenance[0].record_path, "$[1]");

    let stored = fx.store().read_rejections("p1").await.unwrap();
    assert_eq!(stored, report.rejections);
}

#[tokio::test]
async fn validation_rejection_keeps_identity_key() {
    let fx = Fixture::new();
    let part = fx.partition("2024-01-02");
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([{"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": -3}]).to_string(),
    );

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.manifest.record_count, 0);
    assert_eq!(report.rejections[0].stage, RejectionStage::Validate);
    assert_eq!(report.rejections[0].rule, "range");
    assert!(report.rejections[0].identity_key.is_some());
}

#[tokio::test]
async fn all_corrupt_input_fails_without_partition() {
    let fx = Fixture::new();
    let part = fx.partition("2024-01-02");
    fx.write(&part, "paris_bike_counts_p0001_20240102T000000Z.json", "{not json");
    fx.write(&part, "paris_bike_counts_p0002_20240102T000000Z.ndjson", "[1, 2");

    let err = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoValidInput { attempted: 2 }));
    assert!(fx.silver_partitions().is_empty());
}

#[tokio::test]
async fn malformed_file_is_skipped() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    fx.write(&part, "paris_bike_counts_p0009_20240102T020000Z.json", "{not json");

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.malformed.len(), 1);
    assert_eq!(report.manifest.malformed_inputs, report.malformed);
    assert_eq!(report.manifest.record_count, 2);
}

#[tokio::test]
async fn api_payload_and_csv_drop_deduplicate_together() {
    let mut config = Config::default();
    config.reader.sources.push("counters_export".to_string());
    let fx = Fixture::with_config(config);
    let api = fx.partition("api");
    fx.write(
        &api,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!({
            "nhits": 1,
            "records": [{
                "recordid": "r1",
                "record_timestamp": "2024-01-02T00:00:00Z",
                "fields": {
                    "id_compteur": "S1",
                    "nom_compteur": "Rivoli",
                    "date": "2024-01-01T01:00:00+01:00",
                    "sum_counts": 4
                }
            }]
        })
        .to_string(),
    );
    let drop = fx.partition("drops");
    fx.write(
        &drop,
        "counters_export_20240103T000000Z.csv",
        "id_compteur;nom_compteur;date;sum_counts\nS1;Rivoli;2024-01-01T00:00:00Z;6\n",
    );

    let report = fx.use_case().run(&fx.context("p1"), &[api, drop]).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.manifest.input_partitions, vec!["api".to_string(), "drops".to_string()]);

    let partition = fx.store().read_partition("p1").await.unwrap();
    assert_eq!(partition.records.len(), 1);
    let record = &partition.records[0];
    assert_eq!(record.get("bikes"), Some(&CanonicalValue::Integer(6)));
    let sources: HashSet<_> = record.lineage.iter().map(|p| p.source_id.as_str()).collect();
    assert!(sources.contains("paris_bike_counts"));
    assert!(sources.contains("counters_export"));
}

#[tokio::test]
async fn existing_partition_is_write_conflict() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    let use_case = fx.use_case();
    let first = use_case.run(&fx.context("p1"), &[part.clone()]).await.unwrap();

    let err = use_case.run(&fx.context("p1"), &[part]).await.unwrap_err();
    assert!(matches!(err, PipelineError::WriteConflict { .. }));

    let kept = fx.store().read_partition("p1").await.unwrap();
    assert_eq!(kept.manifest.run_id, first.manifest.run_id);
}

#[tokio::test]
async fn cancelled_run_publishes_nothing() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    let ctx = fx.context("p1");
    ctx.cancel.cancel();

    let err = fx.use_case().run(&ctx, &[part]).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(fx.silver_partitions().is_empty());
    assert!(fx.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn catalog_lists_committed_partitions_in_order() {
    let fx = Fixture::new();
    let part = seed_duplicate_snapshots(&fx);
    let use_case = fx.use_case();
    use_case.run(&fx.context("p1"), &[part.clone()]).await.unwrap();
    use_case.run(&fx.context("p2"), &[part]).await.unwrap();

    let ids: Vec<_> = fx
        .store()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.partition_id)
        .collect();
    assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
}

#[tokio::test]
async fn counter_metadata_in_flat_bronze_is_not_read() {
    let fx = Fixture::new();
    let bronze = fx.bronze.path().to_path_buf();
    fx.write(
        &bronze,
        "paris_bike_counters_p0001_20240102T000000Z.json",
        json!([
            {"id_compteur": "S1", "nom_compteur": "Rivoli", "coordinates": [48.86, 2.35]},
            {"id_compteur": "S2", "nom_compteur": "Sebastopol", "coordinates": [48.86, 2.35]}
        ])
        .to_string(),
    );
    fx.write(
        &bronze,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([{"id_compteur": "S1", "date": "2024-01-01T00:00:00Z", "sum_counts": 4}]).to_string(),
    );

    let report = fx.use_case().run(&fx.context("p1"), &[bronze]).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.counts.files_read, 1);
    assert_eq!(report.counts.accepted, 1);
    assert!(report.rejections.is_empty());
    assert!(report.manifest.input_files[0]
        .locator
        .ends_with("paris_bike_counts_p0001_20240102T000000Z.json"));
}

#[tokio::test]
async fn duplicates_within_one_file_keep_both_record_paths() {
    let fx = Fixture::new();
    let part = fx.partition("2024-01-02");
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([
            {"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": 5},
            {"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": 6}
        ])
        .to_string(),
    );

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.counts.duplicates_collapsed, 1);

    let partition = fx.store().read_partition("p1").await.unwrap();
    assert_eq!(partition.records.len(), 1);
    let paths: HashSet<_> = partition.records[0]
        .lineage
        .iter()
        .map(|p| p.record_path.as_str())
        .collect();
    assert_eq!(paths, HashSet::from(["$[0]", "$[1]"]));
}

#[tokio::test]
async fn fully_rejected_run_still_publishes_empty_partition() {
    let fx = Fixture::new();
    let part = fx.partition("2024-01-02");
    fx.write(
        &part,
        "paris_bike_counts_p0001_20240102T000000Z.json",
        json!([
            {"station_id": "S1", "ts": "2024-01-01T00:00", "bikes": -1},
            {"station_id": "S2", "ts": "2024-01-01T00:00", "bikes": -2}
        ])
        .to_string(),
    );

    let report = fx.use_case().run(&fx.context("p1"), &[part]).await.unwrap();
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.counts.accepted, 0);
    assert_eq!(report.counts.rejected, 2);

    assert_eq!(fx.silver_partitions(), vec!["p1".to_string()]);
    let partition = fx.store().read_partition("p1").await.unwrap();
    assert!(partition.records.is_empty());
    assert_eq!(partition.manifest.rejected_count, 2);
    assert_eq!(fx.store().read_rejections("p1").await.unwrap().len(), 2);
}
