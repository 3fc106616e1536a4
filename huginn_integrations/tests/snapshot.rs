#![cfg(feature = "spansh")]

use chrono::{Duration, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use huginn_core::catalogue::{CatalogueStore, MemoryCatalogue};
use huginn_core::models::{Coords, Freshness, SystemId, SystemSeed};
use huginn_core::sources::{FetchInput, SourceAdapter};
use huginn_integrations::spansh::SpanshSnapshot;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const DUMP: &str = r#"[
{"id64": 11, "name": "Cemiess", "population": 5000, "bodies": [{"name": "Cemiess 1", "rings": [{"name": "A"}]}]},
{"id64": 12, "name": "Ngalinn", "bodies": [{"name": "Ngalinn A"}], "stations": [{"name": "Dock"}]},
{"id64": 13, "name": "Unseeded"}
]"#;

fn write_gz(path: &Path, body: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    enc.write_all(body.as_bytes()).unwrap();
    enc.finish().unwrap();
}

#[tokio::test]
async fn newest_dump_in_directory_is_used() {
    let dir = tempfile::tempdir().unwrap();
    write_gz(&dir.path().join("galaxy_old.json.gz"), "[\n]");
    std::thread::sleep(std::time::Duration::from_millis(20));
    write_gz(&dir.path().join("galaxy_1day.json.gz"), DUMP);
    std::fs::write(dir.path().join("notes.json"), "{}").unwrap();

    let snapshot = SpanshSnapshot::new(dir.path());
    assert_eq!(
        snapshot.resolve().unwrap(),
        dir.path().join("galaxy_1day.json.gz")
    );
    let report = snapshot
        .fetch(FetchInput::Snapshot { only: None }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fetched(), 3);
}

#[tokio::test]
async fn empty_directory_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = SpanshSnapshot::new(dir.path()).resolve().unwrap_err();
    assert!(matches!(err, huginn_core::Error::NotFound(_)));
}

#[tokio::test]
async fn applying_the_same_dump_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("galaxy.json.gz");
    write_gz(&path, DUMP);

    let store = MemoryCatalogue::new();
    for (id, name) in [(11u64, "Cemiess"), (12, "Ngalinn")] {
        store
            .insert_seed(SystemSeed::new(id, name, Coords::new(id as f64, 0.0, 0.0)).unwrap())
            .await
            .unwrap();
    }
    let only: HashSet<SystemId> = [SystemId(11), SystemId(12)].into();
    let snapshot = SpanshSnapshot::new(&path);
    let t1 = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();

    let mut states = Vec::new();
    for at in [t1, t1 + Duration::days(8)] {
        let report = snapshot
            .fetch(
                FetchInput::Snapshot { only: Some(&only) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        for delta in report.deltas() {
            store.apply_delta(&delta, at).await.unwrap();
        }
        let mut systems = store.snapshot().await;
        for s in &mut systems {
            assert_eq!(s.freshness.bulk_updated_at, Some(at));
            s.freshness = Freshness::default();
        }
        states.push(systems);
    }
    assert_eq!(states[0], states[1]);

    let cemiess = &states[0][0];
    assert!(cemiess.has_ring);
    assert_eq!(cemiess.metadata.population, Some(5000));
    let ngalinn = &states[0][1];
    assert!(!ngalinn.has_ring);
    assert_eq!(ngalinn.metadata.station_count, Some(1));
}
