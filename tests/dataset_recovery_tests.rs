use datakeep::persist::RECOVERED_FROM_BACKUP;
use futures::poll;
use datakeep::{
    DatasetHooks, JsonCodec, LoadOutcome, MigrationPlan, PersistError, PersistPolicy,
    PersistentDataset, RetryPolicy, SystemHealth, VersionedJsonCodec,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Economy {
    balances: BTreeMap<String, i64>,
}

impl Economy {
    fn with(entries: &[(&str, i64)]) -> Self {
        Self {
            balances: entries
                .iter()
                .map(|(name, amount)| (name.to_string(), *amount))
                .collect(),
        }
    }
}

fn economy_at(path: &Path) -> PersistentDataset<JsonCodec<Economy>> {
    PersistentDataset::new("economy", path, JsonCodec::new())
}

fn files_with_marker(dir: &Path, marker: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.to_string_lossy().contains(marker))
        .collect();
    found.sort();
    found
}

fn no_retry_policy() -> PersistPolicy {
    PersistPolicy {
        write_retry: RetryPolicy::none(),
        load_retry: RetryPolicy::none(),
        ..PersistPolicy::default()
    }
}

#[tokio::test]
async fn save_then_load_round_trips_payload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");

    let writer = economy_at(&path);
    writer
        .replace(Economy::with(&[("alice", 10), ("bob", -3)]))
        .unwrap();
    writer.save().await.unwrap();
    assert!(!writer.is_dirty());
    assert!(!path.with_extension("json.tmp").exists());

    let reader = economy_at(&path);
    let outcome = reader.load().await.unwrap();

    assert_eq!(outcome, LoadOutcome::Loaded { migrated: false });
    assert!(reader.is_healthy());
    assert!(!reader.is_dirty());
    assert_eq!(reader.last_error(), None);
    assert_eq!(
        reader.read(|economy| economy.clone()).unwrap(),
        Economy::with(&[("alice", 10), ("bob", -3)])
    );
}

#[tokio::test]
async fn second_save_backs_up_previous_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    let dataset = economy_at(&path);

    dataset.replace(Economy::with(&[("alice", 1)])).unwrap();
    dataset.save().await.unwrap();
    let first_bytes = std::fs::read(&path).unwrap();

    dataset.replace(Economy::with(&[("alice", 2)])).unwrap();
    dataset.save().await.unwrap();

    let backups = dataset.backups().list(&path).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(std::fs::read(&backups[0].path).unwrap(), first_bytes);
}

#[tokio::test]
async fn save_if_needed_is_idempotent() {
    let dir = tempdir().unwrap();
    let dataset = economy_at(&dir.path().join("economy.json"));

    assert!(!dataset.save_if_needed().await.unwrap());

    dataset
        .update(|economy| economy.balances.insert("carol".to_string(), 7))
        .unwrap();
    assert!(dataset.save_if_needed().await.unwrap());
    assert!(!dataset.save_if_needed().await.unwrap());
    assert!(!dataset.save_if_needed().await.unwrap());

    assert_eq!(dataset.write_count(), 1);
}

#[tokio::test]
async fn corrupted_file_recovers_from_newest_backup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");

    let writer = economy_at(&path);
    writer.replace(Economy::with(&[("alice", 100)])).unwrap();
    writer.save().await.unwrap();
    writer.replace(Economy::with(&[("alice", 200)])).unwrap();
    writer.save().await.unwrap();

    std::fs::write(&path, b"{\"balances\": {\"alice\": 2").unwrap();

    let loaded = Arc::new(AtomicBool::new(false));
    let loaded_flag = loaded.clone();
    let reader = economy_at(&path).with_hooks(DatasetHooks::new().on_loaded(
        move |_: &Economy| {
            loaded_flag.store(true, Ordering::SeqCst);
        },
    ));

    let outcome = reader.load().await.unwrap();

    assert_eq!(outcome, LoadOutcome::RecoveredFromBackup);
    assert!(reader.is_healthy());
    assert_eq!(reader.last_error().as_deref(), Some(RECOVERED_FROM_BACKUP));
    assert!(loaded.load(Ordering::SeqCst));
    assert_eq!(
        reader.read(|economy| economy.clone()).unwrap(),
        Economy::with(&[("alice", 100)])
    );

    let quarantined = files_with_marker(dir.path(), ".CORRUPT_");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        std::fs::read(&quarantined[0]).unwrap(),
        b"{\"balances\": {\"alice\": 2"
    );

    let health = reader.health().await;
    assert_eq!(health.status, SystemHealth::Degraded);
    assert_eq!(health.backup_count, 1);
}

#[tokio::test]
async fn corrupted_file_without_backup_resets_and_quarantines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    std::fs::write(&path, b"\x00\x01 definitely not json").unwrap();

    let reset = Arc::new(AtomicBool::new(false));
    let reset_flag = reset.clone();
    let dataset = economy_at(&path).with_hooks(DatasetHooks::new().on_critical_failure(
        move |economy: &mut Economy| {
            reset_flag.store(true, Ordering::SeqCst);
            economy.balances.insert("bank".to_string(), 0);
        },
    ));

    let outcome = dataset.load().await.unwrap();

    assert_eq!(outcome, LoadOutcome::Reset);
    assert!(!dataset.is_healthy());
    assert!(reset.load(Ordering::SeqCst));
    assert!(
        dataset
            .last_error()
            .unwrap()
            .contains("Critical load failure")
    );
    assert_eq!(
        dataset.read(|economy| economy.clone()).unwrap(),
        Economy::with(&[("bank", 0)])
    );

    let quarantined = files_with_marker(dir.path(), ".CORRUPT_");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        std::fs::read(&quarantined[0]).unwrap(),
        b"\x00\x01 definitely not json"
    );

    // The corrupt file must not become a backup.
    dataset
        .update(|economy| economy.balances.insert("alice".to_string(), 1))
        .unwrap();
    dataset.save().await.unwrap();
    assert!(dataset.is_healthy());
    assert_eq!(dataset.last_error(), None);
    assert!(files_with_marker(dir.path(), ".backup_").is_empty());
}

#[tokio::test]
async fn empty_file_is_treated_as_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    std::fs::write(&path, b"").unwrap();

    let dataset = economy_at(&path);
    assert_eq!(dataset.load().await.unwrap(), LoadOutcome::Reset);
    assert!(!dataset.is_healthy());
}

#[tokio::test]
async fn failed_save_keeps_dirty_and_marks_unhealthy() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"i am a file, not a directory").unwrap();
    let path = blocker.join("economy.json");

    let dataset = economy_at(&path).with_policy(no_retry_policy());
    dataset
        .update(|economy| economy.balances.insert("dave".to_string(), 9))
        .unwrap();

    let result = dataset.save().await;

    assert!(result.is_err());
    assert!(dataset.is_dirty());
    assert!(!dataset.is_healthy());
    assert!(dataset.last_error().unwrap().starts_with("Save failed"));
    assert_eq!(dataset.health().await.status, SystemHealth::Unhealthy);

    std::fs::remove_file(&blocker).unwrap();
    dataset.save().await.unwrap();
    assert!(!dataset.is_dirty());
    assert!(dataset.is_healthy());
    assert_eq!(dataset.last_error(), None);
}

#[tokio::test]
async fn newer_stored_version_blocks_writes_and_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    let original = serde_json::to_vec(&json!({
        "version": 3,
        "payload": { "balances": { "erin": 5 } }
    }))
    .unwrap();
    std::fs::write(&path, &original).unwrap();

    let dataset = PersistentDataset::new("economy", &path, VersionedJsonCodec::<Economy>::new(2));
    let outcome = dataset.load().await.unwrap();

    assert_eq!(
        outcome,
        LoadOutcome::IncompatibleVersion {
            stored: 3,
            current: 2
        }
    );
    assert!(!dataset.is_healthy());
    assert!(dataset.is_write_blocked());

    dataset
        .update(|economy| economy.balances.insert("frank".to_string(), 1))
        .unwrap();
    let result = dataset.save().await;
    assert!(matches!(result, Err(PersistError::WriteBlocked(_))));

    assert_eq!(std::fs::read(&path).unwrap(), original);
    assert!(files_with_marker(dir.path(), ".CORRUPT_").is_empty());
    assert!(files_with_marker(dir.path(), ".backup_").is_empty());
}

#[tokio::test]
async fn legacy_file_is_migrated_and_rewritten_on_next_save() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    std::fs::write(&path, br#"{"alice": 4, "bob": 6}"#).unwrap();

    let plan = MigrationPlan::new(1)
        .with_step(0, 1, |legacy| Ok(json!({ "balances": legacy })))
        .unwrap();
    let codec = VersionedJsonCodec::<Economy>::with_plan(plan).unwrap();
    let dataset = PersistentDataset::new("economy", &path, codec);

    assert_eq!(
        dataset.load().await.unwrap(),
        LoadOutcome::Loaded { migrated: true }
    );
    assert!(dataset.is_dirty());
    assert_eq!(
        dataset.read(|economy| economy.clone()).unwrap(),
        Economy::with(&[("alice", 4), ("bob", 6)])
    );

    assert!(dataset.save_if_needed().await.unwrap());
    let stored: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored["version"], json!(1));
    assert_eq!(stored["payload"]["balances"]["bob"], json!(6));
}

#[tokio::test]
async fn concurrent_saves_do_not_interleave() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    let dataset = Arc::new(economy_at(&path));

    let mut handles = Vec::new();
    for round in 0..8i64 {
        let dataset = dataset.clone();
        handles.push(tokio::spawn(async move {
            dataset
                .update(|economy| economy.balances.insert(format!("player-{}", round), round))
                .unwrap();
            dataset.save().await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let reader = economy_at(&path);
    assert_eq!(
        reader.load().await.unwrap(),
        LoadOutcome::Loaded { migrated: false }
    );
    assert_eq!(reader.read(|economy| economy.balances.len()).unwrap(), 8);
    assert!(files_with_marker(dir.path(), ".tmp").is_empty());
}

#[tokio::test]
async fn cancelled_save_keeps_dataset_dirty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("economy.json");
    let dataset = economy_at(&path);
    dataset.replace(Economy::with(&[("gina", 3)])).unwrap();

    let mut save = Box::pin(dataset.save());
    assert!(poll!(&mut save).is_pending());
    // Nothing is durable yet, so the dataset still needs a save.
    assert!(dataset.is_dirty());
    assert!(dataset.needs_save());
    drop(save);

    assert!(dataset.is_dirty());
    assert!(!dataset.is_healthy());
    assert!(dataset.save_if_needed().await.unwrap());
    assert!(!dataset.is_dirty());
    assert!(dataset.is_healthy());

    let reader = economy_at(&path);
    reader.load().await.unwrap();
    assert_eq!(
        reader.read(|economy| economy.clone()).unwrap(),
        Economy::with(&[("gina", 3)])
    );
}

#[tokio::test]
async fn stat_error_is_a_read_failure_not_a_missing_file() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"a file where a directory should be").unwrap();
    let path = blocker.join("economy.json");

    let dataset = economy_at(&path).with_policy(no_retry_policy());
    let outcome = dataset.load().await.unwrap();

    assert_eq!(outcome, LoadOutcome::Reset);
    assert!(!dataset.is_healthy());
    assert!(
        dataset
            .last_error()
            .unwrap()
            .contains("Critical load failure")
    );
}
