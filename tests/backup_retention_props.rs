//! Property tests for backup retention.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use datakeep::{BackupPolicy, BackupRotation};
use proptest::prelude::*;
use tempfile::tempdir;

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 15)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// N backups under a limit of K keep exactly the newest min(N, K).
    #[test]
    fn retention_keeps_newest_backups(creations in 1usize..12, keep in 1usize..7) {
        let dir = tempdir().unwrap();
        let source = dir.path().join("claims.json");
        std::fs::write(&source, b"{}").unwrap();
        let rotation = BackupRotation::new(BackupPolicy {
            max_backups: keep,
            ..BackupPolicy::default()
        });

        let stamps: Vec<NaiveDateTime> = (0..creations)
            .map(|offset| base_time() + Duration::seconds(offset as i64))
            .collect();

        let listed = block_on(async {
            for stamp in &stamps {
                rotation.create_at(&source, *stamp).await.unwrap();
            }
            rotation.list(&source).await.unwrap()
        });

        prop_assert_eq!(listed.len(), creations.min(keep));
        let kept: Vec<NaiveDateTime> = listed.iter().filter_map(|entry| entry.created_at).collect();
        let expected: Vec<NaiveDateTime> = stamps.iter().rev().take(keep).copied().collect();
        prop_assert_eq!(kept, expected);
        for (age, entry) in listed.iter().enumerate() {
            prop_assert_eq!(entry.age, age);
        }
    }

    /// Cleanup never touches backups of other files in the same directory.
    #[test]
    fn cleanup_is_scoped_to_one_source(own in 1usize..8, other in 1usize..8) {
        let dir = tempdir().unwrap();
        let source = dir.path().join("economy.json");
        let neighbour = dir.path().join("economy.json.old");
        std::fs::write(&source, b"{}").unwrap();
        std::fs::write(&neighbour, b"{}").unwrap();
        let rotation = BackupRotation::new(BackupPolicy {
            max_backups: 2,
            ..BackupPolicy::default()
        });
        let unlimited = BackupRotation::new(BackupPolicy {
            max_backups: 100,
            ..BackupPolicy::default()
        });

        let (own_count, other_count) = block_on(async {
            for offset in 0..other {
                unlimited
                    .create_at(&neighbour, base_time() + Duration::seconds(offset as i64))
                    .await
                    .unwrap();
            }
            for offset in 0..own {
                rotation
                    .create_at(&source, base_time() + Duration::seconds(offset as i64))
                    .await
                    .unwrap();
            }
            (rotation.count(&source).await, unlimited.count(&neighbour).await)
        });

        prop_assert_eq!(own_count, own.min(2));
        prop_assert_eq!(other_count, other);
    }
}

/// A backup that cannot be deleted during retention does not fail `create`.
#[cfg(unix)]
#[tokio::test]
async fn cleanup_failure_does_not_fail_create() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let source = dir.path().join("claims.json");
    std::fs::write(&source, b"{\"v\": 1}").unwrap();
    let unlimited = BackupRotation::new(BackupPolicy {
        max_backups: 100,
        ..BackupPolicy::default()
    });
    for offset in 0..3 {
        unlimited
            .create_at(&source, base_time() + Duration::seconds(offset))
            .await
            .unwrap();
    }

    // With the directory read-only the copy can still overwrite the newest
    // backup in place, but deleting the surplus ones fails.
    std::fs::write(&source, b"{\"v\": 2}").unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
    let deletions_blocked = std::fs::File::create(dir.path().join("writable-check")).is_err();

    let rotation = BackupRotation::new(BackupPolicy {
        max_backups: 1,
        ..BackupPolicy::default()
    });
    let created = rotation
        .create_at(&source, base_time() + Duration::seconds(2))
        .await;
    let listed = rotation.list(&source).await.unwrap();

    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    let entry = created.unwrap();
    assert_eq!(std::fs::read(&entry.path).unwrap(), b"{\"v\": 2}");
    assert_eq!(listed[0].path, entry.path);
    // Privileged users bypass directory permissions and cleanup succeeds.
    let expected = if deletions_blocked { 3 } else { 1 };
    assert_eq!(listed.len(), expected);
}
