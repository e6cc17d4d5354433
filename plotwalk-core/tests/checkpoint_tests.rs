// Tests for checkpoint resumption and filter-cycle rotation

use plotwalk_core::checkpoint::{Checkpoint, LocalityTally};
use plotwalk_core::data::Database;
use plotwalk_core::store::{CheckpointStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;

fn create_store(temp_dir: &TempDir) -> Arc<dyn CheckpointStore> {
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    Arc::new(SqliteStore::new(db, "weekly"))
}

#[tokio::test]
async fn test_fresh_cursor_starts_at_zero() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();

    assert_eq!(checkpoint.resume_index("NY"), 0);
    assert_eq!(checkpoint.filter_cycle_index(), 0);
    assert!(!checkpoint.is_region_complete("NY"));
}

#[tokio::test]
async fn test_resume_after_first_locality() {
    // Localities ["Albany", "Buffalo"] in NY; Albany (index 0) finished before a crash.
    let temp_dir = TempDir::new().unwrap();
    {
        let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
        checkpoint
            .complete_locality("NY", 0, LocalityTally::default())
            .await
            .unwrap();
        assert_eq!(checkpoint.cursor().region.as_deref(), Some("NY"));
        assert_eq!(checkpoint.cursor().locality_index, Some(0));
    }

    let restarted = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    assert_eq!(restarted.cursor().region.as_deref(), Some("NY"));
    assert_eq!(restarted.cursor().locality_index, Some(0));
    assert_eq!(restarted.resume_index("NY"), 1);
}

#[tokio::test]
async fn test_locality_index_never_moves_backwards() {
    let temp_dir = TempDir::new().unwrap();
    let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();

    checkpoint
        .complete_locality("NY", 3, LocalityTally::default())
        .await
        .unwrap();
    checkpoint
        .complete_locality("NY", 1, LocalityTally::default())
        .await
        .unwrap();

    assert_eq!(checkpoint.cursor().locality_index, Some(3));
}

#[tokio::test]
async fn test_tallies_accumulate() {
    let temp_dir = TempDir::new().unwrap();
    let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();

    checkpoint
        .complete_locality(
            "NY",
            0,
            LocalityTally {
                persisted: 10,
                rejected: 2,
                skipped: false,
            },
        )
        .await
        .unwrap();
    checkpoint
        .complete_locality(
            "NY",
            1,
            LocalityTally {
                persisted: 0,
                rejected: 0,
                skipped: true,
            },
        )
        .await
        .unwrap();

    let cursor = Checkpoint::load(create_store(&temp_dir))
        .await
        .unwrap()
        .cursor()
        .clone();
    assert_eq!(cursor.total_persisted, 10);
    assert_eq!(cursor.total_rejected, 2);
    assert_eq!(cursor.total_skipped, 1);
}

#[tokio::test]
async fn test_completed_region_resets_locality() {
    let temp_dir = TempDir::new().unwrap();
    let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();

    checkpoint
        .complete_locality("NY", 1, LocalityTally::default())
        .await
        .unwrap();
    checkpoint.complete_region("NY").await.unwrap();

    let restarted = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    assert!(restarted.is_region_complete("NY"));
    assert_eq!(restarted.cursor().locality_index, None);
    assert_eq!(restarted.resume_index("NJ"), 0);
}

#[tokio::test]
async fn test_filter_cycle_rotation_wraps_and_counts_passes() {
    let temp_dir = TempDir::new().unwrap();
    let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    checkpoint.complete_region("NY").await.unwrap();

    assert!(!checkpoint.advance_filter_cycle(2).await.unwrap());
    assert_eq!(checkpoint.filter_cycle_index(), 1);
    assert!(!checkpoint.is_region_complete("NY"));

    assert!(checkpoint.advance_filter_cycle(2).await.unwrap());
    assert_eq!(checkpoint.filter_cycle_index(), 0);
    assert_eq!(checkpoint.cursor().pass_count, 1);

    let restarted = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    assert_eq!(restarted.filter_cycle_index(), 0);
    assert_eq!(restarted.cursor().pass_count, 1);
}

#[tokio::test]
async fn test_locality_writes_keep_advanced_cycle() {
    let temp_dir = TempDir::new().unwrap();
    let mut checkpoint = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    checkpoint.advance_filter_cycle(3).await.unwrap();

    checkpoint
        .complete_locality("NY", 0, LocalityTally::default())
        .await
        .unwrap();

    let restarted = Checkpoint::load(create_store(&temp_dir)).await.unwrap();
    assert_eq!(restarted.filter_cycle_index(), 1);
}
