//! End-to-end optimize flows against real stores: merge commit, rollback
//! under injected faults, and restore from the backup taken before commit.

use std::path::{Path, PathBuf};

use memory_defrag::config::{BridgeConfig, Config};
use memory_defrag::db;
use memory_defrag::error::{DefragError, Severity};
use memory_defrag::migrate;
use memory_defrag::models::{OptimizationRequest, Record};
use memory_defrag::progress::NoProgress;
use memory_defrag::session::Session;
use memory_defrag::store::sqlite::SqliteStore;
use memory_defrag::store::{open_store, Store};
use tempfile::TempDir;

const SEED: &[(&str, &str, &str, f64)] = &[
    ("m1", "User prefers Python", "[1.0, 0.0, 0.0]", 100.0),
    ("m2", "User prefers Python. Uses Pandas", "[1.0, 0.0, 0.0]", 200.0),
    ("m3", "Python for data science", "[0.99, 0.01, 0.0]", 300.0),
    ("m4", "Lives in Geneva", "[0.0, 1.0, 0.0]", 400.0),
    ("m5", "Allergic to peanuts", "[0.0, 0.0, 1.0]", 500.0),
];

/// SEED plus a second, two-member cluster around m4.
const TWO_CLUSTERS: &[(&str, &str, &str, f64)] = &[
    ("m1", "User prefers Python", "[1.0, 0.0, 0.0]", 100.0),
    ("m2", "User prefers Python. Uses Pandas", "[1.0, 0.0, 0.0]", 200.0),
    ("m3", "Python for data science", "[0.99, 0.01, 0.0]", 300.0),
    ("m4", "Lives in Geneva", "[0.0, 1.0, 0.0]", 400.0),
    ("m5", "Allergic to peanuts", "[0.0, 0.0, 1.0]", 500.0),
    ("m6", "Lives in Geneva. Works at CERN", "[0.0, 1.0, 0.0]", 600.0),
];

async fn seeded_sqlite(tmp: &TempDir) -> PathBuf {
    sqlite_with(tmp, SEED).await
}

async fn sqlite_with(tmp: &TempDir, rows: &[(&str, &str, &str, f64)]) -> PathBuf {
    let path = tmp.path().join("memory.db");
    migrate::run_migrations(&path).await.unwrap();
    let pool = db::connect(&path, false).await.unwrap();
    for &(id, content, embedding, ts) in rows {
        sqlx::query(
            "INSERT INTO memories (id, content, embedding, metadata, timestamp, content_hash) \
             VALUES (?, ?, ?, '{\"source\":\"chat\"}', ?, ?)",
        )
        .bind(id)
        .bind(content)
        .bind(embedding)
        .bind(ts)
        .bind(format!("hash-{}", id))
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;
    path
}

async fn load(path: &Path) -> Vec<Record> {
    let mut store = SqliteStore::open(path).await.unwrap();
    let records = store.load_all().await.unwrap();
    store.disconnect().await;
    records
}

async fn read_collection(dir: &Path, bridge: &BridgeConfig) -> Vec<Record> {
    let mut store = open_store(dir, bridge).await.unwrap();
    let records = store.load_all().await.unwrap();
    store.disconnect().await;
    records
}

async fn archived(path: &Path) -> i64 {
    let pool = db::connect(path, false).await.unwrap();
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM memory_archive")
        .fetch_one(&pool)
        .await
        .unwrap();
    pool.close().await;
    n
}

#[tokio::test]
async fn five_records_merge_to_three_and_restore() {
    let tmp = TempDir::new().unwrap();
    let path = seeded_sqlite(&tmp).await;
    let before = load(&path).await;
    let session = Session::open(&Config::minimal(path.clone())).await.unwrap();

    let analysis = session.analyze(&NoProgress).await.unwrap();
    assert_eq!(analysis.clusters.len(), 1);
    let cluster = &analysis.clusters[0];
    let member_ids: Vec<_> = cluster.members.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(member_ids, vec!["m1", "m2", "m3"]);

    let report = session
        .optimize(&analysis, &OptimizationRequest::approve([cluster.id]))
        .await
        .unwrap();
    assert_eq!(report.records_before, 5);
    assert_eq!(report.records_after, 3);
    assert!(report.maintenance_error.is_none());
    let backup = report.backup.expect("backup taken before commit");
    assert_eq!(backup.record_count, 5);
    assert_eq!(backup.checksum.len(), 64);

    let after = load(&path).await;
    assert_eq!(after.len(), 3);
    let original = before.iter().find(|r| r.id == "m1").unwrap();
    let survivor = after.iter().find(|r| r.id == "m1").unwrap();
    assert_eq!(survivor.embedding, original.embedding);
    assert_eq!(survivor.timestamp, original.timestamp);
    assert_eq!(survivor.content, cluster.synthesized_content);
    assert_eq!(survivor.metadata["merged_ids"], "m2,m3");
    assert_eq!(survivor.metadata["original_content_hash"], "hash-m1");
    assert!(after.iter().all(|r| r.id != "m2" && r.id != "m3"));
    assert_eq!(archived(&path).await, 2);

    session.backups().verify_backup(backup.id).await.unwrap();
    let restored = session.restore(backup.id).await.unwrap();
    assert_eq!(restored.id, backup.id);
    session.integrity_check().await.unwrap();
    session.close().await;

    assert_eq!(load(&path).await, before);
}

#[tokio::test]
async fn failed_delete_leaves_store_unchanged() {
    let tmp = TempDir::new().unwrap();
    let path = seeded_sqlite(&tmp).await;
    let pool = db::connect(&path, false).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER block_m3 BEFORE DELETE ON memories WHEN OLD.id = 'm3' \
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let before = load(&path).await;
    let session = Session::open(&Config::minimal(path.clone())).await.unwrap();
    let analysis = session.analyze(&NoProgress).await.unwrap();
    let request = OptimizationRequest::approve([analysis.clusters[0].id]);

    let err = session.optimize(&analysis, &request).await.unwrap_err();
    assert!(matches!(err, DefragError::Transaction(_)), "{err}");
    assert_eq!(err.severity(), Severity::Recoverable);
    // The backup was taken before the commit was attempted.
    assert_eq!(session.backups().list_backups().unwrap().len(), 1);
    session.close().await;

    assert_eq!(load(&path).await, before);
    assert_eq!(archived(&path).await, 0);
}

#[tokio::test]
async fn failure_in_second_cluster_undoes_the_first() {
    let tmp = TempDir::new().unwrap();
    let path = sqlite_with(&tmp, TWO_CLUSTERS).await;
    let pool = db::connect(&path, false).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER block_m6 BEFORE DELETE ON memories WHEN OLD.id = 'm6' \
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let before = load(&path).await;
    let session = Session::open(&Config::minimal(path.clone())).await.unwrap();
    let analysis = session.analyze(&NoProgress).await.unwrap();
    assert_eq!(analysis.clusters.len(), 2);
    let groups: Vec<Vec<&str>> = analysis
        .clusters
        .iter()
        .map(|c| c.members.iter().map(|r| r.id.as_str()).collect())
        .collect();
    assert_eq!(groups, vec![vec!["m1", "m2", "m3"], vec!["m4", "m6"]]);

    let request = OptimizationRequest::approve(analysis.clusters.iter().map(|c| c.id));
    let preview = session.preview(&analysis, &request).unwrap();
    assert_eq!(preview.records_before, 5);
    assert_eq!(preview.records_after, 2);

    let err = session.optimize(&analysis, &request).await.unwrap_err();
    assert!(matches!(err, DefragError::Transaction(_)), "{err}");
    assert_eq!(err.severity(), Severity::Recoverable);
    session.close().await;

    // m1's merged content and the m2/m3 archive rows went with the rollback.
    assert_eq!(load(&path).await, before);
    assert_eq!(archived(&path).await, 0);
}

#[tokio::test]
async fn restore_error_wins_over_reconnect_error() {
    let tmp = TempDir::new().unwrap();
    let path = seeded_sqlite(&tmp).await;
    let session = Session::open(&Config::minimal(path.clone())).await.unwrap();
    std::fs::remove_file(&path).unwrap();

    let missing = uuid::Uuid::new_v4();
    let err = session.restore(missing).await.unwrap_err();
    assert!(matches!(err, DefragError::BackupNotFound(id) if id == missing), "{err}");
    session.close().await;
}

#[tokio::test]
async fn stale_analysis_is_rejected_before_backup() {
    let tmp = TempDir::new().unwrap();
    let path = seeded_sqlite(&tmp).await;
    let session = Session::open(&Config::minimal(path.clone())).await.unwrap();
    let analysis = session.analyze(&NoProgress).await.unwrap();

    let pool = db::connect(&path, false).await.unwrap();
    sqlx::query("DELETE FROM memories WHERE id = 'm2'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let err = session
        .optimize(&analysis, &OptimizationRequest::approve([analysis.clusters[0].id]))
        .await
        .unwrap_err();
    assert!(matches!(err, DefragError::Validation(_)), "{err}");
    assert!(err.is_retryable());
    assert!(session.backups().list_backups().unwrap().is_empty());
    session.close().await;
}

/// A collection directory with a chroma marker and SEED in `data.json`.
#[cfg(unix)]
fn chroma_dir(tmp: &TempDir) -> PathBuf {
    let store_dir = tmp.path().join("chroma");
    std::fs::create_dir_all(&store_dir).unwrap();
    std::fs::write(store_dir.join("chroma.sqlite3"), b"").unwrap();
    let entries: Vec<serde_json::Value> = SEED
        .iter()
        .map(|&(id, content, embedding, ts)| {
            serde_json::json!({
                "id": id,
                "content": content,
                "embedding": serde_json::from_str::<serde_json::Value>(embedding).unwrap(),
                "metadata": {"source": "chat"},
                "timestamp": ts,
            })
        })
        .collect();
    std::fs::write(
        store_dir.join("data.json"),
        serde_json::to_vec(&entries).unwrap(),
    )
    .unwrap();
    store_dir
}

/// Helper that exports `data.json` from the store directory and fails
/// every import after clobbering it.
#[cfg(unix)]
const BROKEN_BRIDGE: &str = r#"#!/bin/sh
action="$1"
dir="$2"
payload="$3"
case "$action" in
  export)
    printf '{"success": true, "memories": ' > "$payload"
    cat "$dir/data.json" >> "$payload"
    printf '}' >> "$payload"
    ;;
  import)
    echo "half written" > "$dir/data.json"
    echo "collection write failed" >&2
    exit 3
    ;;
esac
"#;

#[cfg(unix)]
#[tokio::test]
async fn failed_bridge_import_is_restored_from_backup() {
    let tmp = TempDir::new().unwrap();
    let store_dir = chroma_dir(&tmp);
    let script = tmp.path().join("bridge.sh");
    std::fs::write(&script, BROKEN_BRIDGE).unwrap();

    let mut cfg = Config::minimal(store_dir.clone());
    cfg.bridge.command = Some(vec!["sh".into(), script.display().to_string()]);

    let before = read_collection(&store_dir, &cfg.bridge).await;
    assert_eq!(before.len(), 5);

    let session = Session::open(&cfg).await.unwrap();
    let analysis = session.analyze(&NoProgress).await.unwrap();
    assert_eq!(analysis.clusters.len(), 1);

    let err = session
        .optimize(&analysis, &OptimizationRequest::approve([analysis.clusters[0].id]))
        .await
        .unwrap_err();
    match &err {
        DefragError::Transaction(msg) => assert!(msg.contains("collection write failed"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.severity(), Severity::Recoverable);
    session.close().await;

    assert_eq!(read_collection(&store_dir, &cfg.bridge).await, before);
    assert!(store_dir.join("chroma.sqlite3").exists());
}

/// Helper whose import clobbers the collection and leaves a marker; once
/// the marker exists every export fails, so the backup cannot be
/// verified back in either.
#[cfg(unix)]
const UNRECOVERABLE_BRIDGE: &str = r#"#!/bin/sh
action="$1"
dir="$2"
payload="$3"
marker="$(dirname "$0")/import-attempted"
case "$action" in
  export)
    if [ -e "$marker" ]; then
      echo "collection unreadable" >&2
      exit 4
    fi
    printf '{"success": true, "memories": ' > "$payload"
    cat "$dir/data.json" >> "$payload"
    printf '}' >> "$payload"
    ;;
  import)
    touch "$marker"
    echo "half written" > "$dir/data.json"
    echo "collection write failed" >&2
    exit 3
    ;;
esac
"#;

#[cfg(unix)]
#[tokio::test]
async fn failed_import_and_failed_restore_is_indeterminate() {
    let tmp = TempDir::new().unwrap();
    let store_dir = chroma_dir(&tmp);
    let script = tmp.path().join("bridge.sh");
    std::fs::write(&script, UNRECOVERABLE_BRIDGE).unwrap();

    let mut cfg = Config::minimal(store_dir.clone());
    cfg.bridge.command = Some(vec!["sh".into(), script.display().to_string()]);

    let session = Session::open(&cfg).await.unwrap();
    let analysis = session.analyze(&NoProgress).await.unwrap();
    let err = session
        .optimize(&analysis, &OptimizationRequest::approve([analysis.clusters[0].id]))
        .await
        .unwrap_err();

    let backups = session.backups().list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    match &err {
        DefragError::IndeterminateState {
            write, backup_id, ..
        } => {
            assert!(write.contains("collection write failed"), "{write}");
            assert_eq!(*backup_id, backups[0].id);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.severity(), Severity::Fatal);
    assert!(!err.is_retryable());
    session.close().await;
}
