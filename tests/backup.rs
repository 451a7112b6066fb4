//! Backup round-trip and rotation against real files, driven through the
//! public maintenance API the CLI uses.

use chrono::NaiveDate;
use meridian::config::BackupConfig;
use meridian::crypto::{self, KdfKind};
use meridian::heartbeat::backup::{
    backup_key, create_snapshot, parse_snapshot_name, restore, rotate,
};
use meridian::store::Store;

fn config_with_password() -> BackupConfig {
    BackupConfig {
        password: Some("orbital-pliers-44".to_owned()),
        kdf: KdfKind::Argon2id,
        ..BackupConfig::default()
    }
}

#[tokio::test]
async fn snapshot_restore_round_trip_preserves_rows() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data_dir = tmp.path().join("data");
    let config = config_with_password();

    // Write some state, snapshot, close.
    let store = Store::open(&data_dir).await.expect("open");
    sqlx::query(
        "INSERT INTO conversations (id, created_at, updated_at)
         VALUES ('conv-1', '2026-05-01T00:00:00+00:00', '2026-05-01T00:00:00+00:00')",
    )
    .execute(store.meridian())
    .await
    .expect("seed meridian");
    sqlx::query("INSERT INTO episodes (id, summary, created_at) VALUES ('ep-1', 'met alice', 'x')")
        .execute(store.journal())
        .await
        .expect("seed journal");

    let key = backup_key(&data_dir, &config).expect("key");
    let snapshot = create_snapshot(&store, &tmp.path().join("backups"), &key)
        .await
        .expect("snapshot");
    store.close().await;

    // The sealed files are not plaintext SQLite.
    for name in ["meridian", "journal", "sentinel"] {
        let sealed = std::fs::read(snapshot.snapshot_dir.join(format!("{name}.backup.enc")))
            .expect("sealed bytes");
        assert!(
            !sealed.starts_with(b"SQLite format 3"),
            "{name} must be encrypted at rest"
        );
    }

    // Restore into a fresh directory; the same key derivation (salt on
    // disk) must open it.
    let restored_dir = tmp.path().join("restored");
    let key_again = backup_key(&data_dir, &config).expect("key again");
    let restored = restore(&snapshot.snapshot_dir, &restored_dir, &key_again)
        .await
        .expect("restore");
    assert_eq!(restored, vec!["meridian", "journal", "sentinel"]);

    let reopened = Store::open(&restored_dir).await.expect("reopen restored");
    let (conversations,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE id = 'conv-1'")
            .fetch_one(reopened.meridian())
            .await
            .expect("count");
    assert_eq!(conversations, 1);
    let (episodes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes WHERE id = 'ep-1'")
        .fetch_one(reopened.journal())
        .await
        .expect("count");
    assert_eq!(episodes, 1);
    reopened.close().await;
}

#[test]
fn crypto_round_trip_is_exact() {
    let key = crypto::derive_key("pw", &[9u8; 16], KdfKind::Argon2id).expect("derive");
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let sealed = crypto::seal(&key, &payload).expect("seal");
    assert_eq!(crypto::open(&key, &sealed).expect("open"), payload);
}

#[test]
fn thirty_snapshots_rotate_to_generational_set() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_with_password();

    // 30 sequential snapshots across roughly five months.
    let mut date = NaiveDate::from_ymd_opt(2026, 1, 10).expect("date");
    for _ in 0..30 {
        std::fs::create_dir_all(tmp.path().join(format!("backup-{}", date.format("%Y-%m-%d"))))
            .expect("mkdir");
        date = date.checked_add_days(chrono::Days::new(5)).expect("add");
    }

    let outcome = rotate(tmp.path(), &config).expect("rotate");
    let expected = config.daily_count + config.weekly_count + config.monthly_count;
    assert_eq!(outcome.kept.len(), expected);
    assert_eq!(outcome.removed.len(), 30 - expected);

    // Exactly the expected number of directories remain on disk.
    let remaining = std::fs::read_dir(tmp.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|e| {
            parse_snapshot_name(&e.file_name().to_string_lossy()).is_some()
        })
        .count();
    assert_eq!(remaining, expected);

    // Rerunning rotation is a no-op.
    let again = rotate(tmp.path(), &config).expect("rotate again");
    assert_eq!(again.kept.len(), expected);
    assert!(again.removed.is_empty());
}
