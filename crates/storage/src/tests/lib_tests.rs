use super::*;

async fn temp_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("client.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let storage = Storage::new(&database_url).await.expect("db");
    (dir, storage)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let (_dir, storage) = temp_storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn put_get_and_overwrite() {
    let (_dir, storage) = temp_storage().await;
    assert_eq!(storage.get("accessToken").await.expect("get"), None);

    storage.put("accessToken", "a-1").await.expect("put");
    storage.put("accessToken", "a-2").await.expect("overwrite");
    assert_eq!(
        storage.get("accessToken").await.expect("get"),
        Some("a-2".to_string())
    );
}

#[tokio::test]
async fn remove_many_clears_every_key_together() {
    let (_dir, storage) = temp_storage().await;
    storage
        .put_many(&[("accessToken", "a"), ("refreshToken", "r"), ("user", "{}")])
        .await
        .expect("put many");

    storage
        .remove_many(&["accessToken", "refreshToken", "user"])
        .await
        .expect("remove");

    for key in ["accessToken", "refreshToken", "user"] {
        assert_eq!(storage.get(key).await.expect("get"), None, "{key}");
    }
}

#[tokio::test]
async fn values_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path().join("kv.db").to_string_lossy().replace('\\', "/")
    );

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage.put("refreshToken", "r-1").await.expect("put");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    assert_eq!(
        reopened.get("refreshToken").await.expect("get"),
        Some("r-1".to_string())
    );
}

#[tokio::test]
async fn in_memory_database_keeps_values_across_queries() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.put("k", "v").await.expect("put");
    assert_eq!(storage.get("k").await.expect("get"), Some("v".to_string()));
}

#[tokio::test]
async fn memory_store_matches_sqlite_semantics() {
    let store = MemoryStore::new();
    store
        .put_many(&[("a", "1"), ("b", "2")])
        .await
        .expect("put many");
    store.remove_many(&["a", "missing"]).await.expect("remove");
    assert_eq!(store.get("a").await.expect("get"), None);
    assert_eq!(store.get("b").await.expect("get"), Some("2".to_string()));
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), DEFAULT_DATABASE_URL);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("sqlite:data\\kv.db"), "sqlite://data/kv.db");
}

#[test]
fn only_file_backed_urls_name_a_database_file() {
    assert_eq!(
        database_file("sqlite://./data/kv.db?mode=rwc"),
        Some(PathBuf::from("./data/kv.db"))
    );
    assert_eq!(database_file("sqlite::memory:"), None);
    assert_eq!(database_file("sqlite://"), None);
    assert_eq!(database_file("postgres://localhost/db"), None);
}

#[test]
fn prepare_creates_parent_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(dir.path().join("data").exists());
}
