use super::*;
use shared::domain::UserId;
use storage::{MemoryStore, Storage};

fn pair(access: &str, refresh: &str) -> CredentialPair {
    CredentialPair {
        access_token: access.into(),
        refresh_token: refresh.into(),
    }
}

#[tokio::test]
async fn empty_store_is_not_authenticated() {
    let store = CredentialStore::new(Arc::new(MemoryStore::new()));
    assert!(!store.is_authenticated().await.expect("check"));
    assert!(store.credentials().await.expect("read").is_none());
}

#[tokio::test]
async fn session_requires_both_credential_and_identity() {
    let store = CredentialStore::new(Arc::new(MemoryStore::new()));
    store
        .save_credentials(&pair("a", "r"))
        .await
        .expect("save pair");
    assert!(!store.is_authenticated().await.expect("check"));

    let identity = Identity::placeholder(UserId::new("u-1"));
    store
        .save_session(&pair("a", "r"), &identity)
        .await
        .expect("save session");
    assert!(store.is_authenticated().await.expect("check"));
    assert_eq!(store.identity().await.expect("identity"), Some(identity));
}

#[tokio::test]
async fn refresh_replaces_pair_in_place() {
    let store = CredentialStore::new(Arc::new(MemoryStore::new()));
    store.save_credentials(&pair("a-1", "r-1")).await.expect("save");
    store.save_credentials(&pair("a-2", "r-2")).await.expect("save");
    assert_eq!(store.credentials().await.expect("read"), Some(pair("a-2", "r-2")));
}

#[tokio::test]
async fn clear_removes_credentials_and_identity_from_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!(
        "sqlite://{}",
        dir.path().join("client.db").to_string_lossy().replace('\\', "/")
    );
    let store = CredentialStore::new(Arc::new(Storage::new(&url).await.expect("db")));

    store
        .save_session(&pair("a", "r"), &Identity::placeholder(UserId::new("u-1")))
        .await
        .expect("save");
    store.clear().await.expect("clear");

    assert!(store.access_credential().await.expect("access").is_none());
    assert!(store.refresh_credential().await.expect("refresh").is_none());
    assert!(store.identity().await.expect("identity").is_none());
}
