use std::sync::Arc;

use shared::domain::{CredentialPair, Identity};
use storage::KeyValueStore;

use crate::error::{ClientError, Result};

pub const ACCESS_CREDENTIAL_KEY: &str = "accessToken";
pub const REFRESH_CREDENTIAL_KEY: &str = "refreshToken";
pub const IDENTITY_KEY: &str = "user";

/// Persistent home of the credential pair and the session's own identity.
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn access_credential(&self) -> Result<Option<String>> {
        self.read(ACCESS_CREDENTIAL_KEY).await
    }

    pub async fn refresh_credential(&self) -> Result<Option<String>> {
        self.read(REFRESH_CREDENTIAL_KEY).await
    }

    pub async fn credentials(&self) -> Result<Option<CredentialPair>> {
        let access = self.access_credential().await?;
        let refresh = self.refresh_credential().await?;
        Ok(match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Some(CredentialPair {
                access_token,
                refresh_token,
            }),
            _ => None,
        })
    }

    pub async fn save_credentials(&self, pair: &CredentialPair) -> Result<()> {
        self.store
            .put_many(&[
                (ACCESS_CREDENTIAL_KEY, pair.access_token.as_str()),
                (REFRESH_CREDENTIAL_KEY, pair.refresh_token.as_str()),
            ])
            .await
            .map_err(ClientError::Storage)
    }

    /// Stores the credential pair and identity in one write.
    pub async fn save_session(&self, pair: &CredentialPair, identity: &Identity) -> Result<()> {
        let encoded = serde_json::to_string(identity)
            .map_err(|err| ClientError::Storage(err.into()))?;
        self.store
            .put_many(&[
                (ACCESS_CREDENTIAL_KEY, pair.access_token.as_str()),
                (REFRESH_CREDENTIAL_KEY, pair.refresh_token.as_str()),
                (IDENTITY_KEY, encoded.as_str()),
            ])
            .await
            .map_err(ClientError::Storage)
    }

    pub async fn identity(&self) -> Result<Option<Identity>> {
        let Some(raw) = self.read(IDENTITY_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| ClientError::Storage(err.into()))
    }

    /// A session is authenticated iff a non-empty access credential and a
    /// cached identity both exist.
    pub async fn is_authenticated(&self) -> Result<bool> {
        let has_access = self.access_credential().await?.is_some();
        Ok(has_access && self.read(IDENTITY_KEY).await?.is_some())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store
            .remove_many(&[ACCESS_CREDENTIAL_KEY, REFRESH_CREDENTIAL_KEY, IDENTITY_KEY])
            .await
            .map_err(ClientError::Storage)
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let value = self.store.get(key).await.map_err(ClientError::Storage)?;
        Ok(value.filter(|v| !v.is_empty()))
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
