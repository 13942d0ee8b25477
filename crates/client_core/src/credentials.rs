use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use storage::Storage;

/// Opaque bearer tokens issued by the token endpoint. The client never
/// inspects them; they are persisted verbatim and replayed on requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Seam over the persisted credential pair. The session layer is the only
/// writer; the transport layer reads through this trait to attach auth
/// headers and must never call `store` or `clear`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn store(&self, tokens: &TokenPair) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Credential store backed by the local SQLite database, so a session
/// survives process restarts.
pub struct DurableCredentialStore {
    store: Storage,
}

impl DurableCredentialStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url).await.with_context(|| {
            format!("failed to initialize credential storage at '{database_url}'")
        })?;
        Ok(Arc::new(Self { store }))
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!(
            "sqlite://{}",
            base_dir.join("dashboard_client.sqlite3").display()
        )
    }
}

#[async_trait]
impl CredentialStore for DurableCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        let stored = self.store.load_credentials().await?;
        Ok(stored.map(|stored| TokenPair {
            access: stored.access_token,
            refresh: stored.refresh_token,
        }))
    }

    async fn store(&self, tokens: &TokenPair) -> Result<()> {
        self.store
            .save_credentials(&tokens.access, &tokens.refresh)
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear_credentials().await
    }
}
