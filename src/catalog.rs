//! Model catalog cache.
//!
//! Per-provider TTL'd cache of advertised model ids, persisted as JSON under
//! `<cache_root>/models/<provider>_models.json`. Availability beats
//! freshness: when a refresh fails and a stale entry exists, the stale entry
//! is served with a warning.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::LacquerError;
use crate::providers::Provider;
use crate::types::model::ModelInfo;

const CACHE_TTL_HOURS: i64 = 24;

/// The persisted cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCatalog {
    pub provider: String,
    pub models: Vec<ModelInfo>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedCatalog {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Disk-backed catalog cache. One instance per process; the lock serializes
/// readers against writers, never against the provider call itself.
pub struct ModelCatalog {
    dir: PathBuf,
    disabled: bool,
    lock: RwLock<()>,
}

impl ModelCatalog {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: cache_root.into().join("models"),
            disabled: false,
            lock: RwLock::new(()),
        }
    }

    /// When disabled, reads always go to the provider; successful results are
    /// still written through so other processes benefit.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    fn entry_path(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{provider}_models.json"))
    }

    /// Models for `provider`, from cache when fresh, refreshed otherwise.
    pub async fn get(&self, provider: &dyn Provider) -> Result<Vec<ModelInfo>, LacquerError> {
        let name = provider.name();
        let entry = self.read_entry(name).await;

        if let Some(entry) = &entry {
            if entry.is_fresh(Utc::now()) && !self.disabled {
                debug!(provider = %name, models = entry.models.len(), "catalog cache hit");
                return Ok(entry.models.clone());
            }
        }

        match provider.list_models().await {
            Ok(models) => {
                if let Err(err) = self.write_entry(name, &models).await {
                    warn!(provider = %name, error = %err, "failed to persist model catalog");
                }
                Ok(models)
            }
            Err(err) => {
                if let Some(stale) = entry {
                    warn!(
                        provider = %name,
                        error = %err,
                        cached_at = %stale.cached_at,
                        "model listing failed, serving stale catalog"
                    );
                    Ok(stale.models)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Drop the cached entry for `provider`.
    pub async fn invalidate(&self, provider: &str) -> Result<(), LacquerError> {
        let _guard = self.lock.write().await;
        let path = self.entry_path(provider);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LacquerError::Io(format!(
                "removing {}: {err}",
                path.display()
            ))),
        }
    }

    async fn read_entry(&self, provider: &str) -> Option<CachedCatalog> {
        let _guard = self.lock.read().await;
        let path = self.entry_path(provider);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to read catalog cache");
                }
                return None;
            }
        };
        match serde_json::from_slice::<CachedCatalog>(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed catalog cache entry, ignoring");
                None
            }
        }
    }

    async fn write_entry(
        &self,
        provider: &str,
        models: &[ModelInfo],
    ) -> Result<(), LacquerError> {
        let _guard = self.lock.write().await;

        let now = Utc::now();
        let entry = CachedCatalog {
            provider: provider.to_string(),
            models: models.to_vec(),
            cached_at: now,
            expires_at: now + Duration::hours(CACHE_TTL_HOURS),
        };
        let payload = serde_json::to_vec_pretty(&entry)?;

        create_dir_restricted(&self.dir).await?;

        // Write-then-rename keeps concurrent readers (and other processes)
        // from ever seeing a torn file.
        let path = self.entry_path(provider);
        let temp = self
            .dir
            .join(format!(".{provider}_models.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, &payload)
            .await
            .map_err(|err| LacquerError::Io(format!("writing {}: {err}", temp.display())))?;
        set_file_mode(&temp, 0o600).await?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|err| LacquerError::Io(format!("renaming into {}: {err}", path.display())))?;

        Ok(())
    }
}

async fn create_dir_restricted(dir: &Path) -> Result<(), LacquerError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| LacquerError::Io(format!("creating {}: {err}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))
            .await
            .map_err(|err| LacquerError::Io(format!("chmod {}: {err}", dir.display())))?;
    }
    Ok(())
}

async fn set_file_mode(path: &Path, mode: u32) -> Result<(), LacquerError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| LacquerError::Io(format!("chmod {}: {err}", path.display())))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let entry = CachedCatalog {
            provider: "anthropic".to_string(),
            models: vec![],
            cached_at: now - chrono::Duration::hours(23),
            expires_at: now + chrono::Duration::hours(1),
        };
        assert!(entry.is_fresh(now));
        assert!(!entry.is_fresh(now + chrono::Duration::hours(2)));
        assert!(!entry.is_fresh(entry.expires_at));
    }
}
