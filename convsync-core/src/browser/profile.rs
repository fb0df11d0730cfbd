use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::error::{BrowserError, BrowserResult};

/// A browser user-data directory owned by exactly one run. Client-side storage
/// lives here, so two runs never share one.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    id: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl BrowserProfile {
    fn create(base_dir: &Path) -> BrowserResult<Self> {
        let id = Uuid::new_v4().to_string();
        let path = base_dir.join(&id);
        std::fs::create_dir_all(&path)
            .map_err(|err| BrowserError::Profile(format!("failed to create profile dir: {err}")))?;
        Ok(Self {
            id,
            path,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn touch(&self) -> BrowserResult<()> {
        let marker = self.path.join(".last_used");
        let mut file = fs::File::create(&marker).await.map_err(|err| {
            BrowserError::Profile(format!("failed to write profile marker: {err}"))
        })?;
        file.write_all(Utc::now().to_rfc3339().as_bytes())
            .await
            .map_err(|err| BrowserError::Profile(format!("failed to update profile marker: {err}")))?;
        Ok(())
    }

    /// Removes the directory and everything the browser stored in it.
    pub async fn discard(self) -> BrowserResult<()> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BrowserError::Profile(format!(
                "failed to remove profile {}: {err}",
                self.path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
    ttl: Duration,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P, ttl: Duration) -> BrowserResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create profile base dir: {err}"))
        })?;
        Ok(Self { base_dir, ttl })
    }

    /// Profiles left behind by crashed runs are swept after a day.
    pub fn with_default_ttl<P: AsRef<Path>>(base_dir: P) -> BrowserResult<Self> {
        Self::new(base_dir, Duration::from_secs(24 * 60 * 60))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allocate(&self) -> BrowserResult<BrowserProfile> {
        BrowserProfile::create(&self.base_dir)
    }

    pub fn cleanup_expired(&self) -> BrowserResult<usize> {
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to list profile directory: {err}"))
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if let Ok(modified) = metadata.modified() {
                if now.duration_since(modified).unwrap_or(Duration::ZERO) > self.ttl {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "failed to remove expired profile")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn each_allocation_gets_its_own_directory() {
        let dir = tempdir().unwrap();
        let manager = ProfileManager::with_default_ttl(dir.path()).unwrap();
        let first = manager.allocate().unwrap();
        let second = manager.allocate().unwrap();
        assert_ne!(first.path(), second.path());
        first.touch().await.unwrap();
        assert!(first.path().join(".last_used").exists());

        let path = first.path().to_path_buf();
        first.discard().await.unwrap();
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn zero_ttl_sweeps_existing_profiles() {
        let dir = tempdir().unwrap();
        let manager = ProfileManager::new(dir.path(), Duration::ZERO).unwrap();
        let profile = manager.allocate().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.cleanup_expired().unwrap(), 1);
        assert!(!profile.path().exists());
    }
}
