//! Reservations over the staging area's byte budget.
//!
//! Incoming deal data lands in the staging directory before it is handed to
//! the sealing pipeline. The directory is one mountpoint with a fixed byte
//! budget configured at startup; every online deal tags its advertised
//! transfer size against that budget before its download file is created.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageManagerError {
    #[error("no space left: requested {requested} bytes, {free} free of {max}")]
    NoSpaceLeft { requested: u64, free: u64, max: u64 },

    #[error("no storage tagged for deal {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StorageManagerConfig {
    /// Directory the deal downloads are staged in.
    pub staging_root: PathBuf,
    /// Total bytes the staging area may hold.
    pub max_bytes: u64,
}

struct Ledger {
    free: u64,
    tagged: HashMap<Uuid, u64>,
}

pub struct StorageManager {
    cfg: StorageManagerConfig,
    ledger: Mutex<Ledger>,
}

impl StorageManager {
    /// Create the manager, creating the staging directory if needed.
    pub async fn new(cfg: StorageManagerConfig) -> Result<Self, StorageManagerError> {
        tokio::fs::create_dir_all(&cfg.staging_root).await?;
        let free = cfg.max_bytes;
        Ok(Self {
            cfg,
            ledger: Mutex::new(Ledger {
                free,
                tagged: HashMap::new(),
            }),
        })
    }

    pub fn staging_root(&self) -> &Path {
        &self.cfg.staging_root
    }

    /// Reserve `size` bytes of the staging budget for the deal.
    pub fn tag(&self, deal_uuid: Uuid, size: u64) -> Result<(), StorageManagerError> {
        let mut ledger = self.ledger.lock().expect("staging ledger lock is never poisoned");
        if ledger.tagged.contains_key(&deal_uuid) {
            return Ok(());
        }
        if size > ledger.free {
            return Err(StorageManagerError::NoSpaceLeft {
                requested: size,
                free: ledger.free,
                max: self.cfg.max_bytes,
            });
        }
        ledger.free -= size;
        ledger.tagged.insert(deal_uuid, size);
        Ok(())
    }

    /// Release the deal's reservation, returning how many bytes it held.
    ///
    /// Returns [`StorageManagerError::NotFound`] when nothing is tagged;
    /// the caller layer treats that as a successful no-op.
    pub fn untag(&self, deal_uuid: Uuid) -> Result<u64, StorageManagerError> {
        let mut ledger = self.ledger.lock().expect("staging ledger lock is never poisoned");
        let size = ledger
            .tagged
            .remove(&deal_uuid)
            .ok_or(StorageManagerError::NotFound(deal_uuid))?;
        ledger.free += size;
        Ok(size)
    }

    /// Re-establish a reservation when rebuilding the ledger on startup.
    /// Unlike [`StorageManager::tag`] this never fails: the reservation
    /// existed before the restart and must exist after it.
    pub fn restore_tag(&self, deal_uuid: Uuid, size: u64) {
        let mut ledger = self.ledger.lock().expect("staging ledger lock is never poisoned");
        if ledger.tagged.insert(deal_uuid, size).is_none() {
            ledger.free = ledger.free.saturating_sub(size);
        }
    }

    /// Where the deal's data is downloaded to. A pure function of the
    /// staging root and the deal UUID, so the path cannot collide with any
    /// other deal's.
    pub fn download_file_path(&self, deal_uuid: Uuid) -> PathBuf {
        self.cfg.staging_root.join(format!("{deal_uuid}.car"))
    }

    pub fn free(&self) -> u64 {
        self.ledger
            .lock()
            .expect("staging ledger lock is never poisoned")
            .free
    }

    pub fn total_tagged(&self) -> u64 {
        let ledger = self.ledger.lock().expect("staging ledger lock is never poisoned");
        ledger.tagged.values().sum()
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    async fn init_manager(max_bytes: u64) -> (tempfile::TempDir, StorageManager) {
        let tmp_dir = tempdir().unwrap();
        let manager = StorageManager::new(StorageManagerConfig {
            staging_root: tmp_dir.path().join("staging"),
            max_bytes,
        })
        .await
        .unwrap();
        (tmp_dir, manager)
    }

    #[tokio::test]
    async fn tag_and_untag_track_the_budget() {
        let (_tmp, manager) = init_manager(100).await;

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        manager.tag(first, 60).unwrap();
        assert_eq!(manager.free(), 40);
        assert_eq!(manager.total_tagged(), 60);

        manager.tag(second, 40).unwrap();
        assert_eq!(manager.free(), 0);

        assert_eq!(manager.untag(first).unwrap(), 60);
        assert_eq!(manager.free(), 60);
        assert_eq!(manager.total_tagged(), 40);

        // Untagging twice is a typed no-op.
        assert!(matches!(
            manager.untag(first),
            Err(StorageManagerError::NotFound(uuid)) if uuid == first
        ));
        assert_eq!(manager.free(), 60);
    }

    #[tokio::test]
    async fn over_budget_tags_are_refused() {
        let (_tmp, manager) = init_manager(100).await;

        manager.tag(Uuid::new_v4(), 80).unwrap();
        let err = manager.tag(Uuid::new_v4(), 30).unwrap_err();
        assert!(matches!(
            err,
            StorageManagerError::NoSpaceLeft {
                requested: 30,
                free: 20,
                max: 100,
            }
        ));
        // The refused tag took nothing.
        assert_eq!(manager.free(), 20);
    }

    #[tokio::test]
    async fn download_paths_are_per_deal() {
        let (_tmp, manager) = init_manager(100).await;
        let deal_uuid = Uuid::new_v4();

        let path = manager.download_file_path(deal_uuid);
        assert_eq!(path, manager.download_file_path(deal_uuid));
        assert!(path.starts_with(manager.staging_root()));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("{deal_uuid}.car")
        );
        assert_ne!(path, manager.download_file_path(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn restore_bypasses_the_space_check() {
        let (_tmp, manager) = init_manager(100).await;
        let deal_uuid = Uuid::new_v4();

        manager.restore_tag(deal_uuid, 150);
        assert_eq!(manager.free(), 0);
        assert_eq!(manager.total_tagged(), 150);

        assert_eq!(manager.untag(deal_uuid).unwrap(), 150);
    }
}
