//! # Snapshot Cache - Discovery, Reconciliation and Eviction
//!
//! Snapshot images accumulate under the cache root as jobs fetch or produce
//! them. This module bounds that cache.
//!
//! ## Discovery
//!
//! Every directory exactly [`SNAPSHOT_CACHE_DEPTH`] levels below the root
//! (`<dist>/<release>/<arch>`) whose name is a UUID is one entry. Its size
//! is the recursive sum of its file sizes.
//!
//! ## Reconciliation
//!
//! The remote catalog is authoritative. An entry is **valid** iff its id is
//! an image of some upstream snapshot, and **active** iff that snapshot is
//! marked active. Valid entries also learn their creation time and class
//! (project).
//!
//! ## Eviction
//!
//! Phases run in order, each on what the previous left behind:
//!
//! | Phase | Removes                                                          |
//! |-------|------------------------------------------------------------------|
//! | 1     | every invalid entry                                              |
//! | 2     | every entry older than the TTL, oldest first                     |
//! | 3     | per class over quota: oldest non-active entries until at quota  |
//! | 4     | while over the overall quota: the largest non-active entry       |
//!
//! Active entries are never removed, but their size still counts against
//! both quotas.

use crate::api::JobService;
use crate::constants::{REMOTE_DATETIME_FORMAT, SNAPSHOT_CACHE_DEPTH};
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

// =============================================================================
// Entries
// =============================================================================

/// One cached snapshot image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    pub id: Uuid,
    pub path: PathBuf,
    /// Total size of the files below `path`, in bytes.
    pub size: u64,
    /// Remote creation time; `None` for entries unknown upstream.
    pub date_created: Option<NaiveDateTime>,
    pub is_active: bool,
    pub is_valid: bool,
    /// Owning class (project).
    pub project: Option<Uuid>,
}

/// Upstream facts about one image.
struct Upstream {
    project: Uuid,
    date_created: Option<NaiveDateTime>,
    is_active: bool,
}

/// Recursive size of the files under `path`.
fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// Finds every snapshot directory below `root`, sorted by path.
fn scan(root: &Path) -> Result<Vec<(Uuid, PathBuf, u64)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let depth = SNAPSHOT_CACHE_DEPTH + 1;
    let mut found = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(depth)
        .max_depth(depth)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        let Ok(id) = Uuid::parse_str(&name) else {
            warn!("Skipping non-snapshot directory {}", entry.path().display());
            continue;
        };

        let size = directory_size(entry.path())?;
        found.push((id, entry.into_path(), size));
    }
    Ok(found)
}

// =============================================================================
// Eviction Policy
// =============================================================================

/// Bounds applied by [`SnapshotCache::cleanup`]. Unset bounds skip their
/// phase.
#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    /// Overall size ceiling, in bytes.
    pub max_disk: Option<u64>,
    /// Size ceiling per class, in bytes.
    pub max_disk_per_class: Option<u64>,
    /// Maximum age by remote creation time.
    pub ttl: Option<chrono::Duration>,
    /// Compute decisions without touching the disk.
    pub dry_run: bool,
}

/// Why an entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Absent from the remote catalog.
    Invalid,
    /// Older than the TTL.
    Expired,
    /// Its class exceeded the per-class quota.
    ClassQuota,
    /// The cache exceeded the overall quota.
    DiskQuota,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::Expired => write!(f, "expired"),
            Self::ClassQuota => write!(f, "class quota"),
            Self::DiskQuota => write!(f, "disk quota"),
        }
    }
}

/// One eviction decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub id: Uuid,
    pub size: u64,
    pub reason: EvictionReason,
}

/// Outcome of a cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed entries in removal order.
    pub evicted: Vec<Eviction>,
    /// Cache size after the run.
    pub remaining_bytes: u64,
    /// True if the overall quota could not be met (only active entries left).
    pub over_quota: bool,
}

impl EvictionReport {
    /// Bytes released by the run.
    pub fn freed_bytes(&self) -> u64 {
        self.evicted.iter().map(|e| e.size).sum()
    }
}

// =============================================================================
// Cache
// =============================================================================

/// The on-disk snapshot cache reconciled against the remote catalog.
pub struct SnapshotCache {
    root: PathBuf,
    service: Arc<dyn JobService>,
    snapshots: Vec<SnapshotImage>,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>, service: Arc<dyn JobService>) -> Self {
        Self {
            root: root.into(),
            service,
            snapshots: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current entries, ordered by path.
    pub fn snapshots(&self) -> &[SnapshotImage] {
        &self.snapshots
    }

    /// Sum of the entry sizes.
    pub fn total_size(&self) -> u64 {
        self.snapshots.iter().map(|s| s.size).sum()
    }

    /// Scans the cache root and reconciles the entries against the remote
    /// catalog. The catalog is fetched only if the cache is not empty.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing snapshot cache at {}", self.root.display());

        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| Error::Internal(format!("cache scan task failed: {}", e)))??;

        let mut upstream: HashMap<Uuid, Upstream> = HashMap::new();
        if !found.is_empty() {
            info!("Fetching upstream snapshot metadata");
            for record in self.service.list_snapshots().await? {
                let date_created =
                    match NaiveDateTime::parse_from_str(&record.date_created, REMOTE_DATETIME_FORMAT) {
                        Ok(date) => Some(date),
                        Err(e) => {
                            warn!(
                                "Snapshot {} has unparseable creation date '{}': {}",
                                record.id, record.date_created, e
                            );
                            None
                        }
                    };
                for image in &record.images {
                    upstream.insert(
                        image.id,
                        Upstream {
                            project: record.project.id,
                            date_created,
                            is_active: record.is_active,
                        },
                    );
                }
            }
        }

        self.snapshots = found
            .into_iter()
            .map(|(id, path, size)| {
                let remote = upstream.get(&id);
                SnapshotImage {
                    id,
                    path,
                    size,
                    date_created: remote.and_then(|u| u.date_created),
                    is_active: remote.is_some_and(|u| u.is_active),
                    is_valid: remote.is_some(),
                    project: remote.map(|u| u.project),
                }
            })
            .collect();

        info!(
            "{} items found in cache ({} bytes)",
            self.snapshots.len(),
            self.total_size()
        );
        Ok(())
    }

    /// Removes one entry, wiping its directory when `on_disk` is set.
    ///
    /// Removing an active or unknown entry is an integrity violation.
    pub fn remove(&mut self, id: Uuid, on_disk: bool) -> Result<SnapshotImage> {
        let index = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::CacheIntegrity {
                id: id.to_string(),
                reason: "not in cache".to_string(),
            })?;

        if self.snapshots[index].is_active {
            return Err(Error::CacheIntegrity {
                id: id.to_string(),
                reason: "snapshot is active".to_string(),
            });
        }

        info!("Removing snapshot {}", id);
        if on_disk {
            std::fs::remove_dir_all(&self.snapshots[index].path)?;
        }
        Ok(self.snapshots.remove(index))
    }

    fn evict(
        &mut self,
        id: Uuid,
        reason: EvictionReason,
        policy: &EvictionPolicy,
        report: &mut EvictionReport,
    ) -> Result<()> {
        let removed = self.remove(id, !policy.dry_run)?;
        report.evicted.push(Eviction {
            id,
            size: removed.size,
            reason,
        });
        Ok(())
    }

    /// Applies the eviction phases. `now` is the reference time for the TTL.
    pub fn cleanup(&mut self, policy: &EvictionPolicy, now: NaiveDateTime) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();

        // Phase 1: entries unknown upstream
        let invalid: Vec<Uuid> = self
            .snapshots
            .iter()
            .filter(|s| !s.is_valid && !s.is_active)
            .map(|s| s.id)
            .collect();
        for id in invalid {
            self.evict(id, EvictionReason::Invalid, policy, &mut report)?;
        }

        // Phase 2: expired entries, oldest first
        if let Some(ttl) = policy.ttl {
            let mut expired: Vec<(NaiveDateTime, Uuid)> = self
                .snapshots
                .iter()
                .filter(|s| !s.is_active)
                .filter_map(|s| s.date_created.map(|d| (d, s.id)))
                .filter(|(created, _)| now - *created > ttl)
                .collect();
            expired.sort();
            for (_, id) in expired {
                self.evict(id, EvictionReason::Expired, policy, &mut report)?;
            }
        }

        // Phase 3: per-class quota, oldest first within each class
        if let Some(class_quota) = policy.max_disk_per_class {
            let mut class_size: HashMap<Uuid, u64> = HashMap::new();
            let mut queues: HashMap<Uuid, Vec<(Option<NaiveDateTime>, Uuid, u64)>> = HashMap::new();
            for s in &self.snapshots {
                let Some(project) = s.project else { continue };
                *class_size.entry(project).or_default() += s.size;
                if !s.is_active {
                    queues
                        .entry(project)
                        .or_default()
                        .push((s.date_created, s.id, s.size));
                }
            }

            let mut classes: Vec<Uuid> = class_size.keys().copied().collect();
            classes.sort();
            for project in classes {
                let mut size = class_size[&project];
                if size <= class_quota {
                    continue;
                }

                let mut queue: VecDeque<_> = {
                    let mut entries = queues.remove(&project).unwrap_or_default();
                    entries.sort();
                    entries.into()
                };
                while size > class_quota {
                    let Some((_, id, entry_size)) = queue.pop_front() else {
                        warn!("Class {} stays over quota: only active snapshots left", project);
                        break;
                    };
                    self.evict(id, EvictionReason::ClassQuota, policy, &mut report)?;
                    size -= entry_size;
                }
            }
        }

        // Phase 4: overall quota, largest first
        if let Some(max_disk) = policy.max_disk {
            while self.total_size() > max_disk {
                let largest = self
                    .snapshots
                    .iter()
                    .filter(|s| !s.is_active)
                    .max_by_key(|s| s.size)
                    .map(|s| s.id);
                let Some(id) = largest else {
                    warn!("Cache stays over quota: only active snapshots left");
                    report.over_quota = true;
                    break;
                };
                self.evict(id, EvictionReason::DiskQuota, policy, &mut report)?;
            }
        }

        report.remaining_bytes = self.total_size();
        Ok(report)
    }
}
