//! # Build Environment Constants
//!
//! Defines the timeouts, paths, defaults, and protocol keys used across the
//! crate. These constants are the **single source of truth** for the bounds
//! every blocking operation runs under.
//!
//! ## Cross-References
//!
//! - [`crate::api`]: Uses retry and request timeouts
//! - [`crate::container`]: Uses startup/stop timeouts and image layout
//! - [`crate::log_shipper`]: Uses chunk size and idle interval
//! - [`crate::heartbeat`]: Uses the polling interval
//! - [`crate::orchestrator`]: Uses the cancellation grace period

use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every wait on the container runtime or the remote service is bounded.
// Build commands themselves are not: a CI build may legitimately run for
// hours and is only bounded by remote cancellation.
// =============================================================================

/// Time to wait for a started container to report an IPv4 address.
pub const NETWORK_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Time to wait for a stopped container to reach `STOPPED`.
pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request timeout for the remote job service.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period granted to the execution task after the remote side
/// reports the job as finished.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Polling
// =============================================================================

/// Interval between remote status polls of the cancellation monitor.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Longest the log drain loop sleeps when idle and not closed.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between network-address probes while a container boots.
pub const NETWORK_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Remote Job Service
// =============================================================================

/// Maximum number of attempts per remote request (first try included).
///
/// Delays between attempts grow as `attempt²` seconds: 1, 4, 9, 16.
pub const API_MAX_ATTEMPTS: u32 = 5;

/// Unit of the quadratic retry backoff.
pub const API_RETRY_UNIT: Duration = Duration::from_secs(1);

/// Maximum size of one shipped log chunk, in bytes.
pub const LOG_CHUNK_SIZE: usize = 4096;

/// Source label attached to every shipped log chunk.
pub const LOG_SOURCE: &str = "console";

/// Environment variable holding the default API base URL.
pub const API_URL_ENV: &str = "CHANGES_API_URL";

/// Environment variable holding the default snapshot bucket.
pub const S3_BUCKET_ENV: &str = "CHANGES_S3_BUCKET";

/// Binary run inside the container for remote jobs without a command.
pub const CI_CLIENT_BIN: &str = "changes-client";

// =============================================================================
// Image Cache Layout
// =============================================================================
//
// Snapshots are stored the way the LXC `download` template expects its
// cache, so a cached snapshot can be instantiated without network access:
//
//   <SNAPSHOT_CACHE_ROOT>/<dist>/<release>/<arch>/<snapshot-id>/
//       rootfs.tar.xz
//       config
//       snapshot_id
// =============================================================================

/// Root of the on-disk snapshot cache.
pub const SNAPSHOT_CACHE_ROOT: &str = "/var/cache/lxc/download";

/// Distribution every image is built from.
pub const DEFAULT_DIST: &str = "ubuntu";

/// Release used when neither the job nor the caller names one.
pub const DEFAULT_RELEASE: &str = "precise";

/// User build commands run as unless told otherwise.
pub const DEFAULT_USER: &str = "ubuntu";

/// Compressed rootfs archive inside a cached image.
pub const IMAGE_ROOTFS_ARCHIVE: &str = "rootfs.tar.xz";

/// LXC configuration fragment inside a cached image.
pub const IMAGE_CONFIG_FILE: &str = "config";

/// Marker holding the uts name the image was taken from.
pub const IMAGE_ID_MARKER: &str = "snapshot_id";

/// Files that must all be present for a local image to count as complete.
///
/// Partial presence always forces a re-fetch from the object store.
pub const IMAGE_MANIFEST: [&str; 3] = [IMAGE_ROOTFS_ARCHIVE, IMAGE_CONFIG_FILE, IMAGE_ID_MARKER];

/// Depth of snapshot directories below the cache root (dist/release/arch).
pub const SNAPSHOT_CACHE_DEPTH: usize = 3;

/// Compression level for `rootfs.tar.xz`.
pub const IMAGE_XZ_LEVEL: u32 = 6;

/// Timestamp format of snapshot creation dates in the remote catalog.
pub const REMOTE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

// =============================================================================
// Container Environment
// =============================================================================

/// `PATH` inside the container for every attached command.
pub const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Template used for clean containers.
pub const CLEAN_TEMPLATE: &str = "ubuntu";

/// Template used to instantiate cached snapshots.
pub const SNAPSHOT_TEMPLATE: &str = "download";

/// Device cgroup rules appended so builds can use loop devices.
///
/// `c 10:137` is `/dev/loop-control`, `b 6:*` are the loop block devices.
pub const LOOP_DEVICE_RULES: [&str; 2] = ["c 10:137 rwm", "b 6:* rwm"];

/// Packages installed into every container after boot.
pub const BASELINE_PACKAGES: [&str; 1] = ["ca-certificates"];

/// Contents of the sudo policy written into every container.
pub const SUDOERS_POLICY: &str = "Defaults    env_reset\n\
Defaults    !requiretty\n\
\n\
# Allow all sudoers.\n\
ALL  ALL=(ALL) NOPASSWD:ALL\n";

// =============================================================================
// LXC Configuration Keys
// =============================================================================

/// Root filesystem location (plain path or `overlayfs:base:delta`).
pub const LXC_ROOTFS_KEY: &str = "lxc.rootfs";

/// AppArmor profile key.
pub const LXC_APPARMOR_KEY: &str = "lxc.aa_profile";

/// Device cgroup allow-list key.
pub const LXC_DEVICES_ALLOW_KEY: &str = "lxc.cgroup.devices.allow";

/// Default location of LXC container definitions.
pub const LXC_PATH: &str = "/var/lib/lxc";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when container names are used in filesystem paths.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

// =============================================================================
// Container Name Validation Helper
// =============================================================================

/// Validates a container name for safety.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure the container name is safe"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}
