#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Versioned file cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! {root}/{kind}/{fingerprint}.{hex(version)}.{created_millis}.mpk
//! ```
//!
//! Versions longer than 64 bytes are named `h{sha256(version)}` instead
//! of their hex form, keeping every name well under the usual 255-byte
//! file name limit. The envelope always holds the full version.
//!
//! Every write creates a new file, so an entry for an older upstream
//! version is never replaced in place; stale files are removed by
//! [`CacheStore::sweep`]. Files hold a `MessagePack` envelope carrying
//! the fingerprint, version, creation time and payload. Writes land in a
//! `.mpk.tmp` file first; the sweep also removes old leftovers of those.

pub mod key;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::IntoEnumIterator;

pub use key::{ArtifactKind, CacheKey};

const EXTENSION: &str = "mpk";
const TEMP_EXTENSION: &str = "mpk.tmp";

/// Longest version, in bytes, stored hex-encoded in a file name.
const MAX_PLAIN_VERSION_BYTES: usize = 64;

/// Marks a hashed version tag. Never a hex digit.
const HASHED_VERSION_PREFIX: char = 'h';

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem error on a specific path.
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// Payload could not be encoded.
    #[error("Cache encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A stored entry could not be decoded.
    #[error("Cache decode error in {path}: {source}")]
    Decode {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        source: rmp_serde::decode::Error,
    },

    /// Nothing is stored for the key.
    #[error("No cached {kind} entries for {fingerprint}")]
    NotFound {
        /// Artifact kind, or `any` across all kinds.
        kind: String,
        /// Key fingerprint.
        fingerprint: String,
    },

    /// Some expired entries could not be deleted.
    #[error("Failed to delete {} expired cache entries", failures.len())]
    Sweep {
        /// Each entry that was left behind.
        failures: Vec<SweepFailure>,
    },
}

/// An entry the sweeper failed to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    /// File that is still present.
    pub path: PathBuf,
    /// Reason reported by the filesystem.
    pub reason: String,
}

/// Outcome of a successful sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries deleted.
    pub removed: usize,
    /// Entries young enough to keep.
    pub kept: usize,
    /// Abandoned temp files deleted.
    pub temp_removed: usize,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    fingerprint: &'a str,
    version: &'a str,
    created_at: DateTime<Utc>,
    payload: &'a T,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    fingerprint: String,
    version: String,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    payload: T,
}

/// A cache file, described by its name.
#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    name: String,
    fingerprint: String,
    version_tag: String,
    created_millis: i64,
}

impl Entry {
    /// Parses `{fingerprint}.{tag}.{millis}.{extension}`.
    fn parse(path: PathBuf, extension: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let stem = name.strip_suffix(&format!(".{extension}"))?;
        let mut parts = stem.splitn(3, '.');
        let fingerprint = parts.next()?.to_string();
        let version_tag = parts.next()?.to_string();
        let created_millis = parts.next()?.parse().ok()?;
        Some(Self {
            path,
            name,
            fingerprint,
            version_tag,
            created_millis,
        })
    }

    /// The version, from the name when it is hex-encoded or from the
    /// envelope when it is hashed.
    fn version(&self) -> Option<String> {
        if self.version_tag.starts_with(HASHED_VERSION_PREFIX) {
            return self.stored_version();
        }
        hex::decode(&self.version_tag)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    fn stored_version(&self) -> Option<String> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Cannot read cache entry {}: {e}", self.name);
                return None;
            }
        };
        match rmp_serde::from_slice::<VersionOnly>(&bytes) {
            Ok(envelope) => Some(envelope.version),
            Err(e) => {
                log::warn!("Cannot decode cache entry {}: {e}", self.name);
                None
            }
        }
    }
}

/// File name segment for `version`: its hex form, or a SHA-256 digest
/// when the hex form would make the name too long.
fn version_tag(version: &str) -> String {
    if version.len() <= MAX_PLAIN_VERSION_BYTES {
        hex::encode(version)
    } else {
        format!(
            "{HASHED_VERSION_PREFIX}{}",
            hex::encode(Sha256::digest(version.as_bytes()))
        )
    }
}

fn file_name(fingerprint: &str, version: &str, created_millis: i64) -> String {
    format!(
        "{fingerprint}.{}.{created_millis}.{EXTENSION}",
        version_tag(version)
    )
}

/// Deletes an expired file, recording a failure. Returns whether it was
/// deleted.
fn remove_expired(path: PathBuf, failures: &mut Vec<SweepFailure>) -> bool {
    match fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to delete cache file {}: {e}", path.display());
            failures.push(SweepFailure {
                path,
                reason: e.to_string(),
            });
            false
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed artifact cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    actuality: Duration,
}

impl CacheStore {
    /// Cache rooted at `root`; entries older than `actuality` are never
    /// served.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, actuality: Duration) -> Self {
        Self {
            root: root.into(),
            actuality,
        }
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maximum age of a servable entry.
    #[must_use]
    pub const fn actuality(&self) -> Duration {
        self.actuality
    }

    fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.as_ref())
    }

    /// Persists `payload` as a new entry for `key` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or any filesystem step fails.
    pub fn write<T: Serialize>(
        &self,
        kind: ArtifactKind,
        key: &CacheKey,
        version: &str,
        payload: &T,
    ) -> Result<PathBuf, CacheError> {
        self.write_at(kind, key, version, payload, Utc::now())
    }

    /// [`Self::write`] with an explicit creation time.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or any filesystem step fails.
    pub fn write_at<T: Serialize>(
        &self,
        kind: ArtifactKind,
        key: &CacheKey,
        version: &str,
        payload: &T,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, CacheError> {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let fingerprint = key.fingerprint();
        let bytes = rmp_serde::to_vec_named(&EnvelopeRef {
            fingerprint: &fingerprint,
            version,
            created_at: now,
            payload,
        })?;

        let mut created_millis = now.timestamp_millis();
        let mut path = dir.join(file_name(&fingerprint, version, created_millis));
        while path.exists() {
            created_millis += 1;
            path = dir.join(file_name(&fingerprint, version, created_millis));
        }

        let tmp = path.with_extension(TEMP_EXTENSION);
        fs::write(&tmp, &bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;

        log::debug!("Cached {kind} {fingerprint} @ {version} ({} bytes)", bytes.len());
        Ok(path)
    }

    /// Returns the payload stored for exactly `version`, if it is within
    /// the actuality window.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be listed or the
    /// matching entry cannot be read or decoded.
    pub fn read_if_current<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        key: &CacheKey,
        version: &str,
    ) -> Result<Option<T>, CacheError> {
        self.read_if_current_at(kind, key, version, Utc::now())
    }

    /// [`Self::read_if_current`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be listed or the
    /// matching entry cannot be read or decoded.
    pub fn read_if_current_at<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        key: &CacheKey,
        version: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, CacheError> {
        let fingerprint = key.fingerprint();
        let tag = version_tag(version);

        let Some(entry) = self
            .entries(kind)?
            .into_iter()
            .filter(|e| e.fingerprint == fingerprint && e.version_tag == tag)
            .max_by_key(|e| e.created_millis)
        else {
            log::debug!("Cache miss: {kind} {fingerprint} @ {version}");
            return Ok(None);
        };

        if now.timestamp_millis() - entry.created_millis > self.actuality.num_milliseconds() {
            log::debug!("Cache entry {} is past actuality", entry.name);
            return Ok(None);
        }

        let bytes = fs::read(&entry.path).map_err(io_error(&entry.path))?;
        let envelope: Envelope<T> =
            rmp_serde::from_slice(&bytes).map_err(|source| CacheError::Decode {
                path: entry.path.clone(),
                source,
            })?;

        if envelope.fingerprint != fingerprint || envelope.version != version {
            log::warn!("Cache entry {} does not match its name, ignoring", entry.name);
            return Ok(None);
        }

        log::debug!("Cache hit: {}", entry.name);
        Ok(Some(envelope.payload))
    }

    /// Most recent version stored for `key`: the greatest version string,
    /// the newest file among equal versions. Entries whose version cannot
    /// be recovered are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be listed.
    pub fn latest_version(
        &self,
        kind: ArtifactKind,
        key: &CacheKey,
    ) -> Result<Option<String>, CacheError> {
        let fingerprint = key.fingerprint();
        Ok(self
            .entries(kind)?
            .into_iter()
            .filter(|e| e.fingerprint == fingerprint)
            .filter_map(|e| e.version().map(|version| (version, e.created_millis)))
            .max()
            .map(|(version, _)| version))
    }

    /// Removes every entry of `kind` stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if nothing was stored, or
    /// [`CacheError::Io`] if a file cannot be removed.
    pub fn delete(&self, kind: ArtifactKind, key: &CacheKey) -> Result<usize, CacheError> {
        let removed = self.delete_matching(kind, &key.fingerprint())?;
        if removed == 0 {
            return Err(CacheError::NotFound {
                kind: kind.to_string(),
                fingerprint: key.fingerprint(),
            });
        }
        Ok(removed)
    }

    /// Removes the entries of every kind stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if nothing was stored, or
    /// [`CacheError::Io`] if a file cannot be removed.
    pub fn delete_all(&self, key: &CacheKey) -> Result<usize, CacheError> {
        let fingerprint = key.fingerprint();
        let mut removed = 0;
        for kind in ArtifactKind::iter() {
            removed += self.delete_matching(kind, &fingerprint)?;
        }
        if removed == 0 {
            return Err(CacheError::NotFound {
                kind: "any".to_string(),
                fingerprint,
            });
        }
        log::info!("Deleted {removed} cache entries for {fingerprint}");
        Ok(removed)
    }

    fn delete_matching(&self, kind: ArtifactKind, fingerprint: &str) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in self.entries(kind)? {
            if entry.fingerprint == fingerprint {
                fs::remove_file(&entry.path).map_err(io_error(&entry.path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every entry older than `max_age`, current or not, and
    /// every temp file left behind by an interrupted write that is older
    /// than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Sweep`] listing the entries that could not
    /// be deleted, or [`CacheError::Io`] if a directory cannot be listed.
    pub fn sweep(&self, max_age: Duration) -> Result<SweepReport, CacheError> {
        self.sweep_at(max_age, Utc::now())
    }

    /// [`Self::sweep`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::sweep`].
    pub fn sweep_at(&self, max_age: Duration, now: DateTime<Utc>) -> Result<SweepReport, CacheError> {
        let cutoff = now.timestamp_millis() - max_age.num_milliseconds();
        let mut report = SweepReport::default();
        let mut failures = Vec::new();

        for kind in ArtifactKind::iter() {
            for entry in self.entries(kind)? {
                if entry.created_millis >= cutoff {
                    report.kept += 1;
                    continue;
                }
                if remove_expired(entry.path, &mut failures) {
                    report.removed += 1;
                }
            }
            for temp in self.list(kind, TEMP_EXTENSION)? {
                if temp.created_millis < cutoff && remove_expired(temp.path, &mut failures) {
                    report.temp_removed += 1;
                }
            }
        }

        if !failures.is_empty() {
            return Err(CacheError::Sweep { failures });
        }

        log::info!(
            "Cache sweep removed {} entries and {} temp files, kept {}",
            report.removed,
            report.temp_removed,
            report.kept
        );
        Ok(report)
    }

    /// Cache files of one kind. A missing directory has no entries.
    fn entries(&self, kind: ArtifactKind) -> Result<Vec<Entry>, CacheError> {
        self.list(kind, EXTENSION)
    }

    /// Files of one kind whose names end in `.{extension}`.
    fn list(&self, kind: ArtifactKind, extension: &str) -> Result<Vec<Entry>, CacheError> {
        let dir = self.kind_dir(kind);
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut entries = Vec::new();
        for item in read {
            let item = item.map_err(io_error(&dir))?;
            if let Some(entry) = Entry::parse(item.path(), extension) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
