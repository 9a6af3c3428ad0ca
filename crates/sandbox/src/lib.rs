use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = "sandbox.json";
pub const SANDBOX_VERSION: u32 = 1;

const SESSIONS_DIR: &str = "sessions";
const TEMP_DIR: &str = "temp";
const CACHE_DIR: &str = "cache";
const STATE_DIR: &str = "state";
const LOGS_DIR: &str = "logs";
const CREDENTIALS_DIR: &str = "credentials";
const CONFIG_DIR: &str = "config";
const KEYS_DIR: &str = "keys";

const INSTANCE_KEY_FILE: &str = "instance.key";
const INSTANCE_ID_FILE: &str = "instance.id";
const INSTANCE_KEY_BYTES: usize = 32;
const FINGERPRINT_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid worker id `{worker_id}`")]
    InvalidWorkerId { worker_id: String },
    #[error("failed to create sandbox directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove `{path}`: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sandbox metadata at `{path}` is not valid JSON: {source}")]
    ParseMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("instance key at `{path}` is corrupt: expected {expected} hex bytes")]
    CorruptInstanceKey { path: PathBuf, expected: usize },
    #[error("sandbox serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata persisted as `sandbox.json` in each sandbox root. Field names
/// are the on-disk contract shared with external tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMetadata {
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
}

/// Persistent per-sandbox identity: a 32-byte private key plus a unique
/// instance id string. Generated on first initialization and reused for the
/// life of the sandbox root, so a restarted worker keeps its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub key: Vec<u8>,
}

impl InstanceIdentity {
    /// First 8 bytes of the private key rendered as hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key[..FINGERPRINT_BYTES.min(self.key.len())])
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`. Applied to all
/// externally-supplied file names before joining them under a sandbox
/// subdirectory; this is the path-traversal defense.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Session ids are stricter: `[A-Za-z0-9_-]` only (no dots).
pub fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One worker's private filesystem root. No two workers share a sandbox and
/// nothing in it leaks outside `<base>/<workerId>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSandbox {
    worker_id: String,
    root: PathBuf,
}

impl WorkerSandbox {
    pub fn new(
        base_dir: impl AsRef<Path>,
        worker_id: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let worker_id = worker_id.into();
        validate_worker_id(&worker_id)?;
        Ok(Self {
            root: base_dir.as_ref().join(&worker_id),
            worker_id,
        })
    }

    /// Wrap an existing sandbox root, e.g. the one handed to a child in its
    /// worker configuration.
    pub fn from_root(
        root: impl Into<PathBuf>,
        worker_id: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let worker_id = worker_id.into();
        validate_worker_id(&worker_id)?;
        Ok(Self {
            root: root.into(),
            worker_id,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join(CREDENTIALS_DIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.state_dir().join(format!("{}.json", sanitize_name(name)))
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir().join(sanitize_name(name))
    }

    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_dir().join(sanitize_name(name))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", sanitize_name(name)))
    }

    pub fn credential_path(&self, name: &str) -> PathBuf {
        self.credentials_dir().join(sanitize_name(name))
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir().join(sanitize_name(name))
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Create the directory layout, ensure the persistent identity and write
    /// `sandbox.json`. Idempotent: an existing sandbox keeps its `createdAt`
    /// and its instance key.
    pub fn initialize(&self) -> Result<SandboxMetadata, SandboxError> {
        for dir in [
            self.root.clone(),
            self.sessions_dir(),
            self.temp_dir(),
            self.cache_dir(),
            self.state_dir(),
            self.logs_dir(),
            self.credentials_dir(),
            self.config_dir(),
            self.keys_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| SandboxError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        let identity = self.ensure_identity()?;
        let previous = self.metadata()?;
        let now = Utc::now();
        let metadata = SandboxMetadata {
            worker_id: self.worker_id.clone(),
            created_at: previous.as_ref().map(|m| m.created_at).unwrap_or(now),
            last_accessed: now,
            version: SANDBOX_VERSION,
            key_fingerprint: Some(identity.fingerprint()),
        };
        self.write_metadata(&metadata)?;

        info!(
            worker_id = %self.worker_id,
            root = %self.root.display(),
            fresh = previous.is_none(),
            "sandbox initialized"
        );
        Ok(metadata)
    }

    /// Read `sandbox.json`. Returns `None` when the sandbox has never been
    /// initialized.
    pub fn metadata(&self) -> Result<Option<SandboxMetadata>, SandboxError> {
        let path = self.metadata_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SandboxError::ReadFile { path, source }),
        };
        let metadata =
            serde_json::from_str(&contents).map_err(|source| SandboxError::ParseMetadata {
                path,
                source,
            })?;
        Ok(Some(metadata))
    }

    /// Load the persistent identity, generating key and id on first use.
    pub fn ensure_identity(&self) -> Result<InstanceIdentity, SandboxError> {
        let key_path = self.keys_dir().join(INSTANCE_KEY_FILE);
        let key = match fs::read_to_string(&key_path) {
            Ok(encoded) => {
                let decoded = hex::decode(encoded.trim()).map_err(|_| {
                    SandboxError::CorruptInstanceKey {
                        path: key_path.clone(),
                        expected: INSTANCE_KEY_BYTES,
                    }
                })?;
                if decoded.len() != INSTANCE_KEY_BYTES {
                    return Err(SandboxError::CorruptInstanceKey {
                        path: key_path,
                        expected: INSTANCE_KEY_BYTES,
                    });
                }
                decoded
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let mut bytes = vec![0u8; INSTANCE_KEY_BYTES];
                rand::rng().fill_bytes(&mut bytes);
                write_private(&key_path, hex::encode(&bytes).as_bytes())?;
                debug!(worker_id = %self.worker_id, "generated instance key");
                bytes
            }
            Err(source) => {
                return Err(SandboxError::ReadFile {
                    path: key_path,
                    source,
                });
            }
        };

        let id_path = self.keys_dir().join(INSTANCE_ID_FILE);
        let instance_id = match fs::read_to_string(&id_path) {
            Ok(existing) => existing.trim().to_owned(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let mut suffix = [0u8; 4];
                rand::rng().fill_bytes(&mut suffix);
                let generated =
                    format!("{}-{}-{}", self.worker_id, unix_ms(), hex::encode(suffix));
                write_private(&id_path, generated.as_bytes())?;
                generated
            }
            Err(source) => {
                return Err(SandboxError::ReadFile {
                    path: id_path,
                    source,
                });
            }
        };

        Ok(InstanceIdentity { instance_id, key })
    }

    /// Update `lastAccessed`. No-op for an uninitialized sandbox.
    pub fn touch(&self) -> Result<(), SandboxError> {
        if let Some(mut metadata) = self.metadata()? {
            metadata.last_accessed = Utc::now();
            self.write_metadata(&metadata)?;
        }
        Ok(())
    }

    /// Read a named state document. Missing or unparsable files yield `None`
    /// rather than an error.
    pub fn read_state(&self, name: &str) -> Option<Value> {
        let contents = fs::read_to_string(self.state_path(name)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn write_state(&self, name: &str, value: &Value) -> Result<(), SandboxError> {
        let path = self.state_path(name);
        let contents = serde_json::to_string_pretty(value)?;
        fs::write(&path, contents).map_err(|source| SandboxError::WriteFile { path, source })
    }

    /// Session ids present on disk, in sorted order.
    pub fn list_sessions(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.sessions_dir()) else {
            return Vec::new();
        };
        let mut sessions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_owned)
            })
            .collect();
        sessions.sort();
        sessions
    }

    pub fn clear_temp(&self) -> Result<(), SandboxError> {
        recreate_dir(&self.temp_dir())
    }

    pub fn clear_cache(&self) -> Result<(), SandboxError> {
        recreate_dir(&self.cache_dir())
    }

    /// Remove the entire sandbox root, identity included.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SandboxError::Remove {
                path: self.root.clone(),
                source,
            }),
        }
    }

    /// Environment overlay inherited by the worker process. Re-roots HOME,
    /// the XDG base directories and TMPDIR inside the sandbox so any library
    /// honoring those variables cannot touch the host user's configuration.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let path_of = |path: PathBuf| path.to_string_lossy().into_owned();

        env.insert("MOLTBOT_WORKER_ID".to_owned(), self.worker_id.clone());
        env.insert(
            "MOLTBOT_SANDBOX_DIR".to_owned(),
            path_of(self.root.clone()),
        );
        env.insert(
            "MOLTBOT_SESSIONS_DIR".to_owned(),
            path_of(self.sessions_dir()),
        );
        env.insert("MOLTBOT_TEMP_DIR".to_owned(), path_of(self.temp_dir()));
        env.insert("MOLTBOT_CACHE_DIR".to_owned(), path_of(self.cache_dir()));
        env.insert("MOLTBOT_STATE_DIR".to_owned(), path_of(self.state_dir()));
        env.insert("MOLTBOT_LOGS_DIR".to_owned(), path_of(self.logs_dir()));
        env.insert(
            "MOLTBOT_CREDENTIALS_DIR".to_owned(),
            path_of(self.credentials_dir()),
        );
        env.insert("MOLTBOT_CONFIG_DIR".to_owned(), path_of(self.config_dir()));
        env.insert("MOLTBOT_KEYS_DIR".to_owned(), path_of(self.keys_dir()));

        env.insert("HOME".to_owned(), path_of(self.root.clone()));
        env.insert("XDG_CONFIG_HOME".to_owned(), path_of(self.config_dir()));
        env.insert("XDG_DATA_HOME".to_owned(), path_of(self.state_dir()));
        env.insert("XDG_STATE_HOME".to_owned(), path_of(self.state_dir()));
        env.insert("XDG_CACHE_HOME".to_owned(), path_of(self.cache_dir()));
        env.insert("TMPDIR".to_owned(), path_of(self.temp_dir()));
        env.insert(
            "MOLTBOT_OAUTH_DIR".to_owned(),
            path_of(self.credentials_dir()),
        );
        env
    }

    fn write_metadata(&self, metadata: &SandboxMetadata) -> Result<(), SandboxError> {
        let path = self.metadata_path();
        let contents = serde_json::to_string_pretty(metadata)?;
        fs::write(&path, contents).map_err(|source| SandboxError::WriteFile { path, source })
    }
}

/// Creates and garbage-collects the per-worker sandboxes under one base
/// directory.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    base_dir: PathBuf,
}

impl SandboxManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ensure_base(&self) -> Result<(), SandboxError> {
        fs::create_dir_all(&self.base_dir).map_err(|source| SandboxError::CreateDir {
            path: self.base_dir.clone(),
            source,
        })
    }

    pub fn sandbox(&self, worker_id: &str) -> Result<WorkerSandbox, SandboxError> {
        WorkerSandbox::new(&self.base_dir, worker_id)
    }

    /// Destroy every sandbox whose `lastAccessed` is older than `max_age`.
    /// Roots without readable metadata are left alone. Returns the worker
    /// ids that were removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<Vec<String>, SandboxError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SandboxError::ReadFile {
                    path: self.base_dir.clone(),
                    source,
                });
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = Vec::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let worker_id = entry.file_name().to_string_lossy().into_owned();
            let Ok(sandbox) = WorkerSandbox::new(&self.base_dir, &worker_id) else {
                continue;
            };
            let metadata = match sandbox.metadata() {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(error) => {
                    warn!(worker_id = %worker_id, error = %error, "skipping sandbox with unreadable metadata");
                    continue;
                }
            };
            if metadata.last_accessed < cutoff {
                sandbox.destroy()?;
                info!(worker_id = %worker_id, "stale sandbox removed");
                removed.push(worker_id);
            }
        }
        removed.sort();
        Ok(removed)
    }
}

fn validate_worker_id(worker_id: &str) -> Result<(), SandboxError> {
    if worker_id.trim().is_empty()
        || worker_id.contains('/')
        || worker_id.contains('\\')
        || worker_id.contains("..")
    {
        return Err(SandboxError::InvalidWorkerId {
            worker_id: worker_id.to_owned(),
        });
    }
    Ok(())
}

fn recreate_dir(dir: &Path) -> Result<(), SandboxError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SandboxError::Remove {
                path: dir.to_path_buf(),
                source,
            });
        }
    }
    fs::create_dir_all(dir).map_err(|source| SandboxError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), SandboxError> {
    fs::write(path, contents).map_err(|source| SandboxError::WriteFile {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            SandboxError::WriteFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use serde_json::json;

    use super::*;

    fn temp_base(label: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = env::temp_dir().join(format!(
            "moltbot-sandbox-{label}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("temp base should be creatable");
        path
    }

    #[test]
    fn initialize_creates_the_full_layout() {
        let base = temp_base("layout");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");
        let metadata = sandbox.initialize().expect("initialize should succeed");

        for dir in [
            sandbox.sessions_dir(),
            sandbox.temp_dir(),
            sandbox.cache_dir(),
            sandbox.state_dir(),
            sandbox.logs_dir(),
            sandbox.credentials_dir(),
            sandbox.config_dir(),
            sandbox.keys_dir(),
        ] {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }
        assert_eq!(metadata.worker_id, "worker-0");
        assert_eq!(metadata.version, SANDBOX_VERSION);
        assert!(metadata.key_fingerprint.is_some());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn reinitialize_preserves_created_at_and_instance_key() {
        let base = temp_base("persistence");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");

        let first = sandbox.initialize().expect("first initialize should succeed");
        let first_key = fs::read_to_string(sandbox.keys_dir().join(INSTANCE_KEY_FILE))
            .expect("key file should exist");
        let first_id = sandbox
            .ensure_identity()
            .expect("identity should load")
            .instance_id;

        let second = sandbox
            .initialize()
            .expect("second initialize should succeed");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_accessed >= first.last_accessed);

        let second_key = fs::read_to_string(sandbox.keys_dir().join(INSTANCE_KEY_FILE))
            .expect("key file should exist");
        assert_eq!(second_key, first_key);
        assert_eq!(first_key.trim().len(), INSTANCE_KEY_BYTES * 2);
        let second_id = sandbox
            .ensure_identity()
            .expect("identity should load")
            .instance_id;
        assert_eq!(second_id, first_id);
        assert!(second_id.starts_with("worker-0-"));

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn destroy_then_initialize_starts_a_fresh_sandbox() {
        let base = temp_base("destroy");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");

        let first = sandbox.initialize().expect("initialize should succeed");
        let first_fingerprint = first.key_fingerprint.clone();
        sandbox.destroy().expect("destroy should succeed");
        assert!(!sandbox.root().exists());

        let second = sandbox.initialize().expect("re-initialize should succeed");
        assert!(second.created_at >= first.created_at);
        // A destroyed sandbox loses its identity; a new key is generated.
        assert_ne!(second.key_fingerprint, None);
        assert_ne!(second.key_fingerprint, first_fingerprint);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn traversal_attempts_stay_under_the_sandbox_root() {
        let base = temp_base("traversal");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");

        let path = sandbox.session_path("../../../etc/passwd");
        assert!(path.starts_with(sandbox.sessions_dir()));
        let file_name = path
            .file_name()
            .expect("path should have a file name")
            .to_string_lossy()
            .into_owned();
        assert_eq!(file_name, "_________etc_passwd.json");

        let state = sandbox.state_path("../escape");
        assert!(state.starts_with(sandbox.state_dir()));
        let cache = sandbox.cache_path("/absolute/name");
        assert!(cache.starts_with(sandbox.cache_dir()));

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn session_ids_reject_dots_while_names_keep_them() {
        assert_eq!(sanitize_session_id("chat.42"), "chat_42");
        assert_eq!(sanitize_name("notes.v2.json"), "notes.v2.json");
        assert_eq!(sanitize_name("a b/c"), "a_b_c");
    }

    #[test]
    fn state_round_trips_and_missing_state_reads_as_none() {
        let base = temp_base("state");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");
        sandbox.initialize().expect("initialize should succeed");

        assert!(sandbox.read_state("missing").is_none());
        sandbox
            .write_state("progress", &json!({ "step": 3 }))
            .expect("state should write");
        let value = sandbox.read_state("progress").expect("state should read");
        assert_eq!(value["step"], 3);

        fs::write(sandbox.state_path("broken"), "{not json").expect("file should write");
        assert!(sandbox.read_state("broken").is_none());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn clear_temp_recreates_an_empty_directory() {
        let base = temp_base("clear");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");
        sandbox.initialize().expect("initialize should succeed");

        fs::write(sandbox.temp_path("scratch"), b"data").expect("file should write");
        sandbox.clear_temp().expect("clear_temp should succeed");
        assert!(sandbox.temp_dir().is_dir());
        assert_eq!(
            fs::read_dir(sandbox.temp_dir())
                .expect("temp dir should list")
                .count(),
            0
        );

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn environment_re_roots_standard_variables_inside_the_sandbox() {
        let base = temp_base("env");
        let sandbox = WorkerSandbox::new(&base, "worker-3").expect("sandbox should construct");
        let env = sandbox.environment();

        assert_eq!(env["MOLTBOT_WORKER_ID"], "worker-3");
        assert_eq!(env["HOME"], sandbox.root().to_string_lossy());
        assert_eq!(env["TMPDIR"], sandbox.temp_dir().to_string_lossy());
        assert_eq!(
            env["XDG_CONFIG_HOME"],
            sandbox.config_dir().to_string_lossy()
        );
        assert_eq!(
            env["MOLTBOT_OAUTH_DIR"],
            sandbox.credentials_dir().to_string_lossy()
        );
        for value in env.values() {
            if value.starts_with('/') {
                assert!(
                    Path::new(value).starts_with(sandbox.root()),
                    "{value} escapes the sandbox root"
                );
            }
        }

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn list_sessions_reflects_files_on_disk() {
        let base = temp_base("sessions");
        let sandbox = WorkerSandbox::new(&base, "worker-0").expect("sandbox should construct");
        sandbox.initialize().expect("initialize should succeed");

        assert!(sandbox.list_sessions().is_empty());
        fs::write(sandbox.session_path("alpha"), b"{}").expect("session should write");
        fs::write(sandbox.session_path("beta"), b"{}").expect("session should write");
        assert_eq!(sandbox.list_sessions(), vec!["alpha", "beta"]);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn cleanup_removes_only_stale_sandboxes() {
        let base = temp_base("cleanup");
        let manager = SandboxManager::new(&base);
        manager.ensure_base().expect("base should exist");

        let fresh = manager.sandbox("worker-0").expect("sandbox should construct");
        fresh.initialize().expect("initialize should succeed");

        let stale = manager.sandbox("worker-1").expect("sandbox should construct");
        let mut metadata = stale.initialize().expect("initialize should succeed");
        metadata.last_accessed = Utc::now() - chrono::Duration::hours(48);
        fs::write(
            stale.root().join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata).expect("metadata should serialize"),
        )
        .expect("metadata should write");

        let removed = manager
            .cleanup(Duration::from_secs(24 * 60 * 60))
            .expect("cleanup should succeed");
        assert_eq!(removed, vec!["worker-1"]);
        assert!(fresh.root().exists());
        assert!(!stale.root().exists());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn worker_ids_with_separators_are_rejected() {
        let base = temp_base("ids");
        assert!(WorkerSandbox::new(&base, "../escape").is_err());
        assert!(WorkerSandbox::new(&base, "a/b").is_err());
        assert!(WorkerSandbox::new(&base, "  ").is_err());
        let _ = fs::remove_dir_all(base);
    }
}
