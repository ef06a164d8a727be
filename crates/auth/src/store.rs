//! Durable persistence for [`AuthState`]: atomic JSON writes,
//! a one-shot in-memory cache invalidated by filesystem watch, and the
//! idempotent migration chain applied on load.
//!
//! The cross-process lock is realized with `fd-lock`'s `flock`-backed
//! `RwLock<File>` guarding the whole state file. Because the lock guard
//! must stay held across the async modifier callback, and Rust forbids
//! holding a borrowed guard across an `.await` without a self-referential
//! type, the whole locked section (acquire, load, run modifier, save)
//! executes inside a single blocking task, bridging back into async code
//! with `Handle::block_on` for the modifier itself.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use notify_debouncer_full::notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::state::AuthState;
use crate::token_hash::TokenHash;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What a `with_state_lock` modifier wants done with its result.
pub enum ModifierOutcome<T> {
    /// Persist `state`, then return `result`.
    Save { state: AuthState, result: T },
    /// Nothing changed; return `result` without writing.
    ReadOnly(T),
}

impl<T> ModifierOutcome<T> {
    pub fn save(state: AuthState, result: T) -> Self {
        Self::Save { state, result }
    }

    pub fn read_only(result: T) -> Self {
        Self::ReadOnly(result)
    }
}

#[derive(Clone)]
enum CacheSlot {
    Unknown,
    Value(Option<AuthState>),
}

/// Persists [`AuthState`] to `$DATA_DIR/<name>-auth.json` with a durable
/// single-writer discipline across both tasks and processes.
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    cache: Mutex<CacheSlot>,
    fifo: Mutex<()>,
    dirty: Arc<AtomicBool>,
    _watcher: Option<Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>>,
}

impl StateStore {
    /// Opens (without yet reading) the state file `<name>-auth.json` under
    /// `data_dir`. Starts a filesystem watcher on `data_dir`; watcher setup
    /// failure is logged and otherwise non-fatal.
    pub fn new(data_dir: &Path, name: &str) -> Self {
        let path = data_dir.join(format!("{name}-auth.json"));
        let lock_path = data_dir.join(format!("{name}-auth.json.lock"));
        let dirty = Arc::new(AtomicBool::new(false));

        let watcher = match Self::start_watcher(data_dir, &path, dirty.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "state file watcher unavailable, cache invalidation relies on lock acquisition only");
                None
            },
        };

        Self {
            path,
            lock_path,
            cache: Mutex::new(CacheSlot::Unknown),
            fifo: Mutex::new(()),
            dirty,
            _watcher: watcher,
        }
    }

    fn start_watcher(
        data_dir: &Path,
        state_path: &Path,
        dirty: Arc<AtomicBool>,
    ) -> anyhow::Result<Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>> {
        let target_name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for path in &event.paths {
                            if path.file_name() != Some(target_name.as_os_str()) {
                                continue;
                            }
                            if matches!(
                                event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            ) {
                                debug!(path = %path.display(), "state file changed on disk, invalidating cache");
                                dirty.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "state file watcher error");
                    }
                },
            },
        )?;

        fs::create_dir_all(data_dir)?;
        debouncer.watch(data_dir, RecursiveMode::NonRecursive)?;
        info!(dir = %data_dir.display(), "watching data directory for state file changes");
        Ok(debouncer)
    }

    /// Runs `modifier` under the full lock discipline: in-process FIFO
    /// ordering, cache invalidation, a fresh load, the modifier itself, and
    /// a conditional save — all under the cross-process lock. Errors from
    /// `modifier` propagate without breaking the FIFO chain: the mutex
    /// guard releases normally on any return path.
    pub async fn with_state_lock<T, F, Fut>(&self, modifier: F) -> Result<T, Error>
    where
        F: FnOnce(Option<AuthState>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ModifierOutcome<T>, Error>> + Send,
        T: Send + 'static,
    {
        let _fifo_guard = self.fifo.lock().await;

        // Every entry to the lock path invalidates the cache and reloads from
        // disk, unconditionally. `dirty` only exists so the watcher's debounce
        // window doesn't leave a stale `Unknown` reset racing a concurrent
        // load; it is not a condition for invalidating.
        self.dirty.store(false, Ordering::SeqCst);
        *self.cache.lock().await = CacheSlot::Unknown;

        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let handle = tokio::runtime::Handle::current();

        let (outcome, disk_state) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            let mut rw_lock = fd_lock::RwLock::new(lock_file);

            let deadline = Instant::now() + LOCK_TIMEOUT;
            let _write_guard = loop {
                match rw_lock.try_write() {
                    Ok(guard) => break guard,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(LOCK_POLL_INTERVAL);
                    },
                    Err(_) => return Err(Error::LockTimeout),
                }
            };

            let loaded = load_locked(&path)?;

            let outcome = handle.block_on(modifier(loaded.clone()))?;

            let final_state = match &outcome {
                ModifierOutcome::Save { state, .. } => {
                    save_locked(&path, state)?;
                    Some(state.clone())
                },
                ModifierOutcome::ReadOnly(_) => loaded,
            };

            Ok((outcome, final_state))
        })
        .await
        .map_err(|e| Error::message(format!("state lock task panicked: {e}")))??;

        *self.cache.lock().await = CacheSlot::Value(disk_state);

        match outcome {
            ModifierOutcome::Save { result, .. } => Ok(result),
            ModifierOutcome::ReadOnly(result) => Ok(result),
        }
    }
}

/// The full load path, run with the cross-process lock already held.
/// Cache handling is the caller's responsibility.
fn load_locked(path: &Path) -> Result<Option<AuthState>, Error> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if raw.trim().is_empty() {
        warn!(path = %path.display(), "state file is empty, treating as absent");
        return Ok(None);
    }

    let mut value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file is corrupt, treating as absent");
            return Ok(None);
        },
    };

    let now = now_ms();
    let migrated = run_migrations(&mut value, now);
    if migrated {
        fs::write(path, serde_json::to_string_pretty(&value)?)?;
        set_owner_only_permissions(path)?;
    }

    let state: AuthState = match serde_json::from_value(value) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file failed strict decode after migration, treating as absent");
            return Ok(None);
        },
    };

    let pruned = state.prune_expired_tokens(now).prune_expired_sessions(now);
    if pruned != state {
        save_locked(path, &pruned)?;
        return Ok(Some(pruned));
    }

    Ok(Some(state))
}

/// Serializes `state`, writes it to a sibling temp file with owner-only
/// permissions, then renames atomically over `path`.
fn save_locked(path: &Path, state: &AuthState) -> Result<(), Error> {
    let pid = std::process::id();
    let tmp_path = PathBuf::from(format!("{}.tmp.{pid}", path.display()));

    let json = serde_json::to_string_pretty(state)?;
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    set_owner_only_permissions(&tmp_path)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---- migrations ---------------------------------------------------------

fn run_migrations(value: &mut serde_json::Value, now: i64) -> bool {
    let steps: [fn(&mut serde_json::Value, i64) -> bool; 6] = [
        migrate_scalar_setup_token,
        migrate_plaintext_tokens,
        migrate_credential_metadata_backfill,
        migrate_orphaned_sessions,
        migrate_session_last_activity_backfill,
        migrate_setup_token_expiry_sweep,
    ];

    let mut changed = false;
    for step in steps {
        if step(value, now) {
            changed = true;
        }
    }
    changed
}

fn obj_mut(value: &mut serde_json::Value) -> Option<&mut serde_json::Map<String, serde_json::Value>> {
    value.as_object_mut()
}

/// Step 1: a legacy single `setupToken` string becomes a `setupTokens`
/// array with one sentinel entry whose hash can never match.
fn migrate_scalar_setup_token(value: &mut serde_json::Value, now: i64) -> bool {
    let Some(obj) = obj_mut(value) else { return false };
    let Some(scalar) = obj.get("setupToken").cloned() else {
        return false;
    };
    if !scalar.is_string() {
        obj.remove("setupToken");
        return false;
    }

    let sentinel = TokenHash::hash(&uuid::Uuid::new_v4().to_string());
    let entry = serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "hash": sentinel.hash_hex,
        "salt": sentinel.salt_hex,
        "name": "Legacy setup token",
        "createdAt": now,
        "lastUsedAt": now,
        "expiresAt": now,
        "credentialId": null,
    });

    let tokens = obj
        .entry("setupTokens")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let Some(arr) = tokens.as_array_mut() {
        arr.push(entry);
    }
    obj.remove("setupToken");
    true
}

/// Step 2: plaintext `token` fields on setup-token entries become
/// `{hash, salt}`.
fn migrate_plaintext_tokens(value: &mut serde_json::Value, _now: i64) -> bool {
    let Some(tokens) = obj_mut(value).and_then(|o| o.get_mut("setupTokens")) else {
        return false;
    };
    let Some(arr) = tokens.as_array_mut() else {
        return false;
    };

    let mut changed = false;
    for entry in arr {
        let Some(obj) = entry.as_object_mut() else { continue };
        let has_hash = obj.get("hash").is_some();
        let Some(plaintext) = obj.get("token").and_then(|v| v.as_str()).map(str::to_string) else {
            continue;
        };
        if !has_hash {
            let hashed = TokenHash::hash(&plaintext);
            obj.insert("hash".into(), serde_json::Value::String(hashed.hash_hex));
            obj.insert("salt".into(), serde_json::Value::String(hashed.salt_hex));
            changed = true;
        }
        obj.remove("token");
    }
    changed
}

/// Step 3: backfill missing `deviceId`/`name`/timestamps/`userAgent` on
/// credential records.
fn migrate_credential_metadata_backfill(value: &mut serde_json::Value, now: i64) -> bool {
    let Some(creds) = obj_mut(value).and_then(|o| o.get_mut("credentials")) else {
        return false;
    };
    let Some(arr) = creds.as_array_mut() else {
        return false;
    };

    let mut changed = false;
    for (i, entry) in arr.iter_mut().enumerate() {
        let Some(obj) = entry.as_object_mut() else { continue };
        let missing_device_id = !obj.contains_key("deviceId");
        let missing_name = !obj.contains_key("name");
        if missing_device_id || missing_name {
            obj.entry("deviceId").or_insert(serde_json::Value::Null);
            obj.entry("name")
                .or_insert_with(|| serde_json::Value::String(format!("Device {}", i + 1)));
            obj.entry("createdAt")
                .or_insert(serde_json::Value::Number(now.into()));
            obj.entry("lastUsedAt")
                .or_insert(serde_json::Value::Number(now.into()));
            obj.entry("userAgent")
                .or_insert_with(|| serde_json::Value::String("Unknown".into()));
            changed = true;
        }
    }
    changed
}

/// Step 4: drop sessions that are malformed or reference a credential that
/// no longer exists.
fn migrate_orphaned_sessions(value: &mut serde_json::Value, _now: i64) -> bool {
    let known_ids: Vec<String> = obj_mut(value)
        .and_then(|o| o.get("credentials"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.get("id").and_then(|v| v.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let Some(sessions) = obj_mut(value).and_then(|o| o.get_mut("sessions")) else {
        return false;
    };
    let Some(sessions_obj) = sessions.as_object_mut() else {
        return false;
    };

    let before = sessions_obj.len();
    sessions_obj.retain(|_, entry| {
        let Some(obj) = entry.as_object() else { return false };
        match obj.get("credentialId") {
            Some(serde_json::Value::String(id)) => known_ids.contains(id),
            _ => false,
        }
    });
    sessions_obj.len() != before
}

/// Step 5: backfill `lastActivityAt` on sessions missing it.
fn migrate_session_last_activity_backfill(value: &mut serde_json::Value, now: i64) -> bool {
    let Some(sessions) = obj_mut(value).and_then(|o| o.get_mut("sessions")) else {
        return false;
    };
    let Some(sessions_obj) = sessions.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    for entry in sessions_obj.values_mut() {
        let Some(obj) = entry.as_object_mut() else { continue };
        if !obj.contains_key("lastActivityAt") {
            obj.insert("lastActivityAt".into(), serde_json::Value::Number(now.into()));
            changed = true;
        }
    }
    changed
}

/// Step 6: fail-closed expiry sweep — a setup token without `expiresAt`, or
/// already expired, is dropped.
fn migrate_setup_token_expiry_sweep(value: &mut serde_json::Value, now: i64) -> bool {
    let Some(tokens) = obj_mut(value).and_then(|o| o.get_mut("setupTokens")) else {
        return false;
    };
    let Some(arr) = tokens.as_array_mut() else {
        return false;
    };

    let before = arr.len();
    arr.retain(|entry| match entry.get("expiresAt").and_then(|v| v.as_i64()) {
        Some(expires_at) => expires_at > now,
        None => false,
    });
    arr.len() != before
}
