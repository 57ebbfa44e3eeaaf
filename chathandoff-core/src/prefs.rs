//! Durable client-side key/value storage and the two typed views over it:
//! the remembered app variant and the in-flight verification code.

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{AppVariant, LaunchPayload, VerificationCode, link::parse_dispatch_url};

pub const PREFERENCE_KEY: &str = "chat_app_variant";
pub const VERIFY_CODE_KEY: &str = "verify_code";
pub const PENDING_DISPATCH_KEY: &str = "pending_dispatch_url";
pub const REFERRAL_CODE_KEY: &str = "referral_code";

/// The store file only ever holds a handful of short strings.
pub const MAX_STORE_FILE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("read {path} failed: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("store file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("store file is not valid JSON: {0}")]
    Parse(serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(serde_json::Error),
    #[error("write {path} failed: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk. Survives restarts; a corrupt file reads as an error and is
/// replaced wholesale on the next write.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if meta.len() > MAX_STORE_FILE_BYTES {
            return Err(StoreError::TooLarge {
                size: meta.len(),
                max: MAX_STORE_FILE_BYTES,
            });
        }

        let data = fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&data).map_err(StoreError::Parse)
    }

    fn load_for_update(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match self.load() {
            Ok(map) => Ok(map),
            Err(err @ (StoreError::Parse(_) | StoreError::TooLarge { .. })) => {
                warn!(path = %self.path.display(), "discarding unreadable store file: {err}");
                Ok(BTreeMap::new())
            }
            Err(err) => Err(err),
        }
    }

    fn save_with_retry(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        const MAX_ATTEMPTS: u32 = 3;
        const BACKOFF_BASE_MS: u64 = 50;

        let payload = serde_json::to_string_pretty(map).map_err(StoreError::Serialize)?;
        let mut attempt = 1;
        loop {
            match self.save_once(payload.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
                Err(err) => {
                    debug!(attempt, "store write failed, retrying: {err}");
                    let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    attempt += 1;
                }
            }
        }
    }

    fn save_once(&self, payload: &[u8]) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)
    }

    fn update(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut map = self.load_for_update()?;
        mutate(&mut map);
        self.save_with_retry(&map)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// Reads a key, folding storage failures into "absent". Nothing in the handoff may fail
/// because the browser profile's storage is unavailable.
fn read_lenient(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, "store read failed, treating as empty: {err}");
            None
        }
    }
}

/// The remembered app variant: ask once, keep it until a launch proves it wrong.
#[derive(Clone)]
pub struct PreferenceStore {
    store: Arc<dyn KeyValueStore>,
}

impl PreferenceStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn get(&self) -> Option<AppVariant> {
        let raw = read_lenient(self.store.as_ref(), PREFERENCE_KEY)?;
        let variant = AppVariant::from_stored(&raw);
        if variant.is_none() {
            warn!(value = %raw, "ignoring unrecognised stored app variant");
        }
        variant
    }

    pub fn set(&self, variant: AppVariant) -> Result<(), StoreError> {
        self.store.set(PREFERENCE_KEY, variant.as_str())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(PREFERENCE_KEY)
    }
}

/// In-flight verification state that must survive a page refresh.
#[derive(Clone)]
pub struct CodeStore {
    store: Arc<dyn KeyValueStore>,
}

impl CodeStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn code(&self) -> Option<VerificationCode> {
        read_lenient(self.store.as_ref(), VERIFY_CODE_KEY)
            .filter(|code| !code.trim().is_empty())
    }

    pub fn set_code(&self, code: &str) -> Result<(), StoreError> {
        self.store.set(VERIFY_CODE_KEY, code)
    }

    pub fn clear_code(&self) -> Result<(), StoreError> {
        self.store.remove(VERIFY_CODE_KEY)?;
        self.store.remove(PENDING_DISPATCH_KEY)
    }

    pub fn set_pending_dispatch(&self, dispatch_url: &str) -> Result<(), StoreError> {
        self.store.set(PENDING_DISPATCH_KEY, dispatch_url)
    }

    /// Hands out the pending launch exactly once, so a refresh does not reopen the app.
    pub fn take_pending_dispatch(&self) -> Option<LaunchPayload> {
        let raw = read_lenient(self.store.as_ref(), PENDING_DISPATCH_KEY)?;
        if let Err(err) = self.store.remove(PENDING_DISPATCH_KEY) {
            warn!("failed to drop pending dispatch url: {err}");
        }
        let payload = parse_dispatch_url(&raw);
        if payload.is_none() {
            warn!(url = %raw, "pending dispatch url is not a valid link");
        }
        payload
    }

    pub fn referral_code(&self) -> Option<String> {
        read_lenient(self.store.as_ref(), REFERRAL_CODE_KEY)
            .filter(|code| !code.trim().is_empty())
    }

    pub fn set_referral_code(&self, referral_code: &str) -> Result<(), StoreError> {
        self.store.set(REFERRAL_CODE_KEY, referral_code)
    }

    pub fn clear_after_verification(&self) -> Result<(), StoreError> {
        self.clear_code()?;
        self.store.remove(REFERRAL_CODE_KEY)
    }
}
