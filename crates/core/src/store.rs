//! Address/symbol store shared between independently run capture tools.
//!
//! A flat JSON object on disk. Every update is a read-merge-write round trip
//! taken under an advisory lock file; keys are never removed.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{CaptureError, CaptureResult};

pub const SYMBOL_STORE_FILE: &str = "symbol-store.json";

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY: Duration = Duration::from_millis(20);

pub type StoreEntries = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct AddressStore {
    path: PathBuf,
}

impl AddressStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SYMBOL_STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; a missing or unreadable file reads as empty.
    pub fn load(&self) -> CaptureResult<StoreEntries> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreEntries::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(StoreEntries::new());
        }
        match serde_json::from_slice(&data) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!("Ignoring unparsable address store {:?}: {}", self.path, e);
                Ok(StoreEntries::new())
            }
        }
    }

    pub fn merge<I>(&self, entries: I) -> CaptureResult<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let _lock = StoreLock::acquire(&self.path)?;
        let mut current = self.load()?;
        let before = current.len();
        current.extend(entries);
        tracing::debug!(
            "Address store {:?}: {} keys ({} new)",
            self.path,
            current.len(),
            current.len() - before
        );

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&current)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Merge addresses, stored as `0x` hex strings.
    pub fn merge_addresses<I, K>(&self, entries: I) -> CaptureResult<()>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        self.merge(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(format!("{:#x}", v)))),
        )
    }

    pub fn get_address(&self, key: &str) -> CaptureResult<Option<u64>> {
        Ok(self.load()?.get(key).and_then(value_as_address))
    }
}

fn value_as_address(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => qsnap_config::parse_u64(s).ok(),
        _ => None,
    }
}

struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path) -> CaptureResult<Self> {
        let path = store.with_extension("json.lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age > LOCK_STALE_AFTER) {
                        tracing::warn!("Breaking stale address store lock {:?}", path);
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        return Err(CaptureError::StoreLocked(path));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store(tag: &str) -> AddressStore {
        let nonce = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("qsnap-store-{}-{}", tag, nonce));
        std::fs::create_dir_all(&dir).unwrap();
        AddressStore::in_dir(&dir)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = temp_store("missing");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_merge_accumulates_and_is_idempotent() {
        let store = temp_store("merge");
        store.merge([("a".to_string(), json!(1))]).unwrap();
        store.merge([("b".to_string(), json!(2))]).unwrap();

        let first = std::fs::read(store.path()).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&first).unwrap(),
            json!({"a": 1, "b": 2})
        );

        store.merge([("a".to_string(), json!(1))]).unwrap();
        assert_eq!(std::fs::read(store.path()).unwrap(), first);
    }

    #[test]
    fn test_merge_overwrites_existing_key() {
        let store = temp_store("overwrite");
        store.merge_addresses([("entry_syscall", 0x1000)]).unwrap();
        store.merge_addresses([("entry_syscall", 0xffffffff81e00000)]).unwrap();
        assert_eq!(
            store.get_address("entry_syscall").unwrap(),
            Some(0xffffffff81e00000)
        );
        assert_eq!(store.load().unwrap()["entry_syscall"], "0xffffffff81e00000");
    }

    #[test]
    fn test_garbage_file_reads_empty_then_recovers() {
        let store = temp_store("garbage");
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().unwrap().is_empty());
        store.merge_addresses([("tiffinfo", 0x555555554000)]).unwrap();
        assert_eq!(store.get_address("tiffinfo").unwrap(), Some(0x555555554000));
    }

    #[test]
    fn test_lock_released_after_merge() {
        let store = temp_store("lock");
        store.merge([("k".to_string(), json!("v"))]).unwrap();
        assert!(!store.path().with_extension("json.lock").exists());
    }
}
