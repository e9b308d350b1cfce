use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store::AddressStore;
use crate::CaptureResult;

/// Subdirectories the fuzzer expects under a target directory.
pub const TARGET_SUBDIRS: [&str; 4] = ["crashes", "inputs", "outputs", "state"];
pub const DUMP_FILE: &str = "mem.dmp";

/// A fuzzing target directory and the executable it snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotTarget {
    dir: PathBuf,
    program: String,
    base: u64,
    /// Function offsets relative to the load base.
    symbols: BTreeMap<String, u64>,
}

impl SnapshotTarget {
    pub fn new(root: &Path, name: &str, program: &str, base: u64) -> Self {
        Self {
            dir: root.join(name),
            program: program.to_string(),
            base,
            symbols: BTreeMap::new(),
        }
    }

    pub fn with_symbols(mut self, symbols: BTreeMap<String, u64>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.join("state")
    }

    pub fn dump_path(&self) -> PathBuf {
        self.state_dir().join(DUMP_FILE)
    }

    pub fn create_dirs(&self) -> CaptureResult<()> {
        for sub in TARGET_SUBDIRS {
            std::fs::create_dir_all(self.dir.join(sub))?;
        }
        tracing::info!("Target directory ready at {:?}", self.dir);
        Ok(())
    }

    /// Record the load base and every relocated function address.
    pub fn seed_store(&self, store: &AddressStore) -> CaptureResult<()> {
        let mut entries = vec![(self.program.clone(), self.base)];
        entries.extend(
            self.symbols
                .iter()
                .map(|(name, rva)| (name.clone(), self.base.wrapping_add(*rva))),
        );
        tracing::info!(
            "Seeding address store with {} entries for {}",
            entries.len(),
            self.program
        );
        store.merge_addresses(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dirs_and_seed() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("qsnap-target-{}", nonce));
        let symbols = BTreeMap::from([("main".to_string(), 0x1189), ("usage".to_string(), 0x1100)]);
        let target =
            SnapshotTarget::new(&root, "tiff", "tiffinfo", 0x5555_5555_4000).with_symbols(symbols);

        target.create_dirs().unwrap();
        for sub in TARGET_SUBDIRS {
            assert!(root.join("tiff").join(sub).is_dir());
        }
        assert_eq!(target.dump_path(), root.join("tiff/state/mem.dmp"));

        let store = AddressStore::in_dir(&root);
        target.seed_store(&store).unwrap();
        assert_eq!(store.get_address("tiffinfo").unwrap(), Some(0x5555_5555_4000));
        assert_eq!(store.get_address("main").unwrap(), Some(0x5555_5555_5189));
        assert_eq!(store.get_address("usage").unwrap(), Some(0x5555_5555_5100));

        let _ = std::fs::remove_dir_all(&root);
    }
}
