//! Durable key-value store for upkeep.
//!
//! This crate provides a trait-based abstraction over the on-device
//! key-value store, allowing alternative backends (LMDB, sqlite) to be
//! plugged in later.
//!
//! The default backend keeps the whole map in a single JSON file and
//! rewrites it atomically (write to a temporary file in the same
//! directory, then rename), so a write transaction is either fully
//! visible or not at all after a crash.
//!
//! # Example
//!
//! ```
//! use upkeep_store::{FileStore, Store};
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let store = FileStore::open(dir.path()).expect("open");
//!
//! store.write("artifact-name", b"release-7").expect("write");
//! assert_eq!(store.read("artifact-name").expect("read"), Some(b"release-7".to_vec()));
//!
//! store.write_transaction(&mut |txn| {
//!     txn.write("artifact-name", b"release-8")?;
//!     txn.remove("state_data")?;
//!     Ok(())
//! }).expect("txn");
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// File name of the serialized map inside the store directory.
pub const STORE_FILE: &str = "store.json";

/// A transaction handle passed to [`Store::write_transaction`] closures.
///
/// All operations are applied to a staged copy of the map; nothing is
/// visible to readers until the closure returns `Ok` and the staged map
/// is committed in a single atomic rename.
pub struct Transaction<'a> {
    staged: &'a mut BTreeMap<String, Vec<u8>>,
}

impl Transaction<'_> {
    /// Read a key from the staged map.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.staged.get(key).cloned())
    }

    /// Write a key into the staged map.
    pub fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Remove a key from the staged map. Removing an absent key is not an error.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.staged.remove(key);
        Ok(())
    }
}

/// Capabilities the update client requires from durable storage.
pub trait Store {
    /// Read a value, `None` when the key is absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a single key. Equivalent to a one-operation transaction.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a single key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Run `f` against a staged copy of the map and commit the result
    /// atomically. If `f` returns an error nothing is committed.
    fn write_transaction(&self, f: &mut dyn FnMut(&mut Transaction) -> Result<()>) -> Result<()>;
}

/// File-backed store keeping the whole map in one JSON document.
///
/// Values are hex-encoded on disk so the file stays valid JSON for
/// arbitrary byte values.
pub struct FileStore {
    path: PathBuf,
    map: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) a store in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store dir {}", dir.display()))?;
        let path = dir.join(STORE_FILE);
        let map = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read store file {}", path.display()))?;
            decode_map(&content)
                .with_context(|| format!("failed to parse store file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            map: RefCell::new(map),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let encoded: BTreeMap<&String, String> =
            map.iter().map(|(k, v)| (k, hex::encode(v))).collect();
        let data =
            serde_json::to_vec_pretty(&encoded).context("failed to serialize store map")?;

        let dir = self
            .path
            .parent()
            .context("store file has no parent directory")?;
        let tmp = dir.join(format!("{STORE_FILE}.tmp"));
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            f.write_all(&data)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            f.sync_all()
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }
}

fn decode_map(content: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    let encoded: BTreeMap<String, String> =
        serde_json::from_str(content).context("store file is not a JSON object")?;
    let mut map = BTreeMap::new();
    for (k, v) in encoded {
        let bytes = hex::decode(&v).with_context(|| format!("invalid hex value for key {k}"))?;
        map.insert(k, bytes);
    }
    Ok(map)
}

impl Store for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_transaction(&mut |txn| txn.write(key, value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write_transaction(&mut |txn| txn.remove(key))
    }

    fn write_transaction(&self, f: &mut dyn FnMut(&mut Transaction) -> Result<()>) -> Result<()> {
        let mut staged = self.map.borrow().clone();
        {
            let mut txn = Transaction {
                staged: &mut staged,
            };
            f(&mut txn)?;
        }
        self.persist(&staged)?;
        *self.map.borrow_mut() = staged;
        Ok(())
    }
}

/// In-memory store for tests and dry runs. Same semantics as
/// [`FileStore`] minus durability.
#[derive(Default)]
pub struct MemStore {
    map: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.borrow_mut().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.borrow_mut().remove(key);
        Ok(())
    }

    fn write_transaction(&self, f: &mut dyn FnMut(&mut Transaction) -> Result<()>) -> Result<()> {
        let mut staged = self.map.borrow().clone();
        {
            let mut txn = Transaction {
                staged: &mut staged,
            };
            f(&mut txn)?;
        }
        *self.map.borrow_mut() = staged;
        Ok(())
    }
}
