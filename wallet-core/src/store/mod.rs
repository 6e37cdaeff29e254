//! Encrypted per-wallet record stores (history, contacts).
//!
//! Records live in memory between [`EncryptedStore::load`] and
//! [`EncryptedStore::write`]; the file on disk is only touched by those two
//! calls. Files are sealed with the wallet data key, so a store can only be
//! read while its wallet is open.

pub mod contacts;
pub mod history;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, DataKey, SealedBox};
use crate::errors::{WalletError, WalletResult};
use crate::storage::write_atomic;

pub use contacts::Contact;
pub use history::HistoryEntry;

const STORE_MAGIC: &[u8; 8] = b"HDSTORE1";
const STORE_VERSION: u16 = 1;

/// A uniquely identified, free-text searchable record.
pub trait StoreRecord: Clone + Serialize + DeserializeOwned + Send {
    /// Record kind written into the file header.
    const KIND: &'static str;
    /// File name inside the wallet directory.
    const FILE_NAME: &'static str;

    fn id(&self) -> Uuid;

    /// Every textual field a filter query is matched against.
    fn searchable_text(&self) -> Vec<&str>;

    fn matches(&self, lowercase_query: &str) -> bool {
        self.searchable_text()
            .iter()
            .any(|field| field.to_lowercase().contains(lowercase_query))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreEnvelope {
    magic: [u8; 8],
    version: u16,
    kind: String,
    sealed: SealedBox,
}

/// In-memory record set backed by one encrypted file.
pub struct EncryptedStore<R: StoreRecord> {
    path: PathBuf,
    key: DataKey,
    records: Vec<R>,
}

impl<R: StoreRecord> EncryptedStore<R> {
    /// Bind a store to its file in `wallet_dir`. Nothing is read until `load`.
    pub fn open(wallet_dir: &Path, key: DataKey) -> Self {
        Self {
            path: wallet_dir.join(R::FILE_NAME),
            key,
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory set with the file contents.
    ///
    /// A missing file is an empty store. Anything unreadable fails with
    /// [`WalletError::StoreCorrupt`] and leaves memory untouched.
    pub fn load(&mut self) -> WalletResult<&[R]> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.records.clear();
                return Ok(&self.records);
            }
            Err(err) => return Err(err.into()),
        };

        self.records = self.decode(&bytes)?;
        log::debug!(
            "Loaded {} {} records from {}",
            self.records.len(),
            R::KIND,
            self.path.display()
        );
        Ok(&self.records)
    }

    /// Add a record, replacing one with the same id in place.
    pub fn add(&mut self, record: R) {
        match self.records.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Remove every record matching `predicate`; returns how many went.
    pub fn remove<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&R) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|record| !predicate(record));
        before - self.records.len()
    }

    pub fn get(&self, id: Uuid) -> Option<&R> {
        self.records.iter().find(|r| r.id() == id)
    }

    /// Case-insensitive substring match over every textual field, in store order.
    pub fn filter(&self, query: &str) -> Vec<R> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return self.records.clone();
        }
        self.records
            .iter()
            .filter(|record| record.matches(&needle))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[R] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist the in-memory set with a temp-write-then-swap.
    pub fn write(&self) -> WalletResult<()> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&self.records)?);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            version: STORE_VERSION,
            kind: R::KIND.to_string(),
            sealed: crypto::seal(&self.key, &plaintext)?,
        };
        let serialized = serde_json::to_vec(&envelope)?;
        write_atomic(&self.path, &serialized)?;
        log::debug!(
            "Wrote {} {} records to {}",
            self.records.len(),
            R::KIND,
            self.path.display()
        );
        Ok(())
    }

    /// Drop the in-memory records. The file is left alone.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn decode(&self, bytes: &[u8]) -> WalletResult<Vec<R>> {
        let corrupt = |reason: String| WalletError::StoreCorrupt {
            path: self.path.clone(),
            reason,
        };

        let envelope: StoreEnvelope =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        if &envelope.magic != STORE_MAGIC {
            return Err(corrupt("invalid magic marker".to_string()));
        }
        if envelope.version != STORE_VERSION {
            return Err(corrupt(format!("unsupported version {}", envelope.version)));
        }
        if envelope.kind != R::KIND {
            return Err(corrupt(format!(
                "expected {} records, found {}",
                R::KIND,
                envelope.kind
            )));
        }

        let plaintext =
            crypto::open(&self.key, &envelope.sealed).map_err(|e| corrupt(e.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| corrupt(e.to_string()))
    }
}

impl<R: StoreRecord> std::fmt::Debug for EncryptedStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("kind", &R::KIND)
            .field("path", &self.path)
            .field("records", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_data_key;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    fn demo_history(store: &mut EncryptedStore<HistoryEntry>) {
        for description in [
            "Wallet opened",
            "Payment 1 received",
            "Contact added",
            "Payment 2 sent",
            "Backup created",
            "Label 1 changed",
        ] {
            store.add(HistoryEntry::new(description));
        }
    }

    fn clone_key(key: &DataKey) -> DataKey {
        Zeroizing::new(**key)
    }

    #[test]
    fn write_clear_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = generate_data_key();
        let mut store = EncryptedStore::<HistoryEntry>::open(dir.path(), clone_key(&key));
        demo_history(&mut store);

        let mut entry = HistoryEntry::new("Round trip");
        entry.set_notes("dippy");
        store.add(entry.clone());
        let before: Vec<(Uuid, String, String)> = store
            .all()
            .iter()
            .map(|e| (e.id, e.description.clone(), e.notes.clone()))
            .collect();

        store.write().unwrap();
        store.clear();
        assert!(store.is_empty());

        store.load().unwrap();
        let after: Vec<(Uuid, String, String)> = store
            .all()
            .iter()
            .map(|e| (e.id, e.description.clone(), e.notes.clone()))
            .collect();
        assert_eq!(before, after);

        let reloaded = store.filter(&entry.description);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].id, entry.id);
        assert_eq!(reloaded[0].notes, "dippy");
    }

    #[test]
    fn filter_is_case_insensitive_and_ordered() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<HistoryEntry>::open(dir.path(), generate_data_key());
        demo_history(&mut store);

        let matches = store.filter("1");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].description, "Payment 1 received");
        assert_eq!(matches[1].description, "Label 1 changed");

        assert_eq!(store.filter("PAYMENT").len(), 2);
        let everything = store.filter("");
        assert_eq!(everything.len(), 6);
        assert_eq!(everything[0].description, "Wallet opened");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<Contact>::open(dir.path(), generate_data_key());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn clear_does_not_delete_file() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<Contact>::open(dir.path(), generate_data_key());
        store.add(Contact::new("Alice"));
        store.write().unwrap();
        store.clear();
        assert!(store.path().exists());
    }

    #[test]
    fn corrupt_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<HistoryEntry>::open(dir.path(), generate_data_key());
        store.add(HistoryEntry::new("kept in memory"));
        fs::write(store.path(), b"{ not a store").unwrap();

        match store.load() {
            Err(WalletError::StoreCorrupt { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("expected StoreCorrupt, got {:?}", other.map(|r| r.len())),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn wrong_key_is_treated_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<Contact>::open(dir.path(), generate_data_key());
        store.add(Contact::new("Bob"));
        store.write().unwrap();

        let mut other = EncryptedStore::<Contact>::open(dir.path(), generate_data_key());
        assert!(matches!(
            other.load(),
            Err(WalletError::StoreCorrupt { .. })
        ));
    }

    #[test]
    fn add_replaces_same_id_and_remove_counts() {
        let dir = TempDir::new().unwrap();
        let mut store = EncryptedStore::<Contact>::open(dir.path(), generate_data_key());
        let mut alice = Contact::new("Alice");
        store.add(alice.clone());
        store.add(Contact::new("Bob"));

        alice.set_notes("met at conference");
        store.add(alice.clone());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(alice.id).unwrap().notes, "met at conference");

        assert_eq!(store.remove(|c| c.name == "Bob"), 1);
        assert_eq!(store.remove(|c| c.name == "Nobody"), 0);
        assert_eq!(store.len(), 1);
    }
}
