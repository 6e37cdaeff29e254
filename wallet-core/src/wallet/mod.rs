//! Wallet lifecycle: create, open, switch, lock and password change.

pub mod identity;
pub mod summary;

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backup::BackupManager;
use crate::config_store::KdfConfig;
use crate::credential::{Credential, CredentialPolicy};
use crate::crypto::{self, DataKey, KdfParameters};
use crate::errors::{WalletError, WalletResult};
use crate::services::{ManagedService, ShutdownKind};
use crate::storage::ApplicationPaths;
use crate::store::{Contact, EncryptedStore, HistoryEntry};

pub use identity::WalletIdentity;
pub use summary::WalletSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletState {
    NoWallet,
    Open,
    Locked,
}

struct OpenWallet {
    summary: WalletSummary,
    history: EncryptedStore<HistoryEntry>,
    contacts: EncryptedStore<Contact>,
}

impl OpenWallet {
    fn flush(&self) -> WalletResult<()> {
        self.history.write()?;
        self.contacts.write()
    }
}

enum Slot {
    Empty,
    Open(Box<OpenWallet>),
    Locked(WalletSummary),
}

impl Slot {
    fn state(&self) -> WalletState {
        match self {
            Slot::Empty => WalletState::NoWallet,
            Slot::Open(_) => WalletState::Open,
            Slot::Locked(_) => WalletState::Locked,
        }
    }

    fn open_wallet(&mut self) -> WalletResult<&mut OpenWallet> {
        match self {
            Slot::Open(wallet) => Ok(wallet.as_mut()),
            Slot::Empty | Slot::Locked(_) => Err(WalletError::NoOpenWallet),
        }
    }
}

/// Owns the process's single current wallet.
///
/// At most one wallet is open at a time. Its history and contact stores
/// exist only while it is open and are dropped, with the data key, when it
/// is locked, closed or switched away from.
pub struct WalletManager {
    paths: ApplicationPaths,
    backups: Arc<BackupManager>,
    kdf: RwLock<KdfConfig>,
    policy: CredentialPolicy,
    slot: Mutex<Slot>,
}

impl WalletManager {
    pub fn new(paths: ApplicationPaths, backups: Arc<BackupManager>, kdf: KdfConfig) -> Self {
        Self {
            paths,
            backups,
            kdf: RwLock::new(kdf),
            policy: CredentialPolicy::default(),
            slot: Mutex::new(Slot::Empty),
        }
    }

    pub fn paths(&self) -> &ApplicationPaths {
        &self.paths
    }

    pub fn set_kdf(&self, kdf: KdfConfig) {
        *self.kdf.write() = kdf;
    }

    pub fn state(&self) -> WalletState {
        self.slot.lock().state()
    }

    pub fn current_summary(&self) -> Option<WalletSummary> {
        match &*self.slot.lock() {
            Slot::Open(wallet) => Some(wallet.summary.clone()),
            Slot::Locked(summary) => Some(summary.clone()),
            Slot::Empty => None,
        }
    }

    pub fn current_identity(&self) -> Option<WalletIdentity> {
        self.current_summary().map(|summary| summary.identity)
    }

    /// Create a wallet from `seed` and open it.
    ///
    /// Any wallet open beforehand is flushed and closed.
    pub fn create(
        &self,
        seed: &[u8],
        credential: &Credential,
        name: &str,
    ) -> WalletResult<WalletIdentity> {
        self.policy
            .validate_strength(credential)
            .map_err(WalletError::WeakCredential)?;
        let identity =
            WalletIdentity::from_seed(seed).map_err(|e| WalletError::WalletCreate(e.to_string()))?;

        let summary_path = self.paths.summary_file(&identity);
        if summary_path.exists() {
            return Err(WalletError::WalletCreate(format!(
                "Wallet {} already exists",
                identity
            )));
        }

        let mut slot = self.slot.lock();
        if let Slot::Open(current) = &*slot {
            current.flush()?;
        }

        let wallet_dir = self.paths.wallet_dir(&identity);
        let existed = wallet_dir.exists();
        let data_key = crypto::generate_data_key();
        let built = self.write_new_wallet(&identity, seed, credential, name, &data_key);
        let summary = match built {
            Ok(summary) => summary,
            Err(err) => {
                if !existed {
                    let _ = fs::remove_dir_all(&wallet_dir);
                }
                return Err(WalletError::WalletCreate(err.to_string()));
            }
        };

        log::info!("Created wallet {} at {}", identity, wallet_dir.display());
        *slot = Slot::Open(Box::new(OpenWallet {
            history: EncryptedStore::open(&wallet_dir, Zeroizing::new(*data_key)),
            contacts: EncryptedStore::open(&wallet_dir, data_key),
            summary,
        }));
        Ok(identity)
    }

    /// Open (or unlock) a wallet. On failure the prior state is kept.
    ///
    /// An unknown identity and a wrong credential both fail with
    /// [`WalletError::InvalidCredential`] after the same key derivation work.
    pub fn open(&self, identity: &WalletIdentity, credential: &Credential) -> WalletResult<()> {
        let mut slot = self.slot.lock();
        let wallet = self.load_wallet(identity, credential)?;
        if let Slot::Open(current) = &*slot {
            current.flush()?;
        }
        *slot = Slot::Open(Box::new(wallet));
        log::info!("Opened wallet {}", identity);
        Ok(())
    }

    /// Close the current wallet and open another one.
    ///
    /// If the new wallet cannot be opened the previous wallet is put back,
    /// so the manager never ends up with no wallet because of a bad switch.
    pub fn switch_wallet(
        &self,
        identity: &WalletIdentity,
        credential: &Credential,
    ) -> WalletResult<()> {
        let mut slot = self.slot.lock();
        if let Slot::Open(current) = &*slot {
            current.flush()?;
        }
        let previous = std::mem::replace(&mut *slot, Slot::Empty);

        match self.load_wallet(identity, credential) {
            Ok(wallet) => {
                *slot = Slot::Open(Box::new(wallet));
                log::info!("Switched to wallet {}", identity);
                Ok(())
            }
            Err(err) => {
                if previous.state() != WalletState::NoWallet {
                    log::warn!("Switch to wallet {} failed, restoring previous wallet", identity);
                }
                *slot = previous;
                Err(err)
            }
        }
    }

    /// Flush the stores and drop every key, keeping only the summary.
    pub fn lock(&self) -> WalletResult<()> {
        let mut slot = self.slot.lock();
        let summary = match &*slot {
            Slot::Open(wallet) => {
                wallet.flush()?;
                wallet.summary.clone()
            }
            Slot::Locked(_) => return Ok(()),
            Slot::Empty => return Err(WalletError::NoOpenWallet),
        };
        log::info!("Locked wallet {}", summary.identity);
        *slot = Slot::Locked(summary);
        Ok(())
    }

    /// Flush and forget the current wallet. A failed flush keeps it open.
    pub fn close(&self) -> WalletResult<()> {
        let mut slot = self.slot.lock();
        if let Slot::Open(wallet) = &*slot {
            wallet.flush()?;
            log::info!("Closed wallet {}", wallet.summary.identity);
        }
        *slot = Slot::Empty;
        Ok(())
    }

    /// Persist both stores of the open wallet.
    pub fn write_stores(&self) -> WalletResult<()> {
        self.slot.lock().open_wallet()?.flush()
    }

    /// Replace the credential of the open wallet.
    ///
    /// A rolling backup is taken first; if it cannot be created nothing is
    /// changed. Only the summary is rewritten, through a temp-file swap.
    pub fn change_password(&self, old: &Credential, new: &Credential) -> WalletResult<()> {
        self.policy
            .validate_strength(new)
            .map_err(WalletError::WeakCredential)?;

        let mut slot = self.slot.lock();
        let wallet = slot.open_wallet()?;
        let data_key = unlock_key(&wallet.summary, old)?;

        wallet.flush()?;
        self.backups.create_rolling_backup(&wallet.summary.identity)?;

        let params = KdfParameters::fresh(&self.kdf.read());
        let derived = crypto::derive_credential(new, &params)?;
        let mut updated = wallet.summary.clone();
        updated.kdf = params;
        updated.credential_hash = derived.verifier;
        updated.wrapped_key = crypto::wrap_key(&derived.kek, &data_key)?;
        updated.touch();
        updated.save(&self.paths.summary_file(&updated.identity))?;

        log::info!("Credential changed for wallet {}", updated.identity);
        wallet.summary = updated;
        Ok(())
    }

    /// Edit the name and notes of the open wallet, after a rolling backup.
    pub fn update_details(&self, name: &str, notes: &str) -> WalletResult<WalletSummary> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WalletError::ValidationError(
                "Wallet name cannot be empty".to_string(),
            ));
        }

        let mut slot = self.slot.lock();
        let wallet = slot.open_wallet()?;
        self.backups.create_rolling_backup(&wallet.summary.identity)?;

        let mut updated = wallet.summary.clone();
        updated.name = name.to_string();
        updated.notes = notes.to_string();
        updated.touch();
        updated.save(&self.paths.summary_file(&updated.identity))?;
        wallet.summary = updated.clone();
        Ok(updated)
    }

    pub fn with_history<F, T>(&self, operation: F) -> WalletResult<T>
    where
        F: FnOnce(&mut EncryptedStore<HistoryEntry>) -> WalletResult<T>,
    {
        let mut slot = self.slot.lock();
        operation(&mut slot.open_wallet()?.history)
    }

    pub fn with_contacts<F, T>(&self, operation: F) -> WalletResult<T>
    where
        F: FnOnce(&mut EncryptedStore<Contact>) -> WalletResult<T>,
    {
        let mut slot = self.slot.lock();
        operation(&mut slot.open_wallet()?.contacts)
    }

    /// Every wallet found under the application directory, sorted by name.
    ///
    /// Unreadable summaries are skipped with a warning.
    pub fn wallet_summaries(&self) -> WalletResult<Vec<WalletSummary>> {
        let wallets_dir = self.paths.wallets_dir();
        if !wallets_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in fs::read_dir(wallets_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let identity = entry
                .file_name()
                .to_str()
                .and_then(WalletIdentity::from_directory_name);
            let Some(identity) = identity else {
                continue;
            };
            match WalletSummary::load(&self.paths.summary_file(&identity)) {
                Ok(summary) => summaries.push(summary),
                Err(err) => log::warn!("Skipping wallet {}: {}", identity, err),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(summaries)
    }

    /// Merge another wallet's contacts into the open wallet.
    ///
    /// Contacts already present (same id) are left alone. If the merged set
    /// cannot be written the open wallet's contacts are left as they were.
    pub fn import_contacts(
        &self,
        source: &WalletIdentity,
        credential: &Credential,
    ) -> WalletResult<usize> {
        let mut slot = self.slot.lock();
        let wallet = slot.open_wallet()?;
        if &wallet.summary.identity == source {
            return Err(WalletError::ContactsImport(
                "Cannot import contacts from the open wallet".to_string(),
            ));
        }

        let (summary, data_key) = self.unlock_summary(source, credential)?;
        let mut source_contacts = EncryptedStore::<Contact>::open(&summary.directory, data_key);
        let imported: Vec<Contact> = source_contacts
            .load()
            .map_err(|e| WalletError::ContactsImport(e.to_string()))?
            .iter()
            .filter(|contact| wallet.contacts.get(contact.id).is_none())
            .cloned()
            .collect();

        let added: Vec<uuid::Uuid> = imported.iter().map(|contact| contact.id).collect();
        for contact in imported {
            wallet.contacts.add(contact);
        }
        if let Err(err) = wallet.contacts.write() {
            wallet.contacts.remove(|contact| added.contains(&contact.id));
            return Err(WalletError::ContactsImport(err.to_string()));
        }

        log::info!(
            "Imported {} contacts from wallet {} into {}",
            added.len(),
            source,
            wallet.summary.identity
        );
        Ok(added.len())
    }

    fn write_new_wallet(
        &self,
        identity: &WalletIdentity,
        seed: &[u8],
        credential: &Credential,
        name: &str,
        data_key: &DataKey,
    ) -> WalletResult<WalletSummary> {
        let wallet_dir = self.paths.wallet_dir(identity);
        fs::create_dir_all(&wallet_dir)?;

        let params = KdfParameters::fresh(&self.kdf.read());
        let derived = crypto::derive_credential(credential, &params)?;
        let now = Utc::now();
        let summary = WalletSummary {
            identity: identity.clone(),
            name: name.trim().to_string(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            directory: wallet_dir,
            kdf: params,
            credential_hash: derived.verifier,
            wrapped_key: crypto::wrap_key(&derived.kek, data_key)?,
        };

        summary::write_wallet_file(&self.paths.wallet_file(identity), identity, data_key, seed)?;
        summary.save(&self.paths.summary_file(identity))?;
        Ok(summary)
    }

    /// Verify the credential, check the live wallet file and load both stores.
    fn load_wallet(
        &self,
        identity: &WalletIdentity,
        credential: &Credential,
    ) -> WalletResult<OpenWallet> {
        let (summary, data_key) = self.unlock_summary(identity, credential)?;
        summary::verify_wallet_file(&self.paths.wallet_file(identity), identity, &data_key)?;

        let mut history = EncryptedStore::<HistoryEntry>::open(&summary.directory, Zeroizing::new(*data_key));
        history.load()?;
        let mut contacts = EncryptedStore::<Contact>::open(&summary.directory, data_key);
        contacts.load()?;

        Ok(OpenWallet {
            summary,
            history,
            contacts,
        })
    }

    fn unlock_summary(
        &self,
        identity: &WalletIdentity,
        credential: &Credential,
    ) -> WalletResult<(WalletSummary, DataKey)> {
        let summary = match WalletSummary::load(&self.paths.summary_file(identity)) {
            Ok(summary) => summary,
            Err(WalletError::FileNotFound(_)) => {
                // Same derivation cost as a real wallet.
                let decoy = KdfParameters::fresh(&self.kdf.read());
                let _ = crypto::derive_credential(credential, &decoy);
                return Err(WalletError::InvalidCredential);
            }
            Err(err) => return Err(err),
        };
        let data_key = unlock_key(&summary, credential)?;
        Ok((summary, data_key))
    }
}

/// Check `credential` against the summary and unwrap the data key.
fn unlock_key(summary: &WalletSummary, credential: &Credential) -> WalletResult<DataKey> {
    let derived = crypto::derive_credential(credential, &summary.kdf)?;
    if !CredentialPolicy::compare(&derived.verifier, &summary.credential_hash) {
        return Err(WalletError::InvalidCredential);
    }
    crypto::unwrap_key(&derived.kek, &summary.wrapped_key)
        .map_err(|_| WalletError::InvalidCredential)
}

impl ManagedService for WalletManager {
    fn name(&self) -> &str {
        "wallet-manager"
    }

    fn start(&self) -> bool {
        match self.paths.ensure_directories() {
            Ok(()) => true,
            Err(err) => {
                log::error!("Wallet directories unavailable: {}", err);
                false
            }
        }
    }

    fn stop_and_wait(&self) {
        if self.state() == WalletState::Open {
            if let Err(err) = self.write_stores() {
                log::error!("Failed to flush wallet stores: {}", err);
            }
        }
    }

    fn on_shutdown(&self, kind: ShutdownKind) {
        match kind {
            ShutdownKind::Hard | ShutdownKind::Soft => {
                if let Err(err) = self.close() {
                    log::error!("Failed to close wallet cleanly: {}", err);
                    *self.slot.lock() = Slot::Empty;
                }
            }
            ShutdownKind::Standby => self.stop_and_wait(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{BackupConfig, Environment};
    use tempfile::TempDir;

    const SEED_A: [u8; 64] = [11u8; 64];
    const SEED_B: [u8; 64] = [22u8; 64];

    fn manager() -> (TempDir, WalletManager) {
        let dir = TempDir::new().unwrap();
        let backups = Arc::new(BackupManager::from_config(&BackupConfig::default()));
        backups.initialise(dir.path(), None).unwrap();
        let paths = ApplicationPaths::new(dir.path()).unwrap();
        paths.ensure_directories().unwrap();
        let manager = WalletManager::new(
            paths,
            backups,
            KdfConfig::for_environment(Environment::Test),
        );
        (dir, manager)
    }

    fn cred(value: &str) -> Credential {
        Credential::new(value)
    }

    #[test]
    fn create_opens_wallet_and_rejects_duplicates() {
        let (_dir, manager) = manager();
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();

        assert_eq!(manager.state(), WalletState::Open);
        assert_eq!(manager.current_identity(), Some(id.clone()));
        assert!(manager.paths().wallet_file(&id).exists());
        assert!(manager.paths().summary_file(&id).exists());

        assert!(matches!(
            manager.create(&SEED_A, &cred("Abc123!x"), "Again"),
            Err(WalletError::WalletCreate(_))
        ));
    }

    #[test]
    fn create_rejects_weak_credential() {
        let (_dir, manager) = manager();
        assert!(matches!(
            manager.create(&SEED_A, &cred("short"), "Main"),
            Err(WalletError::WeakCredential(_))
        ));
        assert_eq!(manager.state(), WalletState::NoWallet);
    }

    #[test]
    fn unknown_wallet_and_wrong_credential_look_the_same() {
        let (_dir, manager) = manager();
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();
        manager.close().unwrap();

        let unknown = WalletIdentity::from_seed(&SEED_B).unwrap();
        let wrong = manager.open(&id, &cred("Abc123!y")).unwrap_err();
        let missing = manager.open(&unknown, &cred("Abc123!x")).unwrap_err();
        assert_eq!(wrong, WalletError::InvalidCredential);
        assert_eq!(missing, WalletError::InvalidCredential);
        assert_eq!(manager.state(), WalletState::NoWallet);
    }

    #[test]
    fn lock_then_open_restores_stores() {
        let (_dir, manager) = manager();
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();
        manager
            .with_history(|history| {
                history.add(HistoryEntry::new("Payment received"));
                Ok(())
            })
            .unwrap();

        manager.lock().unwrap();
        assert_eq!(manager.state(), WalletState::Locked);
        assert!(matches!(
            manager.with_history(|h| Ok(h.len())),
            Err(WalletError::NoOpenWallet)
        ));

        manager.open(&id, &cred("Abc123!x")).unwrap();
        let count = manager.with_history(|h| Ok(h.len())).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn failed_switch_keeps_previous_wallet() {
        let (_dir, manager) = manager();
        let second = manager.create(&SEED_B, &cred("Xyz789!q"), "Second").unwrap();
        let first = manager.create(&SEED_A, &cred("Abc123!x"), "First").unwrap();

        let err = manager.switch_wallet(&second, &cred("Wrong000!")).unwrap_err();
        assert_eq!(err, WalletError::InvalidCredential);
        assert_eq!(manager.current_identity(), Some(first));
        assert_eq!(manager.state(), WalletState::Open);

        manager.switch_wallet(&second, &cred("Xyz789!q")).unwrap();
        assert_eq!(manager.current_identity(), Some(second));
    }

    #[test]
    fn change_password_requires_old_credential() {
        let (_dir, manager) = manager();
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();

        assert_eq!(
            manager
                .change_password(&cred("Nope123!x"), &cred("Xyz789!q"))
                .unwrap_err(),
            WalletError::InvalidCredential
        );
        manager
            .change_password(&cred("Abc123!x"), &cred("Xyz789!q"))
            .unwrap();
        manager.close().unwrap();

        assert_eq!(
            manager.open(&id, &cred("Abc123!x")).unwrap_err(),
            WalletError::InvalidCredential
        );
        manager.open(&id, &cred("Xyz789!q")).unwrap();
    }

    #[test]
    fn change_password_aborts_when_backup_fails() {
        let dir = TempDir::new().unwrap();
        // Never initialised, so every backup request fails.
        let backups = Arc::new(BackupManager::new());
        let paths = ApplicationPaths::new(dir.path()).unwrap();
        let manager = WalletManager::new(
            paths,
            backups,
            KdfConfig::for_environment(Environment::Test),
        );
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();
        let before = fs::read(manager.paths().summary_file(&id)).unwrap();

        assert!(matches!(
            manager.change_password(&cred("Abc123!x"), &cred("Xyz789!q")),
            Err(WalletError::BackupFailed(_))
        ));
        assert_eq!(fs::read(manager.paths().summary_file(&id)).unwrap(), before);
    }

    #[test]
    fn update_details_persists_name_and_notes() {
        let (_dir, manager) = manager();
        let id = manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();
        manager.update_details("Savings", "long term").unwrap();
        manager.close().unwrap();

        let summaries = manager.wallet_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].identity, id);
        assert_eq!(summaries[0].name, "Savings");
        assert_eq!(summaries[0].notes, "long term");
    }

    #[test]
    fn import_contacts_merges_from_other_wallet() {
        let (_dir, manager) = manager();
        let source = manager.create(&SEED_B, &cred("Xyz789!q"), "Source").unwrap();
        manager
            .with_contacts(|contacts| {
                contacts.add(Contact::new("Alice"));
                contacts.add(Contact::new("Bob"));
                Ok(())
            })
            .unwrap();
        manager.create(&SEED_A, &cred("Abc123!x"), "Target").unwrap();

        assert_eq!(
            manager
                .import_contacts(&source, &cred("Wrong789!q"))
                .unwrap_err(),
            WalletError::InvalidCredential
        );
        assert_eq!(manager.import_contacts(&source, &cred("Xyz789!q")).unwrap(), 2);
        assert_eq!(manager.import_contacts(&source, &cred("Xyz789!q")).unwrap(), 0);
        assert_eq!(manager.with_contacts(|c| Ok(c.len())).unwrap(), 2);
    }

    #[test]
    fn shutdown_closes_open_wallet() {
        let (_dir, manager) = manager();
        manager.create(&SEED_A, &cred("Abc123!x"), "Main").unwrap();
        manager.on_shutdown(ShutdownKind::Hard);
        assert_eq!(manager.state(), WalletState::NoWallet);
    }
}
