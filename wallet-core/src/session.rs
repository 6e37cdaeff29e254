use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::backup::BackupManager;
use crate::config_store::SessionConfig;
use crate::credential::{Credential, CredentialOutcome, CredentialPolicy};
use crate::errors::{WalletError, WalletResult};
use crate::services::{ManagedService, ManagedServiceRegistry, ServiceStage, ShutdownKind};
use crate::store::HistoryEntry;
use crate::wallet::{WalletIdentity, WalletManager, WalletState};

/// History line appended every time a wallet is opened.
pub const WALLET_OPENED_ENTRY: &str = "Wallet opened";

/// Builds the services bound to one open wallet (payment tracking, network sync).
pub trait WalletServiceFactory: Send + Sync {
    fn create(&self, identity: &WalletIdentity) -> Arc<dyn ManagedService>;
}

/// Drives wallet transitions and the services that depend on them.
///
/// One transition runs at a time: every operation takes the gate first, and
/// blocking work (key derivation, file I/O, service stop paths) runs on the
/// tokio blocking pool. Because the gate is held across each blocking call,
/// the controller never has more than one task on that pool, whatever the
/// runtime's blocking thread limit is. A rejected credential is reported
/// only after `failed_unlock_delay` has passed.
///
/// Core services handed over with [`SessionController::with_core_services`]
/// are registered and started again on the next create or unlock after a
/// HARD or SOFT shutdown dropped them.
pub struct SessionController {
    wallets: Arc<WalletManager>,
    backups: Arc<BackupManager>,
    registry: Arc<ManagedServiceRegistry>,
    factories: Vec<Arc<dyn WalletServiceFactory>>,
    core_services: Vec<(ServiceStage, Arc<dyn ManagedService>)>,
    policy: CredentialPolicy,
    failed_unlock_delay: Duration,
    gate: AsyncMutex<()>,
}

impl SessionController {
    pub fn new(
        wallets: Arc<WalletManager>,
        backups: Arc<BackupManager>,
        registry: Arc<ManagedServiceRegistry>,
        factories: Vec<Arc<dyn WalletServiceFactory>>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            wallets,
            backups,
            registry,
            factories,
            core_services: Vec::new(),
            policy: CredentialPolicy::default(),
            failed_unlock_delay: config.failed_unlock_delay(),
            gate: AsyncMutex::new(()),
        }
    }

    /// Services outside the wallet stage that the session brings back after
    /// a shutdown released them.
    pub fn with_core_services(
        mut self,
        services: Vec<(ServiceStage, Arc<dyn ManagedService>)>,
    ) -> Self {
        self.core_services = services;
        self
    }

    pub fn wallets(&self) -> &Arc<WalletManager> {
        &self.wallets
    }

    pub fn registry(&self) -> &Arc<ManagedServiceRegistry> {
        &self.registry
    }

    pub fn state(&self) -> WalletState {
        self.wallets.state()
    }

    pub fn current_identity(&self) -> Option<WalletIdentity> {
        self.wallets.current_identity()
    }

    pub fn failed_unlock_delay(&self) -> Duration {
        self.failed_unlock_delay
    }

    /// Create and open a wallet. `confirmation` must repeat `credential`.
    pub async fn create_wallet(
        &self,
        seed: zeroize::Zeroizing<Vec<u8>>,
        credential: Credential,
        confirmation: Credential,
        name: String,
    ) -> WalletResult<CredentialOutcome> {
        let outcome = self.policy.confirm(&credential, &confirmation);
        drop(confirmation);
        if !outcome.is_accepted() {
            return Ok(outcome);
        }

        let _gate = self.gate.lock().await;
        self.ensure_core_services().await?;
        self.stop_wallet_services().await?;

        let wallets = Arc::clone(&self.wallets);
        let created =
            blocking(move || wallets.create(&seed, &credential, &name)).await;
        let identity = match created {
            Ok(identity) => identity,
            Err(err) => {
                self.resume_current_wallet().await;
                return Err(err);
            }
        };

        let backups = Arc::clone(&self.backups);
        let initial = identity.clone();
        if let Err(err) =
            blocking(move || backups.create_local_and_cloud_backup(&initial).map(|_| ())).await
        {
            log::warn!("Initial backup of wallet {} failed: {}", identity, err);
        }

        self.after_open(&identity).await?;
        Ok(CredentialOutcome::Accepted)
    }

    /// Open `identity`. With another wallet open this is a switch.
    pub async fn unlock(
        &self,
        identity: WalletIdentity,
        credential: Credential,
    ) -> WalletResult<CredentialOutcome> {
        let _gate = self.gate.lock().await;
        self.ensure_core_services().await?;
        let switching = self.wallets.state() == WalletState::Open;
        self.transition(identity, credential, switching).await
    }

    /// Close the current wallet and open `identity`, falling back to the
    /// current wallet if that fails.
    pub async fn switch_wallet(
        &self,
        identity: WalletIdentity,
        credential: Credential,
    ) -> WalletResult<CredentialOutcome> {
        let _gate = self.gate.lock().await;
        self.ensure_core_services().await?;
        self.transition(identity, credential, true).await
    }

    /// Register and start any core service a shutdown released.
    pub async fn restart(&self) -> WalletResult<()> {
        let _gate = self.gate.lock().await;
        self.ensure_core_services().await
    }

    pub async fn lock(&self) -> WalletResult<()> {
        let _gate = self.gate.lock().await;
        self.stop_wallet_services().await?;
        let wallets = Arc::clone(&self.wallets);
        blocking(move || wallets.lock()).await
    }

    /// Change the open wallet's credential. `confirmation` must repeat `new`.
    pub async fn change_password(
        &self,
        old: Credential,
        new: Credential,
        confirmation: Credential,
    ) -> WalletResult<CredentialOutcome> {
        let outcome = self.policy.confirm(&new, &confirmation);
        drop(confirmation);
        if !outcome.is_accepted() {
            return Ok(outcome);
        }

        let _gate = self.gate.lock().await;
        let wallets = Arc::clone(&self.wallets);
        match blocking(move || wallets.change_password(&old, &new)).await {
            Ok(()) => Ok(CredentialOutcome::Accepted),
            Err(WalletError::InvalidCredential) => Ok(self.reject().await),
            Err(err) => Err(err),
        }
    }

    /// Replace a wallet's files with its newest valid backup.
    ///
    /// If that wallet is open it is closed first; it stays closed afterwards
    /// and must be unlocked again.
    pub async fn restore_from_backup(
        &self,
        identity: WalletIdentity,
    ) -> WalletResult<Option<PathBuf>> {
        let _gate = self.gate.lock().await;
        if self.wallets.current_identity().as_ref() == Some(&identity) {
            self.stop_wallet_services().await?;
            let wallets = Arc::clone(&self.wallets);
            blocking(move || wallets.close()).await?;
        }

        let backups = Arc::clone(&self.backups);
        blocking(move || backups.restore_latest(&identity)).await
    }

    /// Merge contacts from another wallet into the open one.
    pub async fn import_contacts(
        &self,
        source: WalletIdentity,
        credential: Credential,
    ) -> WalletResult<usize> {
        let _gate = self.gate.lock().await;
        let wallets = Arc::clone(&self.wallets);
        match blocking(move || wallets.import_contacts(&source, &credential)).await {
            Err(WalletError::InvalidCredential) => {
                tokio::time::sleep(self.failed_unlock_delay).await;
                Err(WalletError::InvalidCredential)
            }
            other => other,
        }
    }

    /// Notify every registered service in shutdown order. Never fails.
    pub async fn shutdown(&self, kind: ShutdownKind) {
        let _gate = self.gate.lock().await;
        let registry = Arc::clone(&self.registry);
        let result = blocking(move || {
            registry.on_shutdown(kind);
            Ok(())
        })
        .await;
        if let Err(err) = result {
            log::error!("Shutdown ({}) did not complete cleanly: {}", kind, err);
        }
    }

    async fn ensure_core_services(&self) -> WalletResult<()> {
        for (stage, service) in &self.core_services {
            if !self.registry.contains(service) {
                self.registry.register(*stage, Arc::clone(service));
            }
        }
        let stopped = self
            .core_services
            .iter()
            .filter(|(_, service)| !self.registry.is_running(service))
            .count();
        if stopped == 0 {
            return Ok(());
        }

        log::info!("Restarting {} core services", stopped);
        let registry = Arc::clone(&self.registry);
        blocking(move || registry.start_all()).await
    }

    async fn transition(
        &self,
        identity: WalletIdentity,
        credential: Credential,
        switching: bool,
    ) -> WalletResult<CredentialOutcome> {
        self.stop_wallet_services().await?;

        let wallets = Arc::clone(&self.wallets);
        let target = identity.clone();
        let opened = blocking(move || {
            if switching {
                wallets.switch_wallet(&target, &credential)
            } else {
                wallets.open(&target, &credential)
            }
        })
        .await;

        match opened {
            Ok(()) => {
                self.after_open(&identity).await?;
                Ok(CredentialOutcome::Accepted)
            }
            Err(WalletError::InvalidCredential) => {
                self.resume_current_wallet().await;
                Ok(self.reject().await)
            }
            Err(err) => {
                self.resume_current_wallet().await;
                Err(err)
            }
        }
    }

    async fn reject(&self) -> CredentialOutcome {
        tokio::time::sleep(self.failed_unlock_delay).await;
        CredentialOutcome::RejectedMismatch
    }

    /// Record the open in history, then bring up the wallet's services.
    /// If they cannot start the wallet is closed again.
    async fn after_open(&self, identity: &WalletIdentity) -> WalletResult<()> {
        let wallets = Arc::clone(&self.wallets);
        let recorded = blocking(move || {
            wallets.with_history(|history| {
                history.add(HistoryEntry::new(WALLET_OPENED_ENTRY));
                history.write()
            })
        })
        .await;
        if let Err(err) = recorded {
            log::warn!("Could not record wallet open for {}: {}", identity, err);
        }

        if let Err(err) = self.start_wallet_services(identity).await {
            let wallets = Arc::clone(&self.wallets);
            if let Err(close_err) = blocking(move || wallets.close()).await {
                log::error!("Failed to close wallet {}: {}", identity, close_err);
            }
            return Err(err);
        }
        Ok(())
    }

    async fn start_wallet_services(&self, identity: &WalletIdentity) -> WalletResult<()> {
        for factory in &self.factories {
            self.registry
                .register(ServiceStage::WalletScoped, factory.create(identity));
        }

        let registry = Arc::clone(&self.registry);
        let started = blocking(move || registry.start_stage(ServiceStage::WalletScoped)).await;
        if started.is_err() {
            let registry = Arc::clone(&self.registry);
            blocking(move || Ok(registry.release_stage(ServiceStage::WalletScoped))).await?;
        }
        started
    }

    /// Stop and drop every wallet-scoped service.
    async fn stop_wallet_services(&self) -> WalletResult<()> {
        let registry = Arc::clone(&self.registry);
        let released =
            blocking(move || Ok(registry.release_stage(ServiceStage::WalletScoped))).await?;
        if released > 0 {
            log::debug!("Released {} wallet services", released);
        }
        Ok(())
    }

    /// Restart services for whatever wallet is still open after a failed transition.
    async fn resume_current_wallet(&self) {
        if self.wallets.state() != WalletState::Open {
            return;
        }
        let Some(identity) = self.wallets.current_identity() else {
            return;
        };
        if let Err(err) = self.start_wallet_services(&identity).await {
            log::error!("Could not restart services for wallet {}: {}", identity, err);
            let wallets = Arc::clone(&self.wallets);
            if let Err(close_err) = blocking(move || wallets.close()).await {
                log::error!("Failed to close wallet {}: {}", identity, close_err);
            }
        }
    }
}

/// Run `operation` on the blocking pool.
async fn blocking<F, T>(operation: F) -> WalletResult<T>
where
    F: FnOnce() -> WalletResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation).await?
}
