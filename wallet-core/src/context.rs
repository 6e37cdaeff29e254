use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backup::BackupManager;
use crate::config_store::{ConfigStore, Environment, WalletConfig};
use crate::errors::WalletResult;
use crate::services::{ManagedService, ManagedServiceRegistry, ServiceStage, ShutdownKind};
use crate::session::{SessionController, WalletServiceFactory};
use crate::storage::ApplicationPaths;
use crate::wallet::WalletManager;

/// Installation-level configuration, saved when the application goes down.
struct InstallationConfigService {
    store: ConfigStore,
    config: Arc<RwLock<WalletConfig>>,
}

impl InstallationConfigService {
    fn persist(&self) {
        let snapshot = self.config.read().clone();
        if let Err(err) = self.store.save(&snapshot) {
            log::error!("Failed to save configuration: {}", err);
        }
    }
}

impl ManagedService for InstallationConfigService {
    fn name(&self) -> &str {
        "installation-config"
    }

    fn start(&self) -> bool {
        true
    }

    fn stop_and_wait(&self) {
        self.persist();
    }

    fn on_shutdown(&self, kind: ShutdownKind) {
        match kind {
            ShutdownKind::Hard | ShutdownKind::Soft => self.persist(),
            ShutdownKind::Standby => {}
        }
    }
}

/// Top-level owner of every wallet subsystem for one application directory.
///
/// Nothing here is global: several contexts can live in one process as
/// long as they point at different directories.
pub struct WalletContext {
    paths: ApplicationPaths,
    environment: Environment,
    config_store: ConfigStore,
    config: Arc<RwLock<WalletConfig>>,
    backups: Arc<BackupManager>,
    wallets: Arc<WalletManager>,
    registry: Arc<ManagedServiceRegistry>,
    session: SessionController,
}

impl WalletContext {
    /// Build a context for `root_dir`, reading the environment from `HDWALLET_ENV`.
    pub fn initialize(root_dir: PathBuf) -> WalletResult<Self> {
        Self::initialize_with_environment(root_dir, Environment::from_env(), Vec::new())
    }

    pub fn initialize_with_environment(
        root_dir: PathBuf,
        environment: Environment,
        factories: Vec<Arc<dyn WalletServiceFactory>>,
    ) -> WalletResult<Self> {
        let paths = ApplicationPaths::new(&root_dir)?;
        paths.ensure_directories()?;

        let config_store = ConfigStore::from_paths(&paths);
        let initial_config = config_store.load_or_default(environment)?;

        let backups = Arc::new(BackupManager::from_config(&initial_config.backup));
        backups.initialise(
            paths.root_dir(),
            initial_config.backup.cloud_backup_location.as_deref(),
        )?;
        let wallets = Arc::new(WalletManager::new(
            paths.clone(),
            Arc::clone(&backups),
            initial_config.kdf.clone(),
        ));

        let config = Arc::new(RwLock::new(initial_config.clone()));
        let installation: Arc<dyn ManagedService> = Arc::new(InstallationConfigService {
            store: config_store.clone(),
            config: Arc::clone(&config),
        });
        let backup_service: Arc<dyn ManagedService> = backups.clone();
        let wallet_service: Arc<dyn ManagedService> = wallets.clone();
        let core_services = vec![
            (ServiceStage::Installation, installation),
            (ServiceStage::Backup, backup_service),
            (ServiceStage::WalletManager, wallet_service),
        ];
        let registry = Arc::new(ManagedServiceRegistry::new());
        for (stage, service) in &core_services {
            registry.register(*stage, Arc::clone(service));
        }
        registry.start_all()?;

        let session = SessionController::new(
            Arc::clone(&wallets),
            Arc::clone(&backups),
            Arc::clone(&registry),
            factories,
            &initial_config.session,
        )
        .with_core_services(core_services);

        log::info!(
            "Wallet context ready at {} ({:?})",
            paths.root_dir().display(),
            environment
        );
        Ok(Self {
            paths,
            environment,
            config_store,
            config,
            backups,
            wallets,
            registry,
            session,
        })
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn wallets(&self) -> &Arc<WalletManager> {
        &self.wallets
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn registry(&self) -> &Arc<ManagedServiceRegistry> {
        &self.registry
    }

    pub fn paths(&self) -> &ApplicationPaths {
        &self.paths
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn config(&self) -> WalletConfig {
        self.config.read().clone()
    }

    /// Persist a configuration change and apply it to the running managers.
    ///
    /// The failed-unlock delay is read when the context is built, so a change
    /// to it applies from the next start.
    pub fn update_config<F>(&self, updater: F) -> WalletResult<WalletConfig>
    where
        F: FnOnce(&mut WalletConfig) -> WalletResult<()>,
    {
        let updated = self.config_store.update(self.environment, updater)?;
        self.backups.configure(&updated.backup);
        self.backups
            .set_cloud_location(updated.backup.cloud_backup_location.as_deref());
        self.wallets.set_kdf(updated.kdf.clone());
        *self.config.write() = updated.clone();
        Ok(updated)
    }

    pub async fn shutdown(&self, kind: ShutdownKind) {
        self.session.shutdown(kind).await;
    }

    /// Bring the core services back after a SOFT shutdown. Unlocking a
    /// wallet does the same implicitly.
    pub async fn restart(&self) -> WalletResult<()> {
        self.session.restart().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletState;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> WalletContext {
        WalletContext::initialize_with_environment(
            dir.path().to_path_buf(),
            Environment::Test,
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn initialize_starts_core_services_in_order() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert!(ctx.paths().config_file().exists());
        assert_eq!(
            ctx.registry().running_services(),
            vec!["installation-config", "backup-manager", "wallet-manager"]
        );
        assert_eq!(ctx.environment(), Environment::Test);
        assert_eq!(ctx.wallets().state(), WalletState::NoWallet);
    }

    #[test]
    fn update_config_applies_cloud_location() {
        let dir = TempDir::new().unwrap();
        let cloud = dir.path().join("cloud");
        std::fs::create_dir_all(&cloud).unwrap();
        let ctx = context(&dir);

        let target = cloud.clone();
        let updated = ctx
            .update_config(move |config| {
                config.backup.cloud_backup_location = Some(target);
                config.backup.rolling_retention = 2;
                Ok(())
            })
            .unwrap();

        assert_eq!(updated.backup.rolling_retention, 2);
        assert_eq!(ctx.backups().cloud_location(), Some(cloud));
        assert_eq!(ctx.config().backup.rolling_retention, 2);
    }

    #[test]
    fn contexts_in_separate_directories_are_independent() {
        let first_dir = TempDir::new().unwrap();
        let second_dir = TempDir::new().unwrap();
        let first = context(&first_dir);
        let second = context(&second_dir);

        assert_ne!(first.paths().root_dir(), second.paths().root_dir());
        assert_eq!(second.registry().len(), 3);
    }

    #[tokio::test]
    async fn soft_shutdown_empties_registry() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.shutdown(ShutdownKind::Soft).await;
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn restart_after_soft_shutdown_brings_core_services_back() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.shutdown(ShutdownKind::Soft).await;

        ctx.restart().await.unwrap();
        assert_eq!(
            ctx.registry().running_services(),
            vec!["installation-config", "backup-manager", "wallet-manager"]
        );

        ctx.restart().await.unwrap();
        assert_eq!(ctx.registry().len(), 3);
    }
}
