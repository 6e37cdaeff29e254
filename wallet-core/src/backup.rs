//! Zipped wallet snapshots: rolling rotation, local copies and cloud mirror.
//!
//! Every archive carries a `manifest.json` with the blake3 checksum of each
//! file so a restore can tell a good snapshot from a damaged one. Archives
//! are written as `<name>.partial` and only renamed once complete.
//!
//! Two processes writing the same wallet's rotation directory are not
//! guarded against; only in-process writers are serialized.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config_store::BackupConfig;
use crate::crypto::blake3_checksum;
use crate::errors::{WalletError, WalletResult};
use crate::services::{ManagedService, ShutdownKind};
use crate::storage::{ApplicationPaths, TEMP_SUFFIX};
use crate::wallet::WalletIdentity;

const MANIFEST_NAME: &str = "manifest.json";
const MANIFEST_VERSION: u16 = 1;
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const PARTIAL_SUFFIX: &str = ".partial";
const STAGING_SUFFIX: &str = ".restore";
const DISPLACED_SUFFIX: &str = ".previous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    /// Capped rotation taken before mutating operations.
    Rolling,
    /// Full backup kept in the application directory.
    Local,
    /// Mirror of a local backup in the user's cloud folder.
    Cloud,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub identity: WalletIdentity,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
}

/// Result of [`BackupManager::create_local_and_cloud_backup`].
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub local: PathBuf,
    pub cloud: Option<PathBuf>,
    /// Set when the cloud copy failed. The local backup still succeeded.
    pub cloud_error: Option<WalletError>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupManifest {
    version: u16,
    identity: WalletIdentity,
    created_at: DateTime<Utc>,
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    size: u64,
    checksum: String,
}

#[derive(Debug, Clone)]
struct BackupLocations {
    paths: ApplicationPaths,
    cloud_root: Option<PathBuf>,
}

/// Creates, rotates and restores wallet backups.
#[derive(Debug)]
pub struct BackupManager {
    settings: RwLock<BackupConfig>,
    locations: RwLock<Option<BackupLocations>>,
    identity_locks: Mutex<HashMap<WalletIdentity, Arc<Mutex<()>>>>,
    shutting_down: AtomicBool,
}

impl Default for BackupManager {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

impl BackupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            settings: RwLock::new(config.clone()),
            locations: RwLock::new(None),
            identity_locks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Bind the manager to an application directory and optional cloud folder.
    ///
    /// A cloud folder that does not exist is ignored with a warning.
    pub fn initialise(&self, application_dir: &Path, cloud_dir: Option<&Path>) -> WalletResult<()> {
        let paths = ApplicationPaths::new(application_dir)?;
        paths.ensure_directories()?;
        recover_interrupted_restores(paths.wallets_dir())?;
        *self.locations.write() = Some(BackupLocations {
            paths,
            cloud_root: None,
        });
        self.set_cloud_location(cloud_dir);
        log::info!("Backup manager initialised at {}", application_dir.display());
        Ok(())
    }

    pub fn is_initialised(&self) -> bool {
        self.locations.read().is_some()
    }

    /// Apply new retention settings. The cloud folder is set separately.
    pub fn configure(&self, config: &BackupConfig) {
        *self.settings.write() = config.clone();
    }

    pub fn set_cloud_location(&self, cloud_dir: Option<&Path>) {
        let cloud_root = match cloud_dir {
            Some(dir) if dir.is_dir() => Some(dir.to_path_buf()),
            Some(dir) => {
                log::warn!(
                    "Cloud backup location {} does not exist, mirroring disabled",
                    dir.display()
                );
                None
            }
            None => None,
        };
        if let Some(locations) = self.locations.write().as_mut() {
            locations.cloud_root = cloud_root;
        }
    }

    pub fn cloud_location(&self) -> Option<PathBuf> {
        self.locations
            .read()
            .as_ref()
            .and_then(|l| l.cloud_root.clone())
    }

    /// Snapshot the wallet into its rolling rotation, then prune the oldest.
    pub fn create_rolling_backup(&self, identity: &WalletIdentity) -> WalletResult<PathBuf> {
        self.ensure_accepting()?;
        let locations = self.locations()?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock();

        let dir = locations.paths.rolling_backup_dir(identity);
        let archive = write_archive(&locations.paths.wallet_dir(identity), identity, &dir)
            .map_err(as_backup_failure)?;
        log::info!("Rolling backup created at {}", archive.display());

        let keep = self.settings.read().rolling_retention;
        prune(&dir, identity, BackupKind::Rolling, keep);
        Ok(archive)
    }

    /// Full backup into the local zip directory, mirrored to the cloud folder
    /// when one is configured. A cloud failure is reported in the outcome only.
    pub fn create_local_and_cloud_backup(
        &self,
        identity: &WalletIdentity,
    ) -> WalletResult<BackupOutcome> {
        self.ensure_accepting()?;
        let locations = self.locations()?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock();

        let dir = locations.paths.local_backup_dir(identity);
        let local = write_archive(&locations.paths.wallet_dir(identity), identity, &dir)
            .map_err(as_backup_failure)?;
        log::info!("Local backup created at {}", local.display());

        let keep = self.settings.read().local_zip_retention;
        prune(&dir, identity, BackupKind::Local, keep);

        let mut outcome = BackupOutcome {
            local,
            cloud: None,
            cloud_error: None,
        };
        if let Some(cloud_root) = &locations.cloud_root {
            let target_dir = ApplicationPaths::cloud_backup_dir(cloud_root, identity);
            match mirror(&outcome.local, &target_dir) {
                Ok(copy) => outcome.cloud = Some(copy),
                Err(err) => {
                    let err = WalletError::CloudMirrorFailed(err.to_string());
                    log::warn!("{}", err);
                    outcome.cloud_error = Some(err);
                }
            }
        }
        Ok(outcome)
    }

    /// All backups of `identity` across rolling, local and cloud, newest first.
    pub fn list_backups(&self, identity: &WalletIdentity) -> WalletResult<Vec<BackupRecord>> {
        let locations = self.locations()?;
        let mut records = archives_in(
            &locations.paths.rolling_backup_dir(identity),
            identity,
            BackupKind::Rolling,
        )?;
        records.extend(archives_in(
            &locations.paths.local_backup_dir(identity),
            identity,
            BackupKind::Local,
        )?);
        if let Some(cloud_root) = &locations.cloud_root {
            let dir = ApplicationPaths::cloud_backup_dir(cloud_root, identity);
            match archives_in(&dir, identity, BackupKind::Cloud) {
                Ok(cloud) => records.extend(cloud),
                Err(err) => log::warn!("Cannot list cloud backups in {}: {}", dir.display(), err),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Check an archive's manifest and every checksum in it.
    pub fn verify(&self, record: &BackupRecord) -> WalletResult<()> {
        read_archive(&record.path, &record.identity).map(|_| ())
    }

    /// Replace the live wallet directory with the newest verifiable backup.
    ///
    /// Damaged archives are skipped in favour of the next newest. Returns the
    /// archive used, or `None` when no usable backup exists.
    pub fn restore_latest(&self, identity: &WalletIdentity) -> WalletResult<Option<PathBuf>> {
        self.ensure_accepting()?;
        let locations = self.locations()?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock();

        for record in self.list_backups(identity)? {
            let files = match read_archive(&record.path, identity) {
                Ok(files) => files,
                Err(err) => {
                    log::warn!("Skipping unusable backup {}: {}", record.path.display(), err);
                    continue;
                }
            };
            install(&locations.paths.wallet_dir(identity), files)?;
            log::info!(
                "Wallet {} restored from {}",
                identity,
                record.path.display()
            );
            return Ok(Some(record.path));
        }

        log::warn!("No valid backup available for wallet {}", identity);
        Ok(None)
    }

    fn locations(&self) -> WalletResult<BackupLocations> {
        self.locations.read().clone().ok_or_else(|| {
            WalletError::BackupFailed("Backup manager has not been initialised".to_string())
        })
    }

    fn ensure_accepting(&self) -> WalletResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(WalletError::BackupFailed(
                "Backup service is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    fn identity_lock(&self, identity: &WalletIdentity) -> Arc<Mutex<()>> {
        Arc::clone(
            self.identity_locks
                .lock()
                .entry(identity.clone())
                .or_default(),
        )
    }

    /// Block until every in-flight backup or restore has finished.
    fn wait_for_in_flight(&self) {
        let locks: Vec<Arc<Mutex<()>>> = self.identity_locks.lock().values().cloned().collect();
        for lock in locks {
            drop(lock.lock());
        }
    }
}

impl ManagedService for BackupManager {
    fn name(&self) -> &str {
        "backup-manager"
    }

    fn start(&self) -> bool {
        if !self.is_initialised() {
            log::error!("Backup manager started before initialisation");
            return false;
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        true
    }

    fn stop_and_wait(&self) {
        self.wait_for_in_flight();
    }

    fn on_shutdown(&self, kind: ShutdownKind) {
        match kind {
            ShutdownKind::Hard | ShutdownKind::Soft => {
                self.shutting_down.store(true, Ordering::SeqCst);
                self.wait_for_in_flight();
            }
            ShutdownKind::Standby => {
                log::debug!("Backup manager entering standby");
            }
        }
    }
}

fn as_backup_failure(err: WalletError) -> WalletError {
    match err {
        WalletError::BackupFailed(_) => err,
        other => WalletError::BackupFailed(other.to_string()),
    }
}

fn zip_error(err: zip::result::ZipError) -> WalletError {
    WalletError::BackupFailed(format!("Archive error: {}", err))
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn archive_prefix(identity: &WalletIdentity) -> String {
    format!("{}-", identity.directory_name())
}

fn archive_name(identity: &WalletIdentity, stamp: DateTime<Utc>) -> String {
    format!(
        "{}{}.{}",
        archive_prefix(identity),
        stamp.format(STAMP_FORMAT),
        ApplicationPaths::BACKUP_EXTENSION
    )
}

fn parse_archive_name(identity: &WalletIdentity, file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(&archive_prefix(identity))?
        .strip_suffix(ApplicationPaths::BACKUP_EXTENSION)?
        .strip_suffix('.')?;
    let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// First free archive path in `dir`, stepping the stamp on collision.
fn unique_archive_path(dir: &Path, identity: &WalletIdentity) -> PathBuf {
    let mut stamp = Utc::now();
    loop {
        let candidate = dir.join(archive_name(identity, stamp));
        if !candidate.exists() {
            return candidate;
        }
        stamp += chrono::Duration::microseconds(1);
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != MANIFEST_NAME
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

fn wallet_files(wallet_dir: &Path) -> WalletResult<Vec<(String, Vec<u8>)>> {
    if !wallet_dir.is_dir() {
        return Err(WalletError::BackupFailed(format!(
            "Wallet directory {} does not exist",
            wallet_dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(wallet_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.ends_with(TEMP_SUFFIX) || !is_plain_file_name(&name) {
            continue;
        }
        files.push((name, fs::read(entry.path())?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn write_archive(
    wallet_dir: &Path,
    identity: &WalletIdentity,
    target_dir: &Path,
) -> WalletResult<PathBuf> {
    let files = wallet_files(wallet_dir)?;
    fs::create_dir_all(target_dir)?;

    let manifest = BackupManifest {
        version: MANIFEST_VERSION,
        identity: identity.clone(),
        created_at: Utc::now(),
        files: files
            .iter()
            .map(|(name, bytes)| ManifestEntry {
                name: name.clone(),
                size: bytes.len() as u64,
                checksum: hex::encode(blake3_checksum(bytes)),
            })
            .collect(),
    };

    let target = unique_archive_path(target_dir, identity);
    let partial = with_suffix(&target, PARTIAL_SUFFIX);
    let written = (|| -> WalletResult<()> {
        let mut writer = ZipWriter::new(File::create(&partial)?);
        for (name, bytes) in &files {
            writer.start_file(name.as_str(), entry_options()).map_err(zip_error)?;
            writer.write_all(bytes)?;
        }
        writer.start_file(MANIFEST_NAME, entry_options()).map_err(zip_error)?;
        writer.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
        let file = writer.finish().map_err(zip_error)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    fs::rename(&partial, &target)?;
    Ok(target)
}

/// Open an archive and return its files once every checksum matches.
fn read_archive(path: &Path, identity: &WalletIdentity) -> WalletResult<Vec<(String, Vec<u8>)>> {
    let corrupt =
        |reason: String| WalletError::BackupFailed(format!("{}: {}", path.display(), reason));

    let mut archive = ZipArchive::new(File::open(path)?).map_err(|e| corrupt(e.to_string()))?;
    let manifest: BackupManifest = {
        let mut entry = archive
            .by_name(MANIFEST_NAME)
            .map_err(|e| corrupt(e.to_string()))?;
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        serde_json::from_slice(&buffer).map_err(|e| corrupt(e.to_string()))?
    };

    if manifest.version != MANIFEST_VERSION {
        return Err(corrupt(format!("unsupported manifest version {}", manifest.version)));
    }
    if &manifest.identity != identity {
        return Err(corrupt("archive belongs to another wallet".to_string()));
    }

    let mut files = Vec::with_capacity(manifest.files.len());
    for item in &manifest.files {
        if !is_plain_file_name(&item.name) {
            return Err(corrupt(format!("invalid entry name '{}'", item.name)));
        }
        let mut entry = archive
            .by_name(&item.name)
            .map_err(|e| corrupt(e.to_string()))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| corrupt(e.to_string()))?;
        if bytes.len() as u64 != item.size || hex::encode(blake3_checksum(&bytes)) != item.checksum
        {
            return Err(corrupt(format!("checksum mismatch for {}", item.name)));
        }
        files.push((item.name.clone(), bytes));
    }
    Ok(files)
}

fn archives_in(
    dir: &Path,
    identity: &WalletIdentity,
    kind: BackupKind,
) -> WalletResult<Vec<BackupRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let created_at = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| parse_archive_name(identity, name));
        if let Some(created_at) = created_at {
            records.push(BackupRecord {
                identity: identity.clone(),
                path,
                created_at,
                kind,
            });
        }
    }
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(records)
}

/// Keep the `keep` newest archives in `dir`, never fewer than one.
/// Failures are logged only.
fn prune(dir: &Path, identity: &WalletIdentity, kind: BackupKind, keep: usize) -> usize {
    let keep = keep.max(1);
    let records = match archives_in(dir, identity, kind) {
        Ok(records) => records,
        Err(err) => {
            log::warn!("Cannot prune backups in {}: {}", dir.display(), err);
            return 0;
        }
    };

    let mut removed = 0;
    for record in records.iter().skip(keep) {
        match fs::remove_file(&record.path) {
            Ok(()) => removed += 1,
            Err(err) => log::warn!("Failed to prune {}: {}", record.path.display(), err),
        }
    }
    if removed > 0 {
        log::debug!("Pruned {} {:?} backups in {}", removed, kind, dir.display());
    }
    removed
}

fn mirror(archive: &Path, target_dir: &Path) -> WalletResult<PathBuf> {
    let file_name = archive
        .file_name()
        .ok_or_else(|| WalletError::StorageError(format!("Invalid archive {}", archive.display())))?;
    fs::create_dir_all(target_dir)?;

    let target = target_dir.join(file_name);
    let partial = with_suffix(&target, PARTIAL_SUFFIX);
    if let Err(err) = fs::copy(archive, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(err.into());
    }
    fs::rename(&partial, &target)?;
    Ok(target)
}

/// Repair wallet directories left behind by a restore that never finished.
///
/// A displaced `.previous` directory goes back into place when the live one
/// is missing and is dropped otherwise. Staging directories are always
/// dropped; the restore can simply be run again.
fn recover_interrupted_restores(wallets_dir: &Path) -> WalletResult<()> {
    let mut staged = Vec::new();
    for entry in fs::read_dir(wallets_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.ends_with(STAGING_SUFFIX) {
            staged.push(path);
            continue;
        }
        let Some(live_name) = name.strip_suffix(DISPLACED_SUFFIX) else {
            continue;
        };

        let live = path.with_file_name(live_name);
        if live.exists() {
            if let Err(err) = fs::remove_dir_all(&path) {
                log::error!("Failed to remove {}: {}", path.display(), err);
            }
            continue;
        }
        match fs::rename(&path, &live) {
            Ok(()) => log::warn!(
                "Recovered {} after an interrupted restore",
                live.display()
            ),
            Err(err) => log::error!(
                "Could not move {} back into place: {}",
                path.display(),
                err
            ),
        }
    }

    for path in staged {
        log::warn!("Removing stale restore staging {}", path.display());
        if let Err(err) = fs::remove_dir_all(&path) {
            log::error!("Failed to remove {}: {}", path.display(), err);
        }
    }
    Ok(())
}

/// Extract into a staging sibling, then swap it in for the live directory.
fn install(wallet_dir: &Path, files: Vec<(String, Vec<u8>)>) -> WalletResult<()> {
    let staging = with_suffix(wallet_dir, STAGING_SUFFIX);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    for (name, bytes) in files {
        let mut file = File::create(staging.join(&name))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    let displaced = with_suffix(wallet_dir, DISPLACED_SUFFIX);
    if displaced.exists() {
        fs::remove_dir_all(&displaced)?;
    }
    let had_live = wallet_dir.exists();
    if had_live {
        fs::rename(wallet_dir, &displaced)?;
    }
    if let Err(err) = fs::rename(&staging, wallet_dir) {
        if had_live {
            if let Err(rollback) = fs::rename(&displaced, wallet_dir) {
                log::error!(
                    "Could not move {} back after a failed restore: {}",
                    displaced.display(),
                    rollback
                );
            }
        }
        return Err(err.into());
    }
    if had_live {
        if let Err(err) = fs::remove_dir_all(&displaced) {
            log::warn!("Failed to remove {}: {}", displaced.display(), err);
        }
    }
    Ok(())
}
