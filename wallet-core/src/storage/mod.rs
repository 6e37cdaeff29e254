pub mod paths;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use paths::ApplicationPaths;

use crate::errors::{WalletError, WalletResult};

/// Suffix of the sibling file a write goes through before the swap.
pub const TEMP_SUFFIX: &str = ".new";

/// Sibling path used while `path` is being rewritten.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Write `bytes` to `path` without ever exposing a truncated file.
///
/// The content goes to a temporary sibling, is synced, then renamed over
/// the target. A crash leaves either the old file or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> WalletResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| WalletError::StorageError(format!("Invalid path {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp_path = temp_path(path);
    let written = (|| -> WalletResult<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}
