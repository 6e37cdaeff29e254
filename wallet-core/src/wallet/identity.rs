use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::identity_digest;
use crate::errors::{WalletError, WalletResult};

const DIRECTORY_PREFIX: &str = "wallet-";
const GROUPS: usize = 5;
const GROUP_HEX_LEN: usize = 8;

/// Stable wallet identifier derived from the seed.
///
/// Rendered as five dash-separated groups of eight hex digits and used as
/// the key for the wallet directory, its stores and its backups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletIdentity(String);

impl WalletIdentity {
    pub fn from_seed(seed: &[u8]) -> WalletResult<Self> {
        if seed.is_empty() {
            return Err(WalletError::ValidationError(
                "Seed cannot be empty".to_string(),
            ));
        }
        let digest = identity_digest(seed)?;
        let groups: Vec<String> = digest.chunks(GROUP_HEX_LEN / 2).map(hex::encode).collect();
        Ok(Self(groups.join("-")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the per-wallet directory, also the backup file prefix.
    pub fn directory_name(&self) -> String {
        format!("{}{}", DIRECTORY_PREFIX, self.0)
    }

    /// Parse a directory name produced by [`WalletIdentity::directory_name`].
    pub fn from_directory_name(name: &str) -> Option<Self> {
        name.strip_prefix(DIRECTORY_PREFIX)
            .and_then(|rest| rest.parse().ok())
    }
}

impl FromStr for WalletIdentity {
    type Err = WalletError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = value.split('-').collect();
        let well_formed = groups.len() == GROUPS
            && groups.iter().all(|group| {
                group.len() == GROUP_HEX_LEN
                    && group
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            });
        if !well_formed {
            return Err(WalletError::ValidationError(format!(
                "Malformed wallet identity '{}'",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for WalletIdentity {
    type Error = WalletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WalletIdentity> for String {
    fn from(identity: WalletIdentity) -> Self {
        identity.0
    }
}

impl fmt::Display for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
