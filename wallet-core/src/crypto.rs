use argon2::{Algorithm, Argon2, Params, Version};
use blake3::Hasher as Blake3;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config_store::KdfConfig;
use crate::credential::Credential;
use crate::errors::{WalletError, WalletResult};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Domain separation key for wallet identity derivation.
const IDENTITY_DOMAIN: &[u8] = b"hd-wallet/identity/v1";

pub type DataKey = Zeroizing<[u8; KEY_LEN]>;

/// Argon2id parameters persisted next to every derived credential hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParameters {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
    pub salt: [u8; SALT_LEN],
}

impl KdfParameters {
    /// Parameters from configuration with a fresh random salt.
    pub fn fresh(config: &KdfConfig) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            m_cost_kib: config.memory_kib,
            t_cost: config.iterations,
            p_cost: config.parallelism,
            salt,
        }
    }
}

/// AES-256-GCM ciphertext with the nonce it was sealed under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Output of one credential derivation.
pub struct DerivedCredential {
    /// Hex verifier stored in the wallet summary.
    pub verifier: String,
    /// Key-encryption key wrapping the wallet data key. Never persisted.
    pub kek: DataKey,
}

/// Run Argon2id once and split the output into verifier and key-encryption key.
pub fn derive_credential(
    credential: &Credential,
    params: &KdfParameters,
) -> WalletResult<DerivedCredential> {
    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(KEY_LEN * 2),
    )
    .map_err(|e| WalletError::CryptoError(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = Zeroizing::new([0u8; KEY_LEN * 2]);
    argon2
        .hash_password_into(credential.expose().as_bytes(), &params.salt, output.as_mut())
        .map_err(|e| WalletError::CryptoError(format!("KDF failed: {e}")))?;

    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    kek.copy_from_slice(&output[KEY_LEN..]);
    Ok(DerivedCredential {
        verifier: hex::encode(&output[..KEY_LEN]),
        kek,
    })
}

/// Random 256-bit key used for wallet file and store encryption.
pub fn generate_data_key() -> DataKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut());
    key
}

pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> WalletResult<SealedBox> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|e| WalletError::CryptoError(format!("Invalid encryption key: {e}")))?;
    let key = LessSafeKey::new(unbound_key);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| WalletError::CryptoError("Encryption failure".to_string()))?;

    Ok(SealedBox {
        nonce: nonce_bytes,
        ciphertext: in_out,
    })
}

pub fn open(key: &[u8; KEY_LEN], sealed: &SealedBox) -> WalletResult<Zeroizing<Vec<u8>>> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|e| WalletError::CryptoError(format!("Invalid encryption key: {e}")))?;
    let key = LessSafeKey::new(unbound_key);

    if sealed.ciphertext.len() < aead::AES_256_GCM.tag_len() {
        return Err(WalletError::CryptoError(
            "Ciphertext shorter than authentication tag".to_string(),
        ));
    }

    let mut in_out = Zeroizing::new(sealed.ciphertext.clone());
    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| WalletError::CryptoError("Decryption failure".to_string()))?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// Wrap the wallet data key under a key-encryption key.
pub fn wrap_key(kek: &DataKey, data_key: &DataKey) -> WalletResult<SealedBox> {
    seal(kek, &data_key[..])
}

pub fn unwrap_key(kek: &DataKey, wrapped: &SealedBox) -> WalletResult<DataKey> {
    let plaintext = open(kek, wrapped)?;
    if plaintext.len() != KEY_LEN {
        return Err(WalletError::CryptoError(
            "Wrapped key has unexpected length".to_string(),
        ));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

pub fn blake3_checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake3::new();
    hasher.update(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(hasher.finalize().as_bytes());
    output
}

/// Keyed hash of the seed; the first 20 bytes form the wallet identity.
pub fn identity_digest(seed: &[u8]) -> WalletResult<[u8; 20]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(IDENTITY_DOMAIN)
        .map_err(|e| WalletError::CryptoError(format!("Invalid HMAC key: {e}")))?;
    mac.update(seed);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    Ok(out)
}

/// BIP39 seed for a mnemonic phrase, without passphrase.
pub fn seed_from_mnemonic(phrase: &str) -> WalletResult<Zeroizing<Vec<u8>>> {
    let mnemonic = bip39::Mnemonic::parse_normalized(phrase)
        .map_err(|e| WalletError::ValidationError(format!("Invalid seed phrase: {e}")))?;
    Ok(Zeroizing::new(mnemonic.to_seed("").to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_kdf() -> KdfConfig {
        KdfConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn derivation_is_deterministic_for_same_salt() {
        let params = KdfParameters::fresh(&light_kdf());
        let a = derive_credential(&Credential::from("Abc123!x"), &params).unwrap();
        let b = derive_credential(&Credential::from("Abc123!x"), &params).unwrap();
        let c = derive_credential(&Credential::from("Abc123!y"), &params).unwrap();
        assert_eq!(a.verifier, b.verifier);
        assert_eq!(*a.kek, *b.kek);
        assert_ne!(a.verifier, c.verifier);
        assert_eq!(a.verifier.len(), KEY_LEN * 2);
    }

    #[test]
    fn fresh_parameters_use_new_salt() {
        let a = KdfParameters::fresh(&light_kdf());
        let b = KdfParameters::fresh(&light_kdf());
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn seal_and_open_round_trip() {
        let key = generate_data_key();
        let sealed = seal(&key, b"history payload").unwrap();
        assert_ne!(sealed.ciphertext, b"history payload".to_vec());
        let plaintext = open(&key, &sealed).unwrap();
        assert_eq!(plaintext.as_slice(), b"history payload");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = seal(&generate_data_key(), b"secret").unwrap();
        let result = open(&generate_data_key(), &sealed);
        assert!(matches!(result, Err(WalletError::CryptoError(_))));
    }

    #[test]
    fn wrapped_key_round_trip() {
        let kek = generate_data_key();
        let data_key = generate_data_key();
        let wrapped = wrap_key(&kek, &data_key).unwrap();
        assert_eq!(*unwrap_key(&kek, &wrapped).unwrap(), *data_key);
        assert!(unwrap_key(&generate_data_key(), &wrapped).is_err());
    }

    #[test]
    fn identity_digest_depends_only_on_seed() {
        assert_eq!(
            identity_digest(&[7u8; 64]).unwrap(),
            identity_digest(&[7u8; 64]).unwrap()
        );
        assert_ne!(
            identity_digest(&[7u8; 64]).unwrap(),
            identity_digest(&[8u8; 64]).unwrap()
        );
    }

    #[test]
    fn mnemonic_seed_is_64_bytes() {
        let seed = seed_from_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        assert_eq!(seed.len(), 64);
        assert!(seed_from_mnemonic("not a valid phrase").is_err());
    }
}
