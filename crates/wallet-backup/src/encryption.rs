/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Encryption support for backups
//!
//! Archives are encrypted with AES-256-GCM under a key derived from the backup
//! password with Argon2id. The payload is split into fixed-size chunks, each
//! sealed with its own nonce, so memory use does not depend on the archive
//! size. A nonce is `prefix (7) || chunk counter (4, big endian) || last flag
//! (1)`, which makes reordering, truncation and appended data detectable.
//!
//! Container layout:
//!
//! ```text
//! magic "WBKENC" | version u8 | m_cost u32 | t_cost u32 | p_cost u32 | salt [16] | nonce prefix [7] | chunks...
//! ```

use crate::{
    error::{BackupError, Result},
    secret::BackupSecret,
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};
use zeroize::Zeroizing;

const MAGIC: &[u8; 6] = b"WBKENC";
const FORMAT_VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const NONCE_PREFIX_SIZE: usize = 7;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;
const HEADER_SIZE: usize = MAGIC.len() + 1 + 12 + SALT_SIZE + NONCE_PREFIX_SIZE;
// Upper bounds accepted from a container header.
pub(crate) const MAX_MEMORY_COST_KIB: u32 = 1024 * 1024;
pub(crate) const MAX_ITERATIONS: u32 = 64;
pub(crate) const MAX_PARALLELISM: u32 = 16;

/// Encryption configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub key_derivation: KeyDerivationConfig,
}

/// Argon2id parameters used for new archives.
///
/// Existing archives carry their own parameters in the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDerivationConfig {
    pub memory_cost_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KeyDerivationConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Password-based AES-256-GCM transform.
#[derive(Debug, Clone)]
pub struct AesGcmCipher {
    key_derivation: KeyDerivationConfig,
}

impl AesGcmCipher {
    pub const EXTENSION: &'static str = "enc";
    pub const MIME_TYPE: &'static str = "application/x-binary";

    pub fn new(config: &EncryptionConfig) -> Self {
        Self {
            key_derivation: config.key_derivation.clone(),
        }
    }

    pub fn extension(&self) -> &'static str {
        Self::EXTENSION
    }

    pub fn mime_type(&self) -> &'static str {
        Self::MIME_TYPE
    }

    /// Encrypt `input` into `output`, returning the number of plaintext bytes.
    pub fn encrypt<R: Read, W: Write>(
        &self,
        secret: &BackupSecret,
        mut input: R,
        mut output: W,
    ) -> Result<u64> {
        let mut salt = [0u8; SALT_SIZE];
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut prefix);

        let params = &self.key_derivation;
        let cipher = derive_cipher(
            secret,
            &salt,
            params.memory_cost_kib,
            params.iterations,
            params.parallelism,
        )?;

        output.write_all(MAGIC)?;
        output.write_all(&[FORMAT_VERSION])?;
        output.write_all(&params.memory_cost_kib.to_be_bytes())?;
        output.write_all(&params.iterations.to_be_bytes())?;
        output.write_all(&params.parallelism.to_be_bytes())?;
        output.write_all(&salt)?;
        output.write_all(&prefix)?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut counter = 0u32;
        let mut total = 0u64;
        loop {
            let read = read_full(&mut input, &mut buffer)?;
            let last = read < CHUNK_SIZE;
            let nonce = chunk_nonce(&prefix, counter, last);
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce), &buffer[..read])
                .map_err(|_| BackupError::Encryption("Failed to seal chunk".to_string()))?;
            output.write_all(&sealed)?;
            total += read as u64;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| BackupError::Encryption("Archive too large".to_string()))?;
        }

        output.flush()?;
        Ok(total)
    }

    /// Decrypt `input` into `output`, returning the number of plaintext bytes.
    pub fn decrypt<R: Read, W: Write>(
        &self,
        secret: &BackupSecret,
        mut input: R,
        mut output: W,
    ) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        input.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                BackupError::StorageTampered("Encrypted archive header is truncated".to_string())
            }
            _ => e.into(),
        })?;

        if &header[..MAGIC.len()] != MAGIC {
            return Err(BackupError::Encryption("Not an encrypted backup archive".to_string()));
        }
        let mut offset = MAGIC.len();
        if header[offset] != FORMAT_VERSION {
            return Err(BackupError::Encryption(format!(
                "Unsupported archive version {}",
                header[offset]
            )));
        }
        offset += 1;

        let memory_cost = read_u32(&header, &mut offset);
        let iterations = read_u32(&header, &mut offset);
        let parallelism = read_u32(&header, &mut offset);
        if memory_cost > MAX_MEMORY_COST_KIB
            || iterations > MAX_ITERATIONS
            || parallelism > MAX_PARALLELISM
        {
            return Err(BackupError::StorageTampered(
                "Implausible key derivation parameters".to_string(),
            ));
        }
        let salt = &header[offset..offset + SALT_SIZE];
        offset += SALT_SIZE;
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        prefix.copy_from_slice(&header[offset..offset + NONCE_PREFIX_SIZE]);

        let cipher = derive_cipher(secret, salt, memory_cost, iterations, parallelism)?;

        let mut buffer = vec![0u8; CHUNK_SIZE + TAG_SIZE];
        let mut counter = 0u32;
        let mut total = 0u64;
        loop {
            let read = read_full(&mut input, &mut buffer)?;
            let last = read < buffer.len();
            if read < TAG_SIZE {
                return Err(BackupError::DecryptionFailed);
            }

            let nonce = chunk_nonce(&prefix, counter, last);
            let plain = Zeroizing::new(
                cipher
                    .decrypt(Nonce::from_slice(&nonce), &buffer[..read])
                    .map_err(|_| BackupError::DecryptionFailed)?,
            );
            output.write_all(&plain)?;
            total += plain.len() as u64;

            if last {
                break;
            }
            counter = counter.checked_add(1).ok_or(BackupError::DecryptionFailed)?;
        }

        output.flush()?;
        Ok(total)
    }

    pub fn encrypt_file(&self, secret: &BackupSecret, source: &Path, destination: &Path) -> Result<u64> {
        let input = BufReader::new(File::open(source)?);
        let output = BufWriter::new(File::create(destination)?);
        self.encrypt(secret, input, output)
    }

    pub fn decrypt_file(&self, secret: &BackupSecret, source: &Path, destination: &Path) -> Result<u64> {
        let input = BufReader::new(File::open(source)?);
        let output = BufWriter::new(File::create(destination)?);
        self.decrypt(secret, input, output)
    }
}

/// Whether the file carries the encrypted container header.
pub fn is_encrypted_file(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; MAGIC.len()];
    let read = read_full(&mut File::open(path)?, &mut magic)?;
    Ok(read == MAGIC.len() && &magic == MAGIC)
}

fn derive_cipher(
    secret: &BackupSecret,
    salt: &[u8],
    memory_cost: u32,
    iterations: u32,
    parallelism: u32,
) -> Result<Aes256Gcm> {
    let params = Params::new(memory_cost, iterations, parallelism, Some(KEY_SIZE))
        .map_err(|e| BackupError::Encryption(format!("Invalid key derivation parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(secret.expose(), salt, &mut key[..])
        .map_err(|e| BackupError::Encryption(format!("Key derivation failed: {}", e)))?;

    Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| BackupError::Encryption("Invalid key length".to_string()))
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[*offset..*offset + 4]);
    *offset += 4;
    u32::from_be_bytes(word)
}

/// Fill `buffer` unless the reader hits EOF first.
fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn fast_config() -> EncryptionConfig {
        EncryptionConfig {
            key_derivation: KeyDerivationConfig {
                memory_cost_kib: 256,
                iterations: 1,
                parallelism: 1,
            },
        }
    }

    fn secret(password: &str) -> BackupSecret {
        BackupSecret::from_password(password).unwrap()
    }

    fn seal(data: &[u8], password: &str) -> Vec<u8> {
        let mut sealed = Vec::new();
        AesGcmCipher::new(&fast_config())
            .encrypt(&secret(password), data, &mut sealed)
            .unwrap();
        sealed
    }

    fn open(sealed: &[u8], password: &str) -> Result<Vec<u8>> {
        let mut plain = Vec::new();
        AesGcmCipher::new(&fast_config()).decrypt(&secret(password), sealed, &mut plain)?;
        Ok(plain)
    }

    #[test]
    fn test_chunk_boundaries() {
        for size in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let sealed = seal(&data, "correct horse");
            assert_eq!(&sealed[..MAGIC.len()], MAGIC);
            assert_eq!(open(&sealed, "correct horse").unwrap(), data, "size {size}");
        }
    }

    #[test]
    fn test_wrong_password() {
        let sealed = seal(b"wallet database", "right");
        assert!(matches!(open(&sealed, "wrong"), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let mut sealed = seal(&vec![1u8; 1000], "pw");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, "pw"), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_truncation_at_chunk_boundary_is_detected() {
        let sealed = seal(&vec![9u8; 2 * CHUNK_SIZE + 10], "pw");
        let cut = HEADER_SIZE + CHUNK_SIZE + TAG_SIZE;
        assert!(matches!(open(&sealed[..cut], "pw"), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_truncated_header() {
        let sealed = seal(b"x", "pw");
        assert!(matches!(
            open(&sealed[..10], "pw"),
            Err(BackupError::StorageTampered(_))
        ));
    }

    #[test]
    fn test_implausible_header_parameters_are_rejected() {
        let sealed = seal(b"wallet database", "pw");
        let params_at = MAGIC.len() + 1;

        for (field, value) in [(0, MAX_MEMORY_COST_KIB + 1), (1, u32::MAX), (2, MAX_PARALLELISM + 1)] {
            let mut forged = sealed.clone();
            let at = params_at + field * 4;
            forged[at..at + 4].copy_from_slice(&value.to_be_bytes());

            let started = std::time::Instant::now();
            assert!(matches!(open(&forged, "pw"), Err(BackupError::StorageTampered(_))));
            assert!(started.elapsed() < std::time::Duration::from_secs(5));
        }
    }

    #[test]
    fn test_file_sniffing() {
        let dir = tempfile::TempDir::new().unwrap();
        let plain = dir.path().join("plain.zip");
        let sealed = dir.path().join("sealed.enc");
        std::fs::write(&plain, b"PK\x03\x04 not encrypted").unwrap();

        let cipher = AesGcmCipher::new(&fast_config());
        cipher.encrypt_file(&secret("pw"), &plain, &sealed).unwrap();

        assert!(is_encrypted_file(&sealed).unwrap());
        assert!(!is_encrypted_file(&plain).unwrap());

        let restored = dir.path().join("restored.zip");
        cipher.decrypt_file(&secret("pw"), &sealed, &restored).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&plain).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..200_000), password in "[ -~]{1,24}") {
            let sealed = seal(&data, &password);
            prop_assert_eq!(open(&sealed, &password).unwrap(), data);
        }
    }
}
