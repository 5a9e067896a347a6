use aes_gcm_siv::aead::generic_array::GenericArray;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::broker::BrokerError;

const NONCE_LEN: usize = 12;

/// Encryption-at-rest for broker store records. The key is derived from the
/// operator-supplied passphrase; every record is sealed individually with a
/// random nonce and the store label as associated data.
pub(crate) struct StoreCipher {
  cipher: Aes256GcmSiv,
}

impl std::fmt::Debug for StoreCipher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f.debug_struct("StoreCipher").finish_non_exhaustive();
  }
}

impl StoreCipher {
  pub(crate) fn from_passphrase(passphrase: &str) -> Self {
    let key = Sha256::digest(passphrase.as_bytes());
    return Self {
      cipher: Aes256GcmSiv::new(GenericArray::from_slice(&key)),
    };
  }

  pub(crate) fn seal(&self, label: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, BrokerError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let sealed = self
      .cipher
      .encrypt(
        GenericArray::from_slice(&nonce),
        Payload {
          msg: plaintext,
          aad: label,
        },
      )
      .map_err(|_| BrokerError::Storage("record encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    return Ok(out);
  }

  pub(crate) fn open(&self, label: &[u8], sealed: &[u8]) -> Result<Vec<u8>, BrokerError> {
    if sealed.len() < NONCE_LEN {
      return Err(BrokerError::Storage("sealed record too short".to_string()));
    }
    let (nonce, msg) = sealed.split_at(NONCE_LEN);
    return self
      .cipher
      .decrypt(
        GenericArray::from_slice(nonce),
        Payload {
          msg,
          aad: label,
        },
      )
      .map_err(|_| BrokerError::Storage("bad seal on store record".to_string()));
  }
}

/// Append-only record log with a u32-LE length prefix per record. Streams and
/// KV buckets replay it on open to rebuild their in-memory state.
#[derive(Debug)]
pub(crate) struct OpLog {
  file: File,
  label: Vec<u8>,
  cipher: Option<std::sync::Arc<StoreCipher>>,
}

impl OpLog {
  /// Opens (or creates) the log at `path` and returns the decoded records
  /// currently in it. Trailing partial records from a crashed writer are
  /// dropped.
  pub(crate) fn open(
    path: &Path,
    label: &str,
    cipher: Option<std::sync::Arc<StoreCipher>>,
  ) -> Result<(Self, Vec<Vec<u8>>), BrokerError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let mut records = Vec::new();
    if path.exists() {
      let mut bytes = Vec::new();
      File::open(path)?.read_to_end(&mut bytes)?;

      let mut offset = 0usize;
      while offset + 4 <= bytes.len() {
        let len_bytes: [u8; 4] = bytes[offset..offset + 4]
          .try_into()
          .map_err(|_| BrokerError::Storage("corrupt record header".to_string()))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if offset + 4 + len > bytes.len() {
          break;
        }
        let raw = &bytes[offset + 4..offset + 4 + len];
        let record = match cipher {
          Some(ref cipher) => cipher.open(label.as_bytes(), raw)?,
          None => raw.to_vec(),
        };
        records.push(record);
        offset += 4 + len;
      }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    return Ok((
      Self {
        file,
        label: label.as_bytes().to_vec(),
        cipher,
      },
      records,
    ));
  }

  pub(crate) fn append(&mut self, record: &[u8]) -> Result<(), BrokerError> {
    let encoded = match self.cipher {
      Some(ref cipher) => cipher.seal(&self.label, record)?,
      None => record.to_vec(),
    };

    let len = u32::try_from(encoded.len())
      .map_err(|_| BrokerError::Storage("record too large".to_string()))?;
    self.file.write_all(&len.to_le_bytes())?;
    self.file.write_all(&encoded)?;
    self.file.flush()?;
    return Ok(());
  }
}
