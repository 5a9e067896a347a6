use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::*;
use std::path::Path;
use thiserror::Error;

/// Trailer appended to signed modules: `[payload][signature: 64B]["GJSIG"]`.
pub const SIGNATURE_MAGIC: &[u8; 5] = b"GJSIG";
pub const SIGNATURE_LEN: usize = 64;
pub const FOOTER_LEN: usize = SIGNATURE_LEN + SIGNATURE_MAGIC.len();

#[derive(Debug, Error)]
pub enum SigningError {
  #[error("file too short to carry a signature envelope")]
  InvalidEnvelope,
  #[error("no signature footer")]
  NoSignatureFooter,
  #[error("signature did not verify against any trusted key")]
  UntrustedSignature,
  #[error("malformed key material: {0}")]
  MalformedKey(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// The set of public keys authorized to sign modules. An empty set disables
/// verification (development mode).
#[derive(Clone, Default)]
#[derive(Debug)]
pub struct TrustRoot {
  keys: Vec<VerifyingKey>,
}

impl TrustRoot {
  pub fn from_hex_keys(hex_keys: &[String]) -> Result<Self, SigningError> {
    let keys = hex_keys
      .iter()
      .map(|k| parse_verifying_key(k))
      .collect::<Result<Vec<_>, _>>()?;
    return Ok(Self { keys });
  }

  pub fn is_empty(&self) -> bool {
    return self.keys.is_empty();
  }
}

/// Read a module file and verify its signature footer against the trust root.
/// Returns the payload with the footer stripped.
pub fn load(path: &Path, trust: &TrustRoot) -> Result<Vec<u8>, SigningError> {
  let bytes = std::fs::read(path)?;
  return verify(&bytes, trust).map(|payload| payload.to_vec());
}

/// Verify `bytes` against the trust root and return the signed payload.
pub fn verify<'a>(bytes: &'a [u8], trust: &TrustRoot) -> Result<&'a [u8], SigningError> {
  if bytes.len() < FOOTER_LEN {
    return Err(SigningError::InvalidEnvelope);
  }

  let (rest, magic) = bytes.split_at(bytes.len() - SIGNATURE_MAGIC.len());
  if magic != SIGNATURE_MAGIC {
    return Err(SigningError::NoSignatureFooter);
  }

  let (payload, sig_bytes) = rest.split_at(rest.len() - SIGNATURE_LEN);
  if trust.is_empty() {
    warn!("No trusted signing keys configured: accepting unverified module (dev mode)");
    return Ok(payload);
  }

  let sig_array: [u8; SIGNATURE_LEN] = sig_bytes
    .try_into()
    .map_err(|_| SigningError::InvalidEnvelope)?;
  let signature = Signature::from_bytes(&sig_array);

  for key in &trust.keys {
    if key.verify(payload, &signature).is_ok() {
      return Ok(payload);
    }
  }

  return Err(SigningError::UntrustedSignature);
}

/// Return the payload without verifying. Bytes without a footer pass through
/// unchanged; this is what makes re-signing idempotent.
pub fn strip_signature(bytes: &[u8]) -> &[u8] {
  if bytes.len() >= FOOTER_LEN && bytes.ends_with(SIGNATURE_MAGIC) {
    return &bytes[..bytes.len() - FOOTER_LEN];
  }
  return bytes;
}

/// Append a signature footer over `bytes`. An existing footer is stripped
/// first so `sign(sign(x)) == sign(x)`.
pub fn sign(bytes: &[u8], key: &SigningKey) -> Vec<u8> {
  let payload = strip_signature(bytes);
  let signature = key.sign(payload);

  let mut out = Vec::with_capacity(payload.len() + FOOTER_LEN);
  out.extend_from_slice(payload);
  out.extend_from_slice(&signature.to_bytes());
  out.extend_from_slice(SIGNATURE_MAGIC);
  return out;
}

/// Sign a module file in place.
pub fn sign_file(path: &Path, key: &SigningKey) -> Result<(), SigningError> {
  let bytes = std::fs::read(path)?;
  std::fs::write(path, sign(&bytes, key))?;
  return Ok(());
}

/// Generate a fresh signing keypair. Both halves are exchanged hex-encoded.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
  use rand::RngCore;

  let mut seed = [0u8; 32];
  rand::rng().fill_bytes(&mut seed);

  let signing = SigningKey::from_bytes(&seed);
  let verifying = signing.verifying_key();
  return (signing, verifying);
}

pub fn encode_signing_key(key: &SigningKey) -> String {
  return hex::encode(key.to_bytes());
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
  return hex::encode(key.to_bytes());
}

pub fn parse_signing_key(hex_seed: &str) -> Result<SigningKey, SigningError> {
  let bytes = hex::decode(hex_seed.trim())
    .map_err(|err| SigningError::MalformedKey(err.to_string()))?;
  let seed: [u8; 32] = bytes
    .try_into()
    .map_err(|_| SigningError::MalformedKey("seed must be 32 bytes".to_string()))?;
  return Ok(SigningKey::from_bytes(&seed));
}

pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, SigningError> {
  let bytes =
    hex::decode(hex_key.trim()).map_err(|err| SigningError::MalformedKey(err.to_string()))?;
  let key: [u8; 32] = bytes
    .try_into()
    .map_err(|_| SigningError::MalformedKey("public key must be 32 bytes".to_string()))?;
  return VerifyingKey::from_bytes(&key)
    .map_err(|err| SigningError::MalformedKey(err.to_string()));
}

#[cfg(test)]
mod tests {
  use super::*;

  fn trust_of(key: &VerifyingKey) -> TrustRoot {
    return TrustRoot {
      keys: vec![*key],
    };
  }

  #[test]
  fn test_sign_verify_roundtrip() {
    let (sk, pk) = generate_keypair();
    let payload = b"\0asm fake module".to_vec();

    let signed = sign(&payload, &sk);
    assert_eq!(signed.len(), payload.len() + FOOTER_LEN);

    let verified = verify(&signed, &trust_of(&pk)).expect("verify");
    assert_eq!(verified, payload.as_slice());
  }

  #[test]
  fn test_strip_signature_is_inverse_of_sign() {
    let (sk, _pk) = generate_keypair();
    let payload = b"module bytes".to_vec();

    assert_eq!(strip_signature(&sign(&payload, &sk)), payload.as_slice());
    // No footer: pass-through.
    assert_eq!(strip_signature(&payload), payload.as_slice());
  }

  #[test]
  fn test_resigning_is_idempotent() {
    let (sk, _pk) = generate_keypair();
    let payload = b"module bytes".to_vec();

    let once = sign(&payload, &sk);
    let twice = sign(&once, &sk);
    assert_eq!(once, twice);
  }

  #[test]
  fn test_untrusted_signature_rejected() {
    let (sk1, _pk1) = generate_keypair();
    let (_sk2, pk2) = generate_keypair();

    let signed = sign(b"payload", &sk1);
    let err = verify(&signed, &trust_of(&pk2)).expect_err("must fail");
    assert!(matches!(err, SigningError::UntrustedSignature));
  }

  #[test]
  fn test_tampered_payload_rejected() {
    let (sk, pk) = generate_keypair();
    let mut signed = sign(b"payload", &sk);
    signed[0] ^= 0xff;

    let err = verify(&signed, &trust_of(&pk)).expect_err("must fail");
    assert!(matches!(err, SigningError::UntrustedSignature));
  }

  #[test]
  fn test_short_file_is_invalid_envelope() {
    let trust = TrustRoot::default();
    // 68 bytes: one short of the footer alone.
    let err = verify(&vec![0u8; FOOTER_LEN - 1], &trust).expect_err("must fail");
    assert!(matches!(err, SigningError::InvalidEnvelope));
  }

  #[test]
  fn test_exactly_footer_sized_file_without_magic() {
    let trust = TrustRoot::default();
    let err = verify(&vec![0u8; FOOTER_LEN], &trust).expect_err("must fail");
    assert!(matches!(err, SigningError::NoSignatureFooter));
  }

  #[test]
  fn test_dev_mode_returns_payload_unverified() {
    let (sk, _pk) = generate_keypair();
    let signed = sign(b"payload", &sk);

    let payload = verify(&signed, &TrustRoot::default()).expect("dev mode");
    assert_eq!(payload, b"payload");
  }

  #[test]
  fn test_key_hex_roundtrip() {
    let (sk, pk) = generate_keypair();

    let sk2 = parse_signing_key(&encode_signing_key(&sk)).expect("seed");
    assert_eq!(sk.to_bytes(), sk2.to_bytes());

    let pk2 = parse_verifying_key(&encode_verifying_key(&pk)).expect("key");
    assert_eq!(pk, pk2);
  }
}
