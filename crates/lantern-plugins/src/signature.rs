//! Ed25519 package signatures.
//!
//! A signature covers the package digest: a blake3 hash over
//!
//! ```text
//! lantern-package-v1
//! <id>@<version>
//! <canonical manifest JSON, signature block removed>
//! <path>:<blake3 hex of file bytes>     (one line per payload file, sorted)
//! ```
//!
//! The canonical manifest is the parsed manifest re-serialized, so edits to
//! permissions, capabilities or the entry point invalidate the signature
//! while formatting of `plugin.json` does not.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, SignatureBlock};

/// The only accepted signature algorithm.
pub const ALGORITHM: &str = "ed25519";

const DIGEST_DOMAIN: &str = "lantern-package-v1";

/// Compute the package digest.
///
/// `files` must yield payload files (everything except `plugin.json`) in
/// path order.
///
/// # Errors
///
/// Returns [`PluginError::MalformedManifest`] if the manifest cannot be
/// serialized.
pub fn package_digest<'a>(
    manifest: &PluginManifest,
    files: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> PluginResult<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DIGEST_DOMAIN.as_bytes());
    hasher.update(b"\n");
    hasher.update(format!("{}@{}\n", manifest.id, manifest.version).as_bytes());
    hasher.update(&canonical_manifest(manifest)?);
    hasher.update(b"\n");
    for (path, data) in files {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(blake3::hash(data).to_hex().as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize())
}

fn canonical_manifest(manifest: &PluginManifest) -> PluginResult<Vec<u8>> {
    let unsigned = PluginManifest {
        signature: None,
        ..manifest.clone()
    };
    serde_json::to_vec(&unsigned).map_err(|e| PluginError::MalformedManifest(e.to_string()))
}

/// Sign `digest` and return the manifest signature block.
#[must_use]
pub fn sign_digest(key: &SigningKey, digest: &blake3::Hash) -> SignatureBlock {
    let signature = key.sign(digest.as_bytes());
    SignatureBlock {
        algorithm: ALGORITHM.to_string(),
        public_key: public_key_base64(&key.verifying_key()),
        signature: STANDARD.encode(signature.to_bytes()),
    }
}

/// Sign the payload `files`, keyed as for
/// [`write_package`](crate::package::write_package), and store the block in
/// `manifest`.
///
/// # Errors
///
/// Returns an error if the manifest cannot be serialized for the digest.
pub fn sign_manifest(
    manifest: &mut PluginManifest,
    files: &BTreeMap<String, Vec<u8>>,
    key: &SigningKey,
) -> PluginResult<()> {
    let payload = files
        .iter()
        .filter(|(path, _)| path.as_str() != MANIFEST_FILE_NAME)
        .map(|(path, data)| (path.as_str(), data.as_slice()));
    let digest = package_digest(manifest, payload)?;
    manifest.signature = Some(sign_digest(key, &digest));
    Ok(())
}

/// Verify `block` over `digest`, returning the signer's key on success.
///
/// # Errors
///
/// Returns [`PluginError::Signature`] for an unsupported algorithm, badly
/// encoded key or signature, or a signature that does not verify.
pub fn verify(block: &SignatureBlock, digest: &blake3::Hash) -> PluginResult<VerifyingKey> {
    if block.algorithm != ALGORITHM {
        return Err(PluginError::Signature(format!(
            "unsupported signature algorithm '{}', expected '{ALGORITHM}'",
            block.algorithm
        )));
    }

    let key = decode_verifying_key(&block.public_key)?;
    let sig_bytes = STANDARD
        .decode(block.signature.trim())
        .map_err(|e| PluginError::Signature(format!("signature is not valid base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| PluginError::Signature(format!("malformed signature: {e}")))?;

    key.verify_strict(digest.as_bytes(), &signature)
        .map_err(|_| PluginError::Signature("signature does not match package contents".into()))?;
    Ok(key)
}

/// Decode a base64 Ed25519 public key.
///
/// # Errors
///
/// Returns [`PluginError::Signature`] if the key is not 32 valid bytes.
pub fn decode_verifying_key(encoded: &str) -> PluginResult<VerifyingKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PluginError::Signature(format!("public key is not valid base64: {e}")))?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        PluginError::Signature(format!(
            "public key must be 32 bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| PluginError::Signature(format!("invalid public key: {e}")))
}

/// Decode a base64 32-byte Ed25519 seed.
///
/// # Errors
///
/// Returns [`PluginError::Signature`] if the seed is not 32 valid bytes.
pub fn signing_key_from_base64(encoded: &str) -> PluginResult<SigningKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PluginError::Signature(format!("signing key is not valid base64: {e}")))?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        PluginError::Signature(format!(
            "signing key seed must be 32 bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Base64 encoding of a public key, as stored in manifests and
/// `plugins.trusted_keys`.
#[must_use]
pub fn public_key_base64(key: &VerifyingKey) -> String {
    STANDARD.encode(key.as_bytes())
}
