//! `keygen`: create a package signing key.

use std::path::Path;

use ed25519_dalek::SigningKey;
use lantern_plugins::signature::public_key_base64;
use rand::rngs::OsRng;

use crate::theme::Theme;

/// Write a fresh base64 seed to `output` and print the public key to add
/// to `plugins.trusted_keys`.
pub(crate) fn generate(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", output.display());
    }

    let key = SigningKey::generate(&mut OsRng);
    let seed = base64_seed(&key);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, format!("{seed}\n"))?;

    println!("{}", Theme::success("New signing key generated."));
    println!("{}", Theme::kv("Key file", &output.display().to_string()));
    println!(
        "{}",
        Theme::kv("Public key", &public_key_base64(&key.verifying_key()))
    );
    Ok(())
}

fn base64_seed(key: &SigningKey) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(key.to_bytes())
}

#[cfg(test)]
mod tests {
    use lantern_plugins::signature::signing_key_from_base64;

    use super::*;

    #[test]
    fn generated_seed_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys/signing.key");
        generate(&path, false).unwrap();

        let seed = std::fs::read_to_string(&path).unwrap();
        assert!(signing_key_from_base64(&seed).is_ok());
        assert!(generate(&path, false).is_err());
        generate(&path, true).unwrap();
    }
}
