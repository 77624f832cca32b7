//! Loading and generating the server identity key.

use anyhow::Context;
use iroh::SecretKey;
use rand::RngCore;
use std::path::Path;

/// Generates a fresh identity: the secret key as hex and the public
/// endpoint id derived from it.
pub fn generate() -> (String, iroh::EndpointId) {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let secret = SecretKey::from_bytes(&bytes);
    (hex::encode(bytes), secret.public())
}

/// Resolves the identity from `--keyhex` or `--keypath`; an inline key
/// wins over a file. `None` when neither was given.
pub fn load(keyhex: Option<&str>, keypath: Option<&Path>) -> anyhow::Result<Option<SecretKey>> {
    if let Some(s) = keyhex {
        let key = parse_secret_key_string(s).context("--keyhex is not a 32-byte hex key")?;
        return Ok(Some(key));
    }
    if let Some(path) = keypath {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read key file {path:?}"))?;
        if let Ok(s) = std::str::from_utf8(&bytes)
            && let Some(key) = parse_secret_key_string(s.trim())
        {
            return Ok(Some(key));
        }
        if let Some(key) = parse_secret_key_bytes(&bytes) {
            return Ok(Some(key));
        }
        anyhow::bail!("key file {path:?} holds neither hex nor 32 raw bytes");
    }
    Ok(None)
}

fn parse_secret_key_string(s: &str) -> Option<SecretKey> {
    let bytes = hex::decode(s.trim()).ok()?;
    parse_secret_key_bytes(&bytes)
}

fn parse_secret_key_bytes(bytes: &[u8]) -> Option<SecretKey> {
    if bytes.len() == 32 {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        return Some(SecretKey::from_bytes(&arr));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_raw_files_both_load() {
        let dir = tempfile::tempdir().unwrap();
        let (secret_hex, id) = generate();

        let hex_file = dir.path().join("id.hex");
        std::fs::write(&hex_file, &secret_hex).unwrap();
        let loaded = load(None, Some(&hex_file)).unwrap().unwrap();
        assert_eq!(loaded.public(), id);

        let raw_file = dir.path().join("id.raw");
        std::fs::write(&raw_file, hex::decode(&secret_hex).unwrap()).unwrap();
        let loaded = load(None, Some(&raw_file)).unwrap().unwrap();
        assert_eq!(loaded.public(), id);

        let loaded = load(Some(&secret_hex), None).unwrap().unwrap();
        assert_eq!(loaded.public(), id);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(load(Some("zz"), None).is_err());
        assert!(load(None, None).unwrap().is_none());
    }
}
