// src/keys.rs
// On-disk RSA key pair lifecycle
//
// The key files named by the configuration hold the client identity between
// runs: public key as SubjectPublicKeyInfo PEM, private key as unencrypted
// PKCS#8 PEM. In one-time mode the files are ignored entirely and each
// connection gets a fresh pair.

use std::fs;
use std::path::Path;

use log::debug;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::crypto::RsaWrapper;
use crate::error::{ClientError, Result};

fn write_file_recursively(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ClientError::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    fs::write(path, content)
        .map_err(|e| ClientError::Config(format!("cannot write {}: {}", path.display(), e)))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| ClientError::Config(format!("cannot read {}: {}", path.display(), e)))
}

/// Load the stored key pair, creating or repairing the files as needed.
///
/// Returns `None` in one-time mode: the transport then generates a pair per
/// connection. Otherwise: a missing private key file means a new pair is
/// generated and both files written; an existing private key is loaded, and
/// a missing public key file is derived from it and written back.
pub fn load_runtime_rsa_wrapper(config: &Config) -> Result<Option<RsaWrapper>> {
    if config.enable_onetime_rsa_keys {
        return Ok(None);
    }

    let private_path = config.private_rsa_key_file_path.as_path();
    let public_path = config.public_rsa_key_file_path.as_path();

    if !private_path.exists() {
        debug!("no private key file, generating a new pair");
        let wrapper = RsaWrapper::new()?;

        write_file_recursively(private_path, &wrapper.private_key_pem()?)?;
        write_file_recursively(public_path, &wrapper.public_key_pem()?)?;

        return Ok(Some(wrapper));
    }

    let mut wrapper = RsaWrapper::empty();
    let derive_public_key = !public_path.exists();

    wrapper.set_private_key_pem(&read_file(private_path)?, derive_public_key)?;

    if derive_public_key {
        debug!("public key file missing, deriving it from the private key");
        write_file_recursively(public_path, &wrapper.public_key_pem()?)?;
    } else {
        wrapper.set_public_key_pem(&read_file(public_path)?)?;
    }

    Ok(Some(wrapper))
}

/// Replace the stored pair with a new one; returns the SHA-256 hex
/// fingerprint of the new public key.
pub fn regenerate_rsa_keys(config: &Config) -> Result<String> {
    let wrapper = RsaWrapper::new()?;

    write_file_recursively(
        config.private_rsa_key_file_path.as_path(),
        &wrapper.private_key_pem()?,
    )?;
    write_file_recursively(
        config.public_rsa_key_file_path.as_path(),
        &wrapper.public_key_pem()?,
    )?;

    public_key_fingerprint(&wrapper)
}

pub fn public_key_fingerprint(wrapper: &RsaWrapper) -> Result<String> {
    Ok(hex::encode(Sha256::digest(
        wrapper.public_key_pem()?.as_bytes(),
    )))
}
