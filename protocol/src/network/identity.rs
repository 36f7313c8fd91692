//! Node identity key.
//!
//! The key file holds the libp2p protobuf encoding of an Ed25519 keypair.
//! A missing file is created on first start; an unreadable one is fatal.

use std::path::Path;

use libp2p::identity::Keypair;
use rand::RngCore;
use tracing::info;

use super::stream::{StreamError, StreamResult};

/// A fresh Ed25519 identity.
pub fn generate() -> StreamResult<Keypair> {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    Keypair::ed25519_from_bytes(seed).map_err(|e| StreamError::Identity(e.to_string()))
}

pub fn load_or_generate(path: &Path) -> StreamResult<Keypair> {
    match std::fs::read(path) {
        Ok(bytes) => Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| StreamError::Identity(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let kp = generate()?;
            let encoded = kp
                .to_protobuf_encoding()
                .map_err(|e| StreamError::Identity(e.to_string()))?;
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, encoded)?;
            info!(path = %path.display(), peer = %kp.public().to_peer_id(), "generated node key");
            Ok(kp)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("network.key");
        let first = load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn garbage_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.key");
        std::fs::write(&path, b"not a key").unwrap();
        assert!(load_or_generate(&path).is_err());
    }
}
