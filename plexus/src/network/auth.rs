// Pre-shared keypair handshake.
//
// Each side signs its hello with an ed25519 key and presents the public key;
// the receiver accepts only keys present in its key directory. Key material
// is provisioned externally; this module only loads, signs and verifies.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{PlexusError, PlexusResult};
use crate::identity::{hex_decode, hex_encode};
use crate::network::wire::Envelope;

const SECRET_FILE: &str = "node.key_secret";

pub struct AuthKeys {
    signing: SigningKey,
    allowed: Vec<VerifyingKey>,
}

impl AuthKeys {
    /// Loads `node.key_secret` plus every `*.key` public key in the
    /// directory as the peer allow-list.
    pub fn load(dir: &Path) -> PlexusResult<Self> {
        let secret_raw = std::fs::read_to_string(dir.join(SECRET_FILE))
            .map_err(|e| PlexusError::Handshake(format!("cannot read node key: {}", e)))?;
        let secret = decode_key_32(secret_raw.trim())?;
        let signing = SigningKey::from_bytes(&secret);

        let mut allowed = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("key") {
                let raw = std::fs::read_to_string(&path)?;
                let bytes = decode_key_32(raw.trim())?;
                let key = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| PlexusError::Handshake(format!("bad public key: {}", e)))?;
                allowed.push(key);
            }
        }
        if allowed.is_empty() {
            return Err(PlexusError::Handshake(
                "auth enabled but no peer keys found".to_string(),
            ));
        }
        Ok(Self { signing, allowed })
    }

    /// Stamps a hello envelope with this node's public key and a signature
    /// over its identity fields.
    pub fn sign_hello(&self, envelope: &mut Envelope) {
        let payload = hello_payload(envelope);
        let signature = self.signing.sign(payload.as_bytes());
        envelope.auth_key = Some(hex_encode(self.signing.verifying_key().as_bytes()));
        envelope.auth_sig = Some(hex_encode(&signature.to_bytes()));
    }

    /// Verifies a peer's hello. The key must be allow-listed and the
    /// signature must cover the hello's identity fields.
    pub fn verify_hello(&self, envelope: &Envelope) -> PlexusResult<()> {
        let key_hex = envelope
            .auth_key
            .as_deref()
            .ok_or_else(|| PlexusError::Handshake("peer sent no auth key".to_string()))?;
        let sig_hex = envelope
            .auth_sig
            .as_deref()
            .ok_or_else(|| PlexusError::Handshake("peer sent no signature".to_string()))?;
        let key = VerifyingKey::from_bytes(&decode_key_32(key_hex)?)
            .map_err(|e| PlexusError::Handshake(format!("bad peer key: {}", e)))?;
        if !self.allowed.contains(&key) {
            return Err(PlexusError::Handshake(
                "peer key is not in the allow list".to_string(),
            ));
        }
        let sig_bytes = hex_decode(sig_hex)
            .ok_or_else(|| PlexusError::Handshake("malformed signature".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| PlexusError::Handshake(format!("malformed signature: {}", e)))?;
        key.verify(hello_payload(envelope).as_bytes(), &signature)
            .map_err(|_| PlexusError::Handshake("signature verification failed".to_string()))
    }
}

/// The signed portion of a hello: node identity and protocol version.
fn hello_payload(envelope: &Envelope) -> String {
    format!(
        "{}|{}",
        envelope.node_id.as_deref().unwrap_or(""),
        envelope.version.as_deref().unwrap_or("")
    )
}

fn decode_key_32(raw: &str) -> PlexusResult<[u8; 32]> {
    let bytes = hex_decode(raw)
        .ok_or_else(|| PlexusError::Handshake("key file is not hex".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| PlexusError::Handshake("key must be 32 bytes".to_string()))
}

/// Writes a fresh keypair into `dir` as `<name>.key` (public) and, for this
/// node's own identity, `node.key_secret`. Returns the public key hex.
pub fn create_keypair_files(dir: &Path, name: &str, own_identity: bool) -> PlexusResult<String> {
    std::fs::create_dir_all(dir)?;
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let signing = SigningKey::from_bytes(&secret);
    let public_hex = hex_encode(signing.verifying_key().as_bytes());
    std::fs::write(dir.join(format!("{}.key", name)), &public_hex)?;
    if own_identity {
        std::fs::write(dir.join(SECRET_FILE), hex_encode(&secret))?;
    }
    Ok(public_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::wire::HeaderFlags;

    #[test]
    fn signed_hello_verifies_against_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        create_keypair_files(dir.path(), "node", true).unwrap();
        let keys = AuthKeys::load(dir.path()).unwrap();

        let mut hello = Envelope::new(HeaderFlags::ACKNOWLEDGE | HeaderFlags::CLIENT);
        hello.node_id = Some("abc".into());
        hello.version = Some("1".into());
        keys.sign_hello(&mut hello);
        assert!(keys.verify_hello(&hello).is_ok());

        // Tampering with the signed fields must fail verification.
        hello.node_id = Some("evil".into());
        assert!(keys.verify_hello(&hello).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        create_keypair_files(dir_a.path(), "node", true).unwrap();
        create_keypair_files(dir_b.path(), "node", true).unwrap();
        let keys_a = AuthKeys::load(dir_a.path()).unwrap();
        let keys_b = AuthKeys::load(dir_b.path()).unwrap();

        let mut hello = Envelope::new(HeaderFlags::ACKNOWLEDGE);
        hello.node_id = Some("abc".into());
        keys_b.sign_hello(&mut hello);
        assert!(keys_a.verify_hello(&hello).is_err());
    }
}
