//! Node identity and transaction authenticators.
//!
//! The node's own identity is an ed25519 keypair persisted as raw bytes in
//! `<dir>/nodekey`. Transactions carry the *name* of their authenticator,
//! a pairing of identifier-derivation and signature-verification algorithms.
//! Two families are registered by default: `ed25519` (raw public key
//! identity) and `secp256k1_ep` (Ethereum "personal sign", 20-byte address
//! identity recovered from the signature).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::Hash;

/// Authenticator name for ed25519 raw-key signatures.
pub const ED25519_AUTH: &str = "ed25519";
/// Authenticator name for Ethereum personal-sign secp256k1 signatures.
pub const ETH_PERSONAL_SIGN_AUTH: &str = "secp256k1_ep";

/// Errors from key handling and signature verification.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown authenticator: {0}")]
    UnknownAuthenticator(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("key file error: {0}")]
    KeyFile(String),
}

/// The node's ed25519 signing identity.
#[derive(Clone)]
pub struct NodeKeypair {
    signing: ed25519_dalek::SigningKey,
}

impl NodeKeypair {
    pub fn generate() -> Self {
        NodeKeypair {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::KeyFile("node key must be 32 bytes".into()))?;
        Ok(NodeKeypair {
            signing: ed25519_dalek::SigningKey::from_bytes(&arr),
        })
    }

    /// Raw secret bytes, suitable for the `nodekey` file.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Raw public key bytes (32 bytes).
    pub fn public_bytes(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    /// The peer identifier derived from the public key.
    pub fn peer_id(&self) -> Hash {
        peer_id_from_pubkey(&self.public_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKeypair({})", hex::encode(&self.peer_id()[..8]))
    }
}

/// Derive a peer id from raw ed25519 public key bytes.
pub fn peer_id_from_pubkey(pubkey: &[u8]) -> Hash {
    crate::hash_domain(b"kwil.peerid", pubkey)
}

/// Verify an ed25519 signature over `msg` from raw 32-byte `pubkey`.
pub fn verify_ed25519(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), AuthError> {
    let key: [u8; 32] = pubkey
        .try_into()
        .map_err(|_| AuthError::InvalidIdentity(format!("ed25519 key with {} bytes", pubkey.len())))?;
    let vk = ed25519_dalek::VerifyingKey::from_bytes(&key)
        .map_err(|e| AuthError::InvalidIdentity(e.to_string()))?;
    let sig_arr: [u8; 64] = sig
        .try_into()
        .map_err(|_| AuthError::InvalidSignature(format!("ed25519 sig with {} bytes", sig.len())))?;
    vk.verify(msg, &ed25519_dalek::Signature::from_bytes(&sig_arr))
        .map_err(|e| AuthError::InvalidSignature(e.to_string()))
}

/// Load the node key from `<dir>/nodekey`, generating and persisting a new
/// one if the file does not exist. The file holds the raw 32 secret bytes.
pub fn load_or_generate_nodekey(dir: &Path) -> Result<NodeKeypair, std::io::Error> {
    let key_path = dir.join("nodekey");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        let kp = NodeKeypair::from_secret_bytes(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        tracing::info!(peer = %hex::encode(&kp.peer_id()[..8]), "Loaded node key");
        Ok(kp)
    } else {
        std::fs::create_dir_all(dir)?;
        let kp = NodeKeypair::generate();
        std::fs::write(&key_path, kp.secret_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(peer = %hex::encode(&kp.peer_id()[..8]), "Generated node key");
        Ok(kp)
    }
}

/// A named pairing of identifier derivation and signature verification.
///
/// `sender` is the identity bytes carried in the transaction: a raw public
/// key for ed25519, a 20-byte address for eth personal sign.
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Render the sender bytes as the canonical account identifier string.
    fn identifier(&self, sender: &[u8]) -> Result<String, AuthError>;

    /// Verify that `sig` over `msg` was produced by the holder of `sender`.
    fn verify(&self, sender: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), AuthError>;
}

/// ed25519 authenticator: identity is the raw public key.
pub struct Ed25519Authenticator;

impl Authenticator for Ed25519Authenticator {
    fn name(&self) -> &'static str {
        ED25519_AUTH
    }

    fn identifier(&self, sender: &[u8]) -> Result<String, AuthError> {
        if sender.len() != 32 {
            return Err(AuthError::InvalidIdentity(format!(
                "ed25519 identity with {} bytes",
                sender.len()
            )));
        }
        Ok(hex::encode(sender))
    }

    fn verify(&self, sender: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), AuthError> {
        verify_ed25519(sender, msg, sig)
    }
}

/// Ethereum personal-sign authenticator (secp256k1 with recovery).
///
/// The identity is the 20-byte Ethereum address. Verification prefixes the
/// message the way wallets do, recovers the public key from the 65-byte
/// signature, and compares the derived address against the claimed sender.
pub struct EthPersonalSignAuthenticator;

fn keccak256(data: &[u8]) -> [u8; 32] {
    use sha3::Digest;
    let mut hasher = sha3::Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Apply the `personal_sign` text prefix and hash.
fn eth_text_hash(msg: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", msg.len());
    let mut buf = Vec::with_capacity(prefix.len() + msg.len());
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(msg);
    keccak256(&buf)
}

/// Derive the 20-byte address from an uncompressed secp256k1 public key.
fn eth_address(vk: &k256::ecdsa::VerifyingKey) -> [u8; 20] {
    let point = vk.to_encoded_point(false);
    // skip the 0x04 uncompressed tag
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    addr
}

impl Authenticator for EthPersonalSignAuthenticator {
    fn name(&self) -> &'static str {
        ETH_PERSONAL_SIGN_AUTH
    }

    fn identifier(&self, sender: &[u8]) -> Result<String, AuthError> {
        if sender.len() != 20 {
            return Err(AuthError::InvalidIdentity(format!(
                "eth address with {} bytes",
                sender.len()
            )));
        }
        Ok(format!("0x{}", hex::encode(sender)))
    }

    fn verify(&self, sender: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), AuthError> {
        if sig.len() != 65 {
            return Err(AuthError::InvalidSignature(format!(
                "expected 65-byte recoverable signature, got {}",
                sig.len()
            )));
        }
        let digest = eth_text_hash(msg);
        let signature = k256::ecdsa::Signature::from_slice(&sig[..64])
            .map_err(|e| AuthError::InvalidSignature(e.to_string()))?;
        // Wallets emit v in {27, 28}; normalize to {0, 1}.
        let v = if sig[64] >= 27 { sig[64] - 27 } else { sig[64] };
        let recid = k256::ecdsa::RecoveryId::try_from(v)
            .map_err(|e| AuthError::InvalidSignature(e.to_string()))?;
        let vk = k256::ecdsa::VerifyingKey::recover_from_prehash(&digest, &signature, recid)
            .map_err(|e| AuthError::InvalidSignature(e.to_string()))?;
        let addr = eth_address(&vk);
        if addr.as_slice() != sender {
            return Err(AuthError::InvalidSignature(format!(
                "expected address 0x{}, recovered 0x{}",
                hex::encode(sender),
                hex::encode(addr)
            )));
        }
        Ok(())
    }
}

/// Name-keyed registry of the authenticators this node accepts.
#[derive(Clone)]
pub struct AuthRegistry {
    auths: HashMap<&'static str, Arc<dyn Authenticator>>,
}

impl AuthRegistry {
    /// Registry with the two default families.
    pub fn with_defaults() -> Self {
        let mut auths: HashMap<&'static str, Arc<dyn Authenticator>> = HashMap::new();
        auths.insert(ED25519_AUTH, Arc::new(Ed25519Authenticator));
        auths.insert(ETH_PERSONAL_SIGN_AUTH, Arc::new(EthPersonalSignAuthenticator));
        AuthRegistry { auths }
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Authenticator>, AuthError> {
        self.auths
            .get(name)
            .ok_or_else(|| AuthError::UnknownAuthenticator(name.to_string()))
    }
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodekey_roundtrip() {
        let kp = NodeKeypair::generate();
        let restored = NodeKeypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_bytes(), restored.public_bytes());
        assert_eq!(kp.peer_id(), restored.peer_id());
    }

    #[test]
    fn nodekey_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let kp1 = load_or_generate_nodekey(dir.path()).unwrap();
        let kp2 = load_or_generate_nodekey(dir.path()).unwrap();
        assert_eq!(kp1.peer_id(), kp2.peer_id());
    }

    #[test]
    fn ed25519_sign_verify() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"hello");
        verify_ed25519(&kp.public_bytes(), b"hello", &sig).unwrap();
        assert!(verify_ed25519(&kp.public_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn ed25519_authenticator_identifier() {
        let kp = NodeKeypair::generate();
        let auth = Ed25519Authenticator;
        let id = auth.identifier(&kp.public_bytes()).unwrap();
        assert_eq!(id, hex::encode(kp.public_bytes()));
        assert!(auth.identifier(&[1, 2, 3]).is_err());
    }

    #[test]
    fn eth_personal_sign_roundtrip() {
        let sk = k256::ecdsa::SigningKey::random(&mut OsRng);
        let vk = sk.verifying_key();
        let addr = eth_address(vk);

        let msg = b"kwil test message";
        let digest = eth_text_hash(msg);
        let (sig, recid) = sk.sign_prehash_recoverable(&digest).unwrap();

        let mut wire = sig.to_bytes().to_vec();
        wire.push(recid.to_byte() + 27);

        let auth = EthPersonalSignAuthenticator;
        auth.verify(&addr, msg, &wire).unwrap();
        assert!(auth.verify(&addr, b"other message", &wire).is_err());

        let id = auth.identifier(&addr).unwrap();
        assert!(id.starts_with("0x"));
        assert_eq!(id.len(), 42);
    }

    #[test]
    fn registry_lookup() {
        let reg = AuthRegistry::with_defaults();
        assert!(reg.get(ED25519_AUTH).is_ok());
        assert!(reg.get(ETH_PERSONAL_SIGN_AUTH).is_ok());
        assert!(matches!(
            reg.get("bls12"),
            Err(AuthError::UnknownAuthenticator(_))
        ));
    }
}
