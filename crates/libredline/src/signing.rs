use anyhow::{Context, Result};
use base64::Engine;
use k256::PublicKey;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use redline_protocol::EngagementId;

/// Broadcast on the coordination bus when the kill switch fires.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HaltAnnouncement {
    pub reason: String,
    pub actor: String,
    pub engagements: Vec<EngagementId>,
    pub issued_at_epoch_ms: u64,
    pub nonce: String,
}

/// JSON payload plus a base64 DER ECDSA signature and the signer's SEC1 public key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub payload: String,
    pub signature: String,
    pub public_key: String,
}

impl SignedPayload {
    /// Check the signature against a pinned public key (base64 SEC1).
    ///
    /// The embedded `public_key` only identifies the signer; a payload signed
    /// by any other key fails even if it is internally consistent.
    pub fn verify(&self, trusted_public_key: &str) -> bool {
        if self.public_key != trusted_public_key {
            return false;
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        let Ok(public_key_bytes) = b64.decode(trusted_public_key) else {
            return false;
        };
        let Ok(public_key) = PublicKey::from_sec1_bytes(&public_key_bytes) else {
            return false;
        };
        let Ok(signature_bytes) = b64.decode(&self.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(&signature_bytes) else {
            return false;
        };
        VerifyingKey::from(public_key)
            .verify(self.payload.as_bytes(), &signature)
            .is_ok()
    }

    pub fn announcement(&self) -> Result<HaltAnnouncement> {
        serde_json::from_str(&self.payload).context("payload is not a halt announcement")
    }
}

/// Signs halt announcements with the daemon's secp256k1 key.
pub struct HaltSigner {
    signing_key: SigningKey,
    public_key_b64: String,
}

impl HaltSigner {
    /// Fresh per-process key.
    pub fn generate() -> Self {
        Self::from_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(bytes).context("failed to construct signing key")?;
        Ok(Self::from_key(signing_key))
    }

    /// Load the persisted halt key, or create one at `path`.
    ///
    /// With `None` the key is ephemeral and lives only as long as the process.
    pub fn load_or_create(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::generate());
        };

        let b64 = base64::engine::general_purpose::STANDARD;
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read halt key {}", path.display()))?;
            let secret = b64
                .decode(raw.trim())
                .context("halt key is not valid base64")?;
            return Self::from_secret_bytes(&secret);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create halt key directory {}", parent.display())
            })?;
        }
        let signer = Self::generate();
        fs::write(path, b64.encode(signer.signing_key.to_bytes()))
            .with_context(|| format!("failed to write halt key {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set halt key permissions {}", path.display()))?;
        Ok(signer)
    }

    fn from_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from(signing_key.verifying_key());
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(public_key.to_sec1_bytes());
        Self {
            signing_key,
            public_key_b64,
        }
    }

    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }

    pub fn sign(&self, announcement: &HaltAnnouncement) -> Result<SignedPayload> {
        let payload = serde_json::to_string(announcement)?;
        let sig: Signature = self.signing_key.sign(payload.as_bytes());
        Ok(SignedPayload {
            payload,
            signature: base64::engine::general_purpose::STANDARD.encode(sig.to_der().as_bytes()),
            public_key: self.public_key_b64.clone(),
        })
    }
}

impl fmt::Debug for HaltSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaltSigner")
            .field("public_key", &self.public_key_b64)
            .finish_non_exhaustive()
    }
}

/// Random hex nonce so two announcements with identical fields still differ.
pub fn nonce() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
