use crate::*;

use async_trait::async_trait;
use ed25519_dalek::PublicKey;
use ed25519_dalek::Signature;
use std::sync::Arc;

/// Proof-of-possession of the device keypair at a point in time.
/// Immutable once created.
///
/// Serializes to the camelCase device-auth blob format already present in
/// deployed secure storage.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSignature {
    pub device_id: String,
    pub timestamp: u64,

    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
}

impl DeviceSignature {
    /// The canonical message this signature covers
    pub fn message(&self) -> String {
        device_auth_message(&self.device_id, self.timestamp)
    }
}

fn device_auth_message(device_id: &str, timestamp: u64) -> String {
    format!("{}:{}", device_id, timestamp)
}

/// An opaque session credential issued by the backend on registration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionToken(pub String);

/// Backend registration contract: binds a device public key to an anonymous
/// session. The backend itself is an external collaborator.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, public_key: &str) -> Result<SessionToken, Error>;
}

/// Signs and verifies device-identity challenges with the device keypair
pub struct Authenticator {
    custodian: Arc<KeyCustodian>,
    store: Arc<dyn KeyStore>,
}

impl Authenticator {
    pub fn new(custodian: Arc<KeyCustodian>, store: Arc<dyn KeyStore>) -> Self {
        Authenticator { custodian, store }
    }

    /// Sign `device_id:timestamp` with the device key and persist the
    /// resulting device-auth blob.
    pub async fn create_device_signature(
        &self,
        device_id: &str,
    ) -> Result<DeviceSignature, Error> {
        self.custodian.get_or_create_keypair().await?;

        let timestamp = now_millis();
        let message = device_auth_message(device_id, timestamp);
        let signature = self.custodian.sign(message.as_bytes()).await?;
        let public_key = self.custodian.public_key().await?;

        let device_signature = DeviceSignature {
            device_id: device_id.to_string(),
            timestamp,
            signature,
            public_key,
        };

        self.store
            .set(
                DEVICE_AUTH_KEY,
                &serde_json::to_string(&device_signature)?,
            )
            .await?;

        Ok(device_signature)
    }

    /// The stored device-auth blob, if any
    pub async fn device_auth(&self) -> Result<Option<DeviceSignature>, Error> {
        let raw = match self.store.get(DEVICE_AUTH_KEY).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Register this device's public key with the backend, reusing a stored
    /// device signature when one exists, and return the session credential.
    pub async fn register<R: Registrar + ?Sized>(
        &self,
        device_id: &str,
        registrar: &R,
    ) -> Result<(DeviceSignature, SessionToken), Error> {
        let device_signature = match self.device_auth().await? {
            Some(existing) => existing,
            None => self.create_device_signature(device_id).await?,
        };

        let public_key = hex::encode(device_signature.public_key.as_bytes());
        let token = registrar.register(&public_key).await?;

        tracing::debug!(device_id, "registered device with backend");

        Ok((device_signature, token))
    }
}

/// Verify a device signature against its own public key. Pure; returns
/// false rather than erroring.
pub fn verify_device_signature(device_signature: &DeviceSignature) -> bool {
    device_signature
        .public_key
        .verify_strict(
            device_signature.message().as_bytes(),
            &device_signature.signature,
        )
        .is_ok()
}

/// Verify a detached hex-encoded signature against a hex-encoded public key.
/// Malformed input of any kind yields false, never an error.
pub fn verify_detached(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match Signature::from_bytes(&signature_bytes) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let public_key_bytes = match hex::decode(public_key_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let public_key = match PublicKey::from_bytes(&public_key_bytes) {
        Ok(public_key) => public_key,
        Err(_) => return false,
    };

    public_key.verify_strict(message, &signature).is_ok()
}
