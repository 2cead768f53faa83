use crate::*;

use async_trait::async_trait;
use ed25519_dalek::ExpandedSecretKey;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use ed25519_dalek::Signature;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Storage key for the device keypair blob
pub const DEVICE_KEYPAIR_KEY: &str = "POLLSAT_DEVICE_KEYPAIR";

/// Storage key for the device-auth blob
pub const DEVICE_AUTH_KEY: &str = "POLLSAT_DEVICE_AUTH";

/// Storage key for the last known merkle root
pub const MERKLE_ROOT_KEY: &str = "POLLSAT_MERKLE_ROOT";

/// Storage key for the last anchoring transaction id
pub const LEDGER_TX_KEY: &str = "POLLSAT_LEDGER_TX";

/// Storage key for locally cached votes pending sync
pub const LOCAL_VOTE_CACHE_KEY: &str = "POLLSAT_VOTES";

/// Secure key-value storage holding opaque string values.
///
/// Implementations map their own failures to `Error::StorageUnavailable`,
/// which is fatal and never retried.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

/// A simple key store backed by an in-memory BTreeMap
#[derive(Default)]
pub struct MemKeyStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemKeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}

/// On-disk representation of the device keypair
#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    secret_key: String,
    public_key: String,
}

/// The public half of the device keypair, plus whether it already existed
/// in secure storage before the call.
#[derive(Clone, Copy, Debug)]
pub struct DeviceKey {
    pub public_key: PublicKey,
    pub existing: bool,
}

/// Owns the device keypair for the lifetime of the installation.
///
/// The secret key lives in the key store and is only ever read back into
/// this type to produce signatures. Signing requests pass message bytes in;
/// nothing ever pulls the secret out.
pub struct KeyCustodian {
    store: Arc<dyn KeyStore>,
    // Guards first-run generation so concurrent calls cannot race two
    // distinct keypairs into storage.
    generation: Mutex<()>,
}

impl KeyCustodian {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        KeyCustodian {
            store,
            generation: Mutex::new(()),
        }
    }

    /// Return the stored keypair's public half, generating and persisting a
    /// new keypair if secure storage holds none. At-most-once per device:
    /// there is no regeneration path while a keypair is stored, and no
    /// recovery path if storage is lost.
    pub async fn get_or_create_keypair(&self) -> Result<DeviceKey, Error> {
        if let Some(keypair) = self.load().await? {
            return Ok(DeviceKey {
                public_key: keypair.public,
                existing: true,
            });
        }

        let _guard = self.generation.lock().await;

        // Another caller may have generated while we waited on the lock
        if let Some(keypair) = self.load().await? {
            return Ok(DeviceKey {
                public_key: keypair.public,
                existing: true,
            });
        }

        let (secret, public) = generate_keypair();
        let stored = StoredKeyPair {
            secret_key: hex::encode(secret.as_bytes()),
            public_key: hex::encode(public.as_bytes()),
        };
        self.store
            .set(DEVICE_KEYPAIR_KEY, &serde_json::to_string(&stored)?)
            .await?;

        tracing::info!(public_key = %hex::encode(public.as_bytes()), "generated device keypair");

        Ok(DeviceKey {
            public_key: public,
            existing: false,
        })
    }

    /// The stored public key, or `NoKeyPair` if none has been generated yet
    pub async fn public_key(&self) -> Result<PublicKey, Error> {
        let keypair = self.load().await?.ok_or(Error::NoKeyPair)?;
        Ok(keypair.public)
    }

    /// Produce a detached signature over `message` with the device secret key
    pub async fn sign(&self, message: &[u8]) -> Result<Signature, Error> {
        let keypair = self.load().await?.ok_or(Error::NoKeyPair)?;
        let expanded: ExpandedSecretKey = (&keypair.secret).into();
        Ok(expanded.sign(message, &keypair.public))
    }

    async fn load(&self) -> Result<Option<Keypair>, Error> {
        let raw = match self.store.get(DEVICE_KEYPAIR_KEY).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let stored: StoredKeyPair =
            serde_json::from_str(&raw).map_err(|_| Error::KeyPairCorrupt)?;
        let secret_bytes = hex::decode(&stored.secret_key).map_err(|_| Error::KeyPairCorrupt)?;
        let secret = SecretKey::from_bytes(&secret_bytes).map_err(|_| Error::KeyPairCorrupt)?;
        let public = PublicKey::from(&secret);

        if hex::encode(public.as_bytes()) != stored.public_key {
            return Err(Error::KeyPairCorrupt);
        }

        Ok(Some(Keypair { secret, public }))
    }
}
