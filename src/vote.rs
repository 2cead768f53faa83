use crate::*;

use std::sync::Arc;
use uuid::Uuid;

/// The output of signing a vote: the canonical hash and the detached
/// signature over the same canonical string. Not persisted here -
/// persistence belongs to the external collaborator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SignedVote {
    pub vote_hash: String,
    pub signature: String,
    pub timestamp: u64,
}

/// A persisted vote row. Immutable after creation except for
/// `merkle_root_id`, which is set exactly once when the vote is batched.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VoteRecord {
    pub id: Uuid,
    pub voter_id: String,
    pub poll_id: String,
    pub option_id: String,
    pub timestamp: u64,
    pub vote_hash: String,
    pub signature: String,
    pub merkle_root_id: Option<Uuid>,
}

impl VoteRecord {
    pub fn new(
        voter_id: &str,
        poll_id: &str,
        option_id: &str,
        signed_vote: &SignedVote,
    ) -> Self {
        VoteRecord {
            id: Uuid::new_v4(),
            voter_id: voter_id.to_string(),
            poll_id: poll_id.to_string(),
            option_id: option_id.to_string(),
            timestamp: signed_vote.timestamp,
            vote_hash: signed_vote.vote_hash.clone(),
            signature: signed_vote.signature.clone(),
            merkle_root_id: None,
        }
    }
}

/// Canonical string a vote signature and hash both cover.
///
/// The timestamp is a mandatory component: without it two identical
/// voter/poll/option tuples would collide to the same hash and aggregation
/// would silently merge two distinct voter intents.
pub fn vote_message(voter_id: &str, poll_id: &str, option_id: &str, timestamp: u64) -> String {
    format!("{}:{}:{}:{}", voter_id, poll_id, option_id, timestamp)
}

/// Deterministic hash of the canonical vote tuple
pub fn vote_hash(voter_id: &str, poll_id: &str, option_id: &str, timestamp: u64) -> String {
    sha256_hex(vote_message(voter_id, poll_id, option_id, timestamp).as_bytes())
}

/// Produces vote hashes and signatures binding {voter, poll, option, time}
pub struct VoteSigner {
    custodian: Arc<KeyCustodian>,
}

impl VoteSigner {
    pub fn new(custodian: Arc<KeyCustodian>) -> Self {
        VoteSigner { custodian }
    }

    /// Capture a timestamp, hash the canonical vote tuple, and sign it with
    /// the device key. No side effects beyond using the keypair.
    pub async fn sign_vote(
        &self,
        poll_id: &str,
        option_id: &str,
        voter_id: &str,
    ) -> Result<SignedVote, Error> {
        let timestamp = now_millis();
        let message = vote_message(voter_id, poll_id, option_id, timestamp);
        let vote_hash = sha256_hex(message.as_bytes());
        let signature = self.custodian.sign(message.as_bytes()).await?;

        Ok(SignedVote {
            vote_hash,
            signature: hex::encode(&signature.to_bytes()[..]),
            timestamp,
        })
    }
}

/// Check a persisted vote row against a voter public key: the stored hash
/// must match the recomputed canonical hash, and the signature must verify.
/// Pure; malformed rows yield false.
pub fn verify_vote_record(record: &VoteRecord, public_key_hex: &str) -> bool {
    let message = vote_message(
        &record.voter_id,
        &record.poll_id,
        &record.option_id,
        record.timestamp,
    );

    if sha256_hex(message.as_bytes()) != record.vote_hash {
        return false;
    }

    verify_detached(message.as_bytes(), &record.signature, public_key_hex)
}

/// Ordered sequence of vote records pending sync, kept in secure storage so
/// a vote survives the app dying before the backend accepts it.
pub struct VoteCache {
    store: Arc<dyn KeyStore>,
}

impl VoteCache {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        VoteCache { store }
    }

    pub async fn push(&self, record: &VoteRecord) -> Result<(), Error> {
        let mut records = self.all().await?;
        records.push(record.clone());
        self.store
            .set(LOCAL_VOTE_CACHE_KEY, &serde_json::to_string(&records)?)
            .await
    }

    pub async fn all(&self) -> Result<Vec<VoteRecord>, Error> {
        match self.store.get(LOCAL_VOTE_CACHE_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn clear(&self) -> Result<(), Error> {
        self.store.remove(LOCAL_VOTE_CACHE_KEY).await
    }
}

/// Vote lifecycle states. `Verified` and `Failed` are terminal.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Created,
    Signed,
    Submitted,
    Batched,
    Anchored,
    Verified,
    Failed,
}

impl VoteStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, VoteStatus::Verified | VoteStatus::Failed)
    }

    /// Whether `next` is a legal successor state
    pub fn can_transition(self, next: VoteStatus) -> bool {
        use VoteStatus::*;
        match (self, next) {
            (Created, Signed) => true,
            (Signed, Submitted) => true,
            (Submitted, Batched) => true,
            (Batched, Anchored) => true,
            (Anchored, Verified) => true,
            (Submitted, Failed) | (Batched, Failed) | (Anchored, Failed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> VoteSigner {
        let store: Arc<dyn KeyStore> = Arc::new(MemKeyStore::new());
        let custodian = Arc::new(KeyCustodian::new(store));
        VoteSigner::new(custodian)
    }

    #[test]
    fn test_vote_hash_determinism() {
        let a = vote_hash("voter", "poll", "option", 1000);
        let b = vote_hash("voter", "poll", "option", 1000);
        assert_eq!(a, b);

        // Changing any single argument changes the output
        assert_ne!(a, vote_hash("voter2", "poll", "option", 1000));
        assert_ne!(a, vote_hash("voter", "poll2", "option", 1000));
        assert_ne!(a, vote_hash("voter", "poll", "option2", 1000));
        assert_ne!(a, vote_hash("voter", "poll", "option", 1001));
    }

    #[tokio::test]
    async fn test_sign_vote() {
        let signer = signer();
        signer.custodian.get_or_create_keypair().await.unwrap();
        let public_key = signer.custodian.public_key().await.unwrap();

        let signed = signer.sign_vote("poll-1", "option-1", "voter-1").await.unwrap();
        assert_eq!(signed.vote_hash.len(), 64);
        assert_eq!(
            signed.vote_hash,
            vote_hash("voter-1", "poll-1", "option-1", signed.timestamp)
        );

        let record = VoteRecord::new("voter-1", "poll-1", "option-1", &signed);
        assert!(record.merkle_root_id.is_none());
        assert!(verify_vote_record(
            &record,
            &hex::encode(public_key.as_bytes())
        ));
    }

    #[tokio::test]
    async fn test_tampered_vote_record() {
        let signer = signer();
        signer.custodian.get_or_create_keypair().await.unwrap();
        let public_key = signer.custodian.public_key().await.unwrap();
        let public_key_hex = hex::encode(public_key.as_bytes());

        let signed = signer.sign_vote("poll-1", "option-1", "voter-1").await.unwrap();

        let mut record = VoteRecord::new("voter-1", "poll-1", "option-1", &signed);
        record.option_id = "option-2".to_string();
        assert!(!verify_vote_record(&record, &public_key_hex));

        let mut record = VoteRecord::new("voter-1", "poll-1", "option-1", &signed);
        record.vote_hash = sha256_hex(b"something else");
        assert!(!verify_vote_record(&record, &public_key_hex));
    }

    #[tokio::test]
    async fn test_vote_cache_preserves_order() {
        let store: Arc<dyn KeyStore> = Arc::new(MemKeyStore::new());
        let cache = VoteCache::new(store);

        assert!(cache.all().await.unwrap().is_empty());

        for n in 0..3 {
            let signed = SignedVote {
                vote_hash: sha256_hex(format!("vote-{}", n).as_bytes()),
                signature: String::new(),
                timestamp: 1000 + n,
            };
            let record = VoteRecord::new(&format!("voter-{}", n), "poll-1", "option-1", &signed);
            cache.push(&record).await.unwrap();
        }

        let records = cache.all().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].voter_id, "voter-0");
        assert_eq!(records[2].voter_id, "voter-2");

        cache.clear().await.unwrap();
        assert!(cache.all().await.unwrap().is_empty());
    }

    #[test]
    fn test_vote_status_transitions() {
        use VoteStatus::*;

        assert!(Created.can_transition(Signed));
        assert!(Signed.can_transition(Submitted));
        assert!(Submitted.can_transition(Batched));
        assert!(Batched.can_transition(Anchored));
        assert!(Anchored.can_transition(Verified));

        assert!(Submitted.can_transition(Failed));
        assert!(Batched.can_transition(Failed));
        assert!(Anchored.can_transition(Failed));

        // No failure before submission, no skipping, no leaving terminals
        assert!(!Created.can_transition(Failed));
        assert!(!Signed.can_transition(Failed));
        assert!(!Created.can_transition(Batched));
        assert!(!Verified.can_transition(Failed));
        assert!(!Failed.can_transition(Submitted));
        assert!(Verified.is_terminal());
        assert!(Failed.is_terminal());
    }
}
