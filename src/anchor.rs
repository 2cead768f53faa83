use crate::*;

use async_trait::async_trait;
use ed25519_dalek::PublicKey;
use ed25519_dalek::Signature;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Memo payload prefix identifying anchored merkle roots on the ledger
pub const MEMO_PREFIX: &str = "POLLSAT_MERKLE_ROOT:";

const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_millis(50);

/// Status of an anchoring transaction. Transitions are monotonic:
/// `Pending -> Confirmed` or `Pending -> Failed`, never backward.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Pending,
    Confirmed,
    Failed,
}

impl AnchorStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, AnchorStatus::Pending)
    }

    /// Setting the same status twice is allowed (idempotent writes);
    /// leaving a final status is not.
    pub fn can_transition(self, next: AnchorStatus) -> bool {
        self == next || self == AnchorStatus::Pending
    }
}

impl std::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A merkle root's anchoring record. `id` doubles as the batch id stamped
/// onto the votes the root commits to.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnchorRecord {
    pub id: Uuid,
    pub merkle_root: String,
    pub ledger_tx: String,
    pub status: AnchorStatus,
}

/// A signed memo transaction as submitted to the ledger
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemoTransaction {
    pub memo: String,

    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
}

/// A transaction as read back from the ledger
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LedgerTx {
    pub id: String,
    pub memo: String,
    pub signer: String,
    pub slot: u64,
    pub err: Option<String>,
    pub finalized: bool,
}

/// Ledger RPC contract. The ledger itself is an opaque external service;
/// it accepts signed transactions, returns an id synchronously, and reaches
/// finality asynchronously.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed memo transaction, returning its transaction id
    async fn submit(&self, tx: MemoTransaction) -> Result<String, Error>;

    /// Look up a transaction by id. Absence is `Ok(None)`, not an error.
    async fn get_transaction(&self, tx_id: &str) -> Result<Option<LedgerTx>, Error>;

    /// Look up a transaction by its memo payload. Used to resolve
    /// submissions whose outcome is unknown before retrying them.
    async fn find_by_memo(&self, memo: &str) -> Result<Option<LedgerTx>, Error>;
}

/// Caller-supplied bounds on confirmation polling
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Submits merkle roots to the ledger and reads back their finality
pub struct LedgerAnchor {
    client: Arc<dyn LedgerClient>,
    custodian: Arc<KeyCustodian>,
}

impl LedgerAnchor {
    pub fn new(client: Arc<dyn LedgerClient>, custodian: Arc<KeyCustodian>) -> Self {
        LedgerAnchor { client, custodian }
    }

    /// Wrap `merkle_root` in the memo payload, sign it with the device key,
    /// and submit it.
    ///
    /// Transient failures are retried with bounded backoff. An ambiguous
    /// outcome is never blindly resubmitted: the ledger is checked for the
    /// memo first, and an already-landed transaction is returned as-is.
    pub async fn submit(&self, merkle_root: &str) -> Result<String, Error> {
        let memo = format!("{}{}", MEMO_PREFIX, merkle_root);
        let signature = self.custodian.sign(memo.as_bytes()).await?;
        let public_key = self.custodian.public_key().await?;

        let tx = MemoTransaction {
            memo,
            signature,
            public_key,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.submit(tx.clone()).await {
                Ok(tx_id) => {
                    tracing::info!(%tx_id, merkle_root, "anchored merkle root");
                    return Ok(tx_id);
                }
                Err(Error::NetworkTransient(msg)) if attempt < SUBMIT_ATTEMPTS => {
                    tracing::debug!(attempt, %msg, "transient ledger error, backing off");
                    tokio::time::sleep(SUBMIT_BACKOFF * attempt).await;
                }
                Err(Error::LedgerSubmissionUnknown(msg)) => {
                    tracing::warn!(%msg, "ledger submission outcome unknown, checking ledger");
                    if let Some(existing) = self.client.find_by_memo(&tx.memo).await? {
                        tracing::info!(tx_id = %existing.id, "submission had landed");
                        return Ok(existing.id);
                    }
                    if attempt >= SUBMIT_ATTEMPTS {
                        return Err(Error::LedgerSubmissionUnknown(msg));
                    }
                    tokio::time::sleep(SUBMIT_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Poll the ledger for finality of `tx_id` under the caller's policy.
    /// Never hangs: an exhausted policy reports `Pending` for later
    /// re-polling, and a ledger-reported error reports `Failed`.
    pub async fn confirm(&self, tx_id: &str, policy: &RetryPolicy) -> Result<AnchorStatus, Error> {
        let deadline = tokio::time::Instant::now() + policy.timeout;

        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                if tokio::time::Instant::now() + policy.interval > deadline {
                    break;
                }
                tokio::time::sleep(policy.interval).await;
            }

            match self.client.get_transaction(tx_id).await {
                Ok(Some(tx)) => {
                    if let Some(err) = tx.err {
                        tracing::warn!(%tx_id, %err, "ledger reports transaction failed");
                        return Ok(AnchorStatus::Failed);
                    }
                    if tx.finalized {
                        return Ok(AnchorStatus::Confirmed);
                    }
                    tracing::debug!(%tx_id, attempt, "transaction not yet final");
                }
                Ok(None) => {
                    tracing::debug!(%tx_id, attempt, "transaction not yet visible");
                }
                Err(Error::NetworkTransient(msg)) => {
                    tracing::debug!(%tx_id, %msg, "transient error polling ledger");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(AnchorStatus::Pending)
    }

    /// Read-only transaction lookup; unknown ids are `Ok(None)`
    pub async fn fetch_transaction(&self, tx_id: &str) -> Result<Option<LedgerTx>, Error> {
        self.client.get_transaction(tx_id).await
    }
}

#[derive(Default)]
struct MemLedgerInner {
    transactions: IndexMap<String, LedgerTx>,
    transient_failures: u32,
    unknown_outcomes: u32,
    fail_next_tx: bool,
    hold_finality: bool,
    next_slot: u64,
}

/// An in-memory ledger for tests and embedding, with failure-injection
/// knobs for the transient, ambiguous, and rejected submission paths.
#[derive(Default)]
pub struct MemLedger {
    inner: Mutex<MemLedgerInner>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submissions with a transient network error
    pub async fn inject_transient_failures(&self, n: u32) {
        self.inner.lock().await.transient_failures = n;
    }

    /// Accept the next `n` submissions but report their outcome as unknown
    pub async fn inject_unknown_outcomes(&self, n: u32) {
        self.inner.lock().await.unknown_outcomes = n;
    }

    /// Record the next transaction with a ledger-reported error
    pub async fn fail_next_transaction(&self) {
        self.inner.lock().await.fail_next_tx = true;
    }

    /// Stop finalizing new transactions until `finalize` is called
    pub async fn hold_finality(&self, hold: bool) {
        self.inner.lock().await.hold_finality = hold;
    }

    /// Mark a held transaction as final
    pub async fn finalize(&self, tx_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| Error::NotFound(tx_id.to_string()))?;
        tx.finalized = true;
        Ok(())
    }

    pub async fn transaction_count(&self) -> usize {
        self.inner.lock().await.transactions.len()
    }

    fn record(inner: &mut MemLedgerInner, tx: MemoTransaction) -> String {
        // Like most ledgers, the transaction id is the submission signature,
        // so resubmitting an identical payload cannot create a second record
        let tx_id = hex::encode(&tx.signature.to_bytes()[..]);
        if inner.transactions.contains_key(&tx_id) {
            return tx_id;
        }

        let valid = tx
            .public_key
            .verify_strict(tx.memo.as_bytes(), &tx.signature)
            .is_ok();

        let err = if !valid {
            Some("signature verification failed".to_string())
        } else if inner.fail_next_tx {
            inner.fail_next_tx = false;
            Some("transaction failed".to_string())
        } else {
            None
        };

        inner.next_slot += 1;
        let ledger_tx = LedgerTx {
            id: tx_id.clone(),
            memo: tx.memo,
            signer: hex::encode(tx.public_key.as_bytes()),
            slot: inner.next_slot,
            err,
            finalized: !inner.hold_finality,
        };
        inner.transactions.insert(tx_id.clone(), ledger_tx);
        tx_id
    }
}

#[async_trait]
impl LedgerClient for MemLedger {
    async fn submit(&self, tx: MemoTransaction) -> Result<String, Error> {
        let mut inner = self.inner.lock().await;

        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(Error::NetworkTransient("connection reset".to_string()));
        }

        if inner.unknown_outcomes > 0 {
            inner.unknown_outcomes -= 1;
            // The transaction lands, but the caller never hears back
            let memo = tx.memo.clone();
            Self::record(&mut inner, tx);
            return Err(Error::LedgerSubmissionUnknown(memo));
        }

        Ok(Self::record(&mut inner, tx))
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<LedgerTx>, Error> {
        Ok(self.inner.lock().await.transactions.get(tx_id).cloned())
    }

    async fn find_by_memo(&self, memo: &str) -> Result<Option<LedgerTx>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .values()
            .find(|tx| tx.memo == memo)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
        }
    }

    async fn anchor_with_ledger() -> (LedgerAnchor, Arc<MemLedger>) {
        let store: Arc<dyn KeyStore> = Arc::new(MemKeyStore::new());
        let custodian = Arc::new(KeyCustodian::new(store));
        custodian.get_or_create_keypair().await.unwrap();

        let ledger = Arc::new(MemLedger::new());
        (LedgerAnchor::new(ledger.clone(), custodian), ledger)
    }

    #[tokio::test]
    async fn test_submit_and_confirm() {
        let (anchor, _ledger) = anchor_with_ledger().await;

        let root = sha256_hex(b"root");
        let tx_id = anchor.submit(&root).await.unwrap();

        let status = anchor.confirm(&tx_id, &quick_policy()).await.unwrap();
        assert_eq!(status, AnchorStatus::Confirmed);

        let tx = anchor.fetch_transaction(&tx_id).await.unwrap().unwrap();
        assert_eq!(tx.memo, format!("{}{}", MEMO_PREFIX, root));
    }

    #[tokio::test]
    async fn test_fetch_unknown_transaction() {
        let (anchor, _ledger) = anchor_with_ledger().await;
        assert!(anchor.fetch_transaction("no-such-tx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_retries_transient_failures() {
        let (anchor, ledger) = anchor_with_ledger().await;
        ledger.inject_transient_failures(2).await;

        let tx_id = anchor.submit(&sha256_hex(b"root")).await.unwrap();
        assert!(ledger.get_transaction(&tx_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_submit_surfaces_exhausted_transient_failures() {
        let (anchor, ledger) = anchor_with_ledger().await;
        ledger.inject_transient_failures(10).await;

        match anchor.submit(&sha256_hex(b"root")).await {
            Err(Error::NetworkTransient(_)) => (),
            other => panic!("expected NetworkTransient, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_outcome_resolved_from_ledger() {
        let (anchor, ledger) = anchor_with_ledger().await;
        ledger.inject_unknown_outcomes(1).await;

        // The first submission lands but reports unknown; the anchor must
        // find it on the ledger instead of resubmitting
        let tx_id = anchor.submit(&sha256_hex(b"root")).await.unwrap();
        assert_eq!(ledger.transaction_count().await, 1);
        assert!(ledger.get_transaction(&tx_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_anchoring_idempotent() {
        let (anchor, ledger) = anchor_with_ledger().await;

        let root = sha256_hex(b"root");
        let first = anchor.submit(&root).await.unwrap();
        let second = anchor.submit(&root).await.unwrap();

        // Deterministic signing means the resubmission maps to the same
        // transaction; no duplicate permanent record
        assert_eq!(first, second);
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_confirm_timeout_reports_pending() {
        let (anchor, ledger) = anchor_with_ledger().await;
        ledger.hold_finality(true).await;

        let tx_id = anchor.submit(&sha256_hex(b"root")).await.unwrap();
        let status = anchor.confirm(&tx_id, &quick_policy()).await.unwrap();
        assert_eq!(status, AnchorStatus::Pending);

        // Re-polling after finalization confirms
        ledger.finalize(&tx_id).await.unwrap();
        let status = anchor.confirm(&tx_id, &quick_policy()).await.unwrap();
        assert_eq!(status, AnchorStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_confirm_classifies_ledger_failure() {
        let (anchor, ledger) = anchor_with_ledger().await;
        ledger.fail_next_transaction().await;

        let tx_id = anchor.submit(&sha256_hex(b"root")).await.unwrap();
        let status = anchor.confirm(&tx_id, &quick_policy()).await.unwrap();
        assert_eq!(status, AnchorStatus::Failed);
    }

    #[test]
    fn test_anchor_status_transitions() {
        use AnchorStatus::*;

        assert!(Pending.can_transition(Confirmed));
        assert!(Pending.can_transition(Failed));
        assert!(Confirmed.can_transition(Confirmed));
        assert!(!Confirmed.can_transition(Pending));
        assert!(!Confirmed.can_transition(Failed));
        assert!(!Failed.can_transition(Confirmed));
    }
}
