use crate::*;

use std::sync::Arc;
use uuid::Uuid;

/// Why a vote failed verification. These are normal negative results, not
/// errors; callers display them and move on.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The vote has not been included in any anchored batch yet
    NotBatched,
    /// The vote's proof does not check out against the anchored root
    MerkleMismatch,
    /// The anchoring transaction is not (or never became) final
    LedgerUnconfirmed,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let message = match self {
            VerificationFailure::NotBatched => "vote has not been batched yet",
            VerificationFailure::MerkleMismatch => "merkle proof does not match anchored root",
            VerificationFailure::LedgerUnconfirmed => "anchoring transaction is not confirmed",
        };
        write!(f, "{}", message)
    }
}

/// The answer to "was vote V legitimately cast and permanently recorded?",
/// with the evidence to hand to a third party when it was.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Verification {
    pub verified: bool,
    pub reason: Option<VerificationFailure>,
    pub merkle_root: Option<String>,
    pub ledger_tx: Option<String>,
}

impl Verification {
    fn failed(reason: VerificationFailure) -> Self {
        Verification {
            verified: false,
            reason: Some(reason),
            merkle_root: None,
            ledger_tx: None,
        }
    }

    fn confirmed(merkle_root: String, ledger_tx: String) -> Self {
        Verification {
            verified: true,
            reason: None,
            merkle_root: Some(merkle_root),
            ledger_tx: Some(ledger_tx),
        }
    }
}

/// Composes the store, the merkle tree, and the ledger anchor to verify a
/// single vote end to end.
pub struct VerificationService {
    store: Arc<dyn VoteStore>,
    anchor: Arc<LedgerAnchor>,
}

impl VerificationService {
    pub fn new(store: Arc<dyn VoteStore>, anchor: Arc<LedgerAnchor>) -> Self {
        VerificationService { store, anchor }
    }

    /// Verify that `vote_id` was batched, that its hash is provably included
    /// in the batch's anchored merkle root, and that the anchoring
    /// transaction is final on the ledger.
    ///
    /// A missing vote is an `Error::NotFound`; every negative verification
    /// outcome is a non-throwing `Verification` with a reason.
    pub async fn verify_vote(
        &self,
        vote_id: Uuid,
        policy: &RetryPolicy,
    ) -> Result<Verification, Error> {
        let vote = self
            .store
            .get_vote(vote_id)
            .await?
            .ok_or_else(|| Error::NotFound(vote_id.to_string()))?;

        let batch_id = match vote.merkle_root_id {
            Some(batch_id) => batch_id,
            None => return Ok(Verification::failed(VerificationFailure::NotBatched)),
        };

        let anchor_record = match self.store.get_anchor(batch_id).await? {
            Some(anchor_record) => anchor_record,
            None => return Ok(Verification::failed(VerificationFailure::NotBatched)),
        };

        // Recompute the inclusion proof from the batch as stored
        let batch_votes = self.store.votes_for_batch(batch_id).await?;
        let hashes: Vec<String> = batch_votes
            .iter()
            .map(|batch_vote| batch_vote.vote_hash.clone())
            .collect();
        let tree = MerkleTree::build(&hashes)?;

        let proof = match tree.proof(&vote.vote_hash) {
            Some(proof) => proof,
            None => return Ok(Verification::failed(VerificationFailure::MerkleMismatch)),
        };
        if !proof.verify(&anchor_record.merkle_root) {
            tracing::warn!(%vote_id, "recomputed proof does not match anchored root");
            return Ok(Verification::failed(VerificationFailure::MerkleMismatch));
        }

        // Settle the anchoring transaction's finality
        let status = match anchor_record.status {
            AnchorStatus::Confirmed => AnchorStatus::Confirmed,
            AnchorStatus::Failed => {
                return Ok(Verification::failed(VerificationFailure::LedgerUnconfirmed))
            }
            AnchorStatus::Pending => {
                let status = self.anchor.confirm(&anchor_record.ledger_tx, policy).await?;
                if status.is_final() {
                    self.store.set_anchor_status(batch_id, status).await?;
                }
                status
            }
        };

        if status == AnchorStatus::Confirmed {
            tracing::debug!(%vote_id, ledger_tx = %anchor_record.ledger_tx, "vote verified");
            Ok(Verification::confirmed(
                anchor_record.merkle_root,
                anchor_record.ledger_tx,
            ))
        } else {
            Ok(Verification::failed(VerificationFailure::LedgerUnconfirmed))
        }
    }
}
