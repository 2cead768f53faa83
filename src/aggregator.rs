use crate::*;

use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one aggregation pass
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub merkle_root: String,
    pub ledger_tx: String,
    pub vote_count: usize,
}

/// Drains unanchored votes into a merkle tree and anchors its root.
///
/// There must be a single designated aggregator at a time; the select-and-
/// mark step in the store enforces the no-double-batching invariant if a
/// second one does slip in.
pub struct Aggregator {
    store: Arc<dyn VoteStore>,
    anchor: Arc<LedgerAnchor>,
    keystore: Arc<dyn KeyStore>,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn VoteStore>,
        anchor: Arc<LedgerAnchor>,
        keystore: Arc<dyn KeyStore>,
    ) -> Self {
        Aggregator {
            store,
            anchor,
            keystore,
        }
    }

    /// Take all unbatched votes, build a tree over their hashes in stored
    /// order, anchor the root, and record the anchor. Returns None when
    /// there was nothing to batch.
    ///
    /// A failed anchoring rolls the batch mark back, leaving the votes
    /// unbatched for the next pass.
    pub async fn run_batch(&self) -> Result<Option<BatchSummary>, Error> {
        let batch_id = Uuid::new_v4();
        let votes = self.store.take_unbatched(batch_id).await?;
        if votes.is_empty() {
            tracing::debug!("no unbatched votes");
            return Ok(None);
        }

        let hashes: Vec<String> = votes.iter().map(|vote| vote.vote_hash.clone()).collect();
        let tree = MerkleTree::build(&hashes)?;
        let merkle_root = tree.root().to_string();

        let ledger_tx = match self.anchor.submit(&merkle_root).await {
            Ok(tx_id) => tx_id,
            Err(err) => {
                tracing::warn!(%batch_id, %err, "anchoring failed, releasing batch");
                self.store.unassign_batch(batch_id).await?;
                return Err(err);
            }
        };

        self.store
            .insert_anchor(AnchorRecord {
                id: batch_id,
                merkle_root: merkle_root.clone(),
                ledger_tx: ledger_tx.clone(),
                status: AnchorStatus::Pending,
            })
            .await?;

        // Remember the latest root and anchoring transaction locally
        self.keystore.set(MERKLE_ROOT_KEY, &merkle_root).await?;
        self.keystore.set(LEDGER_TX_KEY, &ledger_tx).await?;

        tracing::info!(
            %batch_id,
            merkle_root = %merkle_root,
            vote_count = votes.len(),
            "batched and anchored votes"
        );

        Ok(Some(BatchSummary {
            batch_id,
            merkle_root,
            ledger_tx,
            vote_count: votes.len(),
        }))
    }
}
