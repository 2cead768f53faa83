use crate::*;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Contract the core requires of the persistence collaborator.
///
/// Vote rows carry a nullable batch id (`merkle_root_id`); anchor rows are
/// keyed by that same batch id. `assign_batch` must be atomic: either every
/// named vote gets the batch id or none do, and a vote that already carries
/// one is a `DoubleBatchingDetected` invariant violation.
#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn insert_vote(&self, vote: VoteRecord) -> Result<(), Error>;

    async fn get_vote(&self, id: Uuid) -> Result<Option<VoteRecord>, Error>;

    /// All votes with no batch id, in insertion order
    async fn select_unbatched(&self) -> Result<Vec<VoteRecord>, Error>;

    /// Atomically stamp `batch_id` onto every vote in `ids`. All-or-nothing.
    async fn assign_batch(&self, ids: &[Uuid], batch_id: Uuid) -> Result<(), Error>;

    /// Roll an aborted batch back to unbatched
    async fn unassign_batch(&self, batch_id: Uuid) -> Result<(), Error>;

    /// All votes stamped with `batch_id`, in insertion order
    async fn votes_for_batch(&self, batch_id: Uuid) -> Result<Vec<VoteRecord>, Error>;

    async fn insert_anchor(&self, anchor: AnchorRecord) -> Result<(), Error>;

    async fn get_anchor(&self, id: Uuid) -> Result<Option<AnchorRecord>, Error>;

    async fn anchor_for_root(&self, merkle_root: &str) -> Result<Option<AnchorRecord>, Error>;

    /// Move an anchor's status forward. Transitions are monotonic:
    /// `Pending -> Confirmed` or `Pending -> Failed`, never backward.
    async fn set_anchor_status(&self, id: Uuid, status: AnchorStatus) -> Result<(), Error>;

    /// Select all unbatched votes and stamp them in one step
    async fn take_unbatched(&self, batch_id: Uuid) -> Result<Vec<VoteRecord>, Error> {
        let selected = self.select_unbatched().await?;
        let ids: Vec<Uuid> = selected.iter().map(|vote| vote.id).collect();
        self.assign_batch(&ids, batch_id).await?;
        self.votes_for_batch(batch_id).await
    }
}

#[derive(Default)]
struct MemVoteStoreInner {
    votes: IndexMap<Uuid, VoteRecord>,
    anchors: IndexMap<Uuid, AnchorRecord>,
}

/// A simple vote store that uses in-memory IndexMaps, preserving insertion
/// order the way a serial database would.
#[derive(Default)]
pub struct MemVoteStore {
    inner: Mutex<MemVoteStoreInner>,
}

impl MemVoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoteStore for MemVoteStore {
    async fn insert_vote(&self, vote: VoteRecord) -> Result<(), Error> {
        self.inner.lock().await.votes.insert(vote.id, vote);
        Ok(())
    }

    async fn get_vote(&self, id: Uuid) -> Result<Option<VoteRecord>, Error> {
        Ok(self.inner.lock().await.votes.get(&id).cloned())
    }

    async fn select_unbatched(&self) -> Result<Vec<VoteRecord>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .votes
            .values()
            .filter(|vote| vote.merkle_root_id.is_none())
            .cloned()
            .collect())
    }

    async fn assign_batch(&self, ids: &[Uuid], batch_id: Uuid) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        // Check the whole set before mutating anything
        for id in ids {
            let vote = inner
                .votes
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if vote.merkle_root_id.is_some() {
                return Err(Error::DoubleBatchingDetected(*id));
            }
        }

        for id in ids {
            if let Some(vote) = inner.votes.get_mut(id) {
                vote.merkle_root_id = Some(batch_id);
            }
        }

        Ok(())
    }

    async fn unassign_batch(&self, batch_id: Uuid) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        for vote in inner.votes.values_mut() {
            if vote.merkle_root_id == Some(batch_id) {
                vote.merkle_root_id = None;
            }
        }
        Ok(())
    }

    async fn votes_for_batch(&self, batch_id: Uuid) -> Result<Vec<VoteRecord>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .votes
            .values()
            .filter(|vote| vote.merkle_root_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn insert_anchor(&self, anchor: AnchorRecord) -> Result<(), Error> {
        self.inner.lock().await.anchors.insert(anchor.id, anchor);
        Ok(())
    }

    async fn get_anchor(&self, id: Uuid) -> Result<Option<AnchorRecord>, Error> {
        Ok(self.inner.lock().await.anchors.get(&id).cloned())
    }

    async fn anchor_for_root(&self, merkle_root: &str) -> Result<Option<AnchorRecord>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .anchors
            .values()
            .find(|anchor| anchor.merkle_root == merkle_root)
            .cloned())
    }

    async fn set_anchor_status(&self, id: Uuid, status: AnchorStatus) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let anchor = inner
            .anchors
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !anchor.status.can_transition(status) {
            return Err(Error::InvalidStatusTransition(anchor.status, status));
        }

        anchor.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(n: u32) -> VoteRecord {
        let signed = SignedVote {
            vote_hash: sha256_hex(format!("vote-{}", n).as_bytes()),
            signature: String::new(),
            timestamp: 1000 + n as u64,
        };
        VoteRecord::new(&format!("voter-{}", n), "poll-1", "option-1", &signed)
    }

    #[tokio::test]
    async fn test_take_unbatched_marks_atomically() {
        let store = MemVoteStore::new();
        for n in 0..3 {
            store.insert_vote(vote(n)).await.unwrap();
        }

        let batch_id = Uuid::new_v4();
        let taken = store.take_unbatched(batch_id).await.unwrap();
        assert_eq!(taken.len(), 3);
        assert!(taken.iter().all(|v| v.merkle_root_id == Some(batch_id)));

        // Nothing left for a second batch
        let second = store.take_unbatched(Uuid::new_v4()).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_double_batching_detected() {
        let store = MemVoteStore::new();
        let record = vote(0);
        let id = record.id;
        store.insert_vote(record).await.unwrap();

        store.assign_batch(&[id], Uuid::new_v4()).await.unwrap();

        match store.assign_batch(&[id], Uuid::new_v4()).await {
            Err(Error::DoubleBatchingDetected(detected)) => assert_eq!(detected, id),
            other => panic!("expected DoubleBatchingDetected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_assign_batch_all_or_nothing() {
        let store = MemVoteStore::new();
        let a = vote(0);
        let b = vote(1);
        let (id_a, id_b) = (a.id, b.id);
        store.insert_vote(a).await.unwrap();
        store.insert_vote(b).await.unwrap();

        // b is already batched, so assigning [a, b] must not touch a
        store.assign_batch(&[id_b], Uuid::new_v4()).await.unwrap();
        assert!(store.assign_batch(&[id_a, id_b], Uuid::new_v4()).await.is_err());
        assert!(store
            .get_vote(id_a)
            .await
            .unwrap()
            .unwrap()
            .merkle_root_id
            .is_none());
    }

    #[tokio::test]
    async fn test_unassign_batch() {
        let store = MemVoteStore::new();
        for n in 0..2 {
            store.insert_vote(vote(n)).await.unwrap();
        }

        let batch_id = Uuid::new_v4();
        store.take_unbatched(batch_id).await.unwrap();
        store.unassign_batch(batch_id).await.unwrap();

        assert_eq!(store.select_unbatched().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_anchor_status_monotonic() {
        let store = MemVoteStore::new();
        let anchor = AnchorRecord {
            id: Uuid::new_v4(),
            merkle_root: sha256_hex(b"root"),
            ledger_tx: "tx-1".to_string(),
            status: AnchorStatus::Pending,
        };
        let id = anchor.id;
        store.insert_anchor(anchor).await.unwrap();

        store
            .set_anchor_status(id, AnchorStatus::Confirmed)
            .await
            .unwrap();

        // Never backward
        match store.set_anchor_status(id, AnchorStatus::Pending).await {
            Err(Error::InvalidStatusTransition(from, to)) => {
                assert_eq!(from, AnchorStatus::Confirmed);
                assert_eq!(to, AnchorStatus::Pending);
            }
            other => panic!("expected InvalidStatusTransition, got {:?}", other),
        }
        match store.set_anchor_status(id, AnchorStatus::Failed).await {
            Err(Error::InvalidStatusTransition(_, _)) => (),
            other => panic!("expected InvalidStatusTransition, got {:?}", other),
        }
    }
}
