//! The per-chat rendezvous: one record holding offer and answer, plus one
//! append-only candidate log per role.
//!
//! The record existing *is* the call. Either side deleting it ends the call
//! for both.

use std::collections::HashSet;

use duet_shared::protocol::{CallRecord, CandidateRole, IceCandidate, SessionDescription};
use duet_shared::ChatId;
use duet_store::store::to_fields;
use duet_store::{ChatDocuments, Document, Patch, Query, StoreError};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::CallError;

pub type RecordStream = BoxStream<'static, Option<CallRecord>>;
pub type CandidateStream = BoxStream<'static, IceCandidate>;

/// The three push sequences of a rendezvous.
pub struct RendezvousWatch {
    pub record: RecordStream,
    pub caller_candidates: CandidateStream,
    pub callee_candidates: CandidateStream,
}

#[derive(Clone, Debug)]
pub struct SessionRendezvous {
    docs: ChatDocuments,
}

impl SessionRendezvous {
    pub fn new(docs: ChatDocuments) -> Self {
        Self { docs }
    }

    pub fn chat_id(&self) -> &ChatId {
        self.docs.chat_id()
    }

    pub async fn current(&self) -> Result<Option<CallRecord>, CallError> {
        let doc = self.docs.store().get(&self.docs.rendezvous_doc()).await?;
        Ok(doc.as_ref().and_then(decode_record))
    }

    /// Create the record with `offer`. Fails if a session already exists;
    /// of two callers racing, exactly one wins.
    pub async fn publish_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        let record = CallRecord {
            offer: Some(offer),
            answer: None,
        };
        match self
            .docs
            .store()
            .create(&self.docs.rendezvous_doc(), to_fields(&record)?)
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => return Err(CallError::AlreadyActive),
            Err(e) => return Err(e.into()),
        }

        info!(chat = %self.docs.chat_id(), "offer published");
        Ok(())
    }

    /// Add `answer` to the record. Fails if there is nothing to answer,
    /// including when the caller hangs up while the answer is in flight.
    pub async fn publish_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        match self.current().await? {
            Some(CallRecord { offer: Some(_), .. }) => {}
            _ => return Err(CallError::NoOffer),
        }

        let patch = Patch::new().set("answer", to_fields(&answer)?);
        match self
            .docs
            .store()
            .update(&self.docs.rendezvous_doc(), patch)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                debug!(chat = %self.docs.chat_id(), "record deleted before the answer landed");
                return Err(CallError::NoOffer);
            }
            Err(e) => return Err(e.into()),
        }

        info!(chat = %self.docs.chat_id(), "answer published");
        Ok(())
    }

    pub async fn append_candidate(
        &self,
        role: CandidateRole,
        candidate: &IceCandidate,
    ) -> Result<(), CallError> {
        self.docs
            .store()
            .append(&self.docs.candidate_log(role), to_fields(candidate)?)
            .await?;
        debug!(chat = %self.docs.chat_id(), %role, "candidate appended");
        Ok(())
    }

    pub async fn watch(&self) -> Result<RendezvousWatch, CallError> {
        Ok(RendezvousWatch {
            record: self.watch_record().await?,
            caller_candidates: self.watch_candidates(CandidateRole::Caller).await?,
            callee_candidates: self.watch_candidates(CandidateRole::Callee).await?,
        })
    }

    /// Full record on every change, `None` once it is deleted. A record that
    /// fails to decode is reported as an empty one so its presence still
    /// counts.
    pub async fn watch_record(&self) -> Result<RecordStream, CallError> {
        let docs = self
            .docs
            .store()
            .subscribe_doc(&self.docs.rendezvous_doc())
            .await?;
        Ok(docs
            .map(|doc| {
                doc.map(|doc| decode_record(&doc).unwrap_or_default())
            })
            .boxed())
    }

    /// Candidates appended to `role`'s log, each delivered once.
    pub async fn watch_candidates(&self, role: CandidateRole) -> Result<CandidateStream, CallError> {
        let log = self.docs.candidate_log(role);
        let snapshots = self.docs.store().subscribe_query(&Query::new(log)).await?;

        let mut delivered = HashSet::new();
        Ok(snapshots
            .flat_map(move |snapshot| {
                let fresh: Vec<IceCandidate> = snapshot
                    .added()
                    .filter(|doc| delivered.insert(doc.id().to_string()))
                    .filter_map(decode_candidate)
                    .collect();
                stream::iter(fresh)
            })
            .boxed())
    }

    /// Delete the record, then purge both candidate logs. Deleting a missing
    /// record succeeds.
    pub async fn terminate(&self) -> Result<(), CallError> {
        self.docs
            .store()
            .delete(&self.docs.rendezvous_doc())
            .await?;
        info!(chat = %self.docs.chat_id(), "rendezvous terminated");

        for role in [CandidateRole::Caller, CandidateRole::Callee] {
            if let Err(e) = self.purge_candidates(role).await {
                if e.is_expected_teardown() {
                    debug!(%role, error = %e, "candidate purge raced teardown");
                } else {
                    warn!(%role, error = %e, "failed to purge candidates");
                }
            }
        }
        Ok(())
    }

    async fn purge_candidates(&self, role: CandidateRole) -> Result<(), StoreError> {
        let store = self.docs.store();
        let entries = store.query(&Query::new(self.docs.candidate_log(role))).await?;
        for entry in entries {
            store.delete(&entry.path).await?;
        }
        Ok(())
    }
}

fn decode_record(doc: &Document) -> Option<CallRecord> {
    match doc.decode::<CallRecord>() {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %doc.path, error = %e, "malformed rendezvous record");
            None
        }
    }
}

fn decode_candidate(doc: &Document) -> Option<IceCandidate> {
    match doc.decode::<IceCandidate>() {
        Ok(candidate) => Some(candidate),
        Err(e) => {
            warn!(path = %doc.path, error = %e, "skipping malformed candidate");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use duet_shared::UserId;
    use duet_store::{
        CollectionPath, DocPath, DocStream, Fields, MemoryStore, QueryStream, RealtimeStore,
    };
    use tokio::time::{sleep, timeout};

    use super::*;

    fn rendezvous(store: Arc<dyn RealtimeStore>) -> SessionRendezvous {
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();
        SessionRendezvous::new(ChatDocuments::new(store, ChatId::between(&alice, &bob)))
    }

    /// A store whose reads come back late, so that writes from the other
    /// side can land between a read and the write that follows it.
    struct LaggingStore {
        inner: MemoryStore,
        lag: Duration,
    }

    #[async_trait]
    impl RealtimeStore for LaggingStore {
        async fn get(&self, path: &DocPath) -> duet_store::Result<Option<Document>> {
            let doc = self.inner.get(path).await;
            sleep(self.lag).await;
            doc
        }

        async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> duet_store::Result<()> {
            self.inner.set(path, fields, merge).await
        }

        async fn create(&self, path: &DocPath, fields: Fields) -> duet_store::Result<()> {
            self.inner.create(path, fields).await
        }

        async fn update(&self, path: &DocPath, patch: Patch) -> duet_store::Result<()> {
            self.inner.update(path, patch).await
        }

        async fn delete(&self, path: &DocPath) -> duet_store::Result<()> {
            self.inner.delete(path).await
        }

        async fn append(
            &self,
            collection: &CollectionPath,
            fields: Fields,
        ) -> duet_store::Result<String> {
            self.inner.append(collection, fields).await
        }

        async fn query(&self, query: &Query) -> duet_store::Result<Vec<Document>> {
            self.inner.query(query).await
        }

        async fn subscribe_doc(&self, path: &DocPath) -> duet_store::Result<DocStream> {
            self.inner.subscribe_doc(path).await
        }

        async fn subscribe_query(&self, query: &Query) -> duet_store::Result<QueryStream> {
            self.inner.subscribe_query(query).await
        }
    }

    fn lagging() -> Arc<LaggingStore> {
        Arc::new(LaggingStore {
            inner: MemoryStore::new(),
            lag: Duration::from_millis(5),
        })
    }

    async fn next<T>(stream: &mut BoxStream<'static, T>) -> T {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_offer_then_answer() {
        let rv = rendezvous(Arc::new(MemoryStore::new()));

        assert_eq!(
            rv.publish_answer(SessionDescription::answer("a")).await,
            Err(CallError::NoOffer)
        );

        rv.publish_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(
            rv.publish_offer(SessionDescription::offer("o2")).await,
            Err(CallError::AlreadyActive)
        );

        rv.publish_answer(SessionDescription::answer("a")).await.unwrap();
        let record = rv.current().await.unwrap().unwrap();
        assert_eq!(record.offer.unwrap().sdp, "o");
        assert_eq!(record.answer.unwrap().sdp, "a");
    }

    #[tokio::test]
    async fn test_racing_offers_have_one_winner() {
        let store = lagging();
        let alice = rendezvous(store.clone());
        let bob = rendezvous(store.clone());

        let (a, b) = tokio::join!(
            alice.publish_offer(SessionDescription::offer("alice-offer")),
            bob.publish_offer(SessionDescription::offer("bob-offer")),
        );

        let stored = alice.current().await.unwrap().unwrap().offer.unwrap().sdp;
        match (a, b) {
            (Ok(()), Err(CallError::AlreadyActive)) => assert_eq!(stored, "alice-offer"),
            (Err(CallError::AlreadyActive), Ok(())) => assert_eq!(stored, "bob-offer"),
            other => panic!("expected exactly one offer to win, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hangup_during_answer_leaves_no_record_behind() {
        let store = lagging();
        let caller = rendezvous(store.clone());
        let callee = rendezvous(store.clone());
        caller
            .publish_offer(SessionDescription::offer("o"))
            .await
            .unwrap();

        let (answer, hangup) = tokio::join!(
            callee.publish_answer(SessionDescription::answer("a")),
            async {
                sleep(Duration::from_millis(1)).await;
                caller.terminate().await
            },
        );

        assert_eq!(answer, Err(CallError::NoOffer));
        hangup.unwrap();
        assert!(caller.current().await.unwrap().is_none());
        caller
            .publish_offer(SessionDescription::offer("next"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_stream_reports_deletion() {
        let rv = rendezvous(Arc::new(MemoryStore::new()));
        let mut watch = rv.watch().await.unwrap();

        assert_eq!(next(&mut watch.record).await, None);
        rv.publish_offer(SessionDescription::offer("o")).await.unwrap();
        assert!(next(&mut watch.record).await.is_some());

        rv.terminate().await.unwrap();
        rv.terminate().await.unwrap();
        assert_eq!(next(&mut watch.record).await, None);
    }

    #[tokio::test]
    async fn test_candidates_delivered_once_in_append_order() {
        let rv = rendezvous(Arc::new(MemoryStore::new()));
        let mut callee = rv.watch_candidates(CandidateRole::Callee).await.unwrap();

        for c in ["c1", "c2", "c3"] {
            rv.append_candidate(CandidateRole::Callee, &IceCandidate::new(c))
                .await
                .unwrap();
        }
        rv.append_candidate(CandidateRole::Caller, &IceCandidate::new("other"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next(&mut callee).await.candidate);
        }
        assert_eq!(seen, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_terminate_purges_candidate_logs() {
        let store = Arc::new(MemoryStore::new());
        let rv = rendezvous(store.clone());

        rv.publish_offer(SessionDescription::offer("o")).await.unwrap();
        rv.append_candidate(CandidateRole::Caller, &IceCandidate::new("c1"))
            .await
            .unwrap();
        rv.terminate().await.unwrap();

        let log = rv.docs.candidate_log(CandidateRole::Caller);
        assert!(store.query(&Query::new(log)).await.unwrap().is_empty());
        assert!(rv.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_as_call_error() {
        let store = Arc::new(MemoryStore::new());
        let rv = rendezvous(store.clone());
        store.set_available(false).await;

        let err = rv.publish_offer(SessionDescription::offer("o")).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
