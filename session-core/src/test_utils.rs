//! Shared fakes for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::device::{Bundle, BundlePublisher};
use crate::error::SessionResult;
use crate::otr::EncryptionSession;
use crate::pipeline::{Direction, Message, Peer, PeerId, Transport};
use crate::storage::{KeyStore, MemoryKeyStore, StoreError, StoreHook, StoreResult};

/// Publisher that records calls and can be told to fail
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    calls: AtomicUsize,
    last: Mutex<Option<(u32, Bundle)>>,
    failure: Mutex<Option<String>>,
}

impl RecordingPublisher {
    pub(crate) fn failing(reason: &str) -> Self {
        let publisher = Self::default();
        publisher.set_failure(Some(reason.to_string()));
        publisher
    }

    pub(crate) fn set_failure(&self, failure: Option<String>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last(&self) -> Option<(u32, Bundle)> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundlePublisher for RecordingPublisher {
    async fn publish_bundle(&self, device_id: u32, bundle: &Bundle) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((device_id, bundle.clone()));
        match self.failure.lock().unwrap().clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

/// [`MemoryKeyStore`] that counts writes per key and can refuse them
#[derive(Default)]
pub(crate) struct CountingKeyStore {
    inner: MemoryKeyStore,
    writes: Mutex<HashMap<String, usize>>,
    fail_writes: AtomicBool,
}

impl CountingKeyStore {
    pub(crate) fn writes(&self, key: &str) -> usize {
        self.writes.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyStore for CountingKeyStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed {
                key: key.to_string(),
                reason: "disk full".to_string(),
            });
        }
        *self.writes.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.set_item(key, value).await
    }

    async fn register_hook(&self, key: &str, hook: StoreHook) {
        self.inner.register_hook(key, hook).await
    }
}

/// Transport that queues outgoing bodies for the test to deliver by hand
#[derive(Default)]
pub(crate) struct Outbox {
    queue: Mutex<VecDeque<String>>,
}

impl Outbox {
    pub(crate) fn take(&self) -> Option<String> {
        self.queue.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Transport for Outbox {
    async fn send(&self, _to: &PeerId, body: String) -> Result<(), String> {
        self.queue.lock().unwrap().push_back(body);
        Ok(())
    }
}

/// Feed every queued body into `session` as an inbound message
pub(crate) async fn deliver_all(outbox: &Outbox, session: &EncryptionSession) -> Vec<SessionResult<Message>> {
    let mut results = Vec::new();
    while let Some(body) = outbox.take() {
        results.push(session.process_message(Message::new(body), Direction::Decrypt).await);
    }
    results
}

/// Peer that records the system notices posted to it
#[derive(Debug)]
pub(crate) struct StubPeer {
    address: String,
    protocol: Option<String>,
    notices: Arc<Mutex<Vec<String>>>,
}

impl StubPeer {
    pub(crate) fn new(address: &str, protocol: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            protocol: protocol.map(str::to_string),
            notices: Arc::default(),
        }
    }

    pub(crate) fn notices(&self) -> Arc<Mutex<Vec<String>>> {
        self.notices.clone()
    }
}

impl Peer for StubPeer {
    fn address(&self) -> &str {
        &self.address
    }

    fn encryption_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn add_system_message(&self, text: &str) {
        self.notices.lock().unwrap().push(text.to_string());
    }
}
