//! In-memory object store with failure injection, for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::{
    ObjectAttributes, ObjectHead, ObjectStore, PartReceipt, PutReceipt, StoreError, UploadSession,
};

struct Session {
    key: String,
    attributes: ObjectAttributes,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, ObjectAttributes)>>,
    sessions: Mutex<HashMap<String, Session>>,
    next_upload: AtomicU32,
    /// Part number that always fails with a permanent error.
    fail_part: Mutex<Option<u32>>,
    /// Throttle this many part uploads before letting them through.
    throttled_parts: AtomicU32,
    /// Delay applied to every write, to widen race windows.
    write_delay: Mutex<Duration>,
    /// While closed, writes park until `open_gate`.
    gate_closed: AtomicBool,
    gate: Notify,
    pub puts: AtomicU32,
    pub multipart_created: AtomicU32,
    pub multipart_completed: AtomicU32,
    pub aborts: AtomicU32,
    writes_in_flight: AtomicU32,
    /// Highest number of delayed writes observed at the same time.
    pub peak_writes: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_part(&self, part_number: u32) {
        *self.fail_part.lock().unwrap() = Some(part_number);
    }

    pub fn throttle_parts(&self, n: u32) {
        self.throttled_parts.store(n, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Writes currently delayed or parked at the gate.
    pub fn writes_in_flight(&self) -> u32 {
        self.writes_in_flight.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<(Bytes, ObjectAttributes)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Place an object directly, bypassing counters.
    pub fn insert(&self, key: &str, body: &[u8], attributes: ObjectAttributes) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (Bytes::copy_from_slice(body), attributes));
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let delay = *self.write_delay.lock().unwrap();
        if delay.is_zero() && !self.gate_closed.load(Ordering::SeqCst) {
            return;
        }
        let now = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes.fetch_max(now, Ordering::SeqCst);
        while self.gate_closed.load(Ordering::SeqCst) {
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.gate_closed.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<PutReceipt, StoreError> {
        self.delay().await;
        self.puts.fetch_add(1, Ordering::SeqCst);
        let size = body.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, attributes.clone()));
        Ok(PutReceipt {
            key: key.to_string(),
            size,
            etag: format!("etag-{size}"),
        })
    }

    async fn create_multipart(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<UploadSession, StoreError> {
        self.multipart_created.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("upload{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().unwrap().insert(
            upload_id.clone(),
            Session {
                key: key.to_string(),
                attributes: attributes.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError> {
        self.delay().await;
        if *self.fail_part.lock().unwrap() == Some(part_number) {
            return Err(StoreError::Rejected {
                key: session.key.clone(),
                reason: format!("injected failure on part {part_number}"),
            });
        }
        let throttled = self.throttled_parts.load(Ordering::SeqCst);
        if throttled > 0 {
            self.throttled_parts.store(throttled - 1, Ordering::SeqCst);
            return Err(StoreError::Throttled(session.key.clone()));
        }

        let mut sessions = self.sessions.lock().unwrap();
        let staged = sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(session.upload_id.clone()))?;
        let size = body.len() as u64;
        staged.parts.insert(part_number, body);
        Ok(PartReceipt {
            part_number,
            etag: format!("part-{part_number}-{size}"),
            size,
        })
    }

    async fn complete_multipart(
        &self,
        session: &UploadSession,
        parts: &[PartReceipt],
    ) -> Result<PutReceipt, StoreError> {
        let staged = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(session.upload_id.clone()))?;

        let mut body = BytesMut::new();
        for part in parts {
            let data = staged
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::InvalidParts {
                    upload_id: session.upload_id.clone(),
                    reason: format!("missing part {}", part.part_number),
                })?;
            body.extend_from_slice(data);
        }
        let size = body.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(staged.key, (body.freeze(), staged.attributes));
        self.multipart_completed.fetch_add(1, Ordering::SeqCst);
        Ok(PutReceipt {
            key: session.key.clone(),
            size,
            etag: format!("etag-{size}-{}", parts.len()),
        })
    }

    async fn abort_multipart(&self, session: &UploadSession) -> Result<(), StoreError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().remove(&session.upload_id);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, attributes)| ObjectHead {
                key: key.to_string(),
                size: body.len() as u64,
                tags: attributes.tags.clone(),
                storage_class: attributes.storage_class.clone(),
            }))
    }

    async fn pending_uploads(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.sessions.lock().unwrap().keys().cloned().collect())
    }
}
