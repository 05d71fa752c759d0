//! Scripted in-memory object store for engine tests.
//!
//! Records every call, injects failures per operation or part number, and can
//! hold part requests at a gate so tests observe what is in flight.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dog_transfer::transport::{
    GetObjectOutput, GetObjectRequest, GetSelector, ObjectHead, PutOutput, UploadPartCopyRequest, UploadPartRequest,
};
use dog_transfer::{
    ByteRange, ByteStream, CompletedPart, ObjectKey, ObjectOptions, ObjectTransport, SessionId, TransferError,
    TransferResult,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put { key: String, bytes: usize },
    Create { key: String },
    UploadPart { upload_id: String, part_number: u32, bytes: usize },
    UploadPartCopy { upload_id: String, part_number: u32, range: ByteRange },
    Complete { upload_id: String, parts: Vec<u32> },
    Abort { upload_id: String },
    ListParts { upload_id: String },
    CopyObject { key: String },
    Get { part_number: Option<u32>, if_match: Option<String> },
    Head { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Put,
    Create,
    UploadPart,
    UploadPartCopy,
    Complete,
    Abort,
    ListParts,
    CopyObject,
    Get,
    Head,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    /// Part lengths for objects committed through a session
    parts: Option<Vec<u64>>,
    content_type: Option<String>,
}

#[derive(Debug, Default)]
struct Session {
    object: Option<ObjectKey>,
    content_type: Option<String>,
    parts: BTreeMap<u32, (Bytes, CompletedPart)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, StoredObject>,
    sessions: HashMap<String, Session>,
    next_session: u32,
    next_etag: u32,
    calls: Vec<Call>,
    /// Operations that always fail
    failing_ops: BTreeSet<OpKey>,
    /// Operations that fail only for one part number
    failing_parts: BTreeSet<(OpKey, u32)>,
    delays: HashMap<u32, Duration>,
    source_checksums: bool,
}

// Op is not Ord; keep a sortable tag for the failure sets
type OpKey = u8;

fn key_of(op: Op) -> OpKey {
    op as u8
}

struct Gate {
    from_part: u32,
    permits: Arc<Semaphore>,
}

/// In-memory transport with call recording and fault injection
pub struct MemoryTransport {
    state: Mutex<State>,
    gate: Mutex<Option<Gate>>,
    listing: Mutex<Option<Arc<Semaphore>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn injected(operation: &'static str) -> TransferError {
    TransferError::transport(
        operation,
        std::io::Error::new(std::io::ErrorKind::Other, format!("injected {} failure", operation)),
    )
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            gate: Mutex::new(None),
            listing: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    // --- scripting ---

    pub fn fail(&self, op: Op) {
        self.state.lock().failing_ops.insert(key_of(op));
    }

    pub fn fail_part(&self, op: Op, part_number: u32) {
        self.state.lock().failing_parts.insert((key_of(op), part_number));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_ops.clear();
        state.failing_parts.clear();
    }

    /// Delay the response for one part number
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().delays.insert(part_number, delay);
    }

    /// Attach a checksum to every part proof and insist it comes back at commit
    pub fn with_checksums(&self) {
        self.state.lock().source_checksums = true;
    }

    /// Hold part requests numbered `from_part` and above until released
    pub fn gate_parts_from(&self, from_part: u32) {
        *self.gate.lock() = Some(Gate {
            from_part,
            permits: Arc::new(Semaphore::new(0)),
        });
    }

    /// Let `n` gated requests through
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.permits.add_permits(n);
        }
    }

    /// Remove the gate and let every waiting request through
    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.permits.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Hold every list-parts request until `open_listing`
    pub fn hold_listing(&self) {
        *self.listing.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_listing(&self) {
        if let Some(permits) = self.listing.lock().take() {
            permits.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Store an object directly, split into `part_size` parts when given
    pub fn insert_object(&self, object: &ObjectKey, data: Bytes, part_size: Option<u64>) -> String {
        let mut state = self.state.lock();
        state.next_etag += 1;
        let etag = format!("\"etag-{}\"", state.next_etag);
        let parts = part_size.map(|size| {
            let total = data.len() as u64;
            let count = total.div_ceil(size);
            (1..=count).map(|n| (total - (n - 1) * size).min(size)).collect()
        });
        state.objects.insert(
            object.clone(),
            StoredObject {
                data,
                etag: etag.clone(),
                parts,
                content_type: None,
            },
        );
        etag
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Abort { upload_id } => Some(upload_id),
                _ => None,
            })
            .collect()
    }

    pub fn creates(&self) -> usize {
        self.count(|call| matches!(call, Call::Create { .. }))
    }

    pub fn puts(&self) -> usize {
        self.count(|call| matches!(call, Call::Put { .. }))
    }

    pub fn completes(&self) -> Vec<Vec<u32>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Complete { parts, .. } => Some(parts),
                _ => None,
            })
            .collect()
    }

    /// Part numbers of upload-part calls, in call order
    pub fn uploaded_parts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UploadPart { part_number, .. } => Some(part_number),
                _ => None,
            })
            .collect()
    }

    /// Part numbers of GET calls, in call order
    pub fn fetched_parts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Get { part_number, .. } => part_number,
                _ => None,
            })
            .collect()
    }

    /// Parts stored under a live session
    pub fn stored_parts(&self, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .sessions
            .get(upload_id)
            .map(|session| session.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn object(&self, object: &ObjectKey) -> Option<Bytes> {
        self.state.lock().objects.get(object).map(|o| o.data.clone())
    }

    pub fn content_type(&self, object: &ObjectKey) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(object)
            .and_then(|o| o.content_type.clone())
    }

    /// Part requests in flight right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of part requests in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    // --- internals ---

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn check(&self, op: Op, operation: &'static str, part_number: Option<u32>) -> TransferResult<()> {
        let state = self.state.lock();
        let failing_part = part_number
            .map(|n| state.failing_parts.contains(&(key_of(op), n)))
            .unwrap_or(false);
        if state.failing_ops.contains(&key_of(op)) || failing_part {
            return Err(injected(operation));
        }
        Ok(())
    }

    /// Track a part request, then wait at the gate and for any scripted delay
    async fn enter_part(&self, part_number: u32) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        let permits = self
            .gate
            .lock()
            .as_ref()
            .filter(|gate| part_number >= gate.from_part)
            .map(|gate| gate.permits.clone());
        if let Some(permits) = permits {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }

        let delay = self.state.lock().delays.get(&part_number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    fn store_part(&self, upload_id: &SessionId, part_number: u32, data: Bytes) -> TransferResult<CompletedPart> {
        let mut state = self.state.lock();
        let checksums = state.source_checksums;
        let session = state
            .sessions
            .get_mut(upload_id.as_str())
            .ok_or_else(|| injected("no such upload"))?;
        let mut proof = CompletedPart::new(part_number)
            .with_etag(format!("\"{}-{}\"", upload_id, part_number))
            .with_size(data.len() as u64);
        if checksums {
            proof = proof.with_checksum(format!("crc-{}", part_number));
        }
        session.parts.insert(part_number, (data, proof.clone()));
        Ok(proof)
    }
}

fn body(data: Bytes) -> ByteStream {
    let split = data.len() / 2;
    let first = data.slice(..split);
    let second = data.slice(split..);
    Box::pin(futures_util::stream::iter(vec![Ok(first), Ok(second)]))
}

#[async_trait]
impl ObjectTransport for MemoryTransport {
    async fn put_object(&self, object: &ObjectKey, options: &ObjectOptions, body: Bytes) -> TransferResult<PutOutput> {
        self.record(Call::Put {
            key: object.key.clone(),
            bytes: body.len(),
        });
        self.check(Op::Put, "put_object", None)?;
        let mut state = self.state.lock();
        state.next_etag += 1;
        let etag = format!("\"etag-{}\"", state.next_etag);
        state.objects.insert(
            object.clone(),
            StoredObject {
                data: body,
                etag: etag.clone(),
                parts: None,
                content_type: options.content_type.clone(),
            },
        );
        Ok(PutOutput {
            etag: Some(etag),
            version_id: None,
        })
    }

    async fn create_multipart_upload(&self, object: &ObjectKey, options: &ObjectOptions) -> TransferResult<SessionId> {
        self.record(Call::Create {
            key: object.key.clone(),
        });
        self.check(Op::Create, "create_multipart_upload", None)?;
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = format!("upload-{}", state.next_session);
        state.sessions.insert(
            id.clone(),
            Session {
                object: Some(object.clone()),
                content_type: options.content_type.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(SessionId::from(id.as_str()))
    }

    async fn upload_part(&self, request: UploadPartRequest) -> TransferResult<CompletedPart> {
        self.record(Call::UploadPart {
            upload_id: request.upload_id.to_string(),
            part_number: request.part_number,
            bytes: request.body.len(),
        });
        let _active = self.enter_part(request.part_number).await;
        self.check(Op::UploadPart, "upload_part", Some(request.part_number))?;
        self.store_part(&request.upload_id, request.part_number, request.body)
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> TransferResult<CompletedPart> {
        self.record(Call::UploadPartCopy {
            upload_id: request.upload_id.to_string(),
            part_number: request.part_number,
            range: request.range,
        });
        let _active = self.enter_part(request.part_number).await;
        self.check(Op::UploadPartCopy, "upload_part_copy", Some(request.part_number))?;

        let data = {
            let state = self.state.lock();
            let source = state
                .objects
                .get(&request.source)
                .ok_or_else(|| injected("no such source"))?;
            if let Some(expected) = &request.source_if_match {
                if expected != &source.etag {
                    return Err(injected("source precondition"));
                }
            }
            source
                .data
                .slice(request.range.start as usize..=request.range.end as usize)
        };
        self.store_part(&request.upload_id, request.part_number, data)
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectKey,
        upload_id: &SessionId,
        parts: Vec<CompletedPart>,
    ) -> TransferResult<PutOutput> {
        self.record(Call::Complete {
            upload_id: upload_id.to_string(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        });
        self.check(Op::Complete, "complete_multipart_upload", None)?;

        let mut state = self.state.lock();
        let session = state
            .sessions
            .remove(upload_id.as_str())
            .ok_or_else(|| injected("no such upload"))?;
        let mut data = Vec::new();
        let mut lengths = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            let (bytes, stored) = session
                .parts
                .get(&part.part_number)
                .ok_or_else(|| injected("unknown part"))?;
            if part.part_number != index as u32 + 1 || part.etag != stored.etag || part.checksum != stored.checksum {
                return Err(injected("bad part list"));
            }
            data.extend_from_slice(bytes);
            lengths.push(bytes.len() as u64);
        }

        state.next_etag += 1;
        let etag = format!("\"etag-{}-{}\"", state.next_etag, parts.len());
        state.objects.insert(
            object.clone(),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
                parts: Some(lengths),
                content_type: session.content_type.clone(),
            },
        );
        Ok(PutOutput {
            etag: Some(etag),
            version_id: None,
        })
    }

    async fn abort_multipart_upload(&self, _object: &ObjectKey, upload_id: &SessionId) -> TransferResult<()> {
        self.record(Call::Abort {
            upload_id: upload_id.to_string(),
        });
        self.check(Op::Abort, "abort_multipart_upload", None)?;
        self.state.lock().sessions.remove(upload_id.as_str());
        Ok(())
    }

    async fn list_parts(&self, _object: &ObjectKey, upload_id: &SessionId) -> TransferResult<Vec<CompletedPart>> {
        self.record(Call::ListParts {
            upload_id: upload_id.to_string(),
        });
        let held = self.listing.lock().clone();
        if let Some(permits) = held {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }
        self.check(Op::ListParts, "list_parts", None)?;
        let state = self.state.lock();
        let session = state
            .sessions
            .get(upload_id.as_str())
            .ok_or_else(|| injected("no such upload"))?;
        Ok(session.parts.values().map(|(_, proof)| proof.clone()).collect())
    }

    async fn copy_object(&self, source: &ObjectKey, destination: &ObjectKey) -> TransferResult<PutOutput> {
        self.record(Call::CopyObject {
            key: destination.key.clone(),
        });
        self.check(Op::CopyObject, "copy_object", None)?;
        let mut state = self.state.lock();
        let mut copied = state
            .objects
            .get(source)
            .cloned()
            .ok_or_else(|| injected("no such source"))?;
        state.next_etag += 1;
        copied.etag = format!("\"etag-{}\"", state.next_etag);
        let etag = copied.etag.clone();
        state.objects.insert(destination.clone(), copied);
        Ok(PutOutput {
            etag: Some(etag),
            version_id: None,
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> TransferResult<GetObjectOutput> {
        let part_number = match &request.selector {
            GetSelector::Part(n) => Some(*n),
            GetSelector::Range(_) => None,
        };
        self.record(Call::Get {
            part_number,
            if_match: request.if_match.clone(),
        });
        let _active = self.enter_part(part_number.unwrap_or(1)).await;
        self.check(Op::Get, "get_object", part_number)?;

        let state = self.state.lock();
        let object = state
            .objects
            .get(&request.object)
            .ok_or_else(|| injected("no such key"))?;
        if let Some(expected) = &request.if_match {
            if expected != &object.etag {
                return Err(injected("precondition"));
            }
        }
        let total = object.data.len() as u64;

        let (range, parts_count) = match (&request.selector, &object.parts) {
            (GetSelector::Range(range), _) => (Some(*range), None),
            (GetSelector::Part(n), Some(lengths)) => {
                let index = (*n as usize).checked_sub(1).filter(|i| *i < lengths.len());
                let index = index.ok_or_else(|| injected("part out of range"))?;
                let start: u64 = lengths[..index].iter().sum();
                let range = ByteRange::new(start, start + lengths[index] - 1);
                (Some(range), Some(lengths.len() as u32))
            }
            (GetSelector::Part(1), None) => (None, None),
            (GetSelector::Part(_), None) => return Err(injected("part out of range")),
        };

        let data = match range {
            Some(range) => object.data.slice(range.start as usize..=range.end as usize),
            None => object.data.clone(),
        };
        Ok(GetObjectOutput {
            parts_count,
            etag: Some(object.etag.clone()),
            content_length: data.len() as u64,
            content_range: range.map(|range| (range, total)),
            body: body(data),
        })
    }

    async fn head_object(&self, object: &ObjectKey) -> TransferResult<ObjectHead> {
        self.record(Call::Head {
            key: object.key.clone(),
        });
        self.check(Op::Head, "head_object", None)?;
        let state = self.state.lock();
        let stored = state.objects.get(object).ok_or_else(|| injected("no such key"))?;
        Ok(ObjectHead {
            size_bytes: stored.data.len() as u64,
            etag: Some(stored.etag.clone()),
            content_type: stored.content_type.clone(),
        })
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Stream `data` in pieces of `piece` bytes
pub fn chunked(data: Bytes, piece: usize) -> ByteStream {
    let pieces: Vec<std::io::Result<Bytes>> = (0..data.len())
        .step_by(piece.max(1))
        .map(|start| Ok(data.slice(start..(start + piece).min(data.len()))))
        .collect();
    Box::pin(futures_util::stream::iter(pieces))
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub fn object(key: &str) -> ObjectKey {
    ObjectKey::new("bucket", key)
}
