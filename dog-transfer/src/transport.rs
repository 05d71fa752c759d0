use async_trait::async_trait;
use bytes::Bytes;

use crate::{ByteRange, ByteStream, CompletedPart, ObjectKey, ObjectOptions, SessionId, TransferResult};

/// The object-store operations the engines are built on.
///
/// Implementations own signing, connection handling and per-request retries.
/// Every error they return is treated as final for that request.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Store a whole object in one request
    async fn put_object(
        &self,
        object: &ObjectKey,
        options: &ObjectOptions,
        body: Bytes,
    ) -> TransferResult<PutOutput>;

    /// Start a multipart session
    async fn create_multipart_upload(
        &self,
        object: &ObjectKey,
        options: &ObjectOptions,
    ) -> TransferResult<SessionId>;

    /// Upload one part of a session
    async fn upload_part(&self, request: UploadPartRequest) -> TransferResult<CompletedPart>;

    /// Copy a byte range of an existing object into one part of a session
    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> TransferResult<CompletedPart>;

    /// Commit a session from its ordered parts
    async fn complete_multipart_upload(
        &self,
        object: &ObjectKey,
        upload_id: &SessionId,
        parts: Vec<CompletedPart>,
    ) -> TransferResult<PutOutput>;

    /// Discard a session and the parts stored under it
    async fn abort_multipart_upload(&self, object: &ObjectKey, upload_id: &SessionId) -> TransferResult<()>;

    /// Parts the store already holds for a session
    async fn list_parts(&self, object: &ObjectKey, upload_id: &SessionId) -> TransferResult<Vec<CompletedPart>>;

    /// Server-side copy in one request
    async fn copy_object(&self, source: &ObjectKey, destination: &ObjectKey) -> TransferResult<PutOutput>;

    /// Fetch one part (by number) or one range of an object
    async fn get_object(&self, request: GetObjectRequest) -> TransferResult<GetObjectOutput>;

    /// Object size and identity without content
    async fn head_object(&self, object: &ObjectKey) -> TransferResult<ObjectHead>;
}

/// Body and coordinates of one part upload
#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub object: ObjectKey,
    pub upload_id: SessionId,
    pub part_number: u32,
    pub body: Bytes,
}

/// Source range and coordinates of one part copy
#[derive(Debug, Clone)]
pub struct UploadPartCopyRequest {
    pub source: ObjectKey,
    pub destination: ObjectKey,
    pub upload_id: SessionId,
    pub part_number: u32,
    pub range: ByteRange,
    /// Pin the copy to the source version observed by the head request
    pub source_if_match: Option<String>,
}

/// Which slice of an object to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetSelector {
    Part(u32),
    /// Not issued by [`DownloadEngine`](crate::DownloadEngine), which always
    /// fetches by part number; for callers driving a transport directly.
    Range(ByteRange),
}

#[derive(Debug, Clone)]
pub struct GetObjectRequest {
    pub object: ObjectKey,
    pub selector: GetSelector,
    /// Fail the request if the object no longer has this etag
    pub if_match: Option<String>,
}

impl GetObjectRequest {
    pub fn part(object: ObjectKey, part_number: u32) -> Self {
        Self {
            object,
            selector: GetSelector::Part(part_number),
            if_match: None,
        }
    }

    pub fn range(object: ObjectKey, range: ByteRange) -> Self {
        Self {
            object,
            selector: GetSelector::Range(range),
            if_match: None,
        }
    }

    pub fn with_if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }
}

/// Response headers plus the body stream of one GET
pub struct GetObjectOutput {
    /// Part count of the object; None for objects stored in one request
    pub parts_count: Option<u32>,
    pub etag: Option<String>,
    pub content_length: u64,
    /// Range this response covers, and the full object size
    pub content_range: Option<(ByteRange, u64)>,
    pub body: ByteStream,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("parts_count", &self.parts_count)
            .field("etag", &self.etag)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Metadata about an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// Final response of a put, copy or commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOutput {
    pub etag: Option<String>,
    pub version_id: Option<String>,
}
