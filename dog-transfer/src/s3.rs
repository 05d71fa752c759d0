//! [`ObjectTransport`] over the AWS SDK, for S3 and S3-compatible stores.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use crate::config::S3Config;
use crate::transport::{
    GetObjectOutput, GetObjectRequest, GetSelector, ObjectHead, ObjectTransport, PutOutput, UploadPartCopyRequest,
    UploadPartRequest,
};
use crate::{ByteRange, ByteStream, CompletedPart, ObjectKey, ObjectOptions, SessionId, TransferError, TransferResult};

/// S3 transport. Retries and signing are the SDK's.
#[derive(Clone, Debug)]
pub struct S3Transport {
    client: Client,
}

impl S3Transport {
    /// Use an already configured client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from explicit settings. Unset fields fall back to the
    /// SDK's default provider chain.
    pub async fn from_config(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = Credentials::new(access_key_id, secret, None, None, "dog-transfer");
            loader = loader.credentials_provider(credentials);
        }
        let shared = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(config.force_path_style)
                .build(),
        );
        Self { client }
    }

    /// Build a client from `S3_*` / `AWS_*` environment variables
    pub async fn from_env() -> Self {
        Self::from_config(&S3Config::from_env()).await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn metadata(options: &ObjectOptions) -> Option<HashMap<String, String>> {
    if options.metadata.is_empty() {
        return None;
    }
    Some(options.metadata.clone().into_iter().collect())
}

fn copy_source(object: &ObjectKey) -> String {
    format!("{}/{}", object.bucket, object.key)
}

fn size(value: Option<i64>) -> u64 {
    value.unwrap_or(0).max(0) as u64
}

/// Adapt the SDK body to the crate's byte stream
fn body_stream(mut body: AwsByteStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => yield Ok(chunk),
                Ok(None) => break,
                Err(err) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, err));
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl ObjectTransport for S3Transport {
    async fn put_object(&self, object: &ObjectKey, options: &ObjectOptions, body: Bytes) -> TransferResult<PutOutput> {
        let output = self
            .client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_content_type(options.content_type.clone())
            .set_metadata(metadata(options))
            .content_length(body.len() as i64)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(|e| TransferError::transport("put_object", e))?;

        Ok(PutOutput {
            etag: output.e_tag().map(str::to_string),
            version_id: output.version_id().map(str::to_string),
        })
    }

    async fn create_multipart_upload(&self, object: &ObjectKey, options: &ObjectOptions) -> TransferResult<SessionId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_content_type(options.content_type.clone())
            .set_metadata(metadata(options))
            .send()
            .await
            .map_err(|e| TransferError::transport("create_multipart_upload", e))?;

        output
            .upload_id()
            .map(SessionId::from)
            .ok_or_else(|| TransferError::invariant("create_multipart_upload returned no upload id"))
    }

    async fn upload_part(&self, request: UploadPartRequest) -> TransferResult<CompletedPart> {
        let size_bytes = request.body.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(&request.object.bucket)
            .key(&request.object.key)
            .upload_id(request.upload_id.as_str())
            .part_number(request.part_number as i32)
            .content_length(size_bytes as i64)
            .body(AwsByteStream::from(request.body))
            .send()
            .await
            .map_err(|e| TransferError::transport("upload_part", e))?;

        Ok(CompletedPart {
            part_number: request.part_number,
            etag: output.e_tag().map(str::to_string),
            checksum: output.checksum_crc32_c().map(str::to_string),
            size_bytes,
        })
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> TransferResult<CompletedPart> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&request.destination.bucket)
            .key(&request.destination.key)
            .upload_id(request.upload_id.as_str())
            .part_number(request.part_number as i32)
            .copy_source(copy_source(&request.source))
            .copy_source_range(request.range.to_header())
            .set_copy_source_if_match(request.source_if_match.clone())
            .send()
            .await
            .map_err(|e| TransferError::transport("upload_part_copy", e))?;

        let result = output
            .copy_part_result()
            .ok_or_else(|| TransferError::invariant("upload_part_copy returned no copy result"))?;

        Ok(CompletedPart {
            part_number: request.part_number,
            etag: result.e_tag().map(str::to_string),
            checksum: result.checksum_crc32_c().map(str::to_string),
            size_bytes: request.range.len(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectKey,
        upload_id: &SessionId,
        parts: Vec<CompletedPart>,
    ) -> TransferResult<PutOutput> {
        let parts: Vec<AwsCompletedPart> = parts
            .into_iter()
            .map(|part| {
                AwsCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .set_e_tag(part.etag)
                    .set_checksum_crc32_c(part.checksum)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id.as_str())
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| TransferError::transport("complete_multipart_upload", e))?;

        Ok(PutOutput {
            etag: output.e_tag().map(str::to_string),
            version_id: output.version_id().map(str::to_string),
        })
    }

    async fn abort_multipart_upload(&self, object: &ObjectKey, upload_id: &SessionId) -> TransferResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id.as_str())
            .send()
            .await
            .map_err(|e| TransferError::transport("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn list_parts(&self, object: &ObjectKey, upload_id: &SessionId) -> TransferResult<Vec<CompletedPart>> {
        let mut pages = self
            .client
            .list_parts()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id.as_str())
            .into_paginator()
            .send();

        let mut parts = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| TransferError::transport("list_parts", e))?;
            for part in page.parts() {
                let Some(part_number) = part.part_number().filter(|n| *n > 0) else {
                    continue;
                };
                parts.push(CompletedPart {
                    part_number: part_number as u32,
                    etag: part.e_tag().map(str::to_string),
                    checksum: part.checksum_crc32_c().map(str::to_string),
                    size_bytes: size(part.size()),
                });
            }
        }
        debug!(upload_id = %upload_id, parts = parts.len(), "listed stored parts");
        Ok(parts)
    }

    async fn copy_object(&self, source: &ObjectKey, destination: &ObjectKey) -> TransferResult<PutOutput> {
        let output = self
            .client
            .copy_object()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .copy_source(copy_source(source))
            .send()
            .await
            .map_err(|e| TransferError::transport("copy_object", e))?;

        Ok(PutOutput {
            etag: output
                .copy_object_result()
                .and_then(|result| result.e_tag())
                .map(str::to_string),
            version_id: output.version_id().map(str::to_string),
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> TransferResult<GetObjectOutput> {
        let mut builder = self
            .client
            .get_object()
            .bucket(&request.object.bucket)
            .key(&request.object.key)
            .set_if_match(request.if_match.clone());
        builder = match request.selector {
            GetSelector::Part(part_number) => builder.part_number(part_number as i32),
            GetSelector::Range(range) => builder.range(range.to_header()),
        };

        let output = builder
            .send()
            .await
            .map_err(|e| TransferError::transport("get_object", e))?;

        Ok(GetObjectOutput {
            parts_count: output.parts_count().filter(|n| *n > 0).map(|n| n as u32),
            etag: output.e_tag().map(str::to_string),
            content_length: size(output.content_length()),
            content_range: output.content_range().and_then(ByteRange::parse_content_range),
            body: body_stream(output.body),
        })
    }

    async fn head_object(&self, object: &ObjectKey) -> TransferResult<ObjectHead> {
        let output = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| TransferError::transport("head_object", e))?;

        Ok(ObjectHead {
            size_bytes: size(output.content_length()),
            etag: output.e_tag().map(str::to_string),
            content_type: output.content_type().map(str::to_string),
        })
    }
}
