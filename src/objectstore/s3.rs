//! S3-backed implementation of the object-store abstraction.
//!
//! Reads stream directly off `GetObject`'s body. Writes are staged through
//! a multipart upload so the full payload is never buffered in memory,
//! matching the streaming-pipeline design note in §9. Metadata is
//! re-stamped after upload via `CopyObject` with a metadata-replace
//! directive, since S3 has no in-place "set user metadata" call.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{ByteSink, ByteSource, ObjectStoreReader, ObjectStoreWriter};
use crate::dataset::StorageObject;
use crate::errors::Error;

/// Multipart uploads must use parts of at least 5 MiB (except the last).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Store {
    client: Client,
    bucket: String,
    /// Optional key prefix this handle is scoped to. Prepended on write,
    /// matched and stripped on list/read.
    top_level_folder: Option<String>,
}

impl S3Store {
    pub fn new(client: Client, bucket: String, top_level_folder: Option<String>) -> Self {
        S3Store { client, bucket, top_level_folder }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.top_level_folder {
            Some(folder) => format!("{}/{}", folder.trim_end_matches('/'), key.trim_start_matches('/')),
            None => key.to_string(),
        }
    }

    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        match &self.top_level_folder {
            Some(folder) => {
                let prefix = format!("{}/", folder.trim_end_matches('/'));
                full_key.strip_prefix(prefix.as_str()).unwrap_or(full_key)
            }
            None => full_key,
        }
    }
}

#[async_trait]
impl ObjectStoreReader for S3Store {
    async fn open_read(&self, key: &str) -> Result<Box<dyn ByteSource>, Error> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("get_object {full_key}: {err}")))?;

        Ok(Box::new(S3ByteSource { body: output.body }))
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let full_key = self.full_key(key);
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_not_found() => Ok(false),
                _ => Err(Error::Storage(format!("head_object {full_key}: {err}"))),
            },
        }
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>, Error> {
        let full_key = self.full_key(key);
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => Ok(Some(StorageObject {
                key: key.to_string(),
                content_length: output.content_length().unwrap_or(0) as u64,
                etag: output.e_tag().map(|s| s.to_string()),
                last_modified: output.last_modified().and_then(|dt| {
                    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).map(|dt| dt.with_timezone(&Utc))
                }),
                user_metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_not_found() => Ok(None),
                _ => Err(Error::Storage(format!("head_object {full_key}: {err}"))),
            },
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, Error> {
        let full_prefix = self.full_key(prefix);
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(&full_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|err| Error::Storage(format!("list_objects_v2 {full_prefix}: {err}")))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(StorageObject {
                    key: self.relative_key(key).to_string(),
                    content_length: object.size().unwrap_or(0) as u64,
                    etag: object.e_tag().map(|s| s.to_string()),
                    last_modified: object.last_modified().and_then(|dt| {
                        DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).map(|dt| dt.with_timezone(&Utc))
                    }),
                    user_metadata: HashMap::new(),
                });
            }

            continuation_token = output.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }
}

#[async_trait]
impl ObjectStoreWriter for S3Store {
    async fn open_write(&self, key: &str, content_type: &str) -> Result<Box<dyn ByteSink>, Error> {
        let full_key = self.full_key(key);
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("create_multipart_upload {full_key}: {err}")))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| Error::Storage("create_multipart_upload returned no upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3MultipartSink {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            upload_id,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
            parts: Vec::new(),
            part_number: 1,
        }))
    }

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<(), Error> {
        let full_key = self.full_key(key);
        let source = format!("{}/{}", self.bucket, full_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .copy_source(source)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|err| Error::Storage(format!("copy_object (set_metadata) {full_key}: {err}")))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("delete_object {full_key}: {err}")))?;
        Ok(())
    }
}

struct S3ByteSource {
    body: ByteStream,
}

#[async_trait]
impl ByteSource for S3ByteSource {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self.body.try_next().await {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => Ok(None),
            Err(err) => Err(Error::Storage(format!("reading object body: {err}"))),
        }
    }
}

struct S3MultipartSink {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    buffer: Vec<u8>,
    parts: Vec<CompletedPart>,
    part_number: i32,
}

impl S3MultipartSink {
    async fn flush_buffer(&mut self, force: bool) -> Result<(), Error> {
        if self.buffer.is_empty() || (!force && self.buffer.len() < MIN_PART_SIZE) {
            return Ok(());
        }

        let body = ByteStream::from(std::mem::take(&mut self.buffer));
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(body)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("upload_part {} part {}: {err}", self.key, self.part_number)))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(self.part_number)
                .set_e_tag(output.e_tag().map(|s| s.to_string()))
                .build(),
        );
        self.part_number += 1;
        Ok(())
    }
}

#[async_trait]
impl ByteSink for S3MultipartSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_buffer(true).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        // Parts smaller than MIN_PART_SIZE can only be uploaded as the
        // final part, so an intermediate flush is a no-op here; the real
        // flush happens in `close`.
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), Error> {
        self.flush_buffer(true).await?;

        if self.parts.is_empty() {
            // Zero-byte object: abort the multipart upload and write an
            // empty object directly instead.
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .send()
                .await
                .map_err(|err| Error::Storage(format!("abort_multipart_upload {}: {err}", self.key)))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(Vec::new()))
                .send()
                .await
                .map_err(|err| Error::Storage(format!("put_object (empty) {}: {err}", self.key)))?;

            return Ok(());
        }

        let completed = CompletedMultipartUpload::builder().set_parts(Some(self.parts.clone())).build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("complete_multipart_upload {}: {err}", self.key)))?;

        Ok(())
    }
}
