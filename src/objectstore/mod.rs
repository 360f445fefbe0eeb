//! Object-store abstraction (C1).
//!
//! Two capability sets, expressed as two traits rather than a subclassed
//! hierarchy (§9 design note): `ObjectStoreReader` covers everything the
//! dataset catalogue and acquisition's source side need; `ObjectStoreWriter`
//! extends it with the write surface acquisition's target side and
//! ingestion's source side need. An instance may be pinned to a
//! `top_level_folder`, prepended on write and stripped on list/read so
//! callers always see keys relative to the folder.

pub mod factory;
pub mod s3;

pub use factory::ObjectStoreFactory;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dataset::StorageObject;
use crate::errors::Error;

/// A chunked byte source. `read_chunk` returns `None` at end of stream.
/// Modeled as a pull-based trait (rather than requiring `AsyncRead`) so it
/// composes easily with the decrypt -> byte-counter -> upload pipeline in
/// `crypto.rs` without pinning or boxing futures by hand.
#[async_trait]
pub trait ByteSource: Send {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error>;
}

/// A chunked byte sink with explicit `flush`/`close`, per the streaming
/// pipeline composition design note in §9: decrypt, the byte-counter, and
/// the upload target are each one of these, chained.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error>;
    async fn flush(&mut self) -> Result<(), Error>;
    async fn close(self: Box<Self>) -> Result<(), Error>;
}

#[async_trait]
pub trait ObjectStoreReader: Send + Sync {
    /// Open a streaming reader over an object's full content.
    async fn open_read(&self, key: &str) -> Result<Box<dyn ByteSource>, Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    async fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>, Error>;

    /// List every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, Error>;
}

#[async_trait]
pub trait ObjectStoreWriter: ObjectStoreReader {
    async fn open_write(&self, key: &str, content_type: &str) -> Result<Box<dyn ByteSink>, Error>;

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// Which logical bucket a store handle talks to. The catalogue and
/// acquisition's source side only ever ask for `External`; acquisition's
/// target side and ingestion's source side ask for `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSource {
    External,
    Internal,
}

/// A sink that forwards every chunk to an inner sink while keeping a
/// running count of bytes written. Used to compose
/// decrypt -> byte-counter -> upload without materialising the file.
pub struct ByteCounterSink {
    inner: Box<dyn ByteSink>,
    bytes_written: u64,
}

impl ByteCounterSink {
    pub fn new(inner: Box<dyn ByteSink>) -> Self {
        ByteCounterSink { inner, bytes_written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait]
impl ByteSink for ByteCounterSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.inner.write(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        self.inner.close().await
    }
}

/// Normalize an etag for comparison: trim surrounding quotes and
/// lower-case it (§4.4 transfer decision).
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_quoted_etags() {
        assert_eq!(normalize_etag("\"ABC123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
        assert_eq!(normalize_etag(" \"AbC\" "), "abc");
    }
}
