//! Factory that hands out object-store handles keyed by logical source.
//! The external bucket is read-only (encrypted source CSVs); the internal
//! bucket is read-write (decrypted CSVs plus reporting collections' object
//! data, when applicable).

use std::sync::Arc;

use aws_sdk_s3::Client;

use super::s3::S3Store;
use super::{ObjectStoreReader, ObjectStoreWriter, StoreSource};
use crate::config::ObjectStoreSettings;
use crate::errors::Error;

pub struct ObjectStoreFactory {
    external: Arc<S3Store>,
    internal: Arc<S3Store>,
}

impl ObjectStoreFactory {
    pub async fn from_settings(settings: &ObjectStoreSettings) -> Result<Self, Error> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&settings.endpoint_url)
            .load()
            .await;
        let client = Client::new(&aws_config);

        Ok(ObjectStoreFactory {
            external: Arc::new(S3Store::new(
                client.clone(),
                settings.external_bucket.clone(),
                settings.external_prefix.clone(),
            )),
            internal: Arc::new(S3Store::new(client, settings.internal_bucket.clone(), settings.internal_prefix.clone())),
        })
    }

    /// Read-only view, for the catalogue and acquisition's source side.
    pub fn reader(&self, source: StoreSource) -> Arc<dyn ObjectStoreReader> {
        match source {
            StoreSource::External => self.external.clone(),
            StoreSource::Internal => self.internal.clone(),
        }
    }

    /// Read-write view, for acquisition's target side and ingestion's
    /// source side. The external bucket never needs write access, but
    /// nothing stops a caller from requesting it against a store backed
    /// by a bucket the credentials genuinely can't write to.
    pub fn writer(&self, source: StoreSource) -> Arc<dyn ObjectStoreWriter> {
        match source {
            StoreSource::External => self.external.clone(),
            StoreSource::Internal => self.internal.clone(),
        }
    }
}
