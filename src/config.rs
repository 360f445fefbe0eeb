//! Environment and `datasets.toml` loading, replacing the teacher's
//! single `database::get_pool` with one settings surface for everything
//! the engine needs to boot: object-store endpoint/credentials, the
//! document-store URI, the AES password-salt source, dataset definitions,
//! and the default acquisition lookback.

use std::env;

use crate::dataset::DatasetDefinition;
use crate::errors::Error;

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint_url: String,
    pub external_bucket: String,
    pub external_prefix: Option<String>,
    pub internal_bucket: String,
    pub internal_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentStoreSettings {
    pub uri: String,
    pub database: String,
}

/// Source of the AES password/salt material. `spec.md` §6 describes this
/// as "a single salt string plus per-key password derivation". The salt
/// is read once at startup, the password is resolved per source key by
/// whatever secret-provisioning system sits outside this crate's scope.
#[derive(Debug, Clone)]
pub struct CryptoSettings {
    pub salt: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub object_store: ObjectStoreSettings,
    pub document_store: DocumentStoreSettings,
    pub crypto: CryptoSettings,
    pub datasets: Vec<DatasetDefinition>,
    pub default_lookback_days: u32,
}

impl Settings {
    /// Load settings from environment variables plus a `datasets.toml`
    /// file whose path is given by `DATASETS_CONFIG_PATH` (default
    /// `datasets.toml` in the working directory), mirroring the teacher's
    /// `dotenvy::dotenv().ok()` startup followed by a config read.
    pub fn load() -> Result<Settings, Error> {
        dotenvy::dotenv().ok();

        let object_store = ObjectStoreSettings {
            endpoint_url: require_env("OBJECT_STORE_ENDPOINT_URL")?,
            external_bucket: require_env("OBJECT_STORE_EXTERNAL_BUCKET")?,
            external_prefix: env::var("OBJECT_STORE_EXTERNAL_PREFIX").ok(),
            internal_bucket: require_env("OBJECT_STORE_INTERNAL_BUCKET")?,
            internal_prefix: env::var("OBJECT_STORE_INTERNAL_PREFIX").ok(),
        };

        let document_store = DocumentStoreSettings {
            uri: require_env("DOCUMENT_STORE_URI")?,
            database: require_env("DOCUMENT_STORE_DATABASE")?,
        };

        let crypto = CryptoSettings { salt: require_env("CRYPTO_SALT")?, password: require_env("CRYPTO_PASSWORD")? };

        let datasets_path = env::var("DATASETS_CONFIG_PATH").unwrap_or_else(|_| "datasets.toml".to_string());
        let contents = std::fs::read_to_string(&datasets_path)
            .map_err(|err| Error::Config(format!("could not read {datasets_path}: {err}")))?;
        let datasets = crate::dataset::parse_datasets_toml(&contents)?;
        if datasets.is_empty() {
            return Err(Error::Config(format!("{datasets_path} declared no [[dataset]] entries")));
        }

        let default_lookback_days = env::var("DEFAULT_LOOKBACK_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        Ok(Settings { object_store, document_store, crypto, datasets, default_lookback_days })
    }
}

fn require_env(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| Error::Config(format!("missing required environment variable {name}")))
}
