//! Record digest engines.
//!
//! The coordinator only moves opaque inputs and digests; everything that
//! knows about tokenisation, key derivation or bit vectors sits behind
//! [`DigestEngine`].

mod bloom;
mod schema;

pub use bloom::BloomDigestEngine;
pub use schema::{
    ClkConfig, FieldFormat, FieldSpec, HashingSpec, KdfKind, KdfParams, LinkageSchema,
    SUPPORTED_SCHEMA_VERSION,
};

use thiserror::Error;

/// Per-field keys produced by [`DigestEngine::derive_keys`].
#[derive(Clone)]
pub struct KeyMaterial {
    fields: Vec<FieldKeys>,
}

#[derive(Clone)]
pub struct FieldKeys {
    pub primary: [u8; 32],
    pub secondary: [u8; 32],
}

impl KeyMaterial {
    pub fn new(fields: Vec<FieldKeys>) -> Self {
        Self { fields }
    }

    pub fn field(&self, position: usize) -> Option<&FieldKeys> {
        self.fields.get(position)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

/// A record failed structural validation against its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FormatError {
    pub field: Option<String>,
    pub message: String,
}

impl FormatError {
    pub fn record(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn field(field: &str, message: impl std::fmt::Display) -> Self {
        Self {
            field: Some(field.to_string()),
            message: format!("field `{field}`: {message}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("digest engine failure: {0}")]
    Engine(String),
}

pub trait DigestEngine: Send + Sync + 'static {
    /// Engine-specific checks run once at job creation.
    fn check_schema(&self, schema: &LinkageSchema) -> Result<(), DigestError>;

    fn derive_keys(
        &self,
        secret: &[u8],
        field_count: usize,
        kdf: &KdfParams,
    ) -> Result<KeyMaterial, DigestError>;

    fn validate(&self, record: &[String], fields: &[FieldSpec]) -> Result<(), FormatError>;

    /// Encode one record. `schema` carries both the field specs and the
    /// encoding parameters.
    fn digest(
        &self,
        record: &[String],
        schema: &LinkageSchema,
        keys: &KeyMaterial,
    ) -> Result<Vec<u8>, DigestError>;
}
