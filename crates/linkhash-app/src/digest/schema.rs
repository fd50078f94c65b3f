//! Linkage schema: how each record field is validated and encoded.
//!
//! The JSON layout follows the widely used CLK schema shape:
//!
//! ```json
//! {
//!   "version": 1,
//!   "clkConfig": { "l": 1024, "k": 20, "kdf": { "type": "BLAKE3" } },
//!   "features": [
//!     { "identifier": "given_name",
//!       "format": { "type": "string", "maxLength": 64 },
//!       "hashing": { "ngram": 2 } }
//!   ]
//! }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DigestError;

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LinkageSchema {
    pub version: u32,
    pub clk_config: ClkConfig,
    pub features: Vec<FieldSpec>,
}

/// Bloom-filter encoding parameters shared by every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClkConfig {
    /// Output length in bits.
    pub l: u32,
    /// Bits set per token at weight 1.0.
    pub k: u32,
    pub kdf: KdfParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfParams {
    #[serde(rename = "type")]
    pub kind: KdfKind,
    /// Base64 salt mixed into every derived key.
    #[serde(default)]
    pub salt: Option<String>,
    /// Base64 context string mixed into every derived key.
    #[serde(default)]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfKind {
    #[default]
    #[serde(rename = "BLAKE3")]
    Blake3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    pub identifier: String,
    pub format: FieldFormat,
    pub hashing: HashingSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum FieldFormat {
    #[serde(rename_all = "camelCase")]
    String {
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(skip)]
        compiled: Option<Regex>,
    },
    Integer {
        #[serde(default)]
        minimum: Option<i64>,
        #[serde(default)]
        maximum: Option<i64>,
    },
    Enum {
        values: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashingSpec {
    pub ngram: usize,
    #[serde(default)]
    pub positional: bool,
    #[serde(default = "HashingSpec::default_weight")]
    pub weight: f64,
}

impl HashingSpec {
    fn default_weight() -> f64 {
        1.0
    }
}

impl LinkageSchema {
    /// Parse a schema descriptor and compile any field patterns.
    pub fn from_value(value: &Value) -> Result<Self, DigestError> {
        let mut schema: LinkageSchema = serde_json::from_value(value.clone())
            .map_err(|err| DigestError::InvalidSchema(err.to_string()))?;
        schema.compile_patterns()?;
        Ok(schema)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, DigestError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| DigestError::InvalidSchema(err.to_string()))?;
        Self::from_value(&value)
    }

    pub fn field_count(&self) -> usize {
        self.features.len()
    }

    fn compile_patterns(&mut self) -> Result<(), DigestError> {
        for field in &mut self.features {
            if let FieldFormat::String {
                pattern: Some(pattern),
                compiled,
                ..
            } = &mut field.format
            {
                let anchored = format!("^(?:{pattern})$");
                let regex = Regex::new(&anchored).map_err(|err| {
                    DigestError::InvalidSchema(format!(
                        "field `{}` has an invalid pattern: {err}",
                        field.identifier
                    ))
                })?;
                *compiled = Some(regex);
            }
        }
        Ok(())
    }
}
