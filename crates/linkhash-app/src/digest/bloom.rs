use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::{
    DigestEngine, DigestError, FieldFormat, FieldKeys, FieldSpec, FormatError, KdfParams,
    KeyMaterial, LinkageSchema, SUPPORTED_SCHEMA_VERSION,
};

const KEY_DERIVATION_CONTEXT: &str = "linkhash 2024-06-01 per-field bloom keys v1";
const DERIVED_BYTES_PER_FIELD: usize = 64;

/// Upper bound on `clkConfig.l` (8 KiB filters).
const MAX_FILTER_BITS: u32 = 1 << 16;
/// Upper bound on `clkConfig.k`; it may also never exceed `l`.
const MAX_HASHES_PER_TOKEN: u32 = 1_024;
/// Upper bound on a field's `hashing.weight`.
const MAX_FIELD_WEIGHT: f64 = 16.0;

/// Cryptographic long-term key style encoder: each field's n-grams are
/// hashed into a shared `l`-bit Bloom filter with field-specific keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct BloomDigestEngine;

impl BloomDigestEngine {
    pub fn new() -> Self {
        Self
    }
}

impl DigestEngine for BloomDigestEngine {
    fn check_schema(&self, schema: &LinkageSchema) -> Result<(), DigestError> {
        if schema.version != SUPPORTED_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema version {} (expected {SUPPORTED_SCHEMA_VERSION})",
                schema.version
            )));
        }
        let clk = &schema.clk_config;
        if clk.l == 0 || clk.l % 8 != 0 {
            return Err(invalid("clkConfig.l must be a positive multiple of 8"));
        }
        if clk.l > MAX_FILTER_BITS {
            return Err(invalid(format!(
                "clkConfig.l must be at most {MAX_FILTER_BITS}"
            )));
        }
        if clk.k == 0 {
            return Err(invalid("clkConfig.k must be at least 1"));
        }
        if clk.k > clk.l.min(MAX_HASHES_PER_TOKEN) {
            return Err(invalid(format!(
                "clkConfig.k must be at most l and at most {MAX_HASHES_PER_TOKEN}"
            )));
        }
        if schema.features.is_empty() {
            return Err(invalid("schema must declare at least one feature"));
        }

        let mut seen = HashSet::new();
        for field in &schema.features {
            let id = field.identifier.as_str();
            if id.trim().is_empty() {
                return Err(invalid("feature identifiers must not be empty"));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate feature identifier `{id}`")));
            }
            if field.hashing.ngram == 0 {
                return Err(invalid(format!("feature `{id}`: ngram must be at least 1")));
            }
            let weight = field.hashing.weight;
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(format!(
                    "feature `{id}`: weight must be a non-negative number"
                )));
            }
            if weight > MAX_FIELD_WEIGHT {
                return Err(invalid(format!(
                    "feature `{id}`: weight must be at most {MAX_FIELD_WEIGHT}"
                )));
            }
            match &field.format {
                FieldFormat::String {
                    min_length: Some(min),
                    max_length: Some(max),
                    ..
                } if min > max => {
                    return Err(invalid(format!(
                        "feature `{id}`: minLength exceeds maxLength"
                    )));
                }
                FieldFormat::Integer {
                    minimum: Some(min),
                    maximum: Some(max),
                } if min > max => {
                    return Err(invalid(format!("feature `{id}`: minimum exceeds maximum")));
                }
                FieldFormat::Enum { values } if values.is_empty() => {
                    return Err(invalid(format!("feature `{id}`: enum needs values")));
                }
                _ => {}
            }
        }
        decode_optional_b64("kdf.salt", clk.kdf.salt.as_deref()).map_err(invalid)?;
        decode_optional_b64("kdf.info", clk.kdf.info.as_deref()).map_err(invalid)?;
        Ok(())
    }

    fn derive_keys(
        &self,
        secret: &[u8],
        field_count: usize,
        kdf: &KdfParams,
    ) -> Result<KeyMaterial, DigestError> {
        if secret.is_empty() {
            return Err(DigestError::KeyDerivation("secret is empty".to_string()));
        }
        if field_count == 0 {
            return Err(DigestError::KeyDerivation(
                "cannot derive keys for zero fields".to_string(),
            ));
        }
        let salt = decode_optional_b64("kdf.salt", kdf.salt.as_deref())
            .map_err(DigestError::KeyDerivation)?;
        let info = decode_optional_b64("kdf.info", kdf.info.as_deref())
            .map_err(DigestError::KeyDerivation)?;

        let mut fields = Vec::with_capacity(field_count);
        for position in 0..field_count {
            let mut hasher = blake3::Hasher::new_derive_key(KEY_DERIVATION_CONTEXT);
            update_prefixed(&mut hasher, &salt);
            update_prefixed(&mut hasher, &info);
            update_prefixed(&mut hasher, secret);
            hasher.update(&(position as u64).to_le_bytes());

            let mut derived = [0u8; DERIVED_BYTES_PER_FIELD];
            hasher.finalize_xof().fill(&mut derived);
            let mut primary = [0u8; 32];
            let mut secondary = [0u8; 32];
            primary.copy_from_slice(&derived[..32]);
            secondary.copy_from_slice(&derived[32..]);
            fields.push(FieldKeys { primary, secondary });
        }
        Ok(KeyMaterial::new(fields))
    }

    fn validate(&self, record: &[String], fields: &[FieldSpec]) -> Result<(), FormatError> {
        if record.len() != fields.len() {
            return Err(FormatError::record(format!(
                "record has {} fields, schema expects {}",
                record.len(),
                fields.len()
            )));
        }
        for (value, spec) in record.iter().zip(fields) {
            validate_field(value, spec)?;
        }
        Ok(())
    }

    fn digest(
        &self,
        record: &[String],
        schema: &LinkageSchema,
        keys: &KeyMaterial,
    ) -> Result<Vec<u8>, DigestError> {
        let features = &schema.features;
        if record.len() != features.len() {
            return Err(FormatError::record(format!(
                "record has {} fields, schema expects {}",
                record.len(),
                features.len()
            ))
            .into());
        }
        if keys.len() < features.len() {
            return Err(DigestError::Engine(format!(
                "key material covers {} fields, schema has {}",
                keys.len(),
                features.len()
            )));
        }

        let bit_len = u64::from(schema.clk_config.l);
        debug_assert!(bit_len > 0 && bit_len % 8 == 0);
        let mut filter = vec![0u8; (bit_len / 8) as usize];

        for (position, (value, spec)) in record.iter().zip(features).enumerate() {
            let hashes = (f64::from(schema.clk_config.k) * spec.hashing.weight).round() as u64;
            if hashes == 0 {
                continue;
            }
            let field_keys = keys.field(position).ok_or_else(|| {
                DigestError::Engine(format!("no key material for field {position}"))
            })?;
            let normalized = normalize_value(value, &spec.format);
            for token in tokenize(&normalized, spec.hashing.ngram, spec.hashing.positional) {
                let h1 = keyed_u64(&field_keys.primary, token.as_bytes());
                let h2 = keyed_u64(&field_keys.secondary, token.as_bytes());
                for i in 0..hashes {
                    let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bit_len;
                    filter[(bit / 8) as usize] |= 0x80 >> (bit % 8);
                }
            }
        }
        Ok(filter)
    }
}

fn invalid(message: impl Into<String>) -> DigestError {
    DigestError::InvalidSchema(message.into())
}

fn decode_optional_b64(name: &str, value: Option<&str>) -> Result<Vec<u8>, String> {
    match value {
        Some(raw) => BASE64
            .decode(raw.trim())
            .map_err(|err| format!("{name} is not valid base64: {err}")),
        None => Ok(Vec::new()),
    }
}

fn update_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn keyed_u64(key: &[u8; 32], token: &[u8]) -> u64 {
    let hash = blake3::keyed_hash(key, token);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

fn normalize_value(value: &str, format: &FieldFormat) -> String {
    match format {
        FieldFormat::Integer { .. } => match value.trim().parse::<i64>() {
            Ok(parsed) => parsed.to_string(),
            Err(_) => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Split `value` into character n-grams. Non-positional grams are padded
/// with a space on both sides so word boundaries contribute tokens.
fn tokenize(value: &str, n: usize, positional: bool) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = if positional || n == 1 {
        value.chars().collect()
    } else {
        format!(" {value} ").chars().collect()
    };
    if chars.len() < n {
        return Vec::new();
    }
    chars
        .windows(n)
        .enumerate()
        .map(|(offset, gram)| {
            let gram: String = gram.iter().collect();
            if positional {
                format!("{} {gram}", offset + 1)
            } else {
                gram
            }
        })
        .collect()
}

fn validate_field(value: &str, spec: &FieldSpec) -> Result<(), FormatError> {
    let id = spec.identifier.as_str();
    match &spec.format {
        FieldFormat::String {
            min_length,
            max_length,
            compiled,
            ..
        } => {
            let len = value.chars().count();
            if let Some(min) = min_length {
                if len < *min {
                    return Err(FormatError::field(
                        id,
                        format!("length {len} is below minimum {min}"),
                    ));
                }
            }
            if let Some(max) = max_length {
                if len > *max {
                    return Err(FormatError::field(
                        id,
                        format!("length {len} exceeds maximum {max}"),
                    ));
                }
            }
            if let Some(regex) = compiled {
                if !regex.is_match(value) {
                    return Err(FormatError::field(id, "value does not match pattern"));
                }
            }
        }
        FieldFormat::Integer { minimum, maximum } => {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| FormatError::field(id, format!("`{value}` is not an integer")))?;
            if let Some(min) = minimum {
                if parsed < *min {
                    return Err(FormatError::field(id, format!("{parsed} is below {min}")));
                }
            }
            if let Some(max) = maximum {
                if parsed > *max {
                    return Err(FormatError::field(id, format!("{parsed} exceeds {max}")));
                }
            }
        }
        FieldFormat::Enum { values } => {
            if !values.iter().any(|allowed| allowed == value) {
                return Err(FormatError::field(id, format!("`{value}` is not allowed")));
            }
        }
    }
    Ok(())
}
