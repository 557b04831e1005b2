//! Deterministic stage identities.
//!
//! A signature hashes, in this order: the parent signature (the base image
//! digest for the first stage), the canonical encoding of the stage's
//! declared configuration, the git digest of its source paths (or
//! [`EMPTY_GIT_DIGEST`]), and an optional force-distinct value. Every field
//! is length-prefixed so no two input sets share an encoding.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use werf_core::{StageDefinition, StageSignature};

/// Stands in for the git digest of stages without git paths. Never a valid
/// hex digest.
pub const EMPTY_GIT_DIGEST: &str = "-";

const DOMAIN: &[u8] = b"werf-stage-signature/v1";

/// A declared configuration value in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// A scalar in its TOML spelling, so `"1"` and `1` stay distinct
    Scalar(String),
    /// Order is significant
    List(Vec<ConfigValue>),
    /// Order is not significant; sorted and deduplicated when encoded
    Set(Vec<ConfigValue>),
    /// Keys are always sorted
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// A string scalar, spelled the way it would be read from werf.toml.
    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(toml::Value::String(value.into()).to_string())
    }

    fn from_toml(value: &toml::Value) -> Self {
        match value {
            toml::Value::Array(items) => Self::List(items.iter().map(Self::from_toml).collect()),
            toml::Value::Table(table) => Self::Map(
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_toml(v)))
                    .collect(),
            ),
            scalar => Self::Scalar(scalar.to_string()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Scalar(text) => {
                out.push(b'S');
                frame(out, text.as_bytes());
            }
            Self::List(items) => {
                out.push(b'L');
                out.extend_from_slice(&(items.len() as u64).to_be_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            Self::Set(items) => {
                let mut encoded: Vec<Vec<u8>> = items
                    .iter()
                    .map(|item| {
                        let mut buf = Vec::new();
                        item.encode(&mut buf);
                        buf
                    })
                    .collect();
                encoded.sort();
                encoded.dedup();

                out.push(b'T');
                out.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
                for item in encoded {
                    out.extend_from_slice(&item);
                }
            }
            Self::Map(entries) => {
                out.push(b'M');
                out.extend_from_slice(&(entries.len() as u64).to_be_bytes());
                for (key, value) in entries {
                    frame(out, key.as_bytes());
                    value.encode(out);
                }
            }
        }
    }
}

/// The configuration fields of one stage, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConfig {
    fields: BTreeMap<String, ConfigValue>,
}

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: ConfigValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Canonical configuration of a `[[stage]]` entry. Fields listed in
    /// `set_fields` must be arrays and are treated as unordered.
    pub fn from_definition(definition: &StageDefinition) -> Result<Self, SignatureError> {
        let mut fields = BTreeMap::new();
        for (field, value) in &definition.config {
            fields.insert(field.clone(), ConfigValue::from_toml(value));
        }

        for field in &definition.set_fields {
            let value = fields
                .remove(field)
                .ok_or_else(|| SignatureError::UnknownSetField {
                    stage: definition.name.clone(),
                    field: field.clone(),
                })?;
            let ConfigValue::List(items) = value else {
                return Err(SignatureError::SetFieldNotArray {
                    stage: definition.name.clone(),
                    field: field.clone(),
                });
            };
            fields.insert(field.clone(), ConfigValue::Set(items));
        }

        Ok(Self { fields })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ConfigValue::Map(self.fields.clone()).encode(&mut out);
        out
    }
}

/// Everything a stage signature depends on apart from its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputs {
    pub name: String,
    pub config: StageConfig,
    /// Digest of the stage's git paths; `None` when it has none
    pub git_digest: Option<String>,
    /// Cache-bust value folded into the hash when set
    pub force_distinct: Option<String>,
}

impl StageInputs {
    pub fn new(name: impl Into<String>, config: StageConfig) -> Self {
        Self {
            name: name.into(),
            config,
            git_digest: None,
            force_distinct: None,
        }
    }
}

pub fn compute_signature(
    parent: &str,
    config: &StageConfig,
    git_digest: Option<&str>,
    force_distinct: Option<&str>,
) -> StageSignature {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);

    let mut buf = Vec::new();
    frame(&mut buf, parent.as_bytes());
    frame(&mut buf, &config.encode());
    frame(&mut buf, git_digest.unwrap_or(EMPTY_GIT_DIGEST).as_bytes());
    match force_distinct {
        Some(value) => {
            buf.push(1);
            frame(&mut buf, value.as_bytes());
        }
        None => buf.push(0),
    }
    hasher.update(&buf);

    StageSignature::new(hex::encode(hasher.finalize()))
}

/// Signatures of consecutive stages, each chained to its predecessor.
pub fn compute_chain(
    base_image_digest: &str,
    stages: &[StageInputs],
) -> Vec<(String, StageSignature)> {
    let mut parent = base_image_digest.to_owned();
    stages
        .iter()
        .map(|stage| {
            let signature = compute_signature(
                &parent,
                &stage.config,
                stage.git_digest.as_deref(),
                stage.force_distinct.as_deref(),
            );
            parent = signature.as_str().to_owned();
            (stage.name.clone(), signature)
        })
        .collect()
}

fn frame(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("stage {stage}: set field {field:?} is not declared in its config")]
    UnknownSetField { stage: String, field: String },

    #[error("stage {stage}: set field {field:?} must be an array")]
    SetFieldNotArray { stage: String, field: String },
}
