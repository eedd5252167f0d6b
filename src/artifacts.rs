//! Artifact references: immutable pointers to analysis output stored elsewhere.
//!
//! The desk never holds artifact payloads, only where they live and the hash of
//! the schema they were written with. Fields are private so a reference cannot
//! change after construction; deserialization goes through the same checks as
//! [`ArtifactRef::new`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ArtifactError;

/// Reference to an externally stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArtifactRef")]
pub struct ArtifactRef {
    uri: String,
    schema_hash: String,
    created_at: DateTime<Utc>,
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawArtifactRef {
    uri: String,
    schema_hash: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl TryFrom<RawArtifactRef> for ArtifactRef {
    type Error = ArtifactError;

    fn try_from(raw: RawArtifactRef) -> Result<Self, Self::Error> {
        let mut artifact = ArtifactRef::new(raw.uri, raw.schema_hash)?;
        artifact.created_at = raw.created_at;
        artifact.metadata = raw.metadata;
        Ok(artifact)
    }
}

impl ArtifactRef {
    /// Create a reference. `uri` and `schema_hash` must be non-empty.
    pub fn new(
        uri: impl Into<String>,
        schema_hash: impl Into<String>,
    ) -> Result<Self, ArtifactError> {
        let uri = uri.into();
        let schema_hash = schema_hash.into();
        if uri.trim().is_empty() {
            return Err(ArtifactError::EmptyField { field: "uri" });
        }
        if schema_hash.trim().is_empty() {
            return Err(ArtifactError::EmptyField {
                field: "schema_hash",
            });
        }
        Ok(Self {
            uri,
            schema_hash,
            created_at: Utc::now(),
            metadata: Map::new(),
        })
    }

    /// Attach a metadata entry. Consumes the reference; only usable while building.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Reference to exposure analysis results produced by a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureFrameRef {
    #[serde(flatten)]
    artifact: ArtifactRef,
}

impl ExposureFrameRef {
    pub fn new(artifact: ArtifactRef) -> Self {
        Self { artifact }
    }

    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    /// Tickers covered by the exposure frame, if the producer recorded them.
    pub fn tickers(&self) -> Vec<String> {
        self.artifact
            .metadata()
            .get("tickers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reference to optimization results, with a preview of the proposed weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResultRef {
    #[serde(flatten)]
    artifact: ArtifactRef,
    preview: BTreeMap<String, Decimal>,
}

impl OptimizationResultRef {
    pub fn new(artifact: ArtifactRef, preview: BTreeMap<String, Decimal>) -> Self {
        Self { artifact, preview }
    }

    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    /// Weight per ticker.
    pub fn preview(&self) -> &BTreeMap<String, Decimal> {
        &self.preview
    }

    /// One-line rendering of the preview, e.g. `AAPL: 0.5, GOOG: 0.5`.
    pub fn preview_line(&self) -> String {
        self.preview
            .iter()
            .map(|(ticker, weight)| format!("{ticker}: {weight}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
