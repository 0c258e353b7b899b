//! Core identity and key types for request-scoped observability.
//!
//! Identifiers follow the parse-don't-validate principle: once a
//! `SessionId` or `CorrelationId` exists it is known to be well formed, so
//! nothing downstream re-checks it.

use std::fmt;
use std::str::FromStr;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier tagging every record of one logical request.
///
/// Correlation IDs are `UUIDv7`, so they sort by creation time.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new correlation ID with the current timestamp.
    pub fn new() -> Self {
        // Uuid::now_v7() always yields a version 7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies the user session a request belongs to.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SessionId(String);

/// Identifies the authenticated user or system actor behind a request.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(String);

/// Identifies the business investigation a request is part of.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct InvestigationId(String);

/// Free-form business phase tag (e.g. `"triage"`).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Phase(String);

/// Architectural layer an operation executes in.
///
/// The four named layers carry their own performance thresholds; any other
/// name falls back to the global default threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Layer {
    /// Entry/boundary layer (HTTP handlers, RPC endpoints)
    Api,
    /// Business-logic layer
    Service,
    /// Domain layer
    Domain,
    /// External-integration layer
    External,
    /// Any other caller-defined layer
    Other(String),
}

impl Layer {
    /// The canonical lowercase name used in operation keys.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Api => "api",
            Self::Service => "service",
            Self::Domain => "domain",
            Self::External => "external",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Layer {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "api" | "entry" => Self::Api,
            "service" | "business" => Self::Service,
            "domain" => Self::Domain,
            "external" | "integration" => Self::External,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Layer {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<Layer> for String {
    fn from(layer: Layer) -> Self {
        layer.as_str().to_string()
    }
}

impl FromStr for Layer {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

/// Kind of record an operation key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Inbound/outbound edge of a layer
    Boundary,
    /// Timed unit of work
    Operation,
    /// Call leaving the process
    ExternalCall,
    /// One-shot metric sample
    Metric,
}

impl Category {
    /// The name used in operation keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::Operation => "operation",
            Self::ExternalCall => "external_call",
            Self::Metric => "metric",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Entering the layer
    Inbound,
    /// Leaving the layer
    Outbound,
}

impl Direction {
    /// The name used in operation keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplication and performance-bucket key.
///
/// Rendered as `{layer}.{category}.{operation}[.{direction}]`. Two
/// operations are the same iff their keys are textually identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    /// Key for a boundary record.
    pub fn boundary(layer: &Layer, operation: &str, direction: Direction) -> Self {
        Self(format!(
            "{layer}.{}.{operation}.{direction}",
            Category::Boundary
        ))
    }

    /// Key for a timed operation or external call.
    pub fn operation(layer: &Layer, category: Category, operation: &str) -> Self {
        Self(format!("{layer}.{category}.{operation}"))
    }

    /// Key for a metric sample; the random suffix keeps every sample distinct.
    pub fn metric(layer: &Layer, name: &str) -> Self {
        Self(format!(
            "{layer}.{}.{name}.{}",
            Category::Metric,
            Uuid::new_v4().simple()
        ))
    }

    /// The rendered key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for OperationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
