//! Kalpana — embedded temporal knowledge graph engine.
//!
//! The core primitive is a [`Fact`]: a subject-predicate-object assertion
//! with a validity interval `[valid_from, valid_until)` and provenance.
//! `valid_until = None` means the fact is currently believed true.
//!
//! Facts are never deleted. Ingesting a newer value for a functional
//! predicate closes the previous fact's interval and opens a new one, so
//! the graph state at any past instant can be reconstructed exactly. A
//! late-arriving fact whose observation time predates already-closed
//! intervals triggers a retroactive re-partition of the affected history.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use kalpana::{CandidateFact, CandidateObject, Mention, SourceRef, TemporalKg, Value};
//! use chrono::Utc;
//!
//! let kg = TemporalKg::open("missions.kalpana").unwrap();
//!
//! let launch: chrono::DateTime<chrono::Utc> = "2016-09-08T00:00:00Z".parse().unwrap();
//! let batch = vec![CandidateFact {
//!     subject: Mention::new("INSAT-3DR", "Mission"),
//!     predicate: "launched_on".into(),
//!     object: CandidateObject::Literal(Value::Date(launch)),
//!     provenance: SourceRef::new("https://mosdac.gov.in/insat-3dr", Utc::now()),
//!     observed_at: Some(launch),
//! }];
//! let report = kg.ingest_batch(batch).unwrap();
//! assert_eq!(report.applied, 1);
//!
//! // Current state, with provenance attached to every fact.
//! let answer = kg.lookup("INSAT-3DR", "Mission", Some("launched_on"), None).unwrap();
//! ```

pub mod merge;
pub mod provenance;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use ulid::Ulid;

pub use merge::{IngestReport, SkipReason, SkippedFact};
pub use provenance::{build_bundle, CitationBundle, FactCitation, SourceCitation};
pub use query::{FactWithProvenance, Hop, QueryOutcome, TraversalOutcome};
pub use schema::{ObjectKind, PredicateSchema, PredicateSpec};
pub use store::{GraphEdit, GraphStore, RedbStore, TimeFilter};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KalpanaError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    /// Predicate names become part of composite store keys, so only
    /// `[a-zA-Z0-9_]+` is accepted at registration.
    #[error("invalid predicate name: {0:?}")]
    InvalidPredicate(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for KalpanaError {
    fn from(e: redb::DatabaseError) -> Self {
        KalpanaError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for KalpanaError {
    fn from(e: redb::TransactionError) -> Self {
        KalpanaError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for KalpanaError {
    fn from(e: redb::TableError) -> Self {
        KalpanaError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for KalpanaError {
    fn from(e: redb::StorageError) -> Self {
        KalpanaError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for KalpanaError {
    fn from(e: redb::CommitError) -> Self {
        KalpanaError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KalpanaError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id! {
    /// Stable, time-sortable identifier for an [`Entity`].
    EntityId
}
ulid_id! {
    /// Stable, time-sortable identifier for a [`Fact`].
    FactId
}
ulid_id! {
    /// Stable identifier for a [`ProvenanceRecord`].
    ProvenanceId
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Closed set of entity types in the mission-portal domain.
///
/// Resolution is scoped per type, so a `Mission` named "SCATSAT-1" and a
/// `Document` named "SCATSAT-1" are distinct entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Mission,
    Instrument,
    Product,
    Document,
    Organization,
    Parameter,
}

impl EntityType {
    /// Parse an ingestion-side type tag (case-insensitive).
    ///
    /// Returns `None` for tags outside the closed set; callers surface this
    /// as a per-fact [`SkipReason::UnknownEntityType`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mission" | "satellite" => Some(Self::Mission),
            "instrument" | "sensor" => Some(Self::Instrument),
            "product" => Some(Self::Product),
            "document" => Some(Self::Document),
            "organization" | "agency" => Some(Self::Organization),
            "parameter" => Some(Self::Parameter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mission => "Mission",
            Self::Instrument => "Instrument",
            Self::Product => "Product",
            Self::Document => "Document",
            Self::Organization => "Organization",
            Self::Parameter => "Parameter",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stable real-world object: satellite mission, instrument, data product,
/// document, organization, or measured parameter.
///
/// Created on first resolution; aliases accumulate over time; never deleted
/// (an entity may become inactive but its identity persists so historical
/// queries keep resolving).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub canonical_name: String,
    pub entity_type: EntityType,
    /// Every surface form this entity has been seen under, raw (unnormalized).
    pub aliases: Vec<String>,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Kind tag for literal object values, used by the predicate schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiteralKind {
    Text,
    Number,
    Boolean,
    Date,
}

impl std::fmt::Display for LiteralKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Text => "Text",
            Self::Number => "Number",
            Self::Boolean => "Boolean",
            Self::Date => "Date",
        };
        f.write_str(s)
    }
}

/// The value stored in a fact's object position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// A text string.
    Text(String),
    /// A numeric value.
    Number(f64),
    /// A boolean.
    Boolean(bool),
    /// A calendar instant (e.g. a launch date).
    Date(DateTime<Utc>),
    /// A reference to another entity.
    Entity(EntityId),
}

impl Value {
    /// The literal kind of this value, or `None` for entity references.
    pub fn literal_kind(&self) -> Option<LiteralKind> {
        match self {
            Value::Text(_) => Some(LiteralKind::Text),
            Value::Number(_) => Some(LiteralKind::Number),
            Value::Boolean(_) => Some(LiteralKind::Boolean),
            Value::Date(_) => Some(LiteralKind::Date),
            Value::Entity(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Entity(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Immutable citation of a fact's origin.
///
/// Records are content-deduplicated by `(source, extracted_at)`: re-ingesting
/// the same scrape yields the same record, and many facts extracted from one
/// document share a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub id: ProvenanceId,
    /// Source URL or document identifier.
    pub source: String,
    /// When the scraper extracted this assertion.
    pub extracted_at: DateTime<Utc>,
    /// Extractor confidence \[0.0, 1.0\].
    pub confidence: f32,
}

/// Ingestion-side reference to a source, before a [`ProvenanceRecord`] is
/// allocated for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub extracted_at: DateTime<Utc>,
    pub confidence: f32,
}

impl SourceRef {
    pub fn new(source: impl Into<String>, extracted_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            extracted_at,
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// One atomic assertion: a typed relation between a subject entity and an
/// object (entity or literal), true over `[valid_from, valid_until)`.
///
/// `valid_until = None` means currently believed true. `seq` is the
/// monotonically increasing ingestion sequence number allocated when the
/// fact row was created — it never changes, even when a retroactive
/// correction rewrites the fact's interval, so operators can distinguish
/// "learned late" from "became true late".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub subject: EntityId,
    pub predicate: String,
    pub object: Value,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Citations backing this fact. Grows when the same assertion is
    /// re-extracted from another source; never shrinks.
    pub provenance: Vec<ProvenanceId>,
    pub seq: u64,
}

impl Fact {
    /// Is the validity interval open-ended (currently believed true)?
    pub fn is_open(&self) -> bool {
        self.valid_until.is_none()
    }

    /// Was this fact true at the given instant (`valid_from <= at < valid_until`)?
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_until.is_none_or(|t| t > at)
    }
}

// ---------------------------------------------------------------------------
// Ingestion input
// ---------------------------------------------------------------------------

/// A raw name as it appears in scraped source material, plus the type tag
/// and any alias hints the source provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub name: String,
    /// Raw type tag from the source (e.g. `"Mission"`, `"satellite"`).
    pub type_tag: String,
    #[serde(default)]
    pub alias_hints: Vec<String>,
}

impl Mention {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            alias_hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: impl IntoIterator<Item = String>) -> Self {
        self.alias_hints.extend(hints);
        self
    }
}

/// Object position of a candidate fact: another mention, or a typed literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum CandidateObject {
    Entity(Mention),
    Literal(Value),
}

/// One candidate assertion from the scraper, before resolution and merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    pub subject: Mention,
    pub predicate: String,
    pub object: CandidateObject,
    pub provenance: SourceRef,
    /// When the source says this became true. Defaults to the extraction
    /// time when the source gives no explicit effective date.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl CandidateFact {
    /// Effective observation timestamp for temporal ordering.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.observed_at.unwrap_or(self.provenance.extracted_at)
    }
}

// ---------------------------------------------------------------------------
// Engine facade
// ---------------------------------------------------------------------------

/// The temporal knowledge graph engine: schema-validated ingestion with
/// conflict resolution, plus current-state / as-of / multi-hop queries.
///
/// Generic over the [`GraphStore`] backend; [`TemporalKg::open`] gives the
/// redb-backed store.
pub struct TemporalKg<S: GraphStore> {
    store: S,
    schema: PredicateSchema,
    locks: merge::GroupLocks,
}

impl TemporalKg<RedbStore> {
    /// Open or create a Kalpana database at the given path, with the default
    /// mission-portal predicate vocabulary.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::with_store(
            RedbStore::open(path)?,
            PredicateSchema::mission_portal(),
        ))
    }

    /// Create an in-memory engine (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_store(
            RedbStore::open_in_memory()?,
            PredicateSchema::mission_portal(),
        ))
    }
}

impl<S: GraphStore> TemporalKg<S> {
    /// Build an engine over an arbitrary store backend and predicate schema.
    pub fn with_store(store: S, schema: PredicateSchema) -> Self {
        Self {
            store,
            schema,
            locks: merge::GroupLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn schema(&self) -> &PredicateSchema {
        &self.schema
    }

    /// Register or replace a predicate in the vocabulary. Names are limited
    /// to `[a-zA-Z0-9_]+`; anything else is [`KalpanaError::InvalidPredicate`].
    pub fn register_predicate(&mut self, name: impl Into<String>, spec: PredicateSpec) -> Result<()> {
        self.schema.register(name, spec)
    }

    /// Ingest a batch of candidate facts. See [`merge`] for the conflict
    /// resolution rules. Per-fact failures are collected in the returned
    /// report; only backend failures abort the batch.
    pub fn ingest_batch(&self, batch: Vec<CandidateFact>) -> Result<IngestReport> {
        merge::ingest_batch(&self.store, &self.schema, &self.locks, batch, None)
    }

    /// Like [`ingest_batch`], but checks `cancel` between (subject, predicate)
    /// groups. Groups applied before cancellation stay committed; the rest of
    /// the batch is reported as skipped, not rolled back.
    ///
    /// [`ingest_batch`]: TemporalKg::ingest_batch
    pub fn ingest_batch_cancellable(
        &self,
        batch: Vec<CandidateFact>,
        cancel: &AtomicBool,
    ) -> Result<IngestReport> {
        merge::ingest_batch(&self.store, &self.schema, &self.locks, batch, Some(cancel))
    }

    /// Answer a current-state or as-of query for a subject.
    ///
    /// `as_of = None` returns facts with an open validity interval;
    /// `as_of = Some(t)` reconstructs the state at `t`. Results are ordered
    /// by descending `valid_from` and carry hydrated provenance records.
    ///
    /// A subject whose name never resolved (or whose type tag is outside the
    /// closed set) yields [`QueryOutcome::EntityNotFound`]; a resolved subject
    /// with no matching facts yields an empty fact list — "no known fact" is
    /// not an error.
    pub fn lookup(
        &self,
        subject: &str,
        type_tag: &str,
        predicate: Option<&str>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<QueryOutcome> {
        query::lookup(&self.store, subject, type_tag, predicate, as_of)
    }

    /// Full ingestion-history view for a subject: every fact ever recorded,
    /// including interval-closed and superseded ones, ordered by ingestion
    /// sequence number.
    pub fn history(
        &self,
        subject: &str,
        type_tag: &str,
        predicate: Option<&str>,
    ) -> Result<QueryOutcome> {
        query::history(&self.store, subject, type_tag, predicate)
    }

    /// Multi-hop traversal from an anchor entity. The as-of instant is
    /// pinned once (defaulting to now) and used for every hop, so one answer
    /// never mixes two snapshots.
    pub fn related(
        &self,
        subject: &str,
        type_tag: &str,
        hops: &[Hop],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<TraversalOutcome> {
        query::related(&self.store, subject, type_tag, hops, as_of)
    }

    /// All known surface forms of an entity, or `None` if it never resolved.
    pub fn aliases_of(&self, subject: &str, type_tag: &str) -> Result<Option<Vec<String>>> {
        let Some(ty) = EntityType::from_tag(type_tag) else {
            return Ok(None);
        };
        Ok(resolver::find_existing(&self.store, ty, subject)?.map(|e| e.aliases))
    }
}
