//! Graph store contract and the redb-backed implementation.
//!
//! The merge and query engines only ever talk to the [`GraphStore`] trait;
//! they make no assumption about file format or query language of the
//! backend. The one hard requirement is atomicity: all edits for one
//! (subject, predicate) group are applied in a single call to
//! [`GraphStore::apply_edits`], and a backend must make that call
//! all-or-nothing — a closed old fact without its replacement must never
//! be observable.

use crate::{
    resolver, Entity, EntityId, EntityType, Fact, FactId, KalpanaError, ProvenanceId,
    ProvenanceRecord, Result, SourceRef, Value,
};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

/// Temporal filter applied by fact reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilter {
    /// Only facts with an open validity interval.
    Current,
    /// Only facts valid at the given instant.
    AsOf(DateTime<Utc>),
    /// The full history, including closed and superseded intervals.
    All,
}

impl TimeFilter {
    pub fn admits(&self, fact: &Fact) -> bool {
        match self {
            TimeFilter::Current => fact.is_open(),
            TimeFilter::AsOf(at) => fact.valid_at(*at),
            TimeFilter::All => true,
        }
    }
}

/// One mutation produced by the merge engine.
///
/// Edits carry the subject and predicate alongside the fact id so backends
/// with composite keys can address the row directly.
#[derive(Debug, Clone)]
pub enum GraphEdit {
    InsertFact(Fact),
    /// Close a fact's validity interval at `at`. A close at the fact's own
    /// `valid_from` leaves a zero-length interval, which no as-of query
    /// matches; this is how equal-timestamp conflicts are superseded.
    CloseInterval {
        subject: EntityId,
        predicate: String,
        fact_id: FactId,
        at: DateTime<Utc>,
    },
    /// Cite an additional provenance record on an existing fact.
    AttachProvenance {
        subject: EntityId,
        predicate: String,
        fact_id: FactId,
        provenance: ProvenanceId,
    },
}

/// Abstract persistence contract for the engine.
pub trait GraphStore {
    /// Insert or update an entity row and its name/alias indexes.
    fn upsert_entity(&self, entity: &Entity) -> Result<()>;

    fn entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    /// Exact raw-name lookup (canonical names and aliases share the index),
    /// scoped by entity type.
    fn entity_by_name(&self, entity_type: EntityType, raw: &str) -> Result<Option<Entity>>;

    /// Normalized-name lookup, scoped by entity type. The caller passes the
    /// already-normalized string.
    fn entity_by_norm(&self, entity_type: EntityType, normalized: &str) -> Result<Option<Entity>>;

    /// All facts for a subject, optionally narrowed to one predicate and a
    /// temporal filter. Must not scan unrelated subjects' history.
    fn facts_for_subject(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        filter: TimeFilter,
    ) -> Result<Vec<Fact>>;

    /// Reverse lookup: facts whose object position references `object`.
    fn facts_for_object(
        &self,
        object: &EntityId,
        predicate: Option<&str>,
        filter: TimeFilter,
    ) -> Result<Vec<Fact>>;

    /// Allocate a provenance record, content-deduplicated by
    /// `(source, extracted_at)`: re-inserting the same reference returns the
    /// existing record's id.
    fn insert_provenance(&self, source: &SourceRef) -> Result<ProvenanceId>;

    fn provenance(&self, id: &ProvenanceId) -> Result<Option<ProvenanceRecord>>;

    /// Apply a group of edits atomically: either all become visible or none.
    fn apply_edits(&self, edits: &[GraphEdit]) -> Result<()>;

    /// Reserve `n` consecutive ingestion sequence numbers, returning the
    /// first. Sequence numbers are monotonic across the store's lifetime.
    fn allocate_seq(&self, n: u64) -> Result<u64>;

    /// Append a single fact. Convenience over [`apply_edits`].
    ///
    /// [`apply_edits`]: GraphStore::apply_edits
    fn append_fact(&self, fact: &Fact) -> Result<()> {
        self.apply_edits(std::slice::from_ref(&GraphEdit::InsertFact(fact.clone())))
    }

    /// Close a single fact's interval. Convenience over [`apply_edits`].
    ///
    /// [`apply_edits`]: GraphStore::apply_edits
    fn close_fact_interval(
        &self,
        subject: &EntityId,
        predicate: &str,
        fact_id: &FactId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply_edits(&[GraphEdit::CloseInterval {
            subject: subject.clone(),
            predicate: predicate.to_string(),
            fact_id: fact_id.clone(),
            at,
        }])
    }
}

// ---------------------------------------------------------------------------
// redb implementation
// ---------------------------------------------------------------------------

/// Composite string key: `"{subject_id}:{predicate}:{fact_id}"`.
///
/// Entity ids and fact ids are ULIDs and predicates are snake_case, so the
/// separator is unambiguous. The ULID fact id is time-sortable, so facts
/// for one (subject, predicate) pair sit together in creation order and
/// range scans by prefix never touch another subject's history.
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");
/// Entity rows keyed by entity id.
const ENTITIES: TableDefinition<&str, &str> = TableDefinition::new("entities");
/// Raw-name index: `"{type}:{raw_name}"` → entity id. Canonical names and
/// aliases both live here.
const NAMES: TableDefinition<&str, &str> = TableDefinition::new("entity_names");
/// Normalized-name index: `"{type}:{normalized}"` → entity id.
const NORMS: TableDefinition<&str, &str> = TableDefinition::new("entity_names_norm");
/// Provenance rows keyed by provenance id.
const PROVENANCE: TableDefinition<&str, &str> = TableDefinition::new("provenance");
/// Content index: `"{extracted_at}|{source}"` → provenance id.
const PROV_INDEX: TableDefinition<&str, &str> = TableDefinition::new("provenance_index");
/// Single-row counters. Key `"seq"` holds the last allocated sequence number.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// redb-backed graph store. All writes are ACID; redb serialises write
/// transactions, so [`apply_edits`] groups are atomic and totally ordered.
///
/// [`apply_edits`]: GraphStore::apply_edits
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a store at the given path. The `.kalpana` extension
    /// is conventional but not enforced.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Useful for tests and
    /// ephemeral workloads; data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(FACTS)?;
            write_txn.open_table(ENTITIES)?;
            write_txn.open_table(NAMES)?;
            write_txn.open_table(NORMS)?;
            write_txn.open_table(PROVENANCE)?;
            write_txn.open_table(PROV_INDEX)?;
            write_txn.open_table(META)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    fn fact_key(subject: &EntityId, predicate: &str, fact_id: &FactId) -> String {
        format!("{subject}:{predicate}:{fact_id}")
    }

    fn name_key(entity_type: EntityType, name: &str) -> String {
        format!("{}:{}", entity_type.as_str(), name)
    }

    fn prov_key(source: &SourceRef) -> String {
        format!("{}|{}", source.extracted_at.to_rfc3339(), source.source)
    }

    // Scan the facts table over one key prefix, applying the temporal filter.
    fn scan_prefix(&self, prefix: &str, filter: TimeFilter) -> Result<Vec<Fact>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let mut results = Vec::new();

        for entry in table.range(prefix..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(prefix) {
                break;
            }
            let fact: Fact = serde_json::from_str(v.value())?;
            if filter.admits(&fact) {
                results.push(fact);
            }
        }

        Ok(results)
    }

    fn entity_by_index(
        &self,
        index: TableDefinition<&str, &str>,
        key: &str,
    ) -> Result<Option<Entity>> {
        let read_txn = self.db.begin_read()?;
        let index_table = read_txn.open_table(index)?;
        let Some(id) = index_table.get(key)?.map(|g| g.value().to_string()) else {
            return Ok(None);
        };
        let entities = read_txn.open_table(ENTITIES)?;
        match entities.get(id.as_str())? {
            Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
            None => Err(KalpanaError::Internal(format!(
                "name index points at missing entity {id}"
            ))),
        }
    }
}

impl GraphStore for RedbStore {
    fn upsert_entity(&self, entity: &Entity) -> Result<()> {
        let row = serde_json::to_string(entity)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut entities = write_txn.open_table(ENTITIES)?;
            entities.insert(entity.id.0.as_str(), row.as_str())?;

            let mut names = write_txn.open_table(NAMES)?;
            let mut norms = write_txn.open_table(NORMS)?;
            let mut index = |name: &str| -> Result<()> {
                let raw_key = Self::name_key(entity.entity_type, name);
                names.insert(raw_key.as_str(), entity.id.0.as_str())?;
                let norm_key = Self::name_key(entity.entity_type, &resolver::normalize(name));
                norms.insert(norm_key.as_str(), entity.id.0.as_str())?;
                Ok(())
            };
            index(&entity.canonical_name)?;
            for alias in &entity.aliases {
                index(alias)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;
        match table.get(id.0.as_str())? {
            Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
            None => Ok(None),
        }
    }

    fn entity_by_name(&self, entity_type: EntityType, raw: &str) -> Result<Option<Entity>> {
        self.entity_by_index(NAMES, &Self::name_key(entity_type, raw))
    }

    fn entity_by_norm(&self, entity_type: EntityType, normalized: &str) -> Result<Option<Entity>> {
        self.entity_by_index(NORMS, &Self::name_key(entity_type, normalized))
    }

    fn facts_for_subject(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        filter: TimeFilter,
    ) -> Result<Vec<Fact>> {
        let prefix = match predicate {
            Some(p) => format!("{subject}:{p}:"),
            None => format!("{subject}:"),
        };
        self.scan_prefix(&prefix, filter)
    }

    fn facts_for_object(
        &self,
        object: &EntityId,
        predicate: Option<&str>,
        filter: TimeFilter,
    ) -> Result<Vec<Fact>> {
        // Linear scan over the facts table. Reverse traversal is rare in
        // this workload; add an object index if it becomes hot.
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let mut results = Vec::new();

        for entry in table.iter()? {
            let (_k, v) = entry?;
            let fact: Fact = serde_json::from_str(v.value())?;
            let object_matches = matches!(&fact.object, Value::Entity(id) if id == object);
            let predicate_matches = predicate.is_none_or(|p| fact.predicate == p);
            if object_matches && predicate_matches && filter.admits(&fact) {
                results.push(fact);
            }
        }

        Ok(results)
    }

    fn insert_provenance(&self, source: &SourceRef) -> Result<ProvenanceId> {
        let key = Self::prov_key(source);

        // Fast path: read transaction, no write lock on replays.
        {
            let read_txn = self.db.begin_read()?;
            let index = read_txn.open_table(PROV_INDEX)?;
            if let Some(existing) = index.get(key.as_str())? {
                return Ok(ProvenanceId(existing.value().to_string()));
            }
        }

        // Slow path: re-check under the write lock, then insert record and
        // index entry in one transaction.
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut index = write_txn.open_table(PROV_INDEX)?;
            let existing = index.get(key.as_str())?.map(|g| g.value().to_string());
            if let Some(existing_id) = existing {
                return Ok(ProvenanceId(existing_id));
            }

            let record = ProvenanceRecord {
                id: ProvenanceId::new(),
                source: source.source.clone(),
                extracted_at: source.extracted_at,
                confidence: source.confidence,
            };
            let row = serde_json::to_string(&record)?;
            let mut table = write_txn.open_table(PROVENANCE)?;
            table.insert(record.id.0.as_str(), row.as_str())?;
            index.insert(key.as_str(), record.id.0.as_str())?;
            record.id
        };
        write_txn.commit()?;
        Ok(id)
    }

    fn provenance(&self, id: &ProvenanceId) -> Result<Option<ProvenanceRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVENANCE)?;
        match table.get(id.0.as_str())? {
            Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
            None => Ok(None),
        }
    }

    fn apply_edits(&self, edits: &[GraphEdit]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FACTS)?;
            for edit in edits {
                match edit {
                    GraphEdit::InsertFact(fact) => {
                        let key = Self::fact_key(&fact.subject, &fact.predicate, &fact.id);
                        let row = serde_json::to_string(fact)?;
                        table.insert(key.as_str(), row.as_str())?;
                    }
                    GraphEdit::CloseInterval {
                        subject,
                        predicate,
                        fact_id,
                        at,
                    } => {
                        let key = Self::fact_key(subject, predicate, fact_id);
                        let row = table.get(key.as_str())?.map(|g| g.value().to_string());
                        // A missing row drops the transaction, rolling back
                        // everything already staged in this group.
                        let row = row.ok_or_else(|| {
                            KalpanaError::NotFound(format!("fact {fact_id} for interval close"))
                        })?;
                        let mut fact: Fact = serde_json::from_str(&row)?;
                        fact.valid_until = Some(*at);
                        let updated = serde_json::to_string(&fact)?;
                        table.insert(key.as_str(), updated.as_str())?;
                    }
                    GraphEdit::AttachProvenance {
                        subject,
                        predicate,
                        fact_id,
                        provenance,
                    } => {
                        let key = Self::fact_key(subject, predicate, fact_id);
                        let row = table.get(key.as_str())?.map(|g| g.value().to_string());
                        let row = row.ok_or_else(|| {
                            KalpanaError::NotFound(format!("fact {fact_id} for citation"))
                        })?;
                        let mut fact: Fact = serde_json::from_str(&row)?;
                        if !fact.provenance.contains(provenance) {
                            fact.provenance.push(provenance.clone());
                            let updated = serde_json::to_string(&fact)?;
                            table.insert(key.as_str(), updated.as_str())?;
                        }
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn allocate_seq(&self, n: u64) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let first = {
            let mut meta = write_txn.open_table(META)?;
            let last: u64 = meta.get("seq")?.map(|g| g.value()).unwrap_or(0);
            meta.insert("seq", last + n)?;
            last + 1
        };
        write_txn.commit()?;
        Ok(first)
    }
}
