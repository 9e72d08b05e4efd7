//! Temporal merge engine.
//!
//! Takes an ordered batch of candidate facts, resolves mentions, and
//! produces the minimal set of graph edits (insertions, interval closures,
//! citation attachments) that reconcile the batch with existing history.
//!
//! Merge rules per (subject, predicate) group:
//!
//! - **Functional predicates** admit one value at a time. Candidates are
//!   processed in observation-time order; a value identical to the interval
//!   covering its observation time only attaches provenance, a differing
//!   value closes the covering interval at the observation time and opens a
//!   new fact bounded by the next known interval start.
//! - A candidate whose observation time predates the open fact's start and
//!   contradicts it is a *late-arriving correction*: the newer ingestion
//!   supersedes the open fact entirely (its interval collapses to zero
//!   length, keeping its provenance and sequence number for the
//!   ingestion-history view) and the corrected value takes the open end.
//! - **Non-functional predicates** insert freely; an identical open
//!   (subject, predicate, object) fact only gains a citation.
//! - Equal observation timestamps with conflicting values resolve by
//!   ingestion order: the later candidate wins, the earlier interval
//!   collapses to zero length. Replaying such a batch re-cites the
//!   zero-length row rather than re-fighting the tie, so replays stay
//!   edit-free.
//!
//! Each group's edits are applied in one atomic store transaction, under a
//! mutex keyed by (subject, predicate) — batches touching disjoint groups
//! run in parallel, there is no global edit lock.

use crate::schema::{PredicateSchema, SchemaViolation};
use crate::store::{GraphEdit, GraphStore, TimeFilter};
use crate::{
    resolver, CandidateFact, CandidateObject, EntityId, EntityType, Fact, FactId, KalpanaError,
    ProvenanceId, Result, SourceRef, Value,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Why one candidate fact was not applied. Skips are per-fact data, never a
/// batch-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    UnknownEntityType {
        tag: String,
    },
    UnknownPredicate {
        predicate: String,
    },
    ConflictingLiteralType {
        predicate: String,
        expected: String,
        got: String,
    },
    /// The batch was cancelled before this candidate's group was applied.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnknownEntityType { tag } => write!(f, "unknown entity type {tag:?}"),
            SkipReason::UnknownPredicate { predicate } => {
                write!(f, "unknown predicate {predicate:?}")
            }
            SkipReason::ConflictingLiteralType {
                predicate,
                expected,
                got,
            } => write!(
                f,
                "object of {predicate:?} must be {expected}, got {got}"
            ),
            SkipReason::Cancelled => write!(f, "batch cancelled before this group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFact {
    /// Position of the candidate in the submitted batch.
    pub index: usize,
    pub reason: SkipReason,
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    /// Candidates applied, including idempotent ones that only attached a
    /// citation.
    pub applied: usize,
    pub skipped: Vec<SkippedFact>,
}

// ---------------------------------------------------------------------------
// Group locking
// ---------------------------------------------------------------------------

type GroupKey = (EntityId, String);

/// Mutual-exclusion scopes keyed by (subject, predicate).
///
/// The lock is held only while one group's candidates are merged and
/// applied; there is no lock spanning a whole batch.
pub(crate) struct GroupLocks {
    // Resolver check-and-create must be atomic per mention, otherwise two
    // concurrent batches could mint two ids for one new name.
    resolve: Mutex<()>,
    groups: Mutex<HashMap<GroupKey, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    pub(crate) fn new() -> Self {
        Self {
            resolve: Mutex::new(()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn for_group(&self, key: &GroupKey) -> Result<Arc<Mutex<()>>> {
        let mut map = self
            .groups
            .lock()
            .map_err(|_| KalpanaError::Internal("group lock table poisoned".into()))?;
        Ok(map.entry(key.clone()).or_default().clone())
    }

    /// Drop the table entry for a group nobody is waiting on, so the table
    /// does not grow by one entry per (subject, predicate) ever ingested.
    fn evict(&self, key: &GroupKey) {
        if let Ok(mut map) = self.groups.lock() {
            // Strong count 1 means the map holds the only reference; any
            // concurrent waiter holds a clone and keeps the entry alive.
            if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                map.remove(key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Batch ingestion
// ---------------------------------------------------------------------------

struct ResolvedCandidate {
    index: usize,
    functional: bool,
    subject: EntityId,
    predicate: String,
    object: Value,
    observed_at: DateTime<Utc>,
    source: SourceRef,
}

pub(crate) fn ingest_batch<S: GraphStore>(
    store: &S,
    schema: &PredicateSchema,
    locks: &GroupLocks,
    batch: Vec<CandidateFact>,
    cancel: Option<&AtomicBool>,
) -> Result<IngestReport> {
    let mut skipped = Vec::new();

    // Step 1/2: resolve mentions and group by (subject, predicate),
    // preserving first-appearance order. Alias registrations are written
    // through the store here, so later candidates in this batch see them.
    let mut order: Vec<GroupKey> = Vec::new();
    let mut groups: HashMap<GroupKey, Vec<ResolvedCandidate>> = HashMap::new();

    for (index, cand) in batch.into_iter().enumerate() {
        let spec = match schema.check(&cand.predicate, &cand.object) {
            Ok(spec) => *spec,
            Err(violation) => {
                let reason = match violation {
                    SchemaViolation::UnknownPredicate => SkipReason::UnknownPredicate {
                        predicate: cand.predicate.clone(),
                    },
                    SchemaViolation::ObjectMismatch { expected, got } => {
                        SkipReason::ConflictingLiteralType {
                            predicate: cand.predicate.clone(),
                            expected,
                            got,
                        }
                    }
                };
                warn!(index, %reason, "skipping candidate fact");
                skipped.push(SkippedFact { index, reason });
                continue;
            }
        };

        let Some(subject_ty) = EntityType::from_tag(&cand.subject.type_tag) else {
            let reason = SkipReason::UnknownEntityType {
                tag: cand.subject.type_tag.clone(),
            };
            warn!(index, %reason, "skipping candidate fact");
            skipped.push(SkippedFact { index, reason });
            continue;
        };

        let object = match &cand.object {
            CandidateObject::Literal(value) => value.clone(),
            CandidateObject::Entity(mention) => {
                let Some(object_ty) = EntityType::from_tag(&mention.type_tag) else {
                    let reason = SkipReason::UnknownEntityType {
                        tag: mention.type_tag.clone(),
                    };
                    warn!(index, %reason, "skipping candidate fact");
                    skipped.push(SkippedFact { index, reason });
                    continue;
                };
                let _resolving = locks
                    .resolve
                    .lock()
                    .map_err(|_| KalpanaError::Internal("resolver lock poisoned".into()))?;
                Value::Entity(resolver::resolve(store, object_ty, mention)?)
            }
        };

        let subject = {
            let _resolving = locks
                .resolve
                .lock()
                .map_err(|_| KalpanaError::Internal("resolver lock poisoned".into()))?;
            resolver::resolve(store, subject_ty, &cand.subject)?
        };

        let observed_at = cand.effective_at();
        let key = (subject.clone(), cand.predicate.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(ResolvedCandidate {
            index,
            functional: spec.functional,
            subject,
            predicate: cand.predicate,
            object,
            observed_at,
            source: cand.provenance,
        });
    }

    // Steps 3-5, one group at a time under the group's lock. Cancellation
    // is honoured only between groups: applied groups stay committed,
    // remaining candidates are reported as skipped.
    let mut applied = 0;
    let mut cancelled = false;
    for key in &order {
        let candidates = groups.remove(key).unwrap_or_default();

        if cancelled || cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            cancelled = true;
            for cand in &candidates {
                skipped.push(SkippedFact {
                    index: cand.index,
                    reason: SkipReason::Cancelled,
                });
            }
            continue;
        }

        let lock = locks.for_group(key)?;
        let merged = {
            let _guard = lock
                .lock()
                .map_err(|_| KalpanaError::Internal("group lock poisoned".into()))?;
            merge_group(store, key, candidates)
        };
        drop(lock);
        locks.evict(key);
        applied += merged?;
    }

    skipped.sort_by_key(|s| s.index);
    Ok(IngestReport { applied, skipped })
}

// ---------------------------------------------------------------------------
// Per-group merge
// ---------------------------------------------------------------------------

/// Working copy of one fact while a group is merged. Existing facts track
/// what changed so only the delta becomes an edit; new facts are inserted
/// whole.
struct Slot {
    fact: Fact,
    is_new: bool,
    /// Creation order within this group, for sequence number assignment.
    created_rank: usize,
    interval_changed: bool,
    added_provenance: Vec<ProvenanceId>,
}

impl Slot {
    fn existing(fact: Fact) -> Self {
        Self {
            fact,
            is_new: false,
            created_rank: 0,
            interval_changed: false,
            added_provenance: Vec::new(),
        }
    }

    /// Zero-length intervals are superseded history; they take no part in
    /// covering or boundary computations.
    fn is_nonempty(&self) -> bool {
        self.fact.valid_until.is_none_or(|u| u > self.fact.valid_from)
    }
}

fn merge_group<S: GraphStore>(
    store: &S,
    key: &GroupKey,
    mut candidates: Vec<ResolvedCandidate>,
) -> Result<usize> {
    let (subject, predicate) = key;

    let mut timeline: Vec<Slot> = store
        .facts_for_subject(subject, Some(predicate), TimeFilter::All)?
        .into_iter()
        .map(Slot::existing)
        .collect();
    timeline.sort_by_key(|s| s.fact.valid_from);

    // Stable sort: equal observation times keep batch order, so the tie
    // rule (later candidate wins) falls out of plain left-to-right
    // processing.
    candidates.sort_by_key(|c| c.observed_at);

    let mut created = 0usize;
    for cand in &candidates {
        let provenance_id = store.insert_provenance(&cand.source)?;
        if cand.functional {
            merge_functional(&mut timeline, cand, provenance_id, &mut created);
        } else {
            merge_multi(&mut timeline, cand, provenance_id, &mut created);
        }
    }

    // Emit the delta. Interval closures and citations on existing facts
    // first, then the new facts with freshly allocated sequence numbers.
    let mut edits = Vec::new();
    for slot in &timeline {
        if slot.is_new {
            continue;
        }
        if slot.interval_changed {
            edits.push(GraphEdit::CloseInterval {
                subject: subject.clone(),
                predicate: predicate.clone(),
                fact_id: slot.fact.id.clone(),
                at: slot.fact.valid_until.unwrap_or(slot.fact.valid_from),
            });
        }
        for pid in &slot.added_provenance {
            edits.push(GraphEdit::AttachProvenance {
                subject: subject.clone(),
                predicate: predicate.clone(),
                fact_id: slot.fact.id.clone(),
                provenance: pid.clone(),
            });
        }
    }

    let mut new_slots: Vec<&mut Slot> = timeline.iter_mut().filter(|s| s.is_new).collect();
    new_slots.sort_by_key(|s| s.created_rank);
    if !new_slots.is_empty() {
        let mut seq = store.allocate_seq(new_slots.len() as u64)?;
        for slot in new_slots {
            slot.fact.seq = seq;
            seq += 1;
            edits.push(GraphEdit::InsertFact(slot.fact.clone()));
        }
    }

    if !edits.is_empty() {
        store.apply_edits(&edits)?;
    }
    debug!(
        subject = %subject,
        predicate = %predicate,
        candidates = candidates.len(),
        edits = edits.len(),
        "merged group"
    );

    Ok(candidates.len())
}

fn attach(slot: &mut Slot, provenance_id: ProvenanceId) {
    if !slot.fact.provenance.contains(&provenance_id) {
        slot.fact.provenance.push(provenance_id.clone());
        if !slot.is_new {
            slot.added_provenance.push(provenance_id);
        }
    }
}

fn insert_sorted(timeline: &mut Vec<Slot>, slot: Slot) {
    let at = slot.fact.valid_from;
    let pos = timeline.partition_point(|s| s.fact.valid_from <= at);
    timeline.insert(pos, slot);
}

fn new_fact(
    cand: &ResolvedCandidate,
    valid_until: Option<DateTime<Utc>>,
    provenance_id: ProvenanceId,
    created: &mut usize,
) -> Slot {
    let fact = Fact {
        id: FactId::new(),
        subject: cand.subject.clone(),
        predicate: cand.predicate.clone(),
        object: cand.object.clone(),
        valid_from: cand.observed_at,
        valid_until,
        provenance: vec![provenance_id],
        seq: 0, // assigned when the group's edits are emitted
    };
    let rank = *created;
    *created += 1;
    Slot {
        fact,
        is_new: true,
        created_rank: rank,
        interval_changed: false,
        added_provenance: Vec::new(),
    }
}

fn close_slot(slot: &mut Slot, at: DateTime<Utc>) {
    slot.fact.valid_until = Some(at);
    if !slot.is_new {
        slot.interval_changed = true;
    }
}

fn merge_functional(
    timeline: &mut Vec<Slot>,
    cand: &ResolvedCandidate,
    provenance_id: ProvenanceId,
    created: &mut usize,
) {
    let t = cand.observed_at;

    // At most one non-empty interval covers t, by the partition invariant.
    let covering = timeline
        .iter()
        .position(|s| {
            s.is_nonempty() && s.fact.valid_from <= t && s.fact.valid_until.is_none_or(|u| u > t)
        });

    if let Some(i) = covering {
        if timeline[i].fact.object == cand.object {
            // Idempotent re-ingestion: no interval edit, extra citation only.
            attach(&mut timeline[i], provenance_id);
            return;
        }
    }

    // A replayed tie: the identical value asserted at exactly this instant
    // may already sit in a zero-length row that lost an earlier conflict.
    // Cite that row instead of re-fighting the tie, so replaying a batch
    // never grows history or churns the open fact's identity.
    if let Some(i) = timeline
        .iter()
        .position(|s| s.fact.valid_from == t && s.fact.object == cand.object)
    {
        attach(&mut timeline[i], provenance_id);
        return;
    }

    // First boundary after t among non-empty intervals: the new fact may
    // not overlap charted history.
    let next_start = timeline
        .iter()
        .filter(|s| s.is_nonempty() && s.fact.valid_from > t)
        .map(|s| s.fact.valid_from)
        .min();

    let mut valid_until = next_start;

    if covering.is_none() {
        let successor = timeline
            .iter()
            .position(|s| s.is_nonempty() && next_start == Some(s.fact.valid_from));
        if let Some(ni) = successor {
            if timeline[ni].fact.object == cand.object {
                // Same value observed to start earlier than charted: absorb
                // the successor interval instead of leaving two adjacent
                // rows carrying one value. The absorbed row keeps its seq
                // and provenance in the history view; its citations carry
                // over to the merged row.
                let successor_from = timeline[ni].fact.valid_from;
                let inherited_until = timeline[ni].fact.valid_until;
                let inherited = timeline[ni].fact.provenance.clone();
                close_slot(&mut timeline[ni], successor_from);
                let mut slot = new_fact(cand, inherited_until, provenance_id, created);
                for pid in inherited {
                    if !slot.fact.provenance.contains(&pid) {
                        slot.fact.provenance.push(pid);
                    }
                }
                insert_sorted(timeline, slot);
                return;
            }
            if timeline[ni].fact.is_open() {
                // Late-arriving correction: nothing charted covers t, and
                // the next fact after t is the open one contradicting this
                // candidate. The candidate carries newer knowledge about an
                // earlier start, so the open fact is superseded wholesale —
                // its interval collapses to zero length, keeping its
                // provenance and seq for the history view.
                let open_from = timeline[ni].fact.valid_from;
                close_slot(&mut timeline[ni], open_from);
                valid_until = None;
            }
        }
    }

    if let Some(i) = covering {
        close_slot(&mut timeline[i], t);
    }

    insert_sorted(timeline, new_fact(cand, valid_until, provenance_id, created));
}

fn merge_multi(
    timeline: &mut Vec<Slot>,
    cand: &ResolvedCandidate,
    provenance_id: ProvenanceId,
    created: &mut usize,
) {
    let identical_open = timeline
        .iter()
        .position(|s| s.fact.is_open() && s.fact.object == cand.object);
    match identical_open {
        Some(i) => attach(&mut timeline[i], provenance_id),
        None => insert_sorted(timeline, new_fact(cand, None, provenance_id, created)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryOutcome;
    use crate::store::RedbStore;
    use crate::{CandidateFact, Mention, TemporalKg, Value};
    use chrono::{DateTime, Utc};

    fn kg() -> TemporalKg<RedbStore> {
        TemporalKg::open_in_memory().unwrap()
    }

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn mission(name: &str) -> Mention {
        Mention::new(name, "Mission")
    }

    fn literal_fact(
        subject: &str,
        predicate: &str,
        object: Value,
        source: &str,
        observed: Option<&str>,
    ) -> CandidateFact {
        CandidateFact {
            subject: mission(subject),
            predicate: predicate.to_string(),
            object: CandidateObject::Literal(object),
            provenance: SourceRef::new(source, dt("2024-01-15T00:00:00Z")),
            observed_at: observed.map(dt),
        }
    }

    fn doc_fact(subject: &str, doc: &str, source: &str) -> CandidateFact {
        CandidateFact {
            subject: mission(subject),
            predicate: "has_document".to_string(),
            object: CandidateObject::Entity(Mention::new(doc, "Document")),
            provenance: SourceRef::new(source, dt("2024-01-15T00:00:00Z")),
            observed_at: None,
        }
    }

    fn current_facts(kg: &TemporalKg<RedbStore>, subject: &str, predicate: &str) -> Vec<Fact> {
        match kg.lookup(subject, "Mission", Some(predicate), None).unwrap() {
            QueryOutcome::Facts(facts) => facts.into_iter().map(|f| f.fact).collect(),
            QueryOutcome::EntityNotFound => panic!("subject {subject} should resolve"),
        }
    }

    fn facts_at(
        kg: &TemporalKg<RedbStore>,
        subject: &str,
        predicate: &str,
        at: &str,
    ) -> Vec<Fact> {
        match kg
            .lookup(subject, "Mission", Some(predicate), Some(dt(at)))
            .unwrap()
        {
            QueryOutcome::Facts(facts) => facts.into_iter().map(|f| f.fact).collect(),
            QueryOutcome::EntityNotFound => panic!("subject {subject} should resolve"),
        }
    }

    /// Every functional group must hold non-overlapping intervals.
    fn assert_partition_invariant(kg: &TemporalKg<RedbStore>, subject: &str, predicate: &str) {
        let QueryOutcome::Facts(facts) = kg.history(subject, "Mission", Some(predicate)).unwrap()
        else {
            panic!("subject {subject} should resolve");
        };
        let mut intervals: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = facts
            .iter()
            .map(|f| (f.fact.valid_from, f.fact.valid_until))
            .filter(|(from, until)| until.is_none_or(|u| u > *from))
            .collect();
        intervals.sort_by_key(|(from, _)| *from);
        for pair in intervals.windows(2) {
            let (_, until) = pair[0];
            let (next_from, _) = pair[1];
            let until = until.expect("only the last interval may be open");
            assert!(
                until <= next_from,
                "overlapping intervals for {subject}/{predicate}"
            );
        }
    }

    #[test]
    fn functional_update_closes_previous_interval() {
        let kg = kg();
        kg.ingest_batch(vec![literal_fact(
            "INSAT-3D",
            "mission_status",
            "active".into(),
            "src-a",
            Some("2020-01-01T00:00:00Z"),
        )])
        .unwrap();
        kg.ingest_batch(vec![literal_fact(
            "INSAT-3D",
            "mission_status",
            "decommissioned".into(),
            "src-b",
            Some("2023-01-01T00:00:00Z"),
        )])
        .unwrap();

        let current = current_facts(&kg, "INSAT-3D", "mission_status");
        assert_eq!(current.len(), 1, "one open fact for a functional predicate");
        assert_eq!(current[0].object, Value::from("decommissioned"));

        let in_2021 = facts_at(&kg, "INSAT-3D", "mission_status", "2021-06-01T00:00:00Z");
        assert_eq!(in_2021.len(), 1);
        assert_eq!(in_2021[0].object, Value::from("active"));

        assert_partition_invariant(&kg, "INSAT-3D", "mission_status");
    }

    #[test]
    fn as_of_returns_value_set_at_preceding_update() {
        let kg = kg();
        for (value, at) in [
            ("pre-launch", "2016-01-01T00:00:00Z"),
            ("active", "2016-09-08T00:00:00Z"),
            ("decommissioned", "2024-03-01T00:00:00Z"),
        ] {
            kg.ingest_batch(vec![literal_fact(
                "INSAT-3DR",
                "mission_status",
                value.into(),
                "src",
                Some(at),
            )])
            .unwrap();
        }

        // Anywhere inside [t2, t3) the value is the one set at t2.
        for probe in ["2016-09-08T00:00:00Z", "2019-01-01T00:00:00Z", "2024-02-29T23:59:59Z"] {
            let facts = facts_at(&kg, "INSAT-3DR", "mission_status", probe);
            assert_eq!(facts.len(), 1, "probe {probe}");
            assert_eq!(facts[0].object, Value::from("active"), "probe {probe}");
        }

        let before = facts_at(&kg, "INSAT-3DR", "mission_status", "2015-01-01T00:00:00Z");
        assert!(before.is_empty(), "no known fact before the first update");
        assert_partition_invariant(&kg, "INSAT-3DR", "mission_status");
    }

    #[test]
    fn reingesting_batch_is_idempotent() {
        let kg = kg();
        let batch = vec![
            literal_fact(
                "SCATSAT-1",
                "launched_on",
                Value::Date(dt("2016-09-26T00:00:00Z")),
                "https://mosdac.gov.in/scatsat-1",
                Some("2016-09-26T00:00:00Z"),
            ),
            doc_fact("SCATSAT-1", "SCATSAT-1 Handbook", "https://mosdac.gov.in/scatsat-1"),
        ];

        let first = kg.ingest_batch(batch.clone()).unwrap();
        assert_eq!(first.applied, 2);
        assert!(first.skipped.is_empty());

        let second = kg.ingest_batch(batch).unwrap();
        assert_eq!(second.applied, 2, "replay applies as citation-attach only");

        let launch = current_facts(&kg, "SCATSAT-1", "launched_on");
        assert_eq!(launch.len(), 1, "replay must not duplicate the launch fact");
        // Same source + extraction time dedupes to one provenance record.
        assert_eq!(launch[0].provenance.len(), 1);

        let docs = current_facts(&kg, "SCATSAT-1", "has_document");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn same_value_from_second_source_attaches_citation() {
        let kg = kg();
        kg.ingest_batch(vec![literal_fact(
            "INSAT-3DR",
            "orbit_type",
            "GEO".into(),
            "https://mosdac.gov.in/insat-3dr",
            Some("2016-09-08T00:00:00Z"),
        )])
        .unwrap();
        kg.ingest_batch(vec![literal_fact(
            "INSAT-3DR",
            "orbit_type",
            "GEO".into(),
            "https://mosdac.gov.in/catalog",
            Some("2017-01-01T00:00:00Z"),
        )])
        .unwrap();

        let facts = current_facts(&kg, "INSAT-3DR", "orbit_type");
        assert_eq!(facts.len(), 1, "identical value must not fork the interval");
        assert_eq!(facts[0].provenance.len(), 2, "both sources cited");
    }

    #[test]
    fn non_functional_predicate_allows_concurrent_facts() {
        let kg = kg();
        let report = kg
            .ingest_batch(vec![
                doc_fact("Megha-Tropiques", "MT Data Policy", "src-1"),
                doc_fact("Megha-Tropiques", "MT User Handbook", "src-1"),
                // Identical to the first: citation only.
                doc_fact("Megha-Tropiques", "MT Data Policy", "src-2"),
            ])
            .unwrap();
        assert_eq!(report.applied, 3);

        let docs = current_facts(&kg, "Megha-Tropiques", "has_document");
        assert_eq!(docs.len(), 2, "two distinct documents concurrently valid");
    }

    #[test]
    fn late_arriving_correction_supersedes_open_fact() {
        let kg = kg();
        // Scraped first: launch date 2020-01-01, no explicit effective date,
        // so the fact's interval starts at extraction time.
        kg.ingest_batch(vec![CandidateFact {
            subject: mission("SatX"),
            predicate: "launched_on".into(),
            object: CandidateObject::Literal(Value::Date(dt("2020-01-01T00:00:00Z"))),
            provenance: SourceRef::new("https://example.org/old-page", dt("2024-01-01T00:00:00Z")),
            observed_at: None,
        }])
        .unwrap();
        // Later scrape corrects the launch date, effective from the true
        // launch itself.
        kg.ingest_batch(vec![CandidateFact {
            subject: mission("SatX"),
            predicate: "launched_on".into(),
            object: CandidateObject::Literal(Value::Date(dt("2019-06-01T00:00:00Z"))),
            provenance: SourceRef::new("https://example.org/new-page", dt("2024-06-01T00:00:00Z")),
            observed_at: Some(dt("2019-06-01T00:00:00Z")),
        }])
        .unwrap();

        // The corrected value holds for every as-of at or after the true
        // effective time, and is the current value.
        for probe in ["2019-06-01T00:00:00Z", "2024-01-02T00:00:00Z", "2025-01-01T00:00:00Z"] {
            let facts = facts_at(&kg, "SatX", "launched_on", probe);
            assert_eq!(facts.len(), 1, "probe {probe}");
            assert_eq!(
                facts[0].object,
                Value::Date(dt("2019-06-01T00:00:00Z")),
                "probe {probe}"
            );
        }
        let current = current_facts(&kg, "SatX", "launched_on");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].object, Value::Date(dt("2019-06-01T00:00:00Z")));

        // The superseded fact stays in the ingestion-history view with its
        // original provenance and a lower sequence number.
        let QueryOutcome::Facts(history) =
            kg.history("SatX", "Mission", Some("launched_on")).unwrap()
        else {
            panic!("SatX should resolve");
        };
        assert_eq!(history.len(), 2);
        let superseded = history
            .iter()
            .find(|f| f.fact.object == Value::Date(dt("2020-01-01T00:00:00Z")))
            .expect("original fact preserved");
        let corrected = history
            .iter()
            .find(|f| f.fact.object == Value::Date(dt("2019-06-01T00:00:00Z")))
            .unwrap();
        assert!(superseded.fact.seq < corrected.fact.seq, "learned-late ordering");
        assert_eq!(superseded.provenance.len(), 1);
        assert_eq!(superseded.provenance[0].source, "https://example.org/old-page");

        assert_partition_invariant(&kg, "SatX", "launched_on");
    }

    #[test]
    fn late_fact_inside_charted_history_repartitions() {
        let kg = kg();
        // Charted: active from 2020, decommissioned from 2024.
        kg.ingest_batch(vec![
            literal_fact(
                "Oceansat-2",
                "mission_status",
                "active".into(),
                "src-a",
                Some("2020-01-01T00:00:00Z"),
            ),
            literal_fact(
                "Oceansat-2",
                "mission_status",
                "decommissioned".into(),
                "src-a",
                Some("2024-01-01T00:00:00Z"),
            ),
        ])
        .unwrap();
        // Learned late: it was in safe mode from mid-2022.
        kg.ingest_batch(vec![literal_fact(
            "Oceansat-2",
            "mission_status",
            "safe mode".into(),
            "src-b",
            Some("2022-07-01T00:00:00Z"),
        )])
        .unwrap();

        let active = facts_at(&kg, "Oceansat-2", "mission_status", "2021-01-01T00:00:00Z");
        assert_eq!(active[0].object, Value::from("active"));

        let safe = facts_at(&kg, "Oceansat-2", "mission_status", "2023-01-01T00:00:00Z");
        assert_eq!(safe[0].object, Value::from("safe mode"));

        // The later charted boundary is untouched by the correction.
        let decom = facts_at(&kg, "Oceansat-2", "mission_status", "2024-06-01T00:00:00Z");
        assert_eq!(decom[0].object, Value::from("decommissioned"));

        assert_partition_invariant(&kg, "Oceansat-2", "mission_status");
    }

    #[test]
    fn equal_observation_times_resolve_by_ingestion_order() {
        let kg = kg();
        let batch = vec![
            literal_fact(
                "Cartosat-3",
                "orbit_type",
                "LEO".into(),
                "src-a",
                Some("2019-11-27T00:00:00Z"),
            ),
            literal_fact(
                "Cartosat-3",
                "orbit_type",
                "SSO".into(),
                "src-b",
                Some("2019-11-27T00:00:00Z"),
            ),
        ];
        let report = kg.ingest_batch(batch.clone()).unwrap();
        assert_eq!(report.applied, 2);

        let current = current_facts(&kg, "Cartosat-3", "orbit_type");
        assert_eq!(current.len(), 1, "tie leaves exactly one open fact");
        assert_eq!(current[0].object, Value::from("SSO"), "later candidate wins");
        let open_id = current[0].id.clone();

        // Replaying the batch must not re-fight the tie: the losing value
        // re-cites its zero-length row, the winner re-cites the open fact.
        let replay = kg.ingest_batch(batch).unwrap();
        assert_eq!(replay.applied, 2);

        let QueryOutcome::Facts(history) = kg
            .history("Cartosat-3", "Mission", Some("orbit_type"))
            .unwrap()
        else {
            panic!("Cartosat-3 should resolve");
        };
        assert_eq!(history.len(), 2, "replay must not grow history");
        let current = current_facts(&kg, "Cartosat-3", "orbit_type");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, open_id, "open fact keeps its identity");
        assert_partition_invariant(&kg, "Cartosat-3", "orbit_type");
    }

    #[test]
    fn earlier_observation_of_same_value_merges_into_one_interval() {
        let kg = kg();
        // First scrape charts the orbit from page-discovery time.
        kg.ingest_batch(vec![literal_fact(
            "EOS-06",
            "orbit_type",
            "SSO".into(),
            "src-a",
            Some("2023-01-01T00:00:00Z"),
        )])
        .unwrap();
        // A second source dates the same value from the actual launch.
        kg.ingest_batch(vec![literal_fact(
            "EOS-06",
            "orbit_type",
            "SSO".into(),
            "src-b",
            Some("2022-11-26T00:00:00Z"),
        )])
        .unwrap();

        let current = current_facts(&kg, "EOS-06", "orbit_type");
        assert_eq!(current.len(), 1, "one interval, not two adjacent ones");
        assert_eq!(current[0].valid_from, dt("2022-11-26T00:00:00Z"));
        assert_eq!(current[0].provenance.len(), 2, "both sources cited");

        let between = facts_at(&kg, "EOS-06", "orbit_type", "2022-12-15T00:00:00Z");
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].object, Value::from("SSO"));

        // Replaying the earlier observation is a pure citation attach.
        kg.ingest_batch(vec![literal_fact(
            "EOS-06",
            "orbit_type",
            "SSO".into(),
            "src-b",
            Some("2022-11-26T00:00:00Z"),
        )])
        .unwrap();
        let QueryOutcome::Facts(history) =
            kg.history("EOS-06", "Mission", Some("orbit_type")).unwrap()
        else {
            panic!("EOS-06 should resolve");
        };
        assert_eq!(history.len(), 2, "absorbed row plus the merged one");
        assert_partition_invariant(&kg, "EOS-06", "orbit_type");
    }

    #[test]
    fn invalid_candidates_are_skipped_without_aborting_batch() {
        let kg = kg();
        let report = kg
            .ingest_batch(vec![
                // 0: bad entity type tag
                CandidateFact {
                    subject: Mention::new("Something", "Spacecraft Part"),
                    predicate: "orbit_type".into(),
                    object: CandidateObject::Literal("GEO".into()),
                    provenance: SourceRef::new("src", dt("2024-01-01T00:00:00Z")),
                    observed_at: None,
                },
                // 1: unknown predicate
                literal_fact("INSAT-3D", "painted_in", "white".into(), "src", None),
                // 2: literal type mismatch (launched_on wants a Date)
                literal_fact("INSAT-3D", "launched_on", "yesterday".into(), "src", None),
                // 3: fine
                literal_fact("INSAT-3D", "orbit_type", "GEO".into(), "src", None),
            ])
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 3);
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::UnknownEntityType { .. }
        ));
        assert!(matches!(
            report.skipped[1].reason,
            SkipReason::UnknownPredicate { .. }
        ));
        assert!(matches!(
            report.skipped[2].reason,
            SkipReason::ConflictingLiteralType { .. }
        ));
        assert_eq!(report.skipped[2].index, 2);

        let facts = current_facts(&kg, "INSAT-3D", "orbit_type");
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn cancelled_batch_reports_unprocessed_groups_as_skipped() {
        let kg = kg();
        let cancel = AtomicBool::new(true);
        let report = kg
            .ingest_batch_cancellable(
                vec![
                    literal_fact("INSAT-3D", "orbit_type", "GEO".into(), "src", None),
                    doc_fact("INSAT-3D", "Handbook", "src"),
                ],
                &cancel,
            )
            .unwrap();

        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped.len(), 2);
        assert!(report
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::Cancelled));
    }

    #[test]
    fn uncancelled_token_applies_normally() {
        let kg = kg();
        let cancel = AtomicBool::new(false);
        let report = kg
            .ingest_batch_cancellable(
                vec![literal_fact("INSAT-3D", "orbit_type", "GEO".into(), "src", None)],
                &cancel,
            )
            .unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn concurrent_batches_on_disjoint_groups_all_apply() {
        let kg = kg();
        std::thread::scope(|scope| {
            for i in 0..4 {
                let kg = &kg;
                scope.spawn(move || {
                    let subject = format!("Sat-{i}");
                    let report = kg
                        .ingest_batch(vec![
                            literal_fact(
                                &subject,
                                "orbit_type",
                                "LEO".into(),
                                "src",
                                Some("2020-01-01T00:00:00Z"),
                            ),
                            literal_fact(
                                &subject,
                                "mission_status",
                                "active".into(),
                                "src",
                                Some("2020-01-01T00:00:00Z"),
                            ),
                        ])
                        .unwrap();
                    assert_eq!(report.applied, 2);
                });
            }
        });

        for i in 0..4 {
            let subject = format!("Sat-{i}");
            assert_eq!(current_facts(&kg, &subject, "orbit_type").len(), 1);
            assert_eq!(current_facts(&kg, &subject, "mission_status").len(), 1);
            assert_partition_invariant(&kg, &subject, "orbit_type");
        }
    }

    #[test]
    fn subject_variants_merge_into_one_entity_history() {
        let kg = kg();
        kg.ingest_batch(vec![literal_fact(
            "INSAT 3D-R",
            "orbit_type",
            "GEO".into(),
            "src-a",
            Some("2016-09-08T00:00:00Z"),
        )])
        .unwrap();
        kg.ingest_batch(vec![literal_fact(
            "insat3dr",
            "orbit_type",
            "GEO".into(),
            "src-b",
            Some("2017-01-01T00:00:00Z"),
        )])
        .unwrap();

        // Both spellings hit the same (subject, predicate) history.
        let facts = current_facts(&kg, "INSAT-3DR", "orbit_type");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].provenance.len(), 2);
    }

    #[test]
    fn group_lock_table_empties_between_batches() {
        let kg = kg();
        kg.ingest_batch(vec![
            literal_fact("INSAT-3D", "orbit_type", "GEO".into(), "src", None),
            doc_fact("INSAT-3D", "Handbook", "src"),
        ])
        .unwrap();
        // Idle entries are evicted once their group applies, so the table
        // does not grow with every (subject, predicate) ever seen.
        assert!(kg.locks.groups.lock().unwrap().is_empty());
    }

    #[test]
    fn contended_group_lock_entry_survives_eviction() {
        let locks = GroupLocks::new();
        let key = (EntityId::new(), "orbit_type".to_string());

        let held = locks.for_group(&key).unwrap();
        locks.evict(&key);
        assert_eq!(
            locks.groups.lock().unwrap().len(),
            1,
            "a live handle keeps the entry"
        );

        drop(held);
        locks.evict(&key);
        assert!(locks.groups.lock().unwrap().is_empty());
    }
}
