//! High-level mission knowledge base API built on Kalpana.
//!
//! Wraps the temporal knowledge graph engine with an answer-oriented
//! surface: every query result comes back with a ready-to-cite
//! [`CitationBundle`], so an assistant never has to invent sources.
//!
//! # Usage
//!
//! ```rust,no_run
//! use kalpana_knowledge::KnowledgeBase;
//! use kalpana::{CandidateFact, CandidateObject, Mention, SourceRef, Value};
//! use chrono::Utc;
//!
//! let kb = KnowledgeBase::open("./missions.kalpana").unwrap();
//!
//! let launch: chrono::DateTime<chrono::Utc> = "2016-09-08T00:00:00Z".parse().unwrap();
//! kb.ingest(vec![CandidateFact {
//!     subject: Mention::new("INSAT-3DR", "Mission"),
//!     predicate: "launched_on".into(),
//!     object: CandidateObject::Literal(Value::Date(launch)),
//!     provenance: SourceRef::new("https://mosdac.gov.in/insat-3dr", Utc::now()),
//!     observed_at: Some(launch),
//! }]).unwrap();
//!
//! // "When was INSAT-3DR launched?" — answer plus citations.
//! let answer = kb.ask("INSAT-3DR", "Mission", Some("launched_on"), None).unwrap();
//! ```

use chrono::{DateTime, Utc};
use kalpana::{
    build_bundle, CandidateFact, CitationBundle, Entity, FactWithProvenance, Hop, IngestReport,
    PredicateSpec, QueryOutcome, RedbStore, TemporalKg, TraversalOutcome,
};
use std::sync::atomic::AtomicBool;

pub use kalpana::KalpanaError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// A citable answer: the facts that hold, plus the deduplicated sources
/// backing them.
#[derive(Debug, Clone)]
pub struct Answer {
    pub facts: Vec<FactWithProvenance>,
    pub citations: CitationBundle,
}

impl Answer {
    fn from_facts(facts: Vec<FactWithProvenance>) -> Self {
        let citations = build_bundle(&facts);
        Self { facts, citations }
    }
}

/// Mission knowledge base over an embedded temporal graph.
///
/// The primary entry point for QA-bot integrations. It wraps
/// [`TemporalKg`] with an API shaped around answering questions about
/// satellite missions, instruments, products, and documents.
pub struct KnowledgeBase {
    kg: TemporalKg<RedbStore>,
}

impl KnowledgeBase {
    /// Open or create a knowledge base at the given path.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            kg: TemporalKg::open(path)?,
        })
    }

    /// In-memory knowledge base; data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            kg: TemporalKg::open_in_memory()?,
        })
    }

    /// Ingest a batch of extracted candidate facts. Per-fact problems are
    /// reported in the result, not raised.
    pub fn ingest(&self, batch: Vec<CandidateFact>) -> Result<IngestReport> {
        self.kg.ingest_batch(batch)
    }

    /// Like [`ingest`], honouring a cancellation token between
    /// (subject, predicate) groups.
    ///
    /// [`ingest`]: KnowledgeBase::ingest
    pub fn ingest_cancellable(
        &self,
        batch: Vec<CandidateFact>,
        cancel: &AtomicBool,
    ) -> Result<IngestReport> {
        self.kg.ingest_batch_cancellable(batch, cancel)
    }

    /// Answer a question about a subject: current state when `as_of` is
    /// `None`, the state at that instant otherwise. Returns `None` when the
    /// subject never resolved to a known entity.
    pub fn ask(
        &self,
        subject: &str,
        type_tag: &str,
        predicate: Option<&str>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<Answer>> {
        match self.kg.lookup(subject, type_tag, predicate, as_of)? {
            QueryOutcome::EntityNotFound => Ok(None),
            QueryOutcome::Facts(facts) => Ok(Some(Answer::from_facts(facts))),
        }
    }

    /// Full ingestion history for a subject, superseded intervals included.
    pub fn history(
        &self,
        subject: &str,
        type_tag: &str,
        predicate: Option<&str>,
    ) -> Result<Option<Answer>> {
        match self.kg.history(subject, type_tag, predicate)? {
            QueryOutcome::EntityNotFound => Ok(None),
            QueryOutcome::Facts(facts) => Ok(Some(Answer::from_facts(facts))),
        }
    }

    /// Entities reachable from a subject over the given hops, all evaluated
    /// at one pinned instant. Returns `None` when the anchor never resolved.
    pub fn related(
        &self,
        subject: &str,
        type_tag: &str,
        hops: &[Hop],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<Vec<Entity>>> {
        match self.kg.related(subject, type_tag, hops, as_of)? {
            TraversalOutcome::EntityNotFound => Ok(None),
            TraversalOutcome::Entities(entities) => Ok(Some(entities)),
        }
    }

    /// Every surface form a subject has been seen under.
    pub fn aliases_of(&self, subject: &str, type_tag: &str) -> Result<Option<Vec<String>>> {
        self.kg.aliases_of(subject, type_tag)
    }

    /// Extend the predicate vocabulary. Names are limited to `[a-zA-Z0-9_]+`.
    pub fn register_predicate(&mut self, name: impl Into<String>, spec: PredicateSpec) -> Result<()> {
        self.kg.register_predicate(name, spec)
    }

    /// The declared predicate names, sorted.
    pub fn predicates(&self) -> Vec<String> {
        self.kg
            .schema()
            .predicate_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Direct access to the underlying engine for advanced callers.
    pub fn engine(&self) -> &TemporalKg<RedbStore> {
        &self.kg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kalpana::{CandidateObject, Mention, SourceRef, Value};

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn kb_with_insat() -> KnowledgeBase {
        let kb = KnowledgeBase::open_in_memory().unwrap();
        let launch = dt("2016-09-08T00:00:00Z");
        kb.ingest(vec![
            CandidateFact {
                subject: Mention::new("INSAT-3DR", "Mission"),
                predicate: "launched_on".into(),
                object: CandidateObject::Literal(Value::Date(launch)),
                provenance: SourceRef::new("https://mosdac.gov.in/insat-3dr", dt("2024-01-15T00:00:00Z")),
                observed_at: Some(launch),
            },
            CandidateFact {
                subject: Mention::new("INSAT-3DR", "Mission"),
                predicate: "has_instrument".into(),
                object: CandidateObject::Entity(Mention::new("Sounder", "Instrument")),
                provenance: SourceRef::new("https://mosdac.gov.in/insat-3dr", dt("2024-01-15T00:00:00Z")),
                observed_at: Some(launch),
            },
        ])
        .unwrap();
        kb
    }

    #[test]
    fn ask_returns_citable_answer() {
        let kb = kb_with_insat();
        let answer = kb
            .ask("INSAT-3DR", "Mission", Some("launched_on"), None)
            .unwrap()
            .expect("subject is known");

        assert_eq!(answer.facts.len(), 1);
        assert_eq!(answer.citations.facts.len(), 1);
        assert_eq!(answer.citations.sources.len(), 1);
        assert_eq!(
            answer.citations.sources[0].source,
            "https://mosdac.gov.in/insat-3dr"
        );
    }

    #[test]
    fn ask_about_unknown_subject_returns_none() {
        let kb = kb_with_insat();
        let answer = kb.ask("Voyager-1", "Mission", None, None).unwrap();
        assert!(answer.is_none());
    }

    #[test]
    fn citations_share_one_source_across_facts() {
        let kb = kb_with_insat();
        let answer = kb
            .ask("INSAT-3DR", "Mission", None, None)
            .unwrap()
            .expect("subject is known");
        assert_eq!(answer.facts.len(), 2);
        // Both facts came from one scrape of one page.
        assert_eq!(answer.citations.sources.len(), 1);
    }

    #[test]
    fn related_surfaces_instruments() {
        let kb = kb_with_insat();
        let found = kb
            .related(
                "INSAT-3DR",
                "Mission",
                &[Hop::Out("has_instrument".into())],
                None,
            )
            .unwrap()
            .expect("anchor is known");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical_name, "Sounder");
    }

    #[test]
    fn vocabulary_is_extensible() {
        let mut kb = KnowledgeBase::open_in_memory().unwrap();
        assert!(!kb.predicates().contains(&"designed_by".to_string()));
        kb.register_predicate(
            "designed_by",
            PredicateSpec::functional(kalpana::ObjectKind::Entity(
                kalpana::EntityType::Organization,
            )),
        )
        .unwrap();
        assert!(kb.predicates().contains(&"designed_by".to_string()));
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kb.kalpana");
        let path_str = path.to_str().unwrap();

        {
            let kb = KnowledgeBase::open(path_str).unwrap();
            kb.ingest(vec![CandidateFact {
                subject: Mention::new("SCATSAT-1", "Mission"),
                predicate: "orbit_type".into(),
                object: CandidateObject::Literal("SSO".into()),
                provenance: SourceRef::new("https://mosdac.gov.in/scatsat-1", dt("2024-01-15T00:00:00Z")),
                observed_at: None,
            }])
            .unwrap();
        }

        let kb = KnowledgeBase::open(path_str).unwrap();
        let answer = kb
            .ask("SCATSAT-1", "Mission", Some("orbit_type"), None)
            .unwrap()
            .expect("subject survives reopen");
        assert_eq!(answer.facts[0].object_display, "SSO");
    }
}
