//! Citation builder: turns hydrated query answers into a compact,
//! source-deduplicated bundle an assistant can cite verbatim.
//!
//! Pure transformation over [`FactWithProvenance`] values; no store access.

use crate::query::FactWithProvenance;
use crate::ProvenanceId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One distinct source cited by the answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCitation {
    pub source: String,
    pub extracted_at: DateTime<Utc>,
    pub confidence: f32,
}

/// One answered fact, pointing into the bundle's source list by index.
#[derive(Debug, Clone, Serialize)]
pub struct FactCitation {
    /// Displayable object value (entity name or rendered literal).
    pub statement: String,
    pub predicate: String,
    pub valid_from: DateTime<Utc>,
    /// `None` while the fact is currently believed true.
    pub valid_until: Option<DateTime<Utc>>,
    /// Indexes into [`CitationBundle::sources`].
    pub sources: Vec<usize>,
}

/// A set of fact statements plus the deduplicated sources backing them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CitationBundle {
    pub sources: Vec<SourceCitation>,
    pub facts: Vec<FactCitation>,
}

impl CitationBundle {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// Build a citation bundle from hydrated facts. Sources are deduplicated by
/// provenance id and listed in first-appearance order; a source shared by
/// several facts appears once and is referenced by index from each.
pub fn build_bundle(facts: &[FactWithProvenance]) -> CitationBundle {
    let mut bundle = CitationBundle::default();
    let mut seen: Vec<ProvenanceId> = Vec::new();

    for item in facts {
        let mut sources = Vec::with_capacity(item.provenance.len());
        for record in &item.provenance {
            let index = match seen.iter().position(|id| id == &record.id) {
                Some(index) => index,
                None => {
                    seen.push(record.id.clone());
                    bundle.sources.push(SourceCitation {
                        source: record.source.clone(),
                        extracted_at: record.extracted_at,
                        confidence: record.confidence,
                    });
                    bundle.sources.len() - 1
                }
            };
            sources.push(index);
        }
        bundle.facts.push(FactCitation {
            statement: item.object_display.clone(),
            predicate: item.fact.predicate.clone(),
            valid_from: item.fact.valid_from,
            valid_until: item.fact.valid_until,
            sources,
        });
    }

    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fact, FactId, EntityId, ProvenanceRecord, Value};
    use chrono::Utc;

    fn record(source: &str) -> ProvenanceRecord {
        ProvenanceRecord {
            id: ProvenanceId::new(),
            source: source.to_string(),
            extracted_at: Utc::now(),
            confidence: 1.0,
        }
    }

    fn hydrated(predicate: &str, display: &str, provenance: Vec<ProvenanceRecord>) -> FactWithProvenance {
        FactWithProvenance {
            fact: Fact {
                id: FactId::new(),
                subject: EntityId::new(),
                predicate: predicate.to_string(),
                object: Value::from(display),
                valid_from: Utc::now(),
                valid_until: None,
                provenance: provenance.iter().map(|r| r.id.clone()).collect(),
                seq: 1,
            },
            object_display: display.to_string(),
            provenance,
        }
    }

    #[test]
    fn empty_input_yields_empty_bundle() {
        let bundle = build_bundle(&[]);
        assert!(bundle.is_empty());
        assert!(bundle.sources.is_empty());
    }

    #[test]
    fn shared_source_is_listed_once() {
        let shared = record("https://mosdac.gov.in/insat-3dr");
        let facts = vec![
            hydrated("orbit_type", "GEO", vec![shared.clone()]),
            hydrated("mission_status", "active", vec![shared.clone()]),
        ];

        let bundle = build_bundle(&facts);
        assert_eq!(bundle.sources.len(), 1);
        assert_eq!(bundle.facts.len(), 2);
        assert_eq!(bundle.facts[0].sources, vec![0]);
        assert_eq!(bundle.facts[1].sources, vec![0]);
    }

    #[test]
    fn fact_with_two_sources_references_both() {
        let a = record("https://mosdac.gov.in/insat-3dr");
        let b = record("https://mosdac.gov.in/catalog");
        let facts = vec![hydrated("orbit_type", "GEO", vec![a, b])];

        let bundle = build_bundle(&facts);
        assert_eq!(bundle.sources.len(), 2);
        assert_eq!(bundle.facts[0].sources, vec![0, 1]);
        assert_eq!(bundle.sources[0].source, "https://mosdac.gov.in/insat-3dr");
        assert_eq!(bundle.sources[1].source, "https://mosdac.gov.in/catalog");
    }

    #[test]
    fn statement_carries_interval_bounds() {
        let facts = vec![hydrated("mission_status", "active", vec![record("src")])];
        let bundle = build_bundle(&facts);
        assert_eq!(bundle.facts[0].statement, "active");
        assert_eq!(bundle.facts[0].predicate, "mission_status");
        assert!(bundle.facts[0].valid_until.is_none());
    }
}
