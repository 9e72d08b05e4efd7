//! Query engine: current-state, as-of, history, and multi-hop reads.
//!
//! Every read resolves the subject name through the same resolver the
//! ingestion path uses (minus its write-through), applies one temporal
//! filter, and hydrates provenance records so answers are citable.
//!
//! Traversals pin their as-of instant once, before the first hop, and
//! reuse it for every subsequent hop. A traversal that consulted "now"
//! per hop could mix two snapshots when an ingestion lands mid-query.

use crate::store::{GraphStore, TimeFilter};
use crate::{
    resolver, Entity, EntityId, EntityType, Fact, KalpanaError, ProvenanceRecord, Result, Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A fact hydrated for answering: full provenance records and a displayable
/// object.
#[derive(Debug, Clone, Serialize)]
pub struct FactWithProvenance {
    pub fact: Fact,
    /// Human-readable object: the entity's canonical name for references,
    /// the rendered value for literals.
    pub object_display: String,
    pub provenance: Vec<ProvenanceRecord>,
}

/// Outcome of a fact lookup. An unresolvable subject is a distinct outcome,
/// not an error, and not the same thing as a subject with no matching facts.
#[derive(Debug, Clone, Serialize)]
pub enum QueryOutcome {
    EntityNotFound,
    Facts(Vec<FactWithProvenance>),
}

/// One traversal step: follow a predicate forward (subject → object) or
/// backward (object → subject).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hop {
    Out(String),
    In(String),
}

/// Outcome of a multi-hop traversal.
#[derive(Debug, Clone, Serialize)]
pub enum TraversalOutcome {
    EntityNotFound,
    Entities(Vec<Entity>),
}

fn resolve_subject<S: GraphStore>(
    store: &S,
    subject: &str,
    type_tag: &str,
) -> Result<Option<Entity>> {
    let Some(ty) = EntityType::from_tag(type_tag) else {
        return Ok(None);
    };
    resolver::find_existing(store, ty, subject)
}

fn hydrate<S: GraphStore>(store: &S, facts: Vec<Fact>) -> Result<Vec<FactWithProvenance>> {
    facts
        .into_iter()
        .map(|fact| {
            let object_display = match &fact.object {
                Value::Entity(id) => match store.entity(id)? {
                    Some(entity) => entity.canonical_name,
                    None => {
                        return Err(KalpanaError::Internal(format!(
                            "fact {} references missing entity {id}",
                            fact.id
                        )))
                    }
                },
                value => value.to_string(),
            };
            let provenance = fact
                .provenance
                .iter()
                .map(|pid| {
                    store.provenance(pid)?.ok_or_else(|| {
                        KalpanaError::Internal(format!(
                            "fact {} cites missing provenance {pid}",
                            fact.id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(FactWithProvenance {
                fact,
                object_display,
                provenance,
            })
        })
        .collect()
}

/// Current-state (`as_of = None`) or point-in-time lookup for a subject,
/// optionally narrowed to one predicate. Facts come back in descending
/// `valid_from` order, newest belief first.
pub fn lookup<S: GraphStore>(
    store: &S,
    subject: &str,
    type_tag: &str,
    predicate: Option<&str>,
    as_of: Option<DateTime<Utc>>,
) -> Result<QueryOutcome> {
    let Some(entity) = resolve_subject(store, subject, type_tag)? else {
        return Ok(QueryOutcome::EntityNotFound);
    };

    let filter = match as_of {
        Some(at) => TimeFilter::AsOf(at),
        None => TimeFilter::Current,
    };
    let mut facts = store.facts_for_subject(&entity.id, predicate, filter)?;
    facts.sort_by(|a, b| b.valid_from.cmp(&a.valid_from));
    Ok(QueryOutcome::Facts(hydrate(store, facts)?))
}

/// The full ingestion-history view: every fact ever recorded for the
/// subject, closed and superseded intervals included, in ingestion order.
pub fn history<S: GraphStore>(
    store: &S,
    subject: &str,
    type_tag: &str,
    predicate: Option<&str>,
) -> Result<QueryOutcome> {
    let Some(entity) = resolve_subject(store, subject, type_tag)? else {
        return Ok(QueryOutcome::EntityNotFound);
    };

    let mut facts = store.facts_for_subject(&entity.id, predicate, TimeFilter::All)?;
    facts.sort_by_key(|f| f.seq);
    Ok(QueryOutcome::Facts(hydrate(store, facts)?))
}

/// Multi-hop traversal from an anchor entity.
///
/// The as-of instant defaults to now and is pinned before the first hop;
/// every hop filters facts against that single instant. Results are the
/// distinct entities reachable after the final hop, in discovery order.
pub fn related<S: GraphStore>(
    store: &S,
    subject: &str,
    type_tag: &str,
    hops: &[Hop],
    as_of: Option<DateTime<Utc>>,
) -> Result<TraversalOutcome> {
    let Some(anchor) = resolve_subject(store, subject, type_tag)? else {
        return Ok(TraversalOutcome::EntityNotFound);
    };

    let at = as_of.unwrap_or_else(Utc::now);
    let filter = TimeFilter::AsOf(at);

    let mut frontier: Vec<EntityId> = vec![anchor.id];
    for hop in hops {
        let mut next: Vec<EntityId> = Vec::new();
        let mut seen: HashSet<EntityId> = HashSet::new();
        for id in &frontier {
            match hop {
                Hop::Out(predicate) => {
                    for fact in store.facts_for_subject(id, Some(predicate), filter)? {
                        // Literal-valued facts have no entity to hop to.
                        if let Value::Entity(object) = fact.object {
                            if seen.insert(object.clone()) {
                                next.push(object);
                            }
                        }
                    }
                }
                Hop::In(predicate) => {
                    for fact in store.facts_for_object(id, Some(predicate), filter)? {
                        if seen.insert(fact.subject.clone()) {
                            next.push(fact.subject);
                        }
                    }
                }
            }
        }
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }

    let entities = frontier
        .into_iter()
        .map(|id| {
            store.entity(&id)?.ok_or_else(|| {
                KalpanaError::Internal(format!("traversal reached missing entity {id}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TraversalOutcome::Entities(entities))
}
