//! Closed, versioned predicate schema.
//!
//! The scraped source material is duck-typed; here every predicate is
//! declared up front with its functional flag and object kind, and every
//! candidate fact is validated against that declaration at ingestion time.
//! Violations surface as per-fact skips (`UnknownPredicate`,
//! `ConflictingLiteralType`) rather than silent coercion.

use crate::{CandidateObject, EntityType, KalpanaError, LiteralKind};
use std::collections::HashMap;

/// What a predicate's object position may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A reference to an entity of the given type.
    Entity(EntityType),
    /// A literal of the given kind.
    Literal(LiteralKind),
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Entity(ty) => write!(f, "Entity({ty})"),
            ObjectKind::Literal(kind) => write!(f, "Literal({kind})"),
        }
    }
}

/// Declaration of one predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateSpec {
    /// Functional predicates admit at most one open fact per subject at any
    /// instant (e.g. `launched_on`); non-functional ones admit many
    /// concurrently valid facts (e.g. `has_document`).
    pub functional: bool,
    pub object: ObjectKind,
}

impl PredicateSpec {
    pub fn functional(object: ObjectKind) -> Self {
        Self {
            functional: true,
            object,
        }
    }

    pub fn multi(object: ObjectKind) -> Self {
        Self {
            functional: false,
            object,
        }
    }
}

/// How a candidate's object failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    UnknownPredicate,
    /// Object kind or literal type does not match the declaration.
    ObjectMismatch { expected: String, got: String },
}

/// The predicate vocabulary: name → declaration.
///
/// Extensible at runtime via [`register`]; the version counter bumps on
/// every change so consumers can detect vocabulary drift.
///
/// [`register`]: PredicateSchema::register
#[derive(Debug, Clone)]
pub struct PredicateSchema {
    version: u32,
    predicates: HashMap<String, PredicateSpec>,
}

impl PredicateSchema {
    /// An empty vocabulary.
    pub fn empty() -> Self {
        Self {
            version: 0,
            predicates: HashMap::new(),
        }
    }

    /// The default vocabulary for the satellite mission portal domain.
    pub fn mission_portal() -> Self {
        use EntityType::*;
        use LiteralKind::*;
        use ObjectKind::{Entity, Literal};

        let mut schema = Self::empty();
        schema.declare("launched_on", PredicateSpec::functional(Literal(Date)));
        schema.declare("operated_by", PredicateSpec::functional(Entity(Organization)));
        schema.declare("orbit_type", PredicateSpec::functional(Literal(Text)));
        schema.declare("mission_status", PredicateSpec::functional(Literal(Text)));
        schema.declare("has_instrument", PredicateSpec::multi(Entity(Instrument)));
        schema.declare("has_product", PredicateSpec::multi(Entity(Product)));
        schema.declare("has_document", PredicateSpec::multi(Entity(Document)));
        schema.declare("has_application", PredicateSpec::multi(Literal(Text)));
        schema.declare("describes", PredicateSpec::multi(Entity(Mission)));
        schema.declare("measures", PredicateSpec::multi(Entity(Parameter)));
        schema.declare("answers", PredicateSpec::multi(Literal(Text)));
        schema
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Register or replace a predicate declaration.
    ///
    /// Names are restricted to `[a-zA-Z0-9_]+`: the predicate becomes part
    /// of the store's `subject:predicate:fact_id` composite keys, so a `:`
    /// (or an empty name) would corrupt the key space.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        spec: PredicateSpec,
    ) -> crate::Result<()> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(KalpanaError::InvalidPredicate(name));
        }
        self.declare(name, spec);
        Ok(())
    }

    fn declare(&mut self, name: impl Into<String>, spec: PredicateSpec) {
        self.predicates.insert(name.into(), spec);
        self.version += 1;
    }

    pub fn spec(&self, predicate: &str) -> Option<&PredicateSpec> {
        self.predicates.get(predicate)
    }

    /// All declared predicate names, sorted.
    pub fn predicate_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate a candidate object against a predicate's declaration.
    ///
    /// Entity-valued objects are checked for type-tag agreement here; the
    /// tag itself may still fail to parse later, which is the resolver's
    /// concern, not the schema's.
    pub fn check(
        &self,
        predicate: &str,
        object: &CandidateObject,
    ) -> Result<&PredicateSpec, SchemaViolation> {
        let spec = self
            .predicates
            .get(predicate)
            .ok_or(SchemaViolation::UnknownPredicate)?;

        match (&spec.object, object) {
            (ObjectKind::Entity(want), CandidateObject::Entity(mention)) => {
                match EntityType::from_tag(&mention.type_tag) {
                    // Unparseable tags are reported as UnknownEntityType by
                    // the resolver path, so let them through here.
                    None => Ok(spec),
                    Some(got) if got == *want => Ok(spec),
                    Some(got) => Err(SchemaViolation::ObjectMismatch {
                        expected: ObjectKind::Entity(*want).to_string(),
                        got: ObjectKind::Entity(got).to_string(),
                    }),
                }
            }
            (ObjectKind::Literal(want), CandidateObject::Literal(value)) => {
                match value.literal_kind() {
                    Some(got) if got == *want => Ok(spec),
                    Some(got) => Err(SchemaViolation::ObjectMismatch {
                        expected: ObjectKind::Literal(*want).to_string(),
                        got: ObjectKind::Literal(got).to_string(),
                    }),
                    None => Err(SchemaViolation::ObjectMismatch {
                        expected: ObjectKind::Literal(*want).to_string(),
                        got: "Entity".to_string(),
                    }),
                }
            }
            (expected, CandidateObject::Entity(_)) => Err(SchemaViolation::ObjectMismatch {
                expected: expected.to_string(),
                got: "Entity".to_string(),
            }),
            (expected, CandidateObject::Literal(value)) => Err(SchemaViolation::ObjectMismatch {
                expected: expected.to_string(),
                got: value
                    .literal_kind()
                    .map(|k| ObjectKind::Literal(k).to_string())
                    .unwrap_or_else(|| "Entity".to_string()),
            }),
        }
    }
}
