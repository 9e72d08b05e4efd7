//! Entity resolver: maps raw mentions to stable entity identities.
//!
//! Matching policy, in priority order: exact canonical-name or alias match,
//! then normalized-string match (case/diacritic/punctuation-insensitive).
//! All lookups are scoped within the mention's type tag, so ties across
//! types cannot occur. A miss creates a new entity and registers the raw
//! mention (plus any alias hints) as aliases.
//!
//! Alias-table mutations are written through the store immediately, so a
//! later candidate in the same ingestion batch sees aliases registered by
//! an earlier one — there are no stale reads within a batch, and no hidden
//! process-wide singleton: all resolver state lives in the [`GraphStore`].

use crate::store::GraphStore;
use crate::{Entity, EntityId, EntityType, Mention, Result};

/// Normalize a surface form for fuzzy matching: lowercase, fold Latin
/// diacritics, drop everything that is not alphanumeric.
///
/// "INSAT 3D-R", "INSAT-3DR" and "insat3dr" all normalize to "insat3dr".
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        for lc in fold_diacritic(c).to_lowercase() {
            if lc.is_alphanumeric() {
                out.push(lc);
            }
        }
    }
    out
}

// Latin-1 fold only. The portal's content is English-language; anything
// outside this table passes through unchanged and still matches itself.
fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'a',
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => 'u',
        'ç' | 'Ç' => 'c',
        'ñ' | 'Ñ' => 'n',
        _ => c,
    }
}

/// Look up an existing entity by name without mutating anything.
///
/// Used on the query path, where resolution must be side-effect free.
pub fn find_existing<S: GraphStore>(
    store: &S,
    entity_type: EntityType,
    name: &str,
) -> Result<Option<Entity>> {
    let raw = name.trim();
    // Canonical names and aliases share the raw-name index; the priority
    // between them only matters on collision, which type scoping rules out.
    if let Some(entity) = store.entity_by_name(entity_type, raw)? {
        return Ok(Some(entity));
    }
    store.entity_by_norm(entity_type, &normalize(raw))
}

/// Resolve a mention to an entity id, creating the entity if no confident
/// match exists. Registers the raw mention and any alias hints as aliases
/// on whichever entity is returned.
///
/// The caller has already parsed the type tag; an unparseable tag never
/// reaches this function.
pub fn resolve<S: GraphStore>(
    store: &S,
    entity_type: EntityType,
    mention: &Mention,
) -> Result<EntityId> {
    let raw = mention.name.trim();

    if let Some(mut entity) = find_existing(store, entity_type, raw)? {
        if register_aliases(&mut entity, raw, &mention.alias_hints) {
            store.upsert_entity(&entity)?;
        }
        return Ok(entity.id);
    }

    let mut entity = Entity {
        id: EntityId::new(),
        canonical_name: raw.to_string(),
        entity_type,
        aliases: vec![raw.to_string()],
    };
    register_aliases(&mut entity, raw, &mention.alias_hints);
    store.upsert_entity(&entity)?;
    Ok(entity.id)
}

/// Add new surface forms to an entity's alias list. Returns true if the
/// entity changed and needs to be written back.
fn register_aliases(entity: &mut Entity, raw: &str, hints: &[String]) -> bool {
    let mut changed = false;
    let mut push = |name: &str| {
        let name = name.trim();
        if !name.is_empty() && !entity.aliases.iter().any(|a| a == name) {
            entity.aliases.push(name.to_string());
            changed = true;
        }
    };
    push(raw);
    for hint in hints {
        push(hint);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RedbStore;

    fn store() -> RedbStore {
        RedbStore::open_in_memory().unwrap()
    }

    #[test]
    fn normalization_folds_case_punctuation_and_diacritics() {
        assert_eq!(normalize("INSAT 3D-R"), "insat3dr");
        assert_eq!(normalize("INSAT-3DR"), "insat3dr");
        assert_eq!(normalize("insat3dr"), "insat3dr");
        assert_eq!(normalize("Mégha-Tropiques"), "meghatropiques");
    }

    #[test]
    fn first_resolution_creates_entity_with_mention_as_alias() {
        let store = store();
        let id = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("INSAT-3DR", "Mission"),
        )
        .unwrap();

        let entity = store.entity(&id).unwrap().unwrap();
        assert_eq!(entity.canonical_name, "INSAT-3DR");
        assert_eq!(entity.aliases, vec!["INSAT-3DR".to_string()]);
    }

    #[test]
    fn variant_spellings_resolve_to_one_entity() {
        let store = store();
        let a = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("INSAT 3D-R", "Mission"),
        )
        .unwrap();
        let b = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("INSAT-3DR", "Mission"),
        )
        .unwrap();
        let c = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("insat3dr", "Mission"),
        )
        .unwrap();

        assert_eq!(a, b);
        assert_eq!(b, c);

        // Each variant was registered as an alias on the one entity.
        let entity = store.entity(&a).unwrap().unwrap();
        assert!(entity.aliases.iter().any(|s| s == "INSAT 3D-R"));
        assert!(entity.aliases.iter().any(|s| s == "INSAT-3DR"));
        assert!(entity.aliases.iter().any(|s| s == "insat3dr"));
    }

    #[test]
    fn resolution_is_scoped_by_entity_type() {
        let store = store();
        let mission = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("SCATSAT-1", "Mission"),
        )
        .unwrap();
        let document = resolve(
            &store,
            EntityType::Document,
            &Mention::new("SCATSAT-1", "Document"),
        )
        .unwrap();
        assert_ne!(mission, document, "same name, different types");
    }

    #[test]
    fn alias_hints_become_searchable_immediately() {
        let store = store();
        let id = resolve(
            &store,
            EntityType::Mission,
            &Mention::new("Megha-Tropiques", "Mission")
                .with_hints(["MT-1".to_string()]),
        )
        .unwrap();

        // A later mention using only the hint must hit the same entity.
        let via_hint = resolve(&store, EntityType::Mission, &Mention::new("MT-1", "Mission"))
            .unwrap();
        assert_eq!(id, via_hint);
    }

    #[test]
    fn find_existing_does_not_create() {
        let store = store();
        let missing = find_existing(&store, EntityType::Mission, "Oceansat-3").unwrap();
        assert!(missing.is_none());
        // Still nothing after the lookup.
        assert!(find_existing(&store, EntityType::Mission, "Oceansat-3")
            .unwrap()
            .is_none());
    }
}
