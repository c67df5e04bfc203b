//! Entity/relation catalogs and triple splits.
//!
//! IDs are assigned in first-seen order of the entity and relation listings,
//! so the same listing always yields the same table. Triples are stored as
//! `(head, tail, relation)` integer tuples and deduplicated per split.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Integer ID of an entity, in `[0, num_entities)`.
pub type EntityId = u32;

/// Integer ID of a relation, in `[0, num_relations)`.
pub type RelationId = u32;

/// A `(head, tail, relation)` fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub head: EntityId,
    pub tail: EntityId,
    pub relation: RelationId,
}

impl Triple {
    pub fn new(head: EntityId, tail: EntityId, relation: RelationId) -> Self {
        Self {
            head,
            tail,
            relation,
        }
    }

    /// Same relation and tail, different head.
    pub fn with_head(self, head: EntityId) -> Self {
        Self { head, ..self }
    }

    /// Same head and relation, different tail.
    pub fn with_tail(self, tail: EntityId) -> Self {
        Self { tail, ..self }
    }
}

/// Name <-> ID table built from a one-name-per-line listing.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    ids: HashMap<String, u32>,
    names: Vec<String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from names; repeated names keep the ID of their first occurrence.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::new();
        for name in names {
            vocab.insert(name.into());
        }
        vocab
    }

    /// Parse a listing file (first whitespace-separated token per line).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = read_input(path.as_ref())?;
        Ok(Self::from_names(
            text.lines().filter_map(|line| line.split_whitespace().next()),
        ))
    }

    /// Insert a name, returning its ID (existing or fresh).
    pub fn insert(&mut self, name: String) -> u32 {
        if let Some(&id) = self.ids.get(&name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.ids.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Immutable entity and relation ID tables shared by every split.
#[derive(Debug, Clone, Default)]
pub struct GraphCatalog {
    entities: Vocab,
    relations: Vocab,
}

impl GraphCatalog {
    pub fn new(entities: Vocab, relations: Vocab) -> Self {
        Self {
            entities,
            relations,
        }
    }

    /// Load the entity and relation listings.
    pub fn load(entities_file: impl AsRef<Path>, relations_file: impl AsRef<Path>) -> Result<Self> {
        let entities = Vocab::from_file(entities_file)?;
        let relations = Vocab::from_file(relations_file)?;
        tracing::debug!(
            entities = entities.len(),
            relations = relations.len(),
            "loaded graph catalog"
        );
        Ok(Self::new(entities, relations))
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    pub fn entities(&self) -> &Vocab {
        &self.entities
    }

    pub fn relations(&self) -> &Vocab {
        &self.relations
    }

    pub fn entity_id(&self, name: &str) -> Option<EntityId> {
        self.entities.id(name)
    }

    pub fn relation_id(&self, name: &str) -> Option<RelationId> {
        self.relations.id(name)
    }

    /// Load a triples file against this catalog.
    pub fn load_triples(&self, path: impl AsRef<Path>) -> Result<Vec<Triple>> {
        let path = path.as_ref();
        let text = read_input(path)?;
        self.parse_triples(&text, path)
    }

    /// Parse `head tail relation` lines, deduplicating while keeping file order.
    ///
    /// `source` is only used in error messages.
    pub fn parse_triples(&self, text: &str, source: &Path) -> Result<Vec<Triple>> {
        let mut seen = HashSet::new();
        let mut triples = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            let schema = |message: String| Error::Schema {
                path: source.to_path_buf(),
                line: lineno + 1,
                message,
            };
            if parts.len() != 3 {
                return Err(schema(format!(
                    "expected 3 fields (head tail relation), found {}",
                    parts.len()
                )));
            }
            let head = self
                .entity_id(parts[0])
                .ok_or_else(|| schema(format!("unknown entity '{}'", parts[0])))?;
            let tail = self
                .entity_id(parts[1])
                .ok_or_else(|| schema(format!("unknown entity '{}'", parts[1])))?;
            let relation = self
                .relation_id(parts[2])
                .ok_or_else(|| schema(format!("unknown relation '{}'", parts[2])))?;

            let triple = Triple::new(head, tail, relation);
            if seen.insert(triple) {
                triples.push(triple);
            }
        }

        Ok(triples)
    }
}

/// Load a catalog and one triples split in a single call.
pub fn load_graph(
    triples_file: impl AsRef<Path>,
    entities_file: impl AsRef<Path>,
    relations_file: impl AsRef<Path>,
) -> Result<(GraphCatalog, Vec<Triple>)> {
    // Check every path up front so the error names the first missing input.
    for path in [triples_file.as_ref(), entities_file.as_ref(), relations_file.as_ref()] {
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
    }
    let catalog = GraphCatalog::load(entities_file, relations_file)?;
    let triples = catalog.load_triples(triples_file)?;
    Ok((catalog, triples))
}

/// Set of known true triples, used to filter corruptions and rankings.
#[derive(Debug, Clone, Default)]
pub struct TripleIndex {
    triples: HashSet<Triple>,
}

impl TripleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, triple: Triple) -> bool {
        self.triples.insert(triple)
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.contains(triple)
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

impl FromIterator<Triple> for TripleIndex {
    fn from_iter<I: IntoIterator<Item = Triple>>(iter: I) -> Self {
        Self {
            triples: iter.into_iter().collect(),
        }
    }
}

impl Extend<Triple> for TripleIndex {
    fn extend<I: IntoIterator<Item = Triple>>(&mut self, iter: I) {
        self.triples.extend(iter);
    }
}

pub(crate) fn read_input(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: PathBuf::from(path),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> GraphCatalog {
        GraphCatalog::new(
            Vocab::from_names(["A", "B", "C"]),
            Vocab::from_names(["r", "s"]),
        )
    }

    #[test]
    fn test_vocab_first_seen_order() {
        let vocab = Vocab::from_names(["Q5", "Q42", "Q5", "Q1"]);
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.id("Q5"), Some(0));
        assert_eq!(vocab.id("Q42"), Some(1));
        assert_eq!(vocab.id("Q1"), Some(2));
        assert_eq!(vocab.name(1), Some("Q42"));
        assert_eq!(vocab.name(7), None);
    }

    #[test]
    fn test_parse_triples_tabs_and_spaces() {
        let text = "A\tB\tr\nB C s\n\nC  A   r\n";
        let triples = catalog().parse_triples(text, Path::new("train.txt")).unwrap();
        assert_eq!(
            triples,
            vec![Triple::new(0, 1, 0), Triple::new(1, 2, 1), Triple::new(2, 0, 0)]
        );
    }

    #[test]
    fn test_parse_triples_deduplicates() {
        let text = "A B r\nA B r\nB A r\n";
        let triples = catalog().parse_triples(text, Path::new("t")).unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0], Triple::new(0, 1, 0));
    }

    #[test]
    fn test_unknown_entity_is_schema_error() {
        let err = catalog()
            .parse_triples("A B r\nA Z r\n", Path::new("t"))
            .unwrap_err();
        match err {
            Error::Schema { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("'Z'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_relation_is_schema_error() {
        let err = catalog().parse_triples("A B q\n", Path::new("t")).unwrap_err();
        assert!(matches!(err, Error::Schema { line: 1, .. }));
    }

    #[test]
    fn test_wrong_field_count_is_schema_error() {
        let err = catalog().parse_triples("A B\n", Path::new("t")).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = GraphCatalog::load("/nonexistent/entities.txt", "/nonexistent/rel.txt")
            .unwrap_err();
        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn test_triple_index() {
        let index: TripleIndex = [Triple::new(0, 1, 0)].into_iter().collect();
        assert!(index.contains(&Triple::new(0, 1, 0)));
        assert!(!index.contains(&Triple::new(1, 0, 0)));
        assert_eq!(index.len(), 1);
    }
}
