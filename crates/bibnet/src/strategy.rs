//! Search strategy documents: the named queries and aggregations of a project.
//!
//! A strategy is a YAML tree `source → category → kind → [ {id: {name, value}} ]`:
//!
//! ```yaml
//! lens_scholarly:
//!   main:
//!     topics:
//!       - topic_1:
//!           name: FR and AU collaborations
//!           value: {"bool": {"must": [{"term": {"author.affiliation.address.country_code": "AU"}}]}}
//!   secondary:
//!     topics:
//!       - topic_2: {name: Australian publications, value: {"match": {"country": "AU"}}}
//!   aggregation:
//!     aggregations:
//!       - by_year: {name: Per year, value: {"by_year": {"date_histogram": {"field": "date_published"}}}}
//! ```
//!
//! `main` topics feed the record harvest; every `secondary` topic is run once per aggregation.
//! The misspelled `aggegations` key of older documents is accepted.
//!
//! The `unification` category holds thesaurus entries. Its `publication_type` entry groups the
//! source's document types for citation normalisation:
//!
//! ```yaml
//! lens_scholarly:
//!   unification:
//!     thesaurus:
//!       - publication_type:
//!           name: Publication types
//!           value:
//!             ja: {label: Journal article, source_types: [journal article]}
//!             cp: {label: Conference proceedings, source_types: [conference proceedings]}
//! ```
//!
//! # Examples
//!
//! ```
//! use bibnet::strategy::{SearchStrategy, StrategyKind};
//!
//! let strategy = SearchStrategy::from_yaml_str(
//!   "lens_scholarly:\n  main:\n    topics:\n      - t1: {name: All, value: {match_all: {}}}",
//! )
//! .unwrap();
//!
//! let topics: Vec<_> = strategy.select("lens_scholarly", "main", StrategyKind::Topic).collect();
//! assert_eq!(topics[0].id, "t1");
//! ```

use super::*;

/// Source whose topics are harvested as records.
pub const SCHOLARLY_SOURCE: &str = "lens_scholarly";

/// Category of the topics harvested as records.
pub const MAIN_CATEGORY: &str = "main";

/// Category of the topics only run as aggregations.
pub const SECONDARY_CATEGORY: &str = "secondary";

/// Category of the thesaurus entries.
pub const UNIFICATION_CATEGORY: &str = "unification";

/// Thesaurus entry grouping document types.
pub const PUBLICATION_TYPE: &str = "publication_type";

/// What a strategy entry is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
  /// A query
  Topic,
  /// An aggregation clause
  Aggregate,
  /// A vocabulary mapping
  Thesaurus,
}

/// One flattened strategy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEntry {
  /// Data source (`lens_scholarly`, ...)
  pub source:   String,
  /// Category within the source (`main`, `secondary`, ...)
  pub category: String,
  /// Kind of entry
  pub kind:     StrategyKind,
  /// Entry id, used in table names
  pub id:       String,
  /// Human-readable name
  pub name:     Option<String>,
  /// Query, aggregation or mapping
  pub value:    Json,
}

/// A group of source document types, from the `publication_type` thesaurus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationType {
  /// Group id (`ja`, `cp`, ...)
  pub id:           String,
  /// Display label
  pub label:        String,
  /// Document types of the source in this group
  pub source_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPublicationType {
  label:        String,
  source_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
  #[serde(default)]
  name:  Option<String>,
  #[serde(default)]
  value: Json,
}

#[derive(Debug, Default, Deserialize)]
struct RawCategory {
  #[serde(default)]
  topics:       Vec<BTreeMap<String, RawItem>>,
  #[serde(default, alias = "aggegations")]
  aggregations: Vec<BTreeMap<String, RawItem>>,
  #[serde(default)]
  thesaurus:    Vec<BTreeMap<String, RawItem>>,
}

/// A parsed search strategy, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchStrategy {
  entries: Vec<StrategyEntry>,
}

impl SearchStrategy {
  /// Parses a strategy document.
  ///
  /// # Errors
  ///
  /// - [`BibnetError::Yaml`] if the document is not YAML
  /// - [`BibnetError::Config`] if it is not shaped like a strategy, or a topic or aggregation
  ///   value is not an object
  pub fn from_yaml_str(yaml: &str) -> Result<Self, BibnetError> {
    let document: Json = serde_yaml::from_str(yaml)?;
    let Json::Object(sources) = document else {
      return Err(BibnetError::Config("search strategy must map sources to categories".into()));
    };

    let mut entries = Vec::new();
    for (source, categories) in sources {
      let Json::Object(categories) = categories else {
        return Err(BibnetError::Config(format!("strategy source `{source}` has no categories")));
      };
      for (category, body) in categories {
        let body: RawCategory = serde_json::from_value(body)
          .map_err(|e| BibnetError::Config(format!("strategy `{source}.{category}`: {e}")))?;
        for (kind, items) in [
          (StrategyKind::Topic, body.topics),
          (StrategyKind::Aggregate, body.aggregations),
          (StrategyKind::Thesaurus, body.thesaurus),
        ] {
          for (id, item) in items.into_iter().flatten() {
            if kind != StrategyKind::Thesaurus && !item.value.is_object() {
              return Err(BibnetError::Config(format!(
                "strategy entry `{source}.{category}.{id}` needs an object value"
              )));
            }
            entries.push(StrategyEntry {
              source: source.clone(),
              category: category.clone(),
              kind,
              id,
              name: item.name,
              value: item.value,
            });
          }
        }
      }
    }
    debug!("Search strategy holds {} entries", entries.len());
    Ok(Self { entries })
  }

  /// Loads a strategy file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, BibnetError> {
    Self::from_yaml_str(&std::fs::read_to_string(path)?)
  }

  /// Every entry.
  pub fn entries(&self) -> &[StrategyEntry] { &self.entries }

  /// Entries of one source, category and kind.
  pub fn select<'a>(
    &'a self,
    source: &'a str,
    category: &'a str,
    kind: StrategyKind,
  ) -> impl Iterator<Item = &'a StrategyEntry> + 'a {
    self.entries.iter().filter(move |e| e.source == source && e.category == category && e.kind == kind)
  }

  /// Publication type groups of a source, in document order; empty when none are defined.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] if the entry is not a map of `{label, source_types}`.
  pub fn publication_types(&self, source: &str) -> Result<Vec<PublicationType>, BibnetError> {
    let Some(entry) = self
      .select(source, UNIFICATION_CATEGORY, StrategyKind::Thesaurus)
      .find(|entry| entry.id == PUBLICATION_TYPE)
    else {
      return Ok(Vec::new());
    };
    let groups: serde_json::Map<String, Json> = serde_json::from_value(entry.value.clone()).map_err(|e| {
      BibnetError::Config(format!("strategy `{source}.{UNIFICATION_CATEGORY}.{PUBLICATION_TYPE}`: {e}"))
    })?;
    groups
      .into_iter()
      .map(|(id, group)| {
        let group: RawPublicationType = serde_json::from_value(group)
          .map_err(|e| BibnetError::Config(format!("publication type `{id}`: {e}")))?;
        Ok(PublicationType { id, label: group.label, source_types: group.source_types })
      })
      .collect()
  }

  /// Aggregations of a source, whatever their category.
  pub fn aggregations<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a StrategyEntry> + 'a {
    self.entries.iter().filter(move |e| e.source == source && e.kind == StrategyKind::Aggregate)
  }
}
