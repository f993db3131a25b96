//! Explodes harvested records into surrogate-keyed relational tables.
//!
//! A harvested record is a nested document: a venue, a list of authors each with a list of
//! affiliations, external ids, funding entries and subject tags. [`normalize`] flattens a batch
//! of them into:
//!
//! | table              | key                         | parent                          |
//! |--------------------|-----------------------------|---------------------------------|
//! | `source`           | `source_id`                 |                                 |
//! | `source_issn`      |                             | `source`                        |
//! | `records`          | `record_id`                 | `source`                        |
//! | `records_id`       |                             | `records`                       |
//! | `contribution`     | `contribution_id`           | `records`                       |
//! | `affiliation`      | `affiliation_id`            | `contribution`, `organisations` |
//! | `organisations`    | `org_id`                    |                                 |
//! | `organisations_id` |                             | `organisations`                 |
//! | `funding`          |                             | `records`                       |
//! | `categories`       |                             | `records`                       |
//!
//! Surrogate ids are assigned in order of first appearance and are only meaningful within one
//! batch. Normalization is all-or-nothing: the first record that does not fit the expected
//! shape fails the whole batch with [`BibnetError::Normalization`].
//!
//! Two enrichment passes run on the result:
//! - [`resolve_locations`] attaches registry locations to organisations through their external
//!   ids
//! - [`link_categories`] matches field-of-study tags against a [`TaxonomyHierarchy`]
//!
//! # Examples
//!
//! ```
//! use bibnet::normalize::normalize;
//! use serde_json::json;
//!
//! let tables = normalize(&[json!({
//!   "lens_id": "000-001",
//!   "year_published": 2021,
//!   "authors": [{"last_name": "Curie", "affiliations": []}]
//! })])
//! .unwrap();
//!
//! assert_eq!(tables.contributions.len(), 1);
//! assert_eq!(tables.organisations[0].name, "unknown");
//! ```

use serde::Deserializer;

use super::*;
use crate::{registry::RegistryIndex, taxonomy::TaxonomyHierarchy};

/// Replacement for missing venue attributes.
pub const MISSING_SOURCE: &str = "other";

/// Replacement for missing country codes and GRID ids.
pub const MISSING_CODE: &str = "??";

/// Name of the organisation standing in for a missing affiliation.
pub const UNKNOWN_ORGANISATION: &str = "unknown";

/// Treats an explicit `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Default + Deserialize<'de>, {
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A typed identifier (`doi`, `pmid`, `grid`, `ror`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawIdentifier {
  /// Identifier scheme
  #[serde(rename = "type")]
  pub kind:  String,
  /// Identifier value
  pub value: String,
}

/// Publication venue of a record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawSource {
  /// Venue title
  #[serde(default)]
  pub title:     Option<String>,
  /// Publisher
  #[serde(default)]
  pub publisher: Option<String>,
  /// Venue type (journal, conference, ...)
  #[serde(default, rename = "type")]
  pub kind:      Option<String>,
  /// Country of publication
  #[serde(default)]
  pub country:   Option<String>,
  /// ISSNs
  #[serde(default, deserialize_with = "nullable")]
  pub issn:      Vec<RawIdentifier>,
}

/// One affiliation of an author.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawAffiliation {
  /// Normalized organisation name
  #[serde(default)]
  pub name:          Option<String>,
  /// Affiliation string as printed
  #[serde(default)]
  pub name_original: Option<String>,
  /// GRID id
  #[serde(default)]
  pub grid_id:       Option<String>,
  /// ISO country code
  #[serde(default)]
  pub country_code:  Option<String>,
  /// Organisation identifiers
  #[serde(default, deserialize_with = "nullable")]
  pub ids:           Vec<RawIdentifier>,
}

/// One author of a record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawAuthor {
  /// Given name
  #[serde(default)]
  pub first_name:   Option<String>,
  /// Family name
  #[serde(default)]
  pub last_name:    Option<String>,
  /// Initials
  #[serde(default)]
  pub initials:     Option<String>,
  /// Author identifiers (ORCID, ...)
  #[serde(default, deserialize_with = "nullable")]
  pub ids:          Vec<RawIdentifier>,
  /// Affiliations; `null` entries count as missing
  #[serde(default, deserialize_with = "nullable")]
  pub affiliations: Vec<Option<RawAffiliation>>,
}

/// One funding acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawFunding {
  /// Funding organisation
  #[serde(default)]
  pub org:        Option<String>,
  /// Grant number
  #[serde(default)]
  pub funding_id: Option<String>,
  /// Funder country
  #[serde(default)]
  pub country:    Option<String>,
}

/// A controlled-vocabulary heading with its qualifier.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawMeshTerm {
  /// Heading
  #[serde(default)]
  pub mesh_heading:   Option<String>,
  /// Heading id
  #[serde(default)]
  pub mesh_id:        Option<String>,
  /// Qualifier
  #[serde(default)]
  pub qualifier_name: Option<String>,
  /// Qualifier id
  #[serde(default)]
  pub qualifier_id:   Option<String>,
}

/// A harvested record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawRecord {
  /// Record id
  #[serde(alias = "lens_id")]
  pub record_id:                 String,
  /// Publication year
  #[serde(default)]
  pub year_published:            Option<i64>,
  /// Open access flag
  #[serde(default)]
  pub is_open_access:            Option<bool>,
  /// Publication type
  #[serde(default)]
  pub publication_type:          Option<String>,
  /// Author count reported by the source
  #[serde(default)]
  pub author_count:              Option<i64>,
  /// Citations from scholarly works
  #[serde(default)]
  pub scholarly_citations_count: Option<i64>,
  /// References resolved to records
  #[serde(default)]
  pub references_resolved_count: Option<i64>,
  /// References
  #[serde(default)]
  pub references_count:          Option<i64>,
  /// Citations from patents
  #[serde(default)]
  pub patent_citations_count:    Option<i64>,
  /// Relevance score from retrieval
  #[serde(default)]
  pub score:                     Option<f64>,
  /// Venue
  #[serde(default)]
  pub source:                    Option<RawSource>,
  /// Record identifiers
  #[serde(default, deserialize_with = "nullable")]
  pub external_ids:              Vec<RawIdentifier>,
  /// Authors in byline order
  #[serde(default, deserialize_with = "nullable")]
  pub authors:                   Vec<RawAuthor>,
  /// Free-text subject tags
  #[serde(default, deserialize_with = "nullable")]
  pub fields_of_study:           Vec<String>,
  /// Controlled-vocabulary terms
  #[serde(default, deserialize_with = "nullable")]
  pub mesh_terms:                Vec<RawMeshTerm>,
  /// Funding acknowledgements
  #[serde(default, deserialize_with = "nullable")]
  pub funding:                   Vec<RawFunding>,
}

fn text(value: &str) -> Value { Value::Text(value.to_string()) }

fn opt_text(value: &Option<String>) -> Value { Value::from(value.clone()) }

/// `records` row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
  /// Record id
  pub record_id:                 String,
  /// Publication year
  pub year_published:            Option<i64>,
  /// Open access flag
  pub is_open_access:            Option<bool>,
  /// Publication type
  pub publication_type:          Option<String>,
  /// Author count, falling back to the length of the author list
  pub nb_authors:                i64,
  /// Citations from scholarly works
  pub scholarly_citations_count: Option<i64>,
  /// References resolved to records
  pub references_resolved_count: Option<i64>,
  /// References
  pub references_count:          Option<i64>,
  /// Citations from patents
  pub patent_citations_count:    Option<i64>,
  /// Relevance score
  pub score:                     Option<f64>,
  /// Venue
  pub source_id:                 i64,
}

impl TableRow for RecordRow {
  const COLUMNS: &'static [&'static str] = &[
    "record_id",
    "year_published",
    "is_open_access",
    "publication_type",
    "nb_authors",
    "scholarly_citations_count",
    "references_resolved_count",
    "references_count",
    "patent_citations_count",
    "score",
    "source_id",
  ];

  fn values(&self) -> Vec<Value> {
    vec![
      text(&self.record_id),
      Value::from(self.year_published),
      Value::from(self.is_open_access),
      opt_text(&self.publication_type),
      Value::Integer(self.nb_authors),
      Value::from(self.scholarly_citations_count),
      Value::from(self.references_resolved_count),
      Value::from(self.references_count),
      Value::from(self.patent_citations_count),
      Value::from(self.score),
      Value::Integer(self.source_id),
    ]
  }
}

/// `source` row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
  /// Surrogate id
  pub source_id:      i64,
  /// Venue title
  pub title:          String,
  /// Publisher
  pub publisher_name: String,
  /// Venue type
  pub kind:           String,
  /// Country
  pub country:        String,
}

impl TableRow for SourceRow {
  const COLUMNS: &'static [&'static str] = &["source_id", "title", "publisher_name", "type", "country"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.source_id),
      text(&self.title),
      text(&self.publisher_name),
      text(&self.kind),
      text(&self.country),
    ]
  }
}

/// `source_issn` row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceIssnRow {
  /// Venue
  pub source_id: i64,
  /// ISSN kind (print, electronic)
  pub kind:      String,
  /// ISSN
  pub value:     String,
}

impl TableRow for SourceIssnRow {
  const COLUMNS: &'static [&'static str] = &["source_id", "type", "value"];

  fn values(&self) -> Vec<Value> { vec![Value::Integer(self.source_id), text(&self.kind), text(&self.value)] }
}

/// `organisations_id` row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganisationIdRow {
  /// Organisation
  pub org_id: i64,
  /// Identifier scheme
  pub kind:   String,
  /// Identifier value
  pub value:  String,
}

impl TableRow for OrganisationIdRow {
  const COLUMNS: &'static [&'static str] = &["org_id", "type", "value"];

  fn values(&self) -> Vec<Value> { vec![Value::Integer(self.org_id), text(&self.kind), text(&self.value)] }
}

/// `records_id` row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordIdRow {
  /// Record id
  pub record_id: String,
  /// Identifier scheme
  pub kind:      String,
  /// Identifier value
  pub value:     String,
}

impl TableRow for RecordIdRow {
  const COLUMNS: &'static [&'static str] = &["record_id", "type", "value"];

  fn values(&self) -> Vec<Value> { vec![text(&self.record_id), text(&self.kind), text(&self.value)] }
}

/// `contribution` row: one author of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionRow {
  /// Surrogate id
  pub contribution_id: i64,
  /// Record id
  pub record_id:       String,
  /// 1-based byline position
  pub author_position: i64,
  /// Given name
  pub first_name:      Option<String>,
  /// Family name
  pub last_name:       Option<String>,
  /// Initials
  pub initials:        Option<String>,
  /// Number of author identifiers
  pub nb_ids:          i64,
  /// Number of affiliation rows, at least one
  pub nb_affiliations: i64,
}

impl TableRow for ContributionRow {
  const COLUMNS: &'static [&'static str] = &[
    "contribution_id",
    "record_id",
    "author_position",
    "first_name",
    "last_name",
    "initials",
    "nb_ids",
    "nb_affiliations",
  ];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.contribution_id),
      text(&self.record_id),
      Value::Integer(self.author_position),
      opt_text(&self.first_name),
      opt_text(&self.last_name),
      opt_text(&self.initials),
      Value::Integer(self.nb_ids),
      Value::Integer(self.nb_affiliations),
    ]
  }
}

/// `affiliation` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffiliationRow {
  /// Surrogate id
  pub affiliation_id:  i64,
  /// Contribution
  pub contribution_id: i64,
  /// Organisation
  pub org_id:          i64,
}

impl TableRow for AffiliationRow {
  const COLUMNS: &'static [&'static str] = &["affiliation_id", "contribution_id", "org_id"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.affiliation_id),
      Value::Integer(self.contribution_id),
      Value::Integer(self.org_id),
    ]
  }
}

/// `organisations` row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganisationRow {
  /// Surrogate id
  pub org_id:       i64,
  /// Name
  pub name:         String,
  /// ISO country code or `??`
  pub country_code: String,
  /// GRID id or `??`
  pub grid_id:      String,
  /// Number of identifiers
  pub nb_ids:       i64,
}

impl TableRow for OrganisationRow {
  const COLUMNS: &'static [&'static str] = &["org_id", "name", "country_code", "grid_id", "nb_ids"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.org_id),
      text(&self.name),
      text(&self.country_code),
      text(&self.grid_id),
      Value::Integer(self.nb_ids),
    ]
  }
}

/// `funding` row.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingRow {
  /// Record id
  pub record_id:  String,
  /// Funding organisation
  pub org:        Option<String>,
  /// Grant number
  pub funding_id: Option<String>,
  /// Funder country
  pub country:    Option<String>,
}

impl TableRow for FundingRow {
  const COLUMNS: &'static [&'static str] = &["record_id", "org", "funding_id", "country"];

  fn values(&self) -> Vec<Value> {
    vec![text(&self.record_id), opt_text(&self.org), opt_text(&self.funding_id), opt_text(&self.country)]
  }
}

/// Provenance of a category assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CategoryKind {
  /// Free-text field-of-study tag
  FieldsOfStudy,
  /// Controlled-vocabulary term
  MeshTerms,
}

impl CategoryKind {
  /// Discriminator stored in the `type` column.
  pub fn as_str(&self) -> &'static str {
    match self {
      CategoryKind::FieldsOfStudy => "fields_of_study",
      CategoryKind::MeshTerms => "mesh_terms",
    }
  }
}

/// `categories` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRow {
  /// Record id
  pub record_id:    String,
  /// Tag or heading
  pub value:        Option<String>,
  /// Vocabulary id; unset for free-text tags
  pub category_id:  Option<String>,
  /// Qualifier
  pub qualifier:    Option<String>,
  /// Qualifier id
  pub qualifier_id: Option<String>,
  /// Provenance
  pub kind:         CategoryKind,
}

impl TableRow for CategoryRow {
  const COLUMNS: &'static [&'static str] =
    &["record_id", "value", "category_id", "qualifier", "qualifier_id", "type"];

  fn values(&self) -> Vec<Value> {
    vec![
      text(&self.record_id),
      opt_text(&self.value),
      opt_text(&self.category_id),
      opt_text(&self.qualifier),
      opt_text(&self.qualifier_id),
      text(self.kind.as_str()),
    ]
  }
}

/// `locations` row: one place of one organisation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRow {
  /// Organisation
  pub org_id:       i64,
  /// Registry entry the organisation resolved to
  pub registry_id:  String,
  /// GeoNames id
  pub geonames_id:  i64,
  /// Place name
  pub name:         Option<String>,
  /// ISO country code
  pub country_code: Option<String>,
  /// Country name
  pub country_name: Option<String>,
  /// Latitude
  pub lat:          Option<f64>,
  /// Longitude
  pub lng:          Option<f64>,
}

impl TableRow for LocationRow {
  const COLUMNS: &'static [&'static str] =
    &["org_id", "id", "geonames_id", "name", "country_code", "country_name", "lat", "lng"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.org_id),
      text(&self.registry_id),
      Value::Integer(self.geonames_id),
      opt_text(&self.name),
      opt_text(&self.country_code),
      opt_text(&self.country_name),
      Value::from(self.lat),
      Value::from(self.lng),
    ]
  }
}

/// Every table of one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTables {
  /// `records`
  pub records:          Vec<RecordRow>,
  /// `source`
  pub sources:          Vec<SourceRow>,
  /// `source_issn`
  pub source_issn:      Vec<SourceIssnRow>,
  /// `records_id`
  pub records_id:       Vec<RecordIdRow>,
  /// `contribution`
  pub contributions:    Vec<ContributionRow>,
  /// `affiliation`
  pub affiliations:     Vec<AffiliationRow>,
  /// `organisations`
  pub organisations:    Vec<OrganisationRow>,
  /// `organisations_id`
  pub organisations_id: Vec<OrganisationIdRow>,
  /// `funding`
  pub funding:          Vec<FundingRow>,
  /// `categories`
  pub categories:       Vec<CategoryRow>,
}

impl NormalizedTables {
  /// The tables with their store names.
  pub fn tables(&self) -> Vec<(String, Table)> {
    vec![
      ("records".to_string(), Table::from_rows(&self.records)),
      ("source".to_string(), Table::from_rows(&self.sources)),
      ("source_issn".to_string(), Table::from_rows(&self.source_issn)),
      ("records_id".to_string(), Table::from_rows(&self.records_id)),
      ("contribution".to_string(), Table::from_rows(&self.contributions)),
      ("affiliation".to_string(), Table::from_rows(&self.affiliations)),
      ("organisations".to_string(), Table::from_rows(&self.organisations)),
      ("organisations_id".to_string(), Table::from_rows(&self.organisations_id)),
      ("funding".to_string(), Table::from_rows(&self.funding)),
      ("categories".to_string(), Table::from_rows(&self.categories)),
    ]
  }
}

/// Deduplication key of an organisation.
type OrganisationKey = (String, String, String);

/// Deduplication key of a venue.
type SourceKey = (String, String, String, String);

#[derive(Default)]
struct Normalizer {
  tables:            NormalizedTables,
  sources:           HashMap<SourceKey, i64>,
  organisations:     HashMap<OrganisationKey, i64>,
  records:           HashSet<String>,
  next_contribution: i64,
  next_affiliation:  i64,
}

impl Normalizer {
  fn source_id(&mut self, source: Option<RawSource>) -> i64 {
    let source = source.unwrap_or_default();
    let or_other = |v: Option<String>| v.unwrap_or_else(|| MISSING_SOURCE.to_string());
    let key = (
      or_other(source.title),
      or_other(source.publisher),
      or_other(source.kind),
      or_other(source.country),
    );
    if let Some(id) = self.sources.get(&key) {
      return *id;
    }

    let source_id = self.sources.len() as i64;
    for issn in source.issn {
      self.tables.source_issn.push(SourceIssnRow { source_id, kind: issn.kind, value: issn.value });
    }
    self.tables.sources.push(SourceRow {
      source_id,
      title: key.0.clone(),
      publisher_name: key.1.clone(),
      kind: key.2.clone(),
      country: key.3.clone(),
    });
    self.sources.insert(key, source_id);
    source_id
  }

  fn org_id(&mut self, affiliation: Option<RawAffiliation>) -> i64 {
    let affiliation = affiliation.unwrap_or_else(|| RawAffiliation {
      name: Some(UNKNOWN_ORGANISATION.to_string()),
      country_code: Some(MISSING_CODE.to_string()),
      ..RawAffiliation::default()
    });
    let key = (
      affiliation.name.unwrap_or_else(|| UNKNOWN_ORGANISATION.to_string()),
      affiliation.country_code.unwrap_or_else(|| MISSING_CODE.to_string()),
      affiliation.grid_id.unwrap_or_else(|| MISSING_CODE.to_string()),
    );
    if let Some(id) = self.organisations.get(&key) {
      return *id;
    }

    let org_id = self.organisations.len() as i64;
    self.tables.organisations.push(OrganisationRow {
      org_id,
      name: key.0.clone(),
      country_code: key.1.clone(),
      grid_id: key.2.clone(),
      nb_ids: affiliation.ids.len() as i64,
    });
    for id in affiliation.ids {
      self.tables.organisations_id.push(OrganisationIdRow { org_id, kind: id.kind, value: id.value });
    }
    self.organisations.insert(key, org_id);
    org_id
  }

  fn add(&mut self, ordinal: usize, record: RawRecord) -> Result<(), BibnetError> {
    if record.record_id.trim().is_empty() {
      return Err(BibnetError::normalization(ordinal, "empty record id"));
    }
    if !self.records.insert(record.record_id.clone()) {
      warn!("Skipping duplicate record {}", record.record_id);
      return Ok(());
    }

    let record_id = record.record_id;
    let source_id = self.source_id(record.source);
    self.tables.records.push(RecordRow {
      record_id: record_id.clone(),
      year_published: record.year_published,
      is_open_access: record.is_open_access,
      publication_type: record.publication_type,
      nb_authors: record.author_count.unwrap_or(record.authors.len() as i64),
      scholarly_citations_count: record.scholarly_citations_count,
      references_resolved_count: record.references_resolved_count,
      references_count: record.references_count,
      patent_citations_count: record.patent_citations_count,
      score: record.score,
      source_id,
    });

    for id in record.external_ids {
      self.tables.records_id.push(RecordIdRow { record_id: record_id.clone(), kind: id.kind, value: id.value });
    }

    for (position, author) in record.authors.into_iter().enumerate() {
      let contribution_id = self.next_contribution;
      self.next_contribution += 1;

      let mut affiliations: Vec<Option<RawAffiliation>> = author.affiliations;
      if affiliations.is_empty() {
        affiliations.push(None);
      }
      let nb_affiliations = affiliations.len() as i64;
      for affiliation in affiliations {
        let org_id = self.org_id(affiliation);
        self.tables.affiliations.push(AffiliationRow {
          affiliation_id: self.next_affiliation,
          contribution_id,
          org_id,
        });
        self.next_affiliation += 1;
      }

      self.tables.contributions.push(ContributionRow {
        contribution_id,
        record_id: record_id.clone(),
        author_position: position as i64 + 1,
        first_name: author.first_name,
        last_name: author.last_name,
        initials: author.initials,
        nb_ids: author.ids.len() as i64,
        nb_affiliations,
      });
    }

    for funding in record.funding {
      self.tables.funding.push(FundingRow {
        record_id:  record_id.clone(),
        org:        funding.org,
        funding_id: funding.funding_id,
        country:    funding.country,
      });
    }

    for field in record.fields_of_study {
      self.tables.categories.push(CategoryRow {
        record_id:    record_id.clone(),
        value:        Some(field),
        category_id:  None,
        qualifier:    None,
        qualifier_id: None,
        kind:         CategoryKind::FieldsOfStudy,
      });
    }
    for term in record.mesh_terms {
      self.tables.categories.push(CategoryRow {
        record_id:    record_id.clone(),
        value:        term.mesh_heading,
        category_id:  term.mesh_id,
        qualifier:    term.qualifier_name,
        qualifier_id: term.qualifier_id,
        kind:         CategoryKind::MeshTerms,
      });
    }
    Ok(())
  }
}

/// Normalizes a batch of harvested records.
///
/// # Errors
///
/// Returns [`BibnetError::Normalization`] naming the first record whose shape does not parse
/// or whose id is empty. No tables are returned in that case.
pub fn normalize(records: &[Json]) -> Result<NormalizedTables, BibnetError> {
  let mut normalizer = Normalizer::default();
  for (ordinal, raw) in records.iter().enumerate() {
    let record =
      RawRecord::deserialize(raw).map_err(|e| BibnetError::normalization(ordinal, e.to_string()))?;
    normalizer.add(ordinal, record)?;
  }
  let tables = normalizer.tables;
  info!(
    "Normalized {} records into {} contributions and {} organisations",
    tables.records.len(),
    tables.contributions.len(),
    tables.organisations.len()
  );
  Ok(tables)
}

/// Attaches registry locations to organisations through their external ids.
///
/// An organisation may resolve to several registry entries and an entry may have several
/// places; every distinct `(org_id, geonames_id)` pair yields one row.
pub fn resolve_locations(tables: &NormalizedTables, index: &RegistryIndex) -> Vec<LocationRow> {
  let mut seen = HashSet::new();
  let mut rows = Vec::new();
  for id in &tables.organisations_id {
    for registry_id in index.resolve(&id.kind, &id.value) {
      for place in index.locations(registry_id) {
        if !seen.insert((id.org_id, place.geonames_id)) {
          continue;
        }
        rows.push(LocationRow {
          org_id:       id.org_id,
          registry_id:  registry_id.clone(),
          geonames_id:  place.geonames_id,
          name:         place.name.clone(),
          country_code: place.country_code.clone(),
          country_name: place.country_name.clone(),
          lat:          place.lat,
          lng:          place.lng,
        });
      }
    }
  }
  debug!("Resolved {} organisation locations", rows.len());
  rows
}

/// Matches field-of-study tags against a hierarchy.
///
/// Each tag yields one row per matching hierarchy row, or one row with empty hierarchy columns
/// when nothing matches. `is_not_linked` is set on every row of a record whose tags all failed
/// to match.
pub fn link_categories(
  categories: &[CategoryRow],
  hierarchy: &TaxonomyHierarchy,
) -> Result<Table, BibnetError> {
  let mut columns = vec!["record_id".to_string(), "value".to_string()];
  columns.extend(TaxonomyHierarchy::columns(hierarchy.depth()));
  columns.push("is_not_linked".to_string());
  let width = columns.len();

  let mut linked_records = HashSet::new();
  let mut rows: Vec<(&str, Vec<Value>)> = Vec::new();
  for category in categories.iter().filter(|c| c.kind == CategoryKind::FieldsOfStudy) {
    let name = category.value.as_deref().unwrap_or_default();
    let prefix = [text(&category.record_id), opt_text(&category.value)];
    let matches = hierarchy.lookup(name);
    if matches.is_empty() {
      let mut cells = prefix.to_vec();
      cells.resize(width - 1, Value::Null);
      rows.push((category.record_id.as_str(), cells));
      continue;
    }
    linked_records.insert(category.record_id.as_str());
    for row in matches {
      let mut cells = prefix.to_vec();
      cells.extend([
        text(&row.category_id),
        Value::Integer(row.level),
        text(&row.display_name),
        text(&row.match_name),
      ]);
      cells.extend(hierarchy.parent_cells(row));
      rows.push((category.record_id.as_str(), cells));
    }
  }

  let mut table = Table::new(columns);
  for (record_id, mut cells) in rows {
    cells.push(Value::from(!linked_records.contains(record_id)));
    table.push(cells)?;
  }
  Ok(table)
}
