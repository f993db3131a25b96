//! Citation normalisation baselines.
//!
//! Citation counts only compare within a discipline, a document type and a publication year.
//! For every pair of a level-1 concept group ([`FieldGroup`]) and a publication type group
//! ([`PublicationType`]), one aggregation query collects per-year statistics of
//! `referenced_by_count` over non-retracted documents. The stacked results form the
//! [`NORMALISATION_TABLE`] of the baseline store.
//!
//! # Examples
//!
//! ```
//! use bibnet::{citations::citation_query, strategy::PublicationType, taxonomy::FieldGroup};
//!
//! let group = FieldGroup {
//!   parent_id:     "C10".into(),
//!   parent_name:   "Quantum mechanics".into(),
//!   members:       vec!["Graphene".into(), "Quantum mechanics".into()],
//!   nb_categories: 2,
//! };
//! let articles = PublicationType {
//!   id:           "ja".into(),
//!   label:        "Journal article".into(),
//!   source_types: vec!["journal article".into()],
//! };
//!
//! let query = citation_query(&group, &articles);
//! assert_eq!(query["bool"]["must"][1]["bool"]["should"].as_array().unwrap().len(), 2);
//! ```

use super::*;
use crate::{clients::search::AggregationTable, strategy::PublicationType, taxonomy::FieldGroup};

/// Baseline table of per-year citation statistics.
pub const NORMALISATION_TABLE: &str = "normalisation_n_lens_concepts";

/// Grouping field of the citation aggregation.
const YEAR_KEY: &str = "year_published";

/// Statistics the aggregation computes per year.
const STATISTICS: [&str; 5] = ["doc_count", "avg", "min", "max", "nb_distinct"];

/// The per-year histogram of `referenced_by_count` statistics.
pub fn citation_aggregation() -> Json {
  json!({
    YEAR_KEY: {
      "date_histogram": {
        "field": "date_published",
        "interval": "YEAR",
        "aggregations": {
          "avg": {"avg": {"field": "referenced_by_count"}},
          "min": {"min": {"field": "referenced_by_count"}},
          "max": {"max": {"field": "referenced_by_count"}},
          "nb_distinct": {"cardinality": {"field": "referenced_by_count"}}
        }
      }
    }
  })
}

/// Non-retracted documents tagged with any member of `group` and typed as any of `types`.
pub fn citation_query(group: &FieldGroup, types: &PublicationType) -> Json {
  let fields: Vec<Json> = group.members.iter().map(|name| json!({"term": {"field_of_study": name}})).collect();
  let kinds: Vec<Json> =
    types.source_types.iter().map(|kind| json!({"term": {"publication_type": kind}})).collect();
  json!({"bool": {"must": [
    {"match": {"is_retracted": false}},
    {"bool": {"should": fields}},
    {"bool": {"should": kinds}}
  ]}})
}

/// Empty [`NORMALISATION_TABLE`] with its columns.
pub fn normalisation_table() -> Table {
  let mut columns = vec!["parent_1", "display_name_1", "pubtype_id", "pubtype_name", YEAR_KEY];
  columns.extend(STATISTICS);
  Table::new(columns)
}

/// Appends the rows of one aggregation, tagged with its group and type; returns their count.
pub fn append_rows(
  table: &mut Table,
  result: &AggregationTable,
  group: &FieldGroup,
  types: &PublicationType,
) -> Result<usize, BibnetError> {
  let rows = &result.table;
  for row in 0..rows.len() {
    let mut cells = vec![
      Value::Text(group.parent_id.clone()),
      Value::Text(group.parent_name.clone()),
      Value::Text(types.id.clone()),
      Value::Text(types.label.clone()),
      rows.get(row, &result.key).cloned().unwrap_or(Value::Null),
    ];
    cells.extend(STATISTICS.iter().map(|name| rows.get(row, name).cloned().unwrap_or(Value::Null)));
    table.push(cells)?;
  }
  Ok(rows.len())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn articles() -> PublicationType {
    PublicationType {
      id:           "ja".into(),
      label:        "Journal article".into(),
      source_types: vec!["journal article".into(), "review".into()],
    }
  }

  fn group() -> FieldGroup {
    FieldGroup {
      parent_id:     "C10".into(),
      parent_name:   "Quantum mechanics".into(),
      members:       vec!["Graphene".into()],
      nb_categories: 1,
    }
  }

  #[test]
  fn test_query_crosses_fields_and_types() {
    let query = citation_query(&group(), &articles());
    assert_eq!(
      query,
      json!({"bool": {"must": [
        {"match": {"is_retracted": false}},
        {"bool": {"should": [{"term": {"field_of_study": "Graphene"}}]}},
        {"bool": {"should": [
          {"term": {"publication_type": "journal article"}},
          {"term": {"publication_type": "review"}}
        ]}}
      ]}})
    );
  }

  #[test]
  fn test_aggregation_is_keyed_by_year() {
    let aggregation = citation_aggregation();
    let histogram = &aggregation[YEAR_KEY]["date_histogram"];
    assert_eq!(histogram["field"], "date_published");
    assert_eq!(histogram["aggregations"]["nb_distinct"], json!({"cardinality": {"field": "referenced_by_count"}}));
  }

  #[test]
  fn test_rows_are_tagged_and_aligned() {
    let mut result = Table::new([YEAR_KEY, "doc_count", "max", "avg"]);
    result.push(vec![Value::Text("2020".into()), Value::Integer(4), Value::Real(9.0), Value::Real(2.5)]).unwrap();
    let result = AggregationTable { key: YEAR_KEY.into(), total: 4, table: result };

    let mut table = normalisation_table();
    assert_eq!(append_rows(&mut table, &result, &group(), &articles()).unwrap(), 1);
    assert_eq!(table.get(0, "parent_1"), Some(&Value::Text("C10".into())));
    assert_eq!(table.get(0, "pubtype_id"), Some(&Value::Text("ja".into())));
    assert_eq!(table.get(0, "avg"), Some(&Value::Real(2.5)));
    assert_eq!(table.get(0, "min"), Some(&Value::Null));

    let empty = AggregationTable { key: YEAR_KEY.into(), total: 0, table: Table::new([YEAR_KEY]) };
    assert_eq!(append_rows(&mut table, &empty, &group(), &articles()).unwrap(), 0);
    assert_eq!(table.len(), 1);
  }
}
