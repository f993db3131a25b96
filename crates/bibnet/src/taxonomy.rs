//! Subject classification hierarchies used to link harvested field-of-study tags.
//!
//! Two OpenAlex vocabularies are supported:
//! - **concepts**: a DAG of levels 0 to 5 where a concept may have several parents; its
//!   hierarchy keeps the two top levels (`parent_0`, `parent_1`)
//! - **topics**: a strict four-level tree (domain, field, subfield, topic); its hierarchy keeps
//!   the three upper levels (`parent_0` to `parent_2`)
//!
//! A [`TaxonomyHierarchy`] has one row per distinct ancestry chain of a category. Categories
//! with several parents fan out into several rows. Missing levels are marked `N/A`.
//!
//! # Examples
//!
//! ```
//! use bibnet::taxonomy::{Topic, TaxonomyHierarchy};
//!
//! let topic: Topic = serde_json::from_value(serde_json::json!({
//!   "id": "https://openalex.org/T10001",
//!   "display_name": "Graphene research",
//!   "domain": {"id": "https://openalex.org/domains/3", "display_name": "Physical Sciences"},
//!   "field": {"id": "https://openalex.org/fields/25", "display_name": "Materials Science"},
//!   "subfield": {"id": "https://openalex.org/subfields/2505", "display_name": "Materials Chemistry"}
//! }))
//! .unwrap();
//!
//! let hierarchy = TaxonomyHierarchy::from_topics(&[topic]);
//! let rows = hierarchy.lookup("Graphene research");
//! assert_eq!(rows[0].parents[0].as_deref(), Some("domains/3"));
//! ```

use super::*;
use crate::store::{as_integer, as_text};

/// Prefix stripped from OpenAlex ids.
const OPENALEX_PREFIX: &str = "https://openalex.org/";

/// Marker for a level the category does not reach.
pub const NOT_APPLICABLE: &str = "N/A";

/// Concepts removed before linking because their display names collide with a better match.
const DUPLICATED_CONCEPTS: [&str; 4] = ["C21036866", "C8880873", "C2776095024", "C205147927"];

/// Concepts sharing the display name "Metre", renamed apart.
const RENAMED_CONCEPTS: [(&str, &str); 2] =
  [("C151011524", "Metre (SI)"), ("C182181037", "Metre (poetry)")];

/// Strips the OpenAlex URL prefix from an id.
pub fn short_id(id: &str) -> String { id.strip_prefix(OPENALEX_PREFIX).unwrap_or(id).to_string() }

/// External ids of a concept or topic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EntityIds {
  /// Wikidata URL
  #[serde(default)]
  pub wikidata:  Option<String>,
  /// Wikipedia URL
  #[serde(default)]
  pub wikipedia: Option<String>,
}

/// A reference from one concept to another.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConceptRef {
  /// OpenAlex id
  pub id:           String,
  /// Display name
  #[serde(default)]
  pub display_name: Option<String>,
  /// Level of the referenced concept
  #[serde(default)]
  pub level:        Option<i64>,
}

/// An OpenAlex concept.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Concept {
  /// OpenAlex id
  pub id:               String,
  /// Display name
  pub display_name:     String,
  /// Depth in the concept DAG, 0 being the broadest
  pub level:            i64,
  /// External ids
  #[serde(default)]
  pub ids:              EntityIds,
  /// Number of works tagged
  #[serde(default)]
  pub works_count:      Option<i64>,
  /// Every ancestor, at every level
  #[serde(default)]
  pub ancestors:        Vec<ConceptRef>,
  /// Related concepts
  #[serde(default)]
  pub related_concepts: Vec<ConceptRef>,
}

impl Concept {
  /// Direct parents: ancestors one level up.
  pub fn parents(&self) -> impl Iterator<Item = &ConceptRef> {
    self.ancestors.iter().filter(move |a| a.level == Some(self.level - 1))
  }

  /// Siblings: related concepts on the same level.
  pub fn siblings(&self) -> impl Iterator<Item = &ConceptRef> {
    self.related_concepts.iter().filter(move |r| r.level == Some(self.level))
  }
}

/// A node of the topic tree above topic level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TopicLevel {
  /// OpenAlex id
  pub id:           String,
  /// Display name
  pub display_name: String,
}

/// A sibling reference of a topic.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TopicRef {
  /// OpenAlex id
  pub id:           String,
  /// Display name
  #[serde(default)]
  pub display_name: Option<String>,
}

/// An OpenAlex topic with its place in the tree.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Topic {
  /// OpenAlex id
  pub id:             String,
  /// Display name
  pub display_name:   String,
  /// Free-text description
  #[serde(default)]
  pub description:    Option<String>,
  /// Keywords
  #[serde(default)]
  pub keywords:       Vec<String>,
  /// External ids
  #[serde(default)]
  pub ids:            EntityIds,
  /// Number of works tagged
  #[serde(default)]
  pub works_count:    Option<i64>,
  /// Citations to tagged works
  #[serde(default)]
  pub cited_by_count: Option<i64>,
  /// Topics sharing the subfield
  #[serde(default)]
  pub siblings:       Vec<TopicRef>,
  /// Level 0
  pub domain:         TopicLevel,
  /// Level 1
  pub field:          TopicLevel,
  /// Level 2
  pub subfield:       TopicLevel,
}

fn text(value: &str) -> Value { Value::Text(value.to_string()) }

fn opt_text(value: Option<&str>) -> Value { Value::from(value.map(str::to_string)) }

/// Node and edge-list tables of the concept vocabulary.
///
/// Returns `concepts_nodes`, `concepts_edgelist_parents` and `concepts_edgelist_siblings`.
pub fn concept_tables(concepts: &[Concept]) -> Result<Vec<(String, Table)>, BibnetError> {
  let mut nodes = Table::new([
    "category_id",
    "display_name",
    "level",
    "wikidata",
    "wikipedia",
    "works_count",
    "nb_parents",
    "nb_siblings",
  ]);
  let mut parents = Table::new(["category_id", "parent", "nb_parents"]);
  let mut siblings = Table::new(["category_id", "sibling", "nb_siblings"]);

  for concept in concepts {
    let id = short_id(&concept.id);
    let direct: Vec<&ConceptRef> = concept.parents().collect();
    let related: Vec<&ConceptRef> = concept.siblings().collect();
    nodes.push(vec![
      text(&id),
      text(&concept.display_name),
      Value::Integer(concept.level),
      opt_text(concept.ids.wikidata.as_deref()),
      opt_text(concept.ids.wikipedia.as_deref()),
      Value::from(concept.works_count),
      Value::Integer(direct.len() as i64),
      Value::Integer(related.len() as i64),
    ])?;
    for parent in &direct {
      parents.push(vec![text(&id), text(&short_id(&parent.id)), Value::Integer(direct.len() as i64)])?;
    }
    for sibling in &related {
      siblings.push(vec![text(&id), text(&short_id(&sibling.id)), Value::Integer(related.len() as i64)])?;
    }
  }

  Ok(vec![
    ("concepts_nodes".to_string(), nodes),
    ("concepts_edgelist_parents".to_string(), parents),
    ("concepts_edgelist_siblings".to_string(), siblings),
  ])
}

/// Node and edge-list tables of the topic tree, including the domain, field and subfield nodes.
///
/// Returns `topics_nodes`, `topics_edgelist_parents` and `topics_edgelist_siblings`.
pub fn topic_tables(topics: &[Topic]) -> Result<Vec<(String, Table)>, BibnetError> {
  let mut nodes = Table::new([
    "category_id",
    "display_name",
    "level",
    "description",
    "works_count",
    "cited_by_count",
    "wikipedia",
    "domain_id",
    "field_id",
    "subfield_id",
  ]);
  let mut parents = Table::new(["category_id", "parent", "nb_parents"]);
  let mut siblings = Table::new(["category_id", "sibling", "nb_siblings"]);
  let mut seen = HashSet::new();

  for topic in topics {
    let id = short_id(&topic.id);
    let domain = short_id(&topic.domain.id);
    let field = short_id(&topic.field.id);
    let subfield = short_id(&topic.subfield.id);

    let tree = [
      (&topic.domain, 0, None, [Some(&domain), None, None]),
      (&topic.field, 1, Some(&domain), [Some(&domain), Some(&field), None]),
      (&topic.subfield, 2, Some(&field), [Some(&domain), Some(&field), Some(&subfield)]),
    ];
    for (node, level, parent, path) in tree {
      let node_id = short_id(&node.id);
      if !seen.insert(node_id.clone()) {
        continue;
      }
      nodes.push(vec![
        text(&node_id),
        text(&node.display_name),
        Value::Integer(level),
        Value::Null,
        Value::Null,
        Value::Null,
        Value::Null,
        opt_text(path[0].map(String::as_str)),
        opt_text(path[1].map(String::as_str)),
        opt_text(path[2].map(String::as_str)),
      ])?;
      if let Some(parent) = parent {
        parents.push(vec![text(&node_id), text(parent), Value::Integer(1)])?;
      }
    }

    if !seen.insert(id.clone()) {
      continue;
    }
    nodes.push(vec![
      text(&id),
      text(&topic.display_name),
      Value::Integer(3),
      opt_text(topic.description.as_deref()),
      Value::from(topic.works_count),
      Value::from(topic.cited_by_count),
      opt_text(topic.ids.wikipedia.as_deref()),
      text(&domain),
      text(&field),
      text(&subfield),
    ])?;
    parents.push(vec![text(&id), text(&subfield), Value::Integer(1)])?;
    for sibling in &topic.siblings {
      siblings.push(vec![
        text(&id),
        text(&short_id(&sibling.id)),
        Value::Integer(topic.siblings.len() as i64),
      ])?;
    }
  }

  Ok(vec![
    ("topics_nodes".to_string(), nodes),
    ("topics_edgelist_parents".to_string(), parents),
    ("topics_edgelist_siblings".to_string(), siblings),
  ])
}

/// One ancestry chain of a category.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyRow {
  /// Category id
  pub category_id:   String,
  /// Level of the category
  pub level:         i64,
  /// Display name, after disambiguation
  pub display_name:  String,
  /// Name harvested tags are matched against
  pub match_name:    String,
  /// Ancestor id per level (`parents[k]` is the level-k ancestor); `None` for `N/A`
  pub parents:       Vec<Option<String>>,
  /// Display name of each ancestor
  pub parent_names:  Vec<Option<String>>,
  /// Distinct ancestors per level across all chains of this category
  pub parent_counts: Vec<i64>,
}

/// Categories sharing one level-1 ancestor, the unit of citation normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
  /// Level-1 ancestor id
  pub parent_id:     String,
  /// Level-1 ancestor display name
  pub parent_name:   String,
  /// Distinct match names of the member categories, sorted
  pub members:       Vec<String>,
  /// Distinct member categories
  pub nb_categories: usize,
}

/// Flattened classification hierarchy with lookup by display name.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyHierarchy {
  depth:   usize,
  rows:    Vec<HierarchyRow>,
  by_name: HashMap<String, Vec<usize>>,
}

/// A node as the hierarchy builder sees it.
struct Node {
  level:        i64,
  display_name: String,
  match_name:   String,
}

impl TaxonomyHierarchy {
  /// Builds the two-level concept hierarchy, after display-name disambiguation.
  pub fn from_concepts(concepts: &[Concept]) -> Self {
    let mut nodes = BTreeMap::new();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for concept in concepts {
      let id = short_id(&concept.id);
      if DUPLICATED_CONCEPTS.contains(&id.as_str()) {
        continue;
      }
      let display_name = RENAMED_CONCEPTS
        .iter()
        .find(|(renamed, _)| *renamed == id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| concept.display_name.clone());
      edges.insert(id.clone(), concept.parents().map(|p| short_id(&p.id)).collect());
      nodes.insert(id, Node { level: concept.level, display_name, match_name: concept.display_name.clone() });
    }
    Self::build(2, nodes, &edges)
  }

  /// Builds the three-level topic hierarchy.
  pub fn from_topics(topics: &[Topic]) -> Self {
    let mut nodes = BTreeMap::new();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for topic in topics {
      let chain = [
        (short_id(&topic.domain.id), &topic.domain.display_name),
        (short_id(&topic.field.id), &topic.field.display_name),
        (short_id(&topic.subfield.id), &topic.subfield.display_name),
        (short_id(&topic.id), &topic.display_name),
      ];
      for (level, (id, name)) in chain.iter().enumerate() {
        nodes.entry(id.clone()).or_insert_with(|| Node {
          level:        level as i64,
          display_name: name.to_string(),
          match_name:   name.to_string(),
        });
        if level > 0 {
          let parents = edges.entry(id.clone()).or_default();
          if !parents.contains(&chain[level - 1].0) {
            parents.push(chain[level - 1].0.clone());
          }
        }
      }
    }
    Self::build(3, nodes, &edges)
  }

  fn build(depth: usize, nodes: BTreeMap<String, Node>, edges: &HashMap<String, Vec<String>>) -> Self {
    let mut rows = Vec::new();
    for (id, node) in &nodes {
      let mut chains: Vec<Vec<Option<String>>> = Vec::new();
      collect_chains(id, &nodes, edges, depth, vec![None; depth], &mut chains, 0);
      chains.dedup();
      let mut counts = vec![0i64; depth];
      for (k, count) in counts.iter_mut().enumerate() {
        let distinct: HashSet<&Option<String>> = chains.iter().map(|c| &c[k]).filter(|p| p.is_some()).collect();
        *count = distinct.len() as i64;
      }
      for parents in chains {
        let parent_names = parents
          .iter()
          .map(|p| p.as_ref().and_then(|p| nodes.get(p)).map(|n| n.display_name.clone()))
          .collect();
        rows.push(HierarchyRow {
          category_id: id.clone(),
          level: node.level,
          display_name: node.display_name.clone(),
          match_name: node.match_name.clone(),
          parents,
          parent_names,
          parent_counts: counts.clone(),
        });
      }
    }
    Self::from_rows(depth, rows)
  }

  fn from_rows(depth: usize, rows: Vec<HierarchyRow>) -> Self {
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
      by_name.entry(row.match_name.clone()).or_default().push(i);
    }
    Self { depth, rows, by_name }
  }

  /// Number of ancestor levels kept.
  pub fn depth(&self) -> usize { self.depth }

  /// All rows.
  pub fn rows(&self) -> &[HierarchyRow] { &self.rows }

  /// Rows whose match name equals `name`.
  pub fn lookup(&self, name: &str) -> Vec<&HierarchyRow> {
    self.by_name.get(name).map(|idx| idx.iter().map(|&i| &self.rows[i]).collect()).unwrap_or_default()
  }

  /// Categories below level 0 grouped by their level-1 ancestor, in ancestor id order.
  ///
  /// A category with several level-1 ancestors belongs to each of their groups.
  pub fn field_groups(&self) -> Vec<FieldGroup> {
    let mut groups: BTreeMap<&str, (Option<&str>, BTreeSet<&str>, HashSet<&str>)> = BTreeMap::new();
    for row in self.rows.iter().filter(|row| row.level > 0) {
      let Some(parent) = row.parents.get(1).and_then(Option::as_deref) else {
        continue;
      };
      let (name, members, ids) = groups.entry(parent).or_default();
      if name.is_none() {
        *name = row.parent_names.get(1).and_then(Option::as_deref);
      }
      members.insert(row.match_name.as_str());
      ids.insert(row.category_id.as_str());
    }
    groups
      .into_iter()
      .map(|(parent, (name, members, ids))| FieldGroup {
        parent_id:     parent.to_string(),
        parent_name:   name.unwrap_or(parent).to_string(),
        members:       members.into_iter().map(str::to_string).collect(),
        nb_categories: ids.len(),
      })
      .collect()
  }

  /// Column layout of the flattened hierarchy for `depth` levels.
  pub fn columns(depth: usize) -> Vec<String> {
    let mut columns: Vec<String> =
      ["category_id", "level", "display_name", "match_name"].iter().map(|c| c.to_string()).collect();
    for k in 0..depth {
      columns.push(format!("parent_{k}"));
      columns.push(format!("display_name_{k}"));
    }
    for k in 0..depth {
      columns.push(format!("nb_parent_{k}"));
    }
    columns
  }

  /// Cells of one row in [`TaxonomyHierarchy::columns`] order, after its category columns.
  pub fn parent_cells(&self, row: &HierarchyRow) -> Vec<Value> {
    let mut cells = Vec::with_capacity(self.depth * 3);
    for k in 0..self.depth {
      cells.push(text(row.parents[k].as_deref().unwrap_or(NOT_APPLICABLE)));
      cells.push(opt_text(row.parent_names[k].as_deref()));
    }
    cells.extend(row.parent_counts.iter().map(|c| Value::Integer(*c)));
    cells
  }

  /// The hierarchy as a table (`concepts_hierarchy` or `topics_hierarchy`).
  pub fn to_table(&self) -> Result<Table, BibnetError> {
    let mut table = Table::new(Self::columns(self.depth));
    for row in &self.rows {
      let mut cells = vec![
        text(&row.category_id),
        Value::Integer(row.level),
        text(&row.display_name),
        text(&row.match_name),
      ];
      cells.extend(self.parent_cells(row));
      table.push(cells)?;
    }
    Ok(table)
  }

  /// Restores a hierarchy written with [`TaxonomyHierarchy::to_table`].
  pub fn from_table(table: &Table) -> Result<Self, BibnetError> {
    let depth = table.columns().iter().filter(|c| c.starts_with("parent_")).count();
    let id = table.column_index("category_id")?;
    let level = table.column_index("level")?;
    let display = table.column_index("display_name")?;
    let matched = table.column_index("match_name")?;
    let mut parent_columns = Vec::with_capacity(depth);
    for k in 0..depth {
      parent_columns.push((
        table.column_index(&format!("parent_{k}"))?,
        table.column_index(&format!("display_name_{k}"))?,
        table.column_index(&format!("nb_parent_{k}"))?,
      ));
    }

    let mut rows = Vec::with_capacity(table.len());
    for cells in table.rows() {
      let category_id = as_text(&cells[id])
        .ok_or_else(|| BibnetError::MalformedResponse("hierarchy row without category_id".into()))?;
      rows.push(HierarchyRow {
        category_id:   category_id.to_string(),
        level:         as_integer(&cells[level]).unwrap_or_default(),
        display_name:  as_text(&cells[display]).unwrap_or_default().to_string(),
        match_name:    as_text(&cells[matched]).unwrap_or_default().to_string(),
        parents:       parent_columns
          .iter()
          .map(|(p, _, _)| as_text(&cells[*p]).filter(|v| *v != NOT_APPLICABLE).map(str::to_string))
          .collect(),
        parent_names:  parent_columns.iter().map(|(_, n, _)| as_text(&cells[*n]).map(str::to_string)).collect(),
        parent_counts: parent_columns.iter().map(|(_, _, c)| as_integer(&cells[*c]).unwrap_or_default()).collect(),
      });
    }
    Ok(Self::from_rows(depth, rows))
  }
}

/// Walks parent edges upward, recording each path's ancestor at every kept level.
///
/// `guard` bounds the walk in case the edge list contains a cycle.
fn collect_chains(
  id: &str,
  nodes: &BTreeMap<String, Node>,
  edges: &HashMap<String, Vec<String>>,
  depth: usize,
  mut path: Vec<Option<String>>,
  chains: &mut Vec<Vec<Option<String>>>,
  guard: usize,
) {
  if let Some(node) = nodes.get(id) {
    if let Ok(level) = usize::try_from(node.level) {
      if level < depth {
        path[level] = Some(id.to_string());
      }
    }
  }
  let parents: Vec<&String> =
    edges.get(id).map(|p| p.iter().filter(|p| nodes.contains_key(*p)).collect()).unwrap_or_default();
  if parents.is_empty() || guard > 8 {
    if !chains.contains(&path) {
      chains.push(path);
    }
    return;
  }
  for parent in parents {
    collect_chains(parent, nodes, edges, depth, path.clone(), chains, guard + 1);
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  fn concept(id: &str, name: &str, level: i64, parents: &[(&str, i64)]) -> Concept {
    Concept {
      id:               format!("{OPENALEX_PREFIX}{id}"),
      display_name:     name.to_string(),
      level,
      ids:              EntityIds::default(),
      works_count:      None,
      ancestors:        parents
        .iter()
        .map(|(p, l)| ConceptRef { id: format!("{OPENALEX_PREFIX}{p}"), display_name: None, level: Some(*l) })
        .collect(),
      related_concepts: Vec::new(),
    }
  }

  pub(crate) fn sample_concepts() -> Vec<Concept> {
    vec![
      concept("C1", "Physics", 0, &[]),
      concept("C2", "Chemistry", 0, &[]),
      concept("C10", "Quantum mechanics", 1, &[("C1", 0)]),
      concept("C11", "Physical chemistry", 1, &[("C1", 0), ("C2", 0)]),
      concept("C100", "Graphene", 2, &[("C10", 1), ("C11", 1), ("C1", 0), ("C2", 0)]),
      concept("C151011524", "Metre", 1, &[("C1", 0)]),
      concept("C21036866", "Graphene", 3, &[("C100", 2)]),
    ]
  }

  pub(crate) fn sample_topics() -> Vec<Topic> {
    serde_json::from_value(json!([
      {
        "id": "https://openalex.org/T1", "display_name": "Graphene synthesis",
        "siblings": [{"id": "https://openalex.org/T2"}],
        "domain": {"id": "https://openalex.org/domains/3", "display_name": "Physical Sciences"},
        "field": {"id": "https://openalex.org/fields/25", "display_name": "Materials Science"},
        "subfield": {"id": "https://openalex.org/subfields/2505", "display_name": "Materials Chemistry"}
      },
      {
        "id": "https://openalex.org/T2", "display_name": "Carbon nanotubes",
        "domain": {"id": "https://openalex.org/domains/3", "display_name": "Physical Sciences"},
        "field": {"id": "https://openalex.org/fields/25", "display_name": "Materials Science"},
        "subfield": {"id": "https://openalex.org/subfields/2505", "display_name": "Materials Chemistry"}
      }
    ]))
    .unwrap()
  }

  #[test]
  fn test_concept_hierarchy_fans_out_over_parents() {
    let hierarchy = TaxonomyHierarchy::from_concepts(&sample_concepts());
    assert_eq!(hierarchy.depth(), 2);

    let physics = hierarchy.lookup("Physics");
    assert_eq!(physics.len(), 1);
    assert_eq!(physics[0].parents, vec![Some("C1".to_string()), None]);

    let chemistry = hierarchy.lookup("Physical chemistry");
    assert_eq!(chemistry.len(), 2);
    assert!(chemistry.iter().all(|row| row.parents[1].as_deref() == Some("C11")));
    assert_eq!(chemistry[0].parent_counts, vec![2, 1]);

    let graphene = hierarchy.lookup("Graphene");
    let chains: HashSet<(Option<String>, Option<String>)> =
      graphene.iter().map(|r| (r.parents[0].clone(), r.parents[1].clone())).collect();
    assert_eq!(chains.len(), 3);
    assert!(graphene.iter().all(|r| r.category_id == "C100"));
  }

  #[test]
  fn test_concept_duplicates_are_corrected() {
    let hierarchy = TaxonomyHierarchy::from_concepts(&sample_concepts());
    assert!(hierarchy.rows().iter().all(|r| r.category_id != "C21036866"));
    let metre = hierarchy.lookup("Metre");
    assert_eq!(metre[0].display_name, "Metre (SI)");
  }

  #[test]
  fn test_topic_hierarchy() {
    let hierarchy = TaxonomyHierarchy::from_topics(&sample_topics());
    assert_eq!(hierarchy.depth(), 3);
    let row = hierarchy.lookup("Carbon nanotubes")[0];
    assert_eq!(row.level, 3);
    assert_eq!(row.parents, vec![
      Some("domains/3".to_string()),
      Some("fields/25".to_string()),
      Some("subfields/2505".to_string())
    ]);
    assert_eq!(row.parent_names[1].as_deref(), Some("Materials Science"));

    let field = hierarchy.lookup("Materials Science")[0];
    assert_eq!(field.parents[2], None);
  }

  #[test]
  fn test_hierarchy_table_roundtrip() {
    let hierarchy = TaxonomyHierarchy::from_concepts(&sample_concepts());
    let table = hierarchy.to_table().unwrap();
    assert_eq!(table.get(0, "parent_1"), Some(&Value::Text(NOT_APPLICABLE.into())));

    let restored = TaxonomyHierarchy::from_table(&table).unwrap();
    assert_eq!(restored.depth(), 2);
    assert_eq!(restored.rows(), hierarchy.rows());
  }

  #[test]
  fn test_field_groups() {
    let groups = TaxonomyHierarchy::from_concepts(&sample_concepts()).field_groups();
    let parents: Vec<&str> = groups.iter().map(|g| g.parent_id.as_str()).collect();
    assert_eq!(parents, vec!["C10", "C11", "C151011524"]);

    assert_eq!(groups[0].parent_name, "Quantum mechanics");
    assert_eq!(groups[0].members, vec!["Graphene".to_string(), "Quantum mechanics".to_string()]);
    assert_eq!(groups[0].nb_categories, 2);
    assert_eq!(groups[2].parent_name, "Metre (SI)");
    assert_eq!(groups[2].members, vec!["Metre".to_string()]);

    assert!(TaxonomyHierarchy::default().field_groups().is_empty());
  }

  #[test]
  fn test_vocabulary_tables() {
    let tables = concept_tables(&sample_concepts()).unwrap();
    assert_eq!(tables[0].0, "concepts_nodes");
    assert_eq!(tables[0].1.len(), 7);
    // C11 -> C1, C2; C100 -> C10, C11; C10, Metre -> C1; C21036866 -> C100
    assert_eq!(tables[1].1.len(), 7);

    let tables = topic_tables(&sample_topics()).unwrap();
    assert_eq!(tables[0].1.len(), 5);
    assert_eq!(tables[1].1.len(), 4);
    assert_eq!(tables[2].1.len(), 1);
  }
}
