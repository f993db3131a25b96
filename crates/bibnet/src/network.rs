//! Organisation collaboration network derived from co-authorship.
//!
//! Every record distributes one unit of collaboration mass over the organisation pairs its
//! authors span. Pairs are formed between contributions, not affiliations: two authors of the
//! same record link every organisation of the first to every organisation of the second.
//!
//! - A contribution pair whose organisation sets are disjoint is *external*. Its pairs become
//!   edges between distinct organisations.
//! - A contribution pair sharing an organisation is *internal*. Only its self-loops survive.
//!   Cross pairs inside an internal contribution pair come from joint appointments and are
//!   discarded.
//!
//! Records with more authors than the team-size ceiling are left out, as they say little about
//! institutional collaboration.
//!
//! # Examples
//!
//! ```
//! use bibnet::{network::NetworkBuilder, normalize::normalize};
//! use serde_json::json;
//!
//! let tables = normalize(&[json!({
//!   "lens_id": "r1",
//!   "authors": [
//!     {"affiliations": [{"name": "Alpha", "country_code": "FR"}]},
//!     {"affiliations": [{"name": "Beta", "country_code": "DE"}]}
//!   ]
//! })])
//! .unwrap();
//!
//! let network = NetworkBuilder::default().build(&tables);
//! assert_eq!(network.edges.len(), 1);
//! assert!(network.edges[0].is_external);
//! assert_eq!(network.nodes.len(), 2);
//! ```

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::*;
use crate::normalize::NormalizedTables;

/// Default ceiling on the number of authors of a record.
pub const DEFAULT_MAX_TEAM_SIZE: i64 = 20;

/// Default seed of the record sample.
pub const DEFAULT_SEED: u64 = 42;

/// A weighted link between two organisations.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
  /// Smaller organisation id of the pair
  pub from:        i64,
  /// Larger organisation id of the pair
  pub to:          i64,
  /// Whether the pair came from authors with disjoint affiliations
  pub is_external: bool,
  /// Collaboration mass summed over records
  pub weight:      f64,
}

impl TableRow for Edge {
  const COLUMNS: &'static [&'static str] = &["from", "to", "is_ext", "weight"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.from),
      Value::Integer(self.to),
      Value::from(self.is_external),
      Value::Real(self.weight),
    ]
  }
}

/// An organisation taking part in at least one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  /// Organisation
  pub org_id:           i64,
  /// Organisation name
  pub name:             String,
  /// Organisation country
  pub country_code:     String,
  /// Fractional contribution count
  pub nb_contributions: f64,
  /// Distinct records
  pub nb_records:       i64,
}

impl TableRow for Node {
  const COLUMNS: &'static [&'static str] =
    &["org_id", "name", "country_code", "nb_contributions", "nb_records"];

  fn values(&self) -> Vec<Value> {
    vec![
      Value::Integer(self.org_id),
      Value::Text(self.name.clone()),
      Value::Text(self.country_code.clone()),
      Value::Real(self.nb_contributions),
      Value::Integer(self.nb_records),
    ]
  }
}

/// Edge and node lists of a collaboration network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaborationNetwork {
  /// Edges, heaviest first
  pub edges: Vec<Edge>,
  /// Nodes, by organisation id
  pub nodes: Vec<Node>,
}

impl CollaborationNetwork {
  /// The network as `net_org_edges` and `net_org_nodes`.
  pub fn tables(&self) -> Vec<(String, Table)> {
    vec![
      ("net_org_edges".to_string(), Table::from_rows(&self.edges)),
      ("net_org_nodes".to_string(), Table::from_rows(&self.nodes)),
    ]
  }
}

/// Builds collaboration networks from normalized tables.
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
  max_team_size: i64,
  sample_size:   Option<usize>,
  seed:          u64,
}

impl Default for NetworkBuilder {
  fn default() -> Self { Self { max_team_size: DEFAULT_MAX_TEAM_SIZE, sample_size: None, seed: DEFAULT_SEED } }
}

type EdgeKey = (i64, i64, bool);

impl NetworkBuilder {
  /// Records with more authors than `max_team_size` are excluded.
  pub fn with_max_team_size(mut self, max_team_size: i64) -> Self {
    self.max_team_size = max_team_size;
    self
  }

  /// Restricts the network to a uniform sample of `sample_size` records.
  pub fn with_sample_size(mut self, sample_size: Option<usize>) -> Self {
    self.sample_size = sample_size;
    self
  }

  /// Seed of the record sample.
  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  /// Record ids kept after the team-size ceiling and sampling.
  fn eligible_records<'a>(&self, tables: &'a NormalizedTables) -> BTreeSet<&'a str> {
    let eligible: BTreeSet<&str> = tables
      .records
      .iter()
      .filter(|r| r.nb_authors <= self.max_team_size)
      .map(|r| r.record_id.as_str())
      .collect();
    let excluded = tables.records.len() - eligible.len();
    if excluded > 0 {
      debug!("Excluding {excluded} records above {} authors", self.max_team_size);
    }

    match self.sample_size {
      Some(size) if size < eligible.len() => {
        let ids: Vec<&str> = eligible.into_iter().collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        ids.choose_multiple(&mut rng, size).copied().collect()
      },
      _ => eligible,
    }
  }

  /// Builds the network.
  pub fn build(&self, tables: &NormalizedTables) -> CollaborationNetwork {
    let records = self.eligible_records(tables);

    let mut contributions: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    let mut record_of: HashMap<i64, &str> = HashMap::new();
    for contribution in &tables.contributions {
      if let Some(&record_id) = records.get(contribution.record_id.as_str()) {
        contributions.entry(record_id).or_default().push(contribution.contribution_id);
        record_of.insert(contribution.contribution_id, record_id);
      }
    }

    let mut orgs: HashMap<i64, BTreeSet<i64>> = HashMap::new();
    let mut affiliation_counts: HashMap<i64, usize> = HashMap::new();
    for affiliation in tables.affiliations.iter().filter(|a| record_of.contains_key(&a.contribution_id)) {
      orgs.entry(affiliation.contribution_id).or_default().insert(affiliation.org_id);
      *affiliation_counts.entry(affiliation.contribution_id).or_default() += 1;
    }

    let mut weights: BTreeMap<EdgeKey, f64> = BTreeMap::new();
    for (record_id, members) in &contributions {
      let record_weights = record_weights(members, &orgs);
      let total: f64 = record_weights.values().sum();
      if total <= 0.0 {
        continue;
      }
      trace!("{record_id}: {} pairs", record_weights.len());
      for (key, weight) in record_weights {
        *weights.entry(key).or_default() += weight / total;
      }
    }

    let mut edges: Vec<Edge> = weights
      .into_iter()
      .map(|((from, to, is_external), weight)| Edge { from, to, is_external, weight })
      .collect();
    edges.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let linked: BTreeSet<i64> = edges.iter().flat_map(|e| [e.from, e.to]).collect();
    let mut shares: BTreeMap<i64, (f64, HashSet<&str>)> = BTreeMap::new();
    for affiliation in tables.affiliations.iter().filter(|a| linked.contains(&a.org_id)) {
      let (Some(&record_id), Some(&count)) =
        (record_of.get(&affiliation.contribution_id), affiliation_counts.get(&affiliation.contribution_id))
      else {
        continue;
      };
      let (share, seen) = shares.entry(affiliation.org_id).or_default();
      *share += 1.0 / count as f64;
      seen.insert(record_id);
    }

    let nodes = tables
      .organisations
      .iter()
      .filter_map(|org| {
        shares.get(&org.org_id).map(|(share, seen)| Node {
          org_id:           org.org_id,
          name:             org.name.clone(),
          country_code:     org.country_code.clone(),
          nb_contributions: *share,
          nb_records:       seen.len() as i64,
        })
      })
      .collect::<Vec<_>>();

    info!(
      "Collaboration network over {} records: {} edges, {} nodes",
      contributions.len(),
      edges.len(),
      nodes.len()
    );
    CollaborationNetwork { edges, nodes }
  }
}

/// Unnormalized pair weights of one record, joint appointments removed.
fn record_weights(members: &[i64], orgs: &HashMap<i64, BTreeSet<i64>>) -> BTreeMap<EdgeKey, f64> {
  let n = members.len() as f64;
  let combinations = n * (n - 1.0) / 2.0;
  let empty = BTreeSet::new();

  let mut weights = BTreeMap::new();
  for (i, left) in members.iter().enumerate() {
    for right in &members[i + 1..] {
      let left_orgs = orgs.get(left).unwrap_or(&empty);
      let right_orgs = orgs.get(right).unwrap_or(&empty);
      let is_external = left_orgs.is_disjoint(right_orgs);

      let rows: Vec<(i64, i64)> = left_orgs
        .iter()
        .flat_map(|a| right_orgs.iter().map(move |b| (*a.min(b), *a.max(b))))
        .collect();
      let nb_pairs = rows.iter().collect::<HashSet<_>>().len();
      let weight = if nb_pairs > 1 { combinations * nb_pairs as f64 } else { combinations };

      for (from, to) in rows {
        if !is_external && from != to {
          continue;
        }
        *weights.entry((from, to, is_external)).or_default() += weight;
      }
    }
  }
  weights
}
