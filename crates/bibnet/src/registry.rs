//! Organisation registry model and identity resolution.
//!
//! The registry dump is a list of [`RegistryEntry`] documents, each describing one research
//! organisation with its names, statuses, external identifiers (GRID, ISNI, Wikidata, ...),
//! geographic locations and relationships to other organisations.
//!
//! Two things are built from a dump:
//! - the baseline tables (`ror`, `ror_location`, ...) written once per baseline version, see
//!   [`baseline_tables`]
//! - a [`RegistryIndex`] mapping `(identifier type, value)` pairs to registry ids, used by the
//!   normalizer to attach locations to harvested organisations
//!
//! Only active entries ever resolve. An identifier carried by an inactive or withdrawn entry is
//! simply absent from the index.
//!
//! # Examples
//!
//! ```
//! use bibnet::registry::{RegistryEntry, RegistryIndex};
//!
//! let entries: Vec<RegistryEntry> = serde_json::from_str(
//!   r#"[{"id": "https://ror.org/01abc", "status": "active",
//!        "names": [{"value": "Example University", "types": ["ror_display"]}],
//!        "external_ids": [{"type": "grid", "all": ["grid.1.1"]}]}]"#,
//! )
//! .unwrap();
//!
//! let index = RegistryIndex::new(&entries);
//! assert_eq!(index.resolve("grid", "grid.1.1"), ["https://ror.org/01abc".to_string()]);
//! assert_eq!(index.resolve("ror", "01abc"), ["https://ror.org/01abc".to_string()]);
//! ```

use super::*;
use crate::store::{as_integer, as_real, as_text, validate_identifier, TabularStore};

/// Registry identifiers are full URLs such as `https://ror.org/01abc`.
pub type RegistryId = String;

/// Prefix stripped from registry ids when indexing them as `ror` identifiers.
const REGISTRY_PREFIX: &str = "https://ror.org/";

/// Lifecycle status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryStatus {
  /// In use
  Active,
  /// Ceased to exist or merged away
  Inactive,
  /// Removed from the registry
  Withdrawn,
  /// Any status this version does not know; never resolves
  #[serde(other)]
  Unknown,
}

impl RegistryStatus {
  /// The status as it appears in the dump.
  pub fn as_str(&self) -> &'static str {
    match self {
      RegistryStatus::Active => "active",
      RegistryStatus::Inactive => "inactive",
      RegistryStatus::Withdrawn => "withdrawn",
      RegistryStatus::Unknown => "unknown",
    }
  }
}

/// One organisation name with its roles (`ror_display`, `acronym`, `alias`, `label`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryName {
  /// The name itself
  pub value: String,
  /// Roles of this name
  #[serde(default)]
  pub types: Vec<String>,
  /// Language code, when known
  #[serde(default)]
  pub lang:  Option<String>,
}

/// Identifiers of one scheme carried by an entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExternalId {
  /// Scheme (`grid`, `isni`, `wikidata`, `fundref`)
  #[serde(rename = "type")]
  pub kind:      String,
  /// Every value in this scheme
  #[serde(default)]
  pub all:       Vec<String>,
  /// The preferred value, if one is flagged
  #[serde(default)]
  pub preferred: Option<String>,
}

impl ExternalId {
  /// All values, deduplicated, with the preferred value included.
  pub fn values(&self) -> Vec<&str> {
    let mut values: Vec<&str> = Vec::with_capacity(self.all.len() + 1);
    for value in self.all.iter().chain(self.preferred.iter()) {
      if !values.contains(&value.as_str()) {
        values.push(value);
      }
    }
    values
  }
}

/// GeoNames details of a location.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GeonamesDetails {
  /// ISO 3166 country code
  #[serde(default)]
  pub country_code: Option<String>,
  /// Country name
  #[serde(default)]
  pub country_name: Option<String>,
  /// Latitude
  #[serde(default)]
  pub lat:          Option<f64>,
  /// Longitude
  #[serde(default)]
  pub lng:          Option<f64>,
  /// Place name
  #[serde(default)]
  pub name:         Option<String>,
}

/// A location reference of an entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryLocation {
  /// GeoNames id of the place
  pub geonames_id:      i64,
  /// Place details
  #[serde(default)]
  pub geonames_details: GeonamesDetails,
}

/// A typed link to another entry (`parent`, `child`, `related`, `successor`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Relationship {
  /// Relationship type
  #[serde(rename = "type")]
  pub kind:  String,
  /// Target registry id
  pub id:    RegistryId,
  /// Display name of the target
  #[serde(default)]
  pub label: Option<String>,
}

/// A web link (`website` or `wikipedia`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Link {
  /// Link type
  #[serde(rename = "type")]
  pub kind:  String,
  /// URL
  pub value: String,
}

/// Date and schema version of an administrative event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AdminStamp {
  /// ISO date
  #[serde(default)]
  pub date:           Option<String>,
  /// Schema version the entry was written with
  #[serde(default)]
  pub schema_version: Option<String>,
}

/// Creation and last modification stamps.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Admin {
  /// When the entry was created
  #[serde(default)]
  pub created:       AdminStamp,
  /// When the entry was last modified
  #[serde(default)]
  pub last_modified: AdminStamp,
}

/// One organisation of the registry dump.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryEntry {
  /// Registry id (primary key)
  pub id:            RegistryId,
  /// Lifecycle status
  pub status:        RegistryStatus,
  /// Names with their roles
  #[serde(default)]
  pub names:         Vec<RegistryName>,
  /// Organisation types, most significant first
  #[serde(default)]
  pub types:         Vec<String>,
  /// Founding year
  #[serde(default)]
  pub established:   Option<i64>,
  /// Identifiers in other schemes
  #[serde(default)]
  pub external_ids:  Vec<ExternalId>,
  /// Geographic locations
  #[serde(default)]
  pub locations:     Vec<RegistryLocation>,
  /// Links to other entries
  #[serde(default)]
  pub relationships: Vec<Relationship>,
  /// Web links
  #[serde(default)]
  pub links:         Vec<Link>,
  /// Internet domains
  #[serde(default)]
  pub domains:       Vec<String>,
  /// Administrative stamps
  #[serde(default)]
  pub admin:         Admin,
}

impl RegistryEntry {
  /// Whether the entry may be used for resolution.
  pub fn is_active(&self) -> bool { self.status == RegistryStatus::Active }

  fn name_of_type(&self, kind: &str) -> Option<&str> {
    self.names.iter().find(|n| n.types.iter().any(|t| t == kind)).map(|n| n.value.as_str())
  }

  /// The display name.
  pub fn display_name(&self) -> Option<&str> { self.name_of_type("ror_display") }

  /// The first acronym.
  pub fn acronym(&self) -> Option<&str> { self.name_of_type("acronym") }

  /// The first link of the given type.
  pub fn link(&self, kind: &str) -> Option<&str> {
    self.links.iter().find(|l| l.kind == kind).map(|l| l.value.as_str())
  }
}

/// A resolved geographic location.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
  /// GeoNames id
  pub geonames_id:  i64,
  /// Place name
  pub name:         Option<String>,
  /// ISO 3166 country code
  pub country_code: Option<String>,
  /// Country name
  pub country_name: Option<String>,
  /// Latitude
  pub lat:          Option<f64>,
  /// Longitude
  pub lng:          Option<f64>,
}

impl From<&RegistryLocation> for GeoLocation {
  fn from(location: &RegistryLocation) -> Self {
    let details = &location.geonames_details;
    Self {
      geonames_id:  location.geonames_id,
      name:         details.name.clone(),
      country_code: details.country_code.clone(),
      country_name: details.country_name.clone(),
      lat:          details.lat,
      lng:          details.lng,
    }
  }
}

/// Lookup from external identifiers to active registry entries and their locations.
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
  by_identifier: HashMap<(String, String), Vec<RegistryId>>,
  locations:     HashMap<RegistryId, Vec<GeoLocation>>,
}

impl RegistryIndex {
  /// Indexes the active entries of a dump.
  pub fn new(entries: &[RegistryEntry]) -> Self {
    let mut index = Self::default();
    for entry in entries.iter().filter(|e| e.is_active()) {
      index.insert_own_id(&entry.id);
      for external in &entry.external_ids {
        for value in external.values() {
          index.insert(&external.kind, value, &entry.id);
        }
      }
      let locations = index.locations.entry(entry.id.clone()).or_default();
      for location in &entry.locations {
        if !locations.iter().any(|l| l.geonames_id == location.geonames_id) {
          locations.push(GeoLocation::from(location));
        }
      }
    }
    debug!("Registry index holds {} identifiers", index.by_identifier.len());
    index
  }

  fn insert(&mut self, kind: &str, value: &str, id: &str) {
    let ids = self.by_identifier.entry((kind.to_string(), value.to_string())).or_default();
    if !ids.iter().any(|known| known == id) {
      ids.push(id.to_string());
    }
  }

  /// The registry id is itself an identifier of type `ror`, with and without its URL prefix.
  fn insert_own_id(&mut self, id: &str) {
    self.insert("ror", id, id);
    if let Some(short) = id.strip_prefix(REGISTRY_PREFIX) {
      self.insert("ror", short, id);
    }
  }

  /// Active registry ids carrying identifier `value` of scheme `kind`.
  pub fn resolve(&self, kind: &str, value: &str) -> &[RegistryId] {
    self
      .by_identifier
      .get(&(kind.to_string(), value.to_string()))
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  /// Locations of an active registry entry.
  pub fn locations(&self, id: &str) -> &[GeoLocation] {
    self.locations.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Number of indexed `(type, value)` pairs.
  pub fn len(&self) -> usize { self.by_identifier.len() }

  /// Whether nothing is indexed.
  pub fn is_empty(&self) -> bool { self.by_identifier.is_empty() }

  /// Rebuilds the index from baseline tables previously written with [`baseline_tables`].
  pub async fn from_store(store: &TabularStore, schema: &str) -> Result<Self, BibnetError> {
    validate_identifier(schema)?;
    let mut index = Self::default();

    let active = store.query(&format!("SELECT id FROM {schema}.ror WHERE status = 'active'")).await?;
    for row in active.rows() {
      if let Some(id) = as_text(&row[0]) {
        index.insert_own_id(id);
        index.locations.entry(id.to_string()).or_default();
      }
    }

    let ids = store
      .query(&format!(
        "SELECT B.id, A.type, A.value FROM {schema}.ror_external_id A INNER JOIN {schema}.ror B \
         ON A.id = B.id WHERE B.status = 'active'"
      ))
      .await?;
    for row in ids.rows() {
      if let (Some(id), Some(kind), Some(value)) = (as_text(&row[0]), as_text(&row[1]), as_text(&row[2])) {
        index.insert(kind, value, id);
      }
    }

    let places = store
      .query(&format!(
        "SELECT A.id, A.geonames_id, B.name, B.country_code, B.country_name, B.lat, B.lng \
         FROM {schema}.ror_location A INNER JOIN {schema}.ror_location_id B \
         ON A.geonames_id = B.geonames_id"
      ))
      .await?;
    for row in places.rows() {
      let (Some(id), Some(geonames_id)) = (as_text(&row[0]), as_integer(&row[1])) else { continue };
      let Some(locations) = index.locations.get_mut(id) else { continue };
      if locations.iter().any(|l| l.geonames_id == geonames_id) {
        continue;
      }
      locations.push(GeoLocation {
        geonames_id,
        name: as_text(&row[2]).map(str::to_string),
        country_code: as_text(&row[3]).map(str::to_string),
        country_name: as_text(&row[4]).map(str::to_string),
        lat: as_real(&row[5]),
        lng: as_real(&row[6]),
      });
    }

    info!("Restored registry index with {} identifiers", index.len());
    Ok(index)
  }
}

fn text(value: &str) -> Value { Value::Text(value.to_string()) }

fn opt_text(value: Option<&str>) -> Value { Value::from(value.map(str::to_string)) }

/// Flattens a dump into the registry baseline tables.
///
/// Produces `ror`, `ror_location`, `ror_location_id`, `ror_external_id`, `ror_names`,
/// `ror_relationships` and `ror_domains`, in that order.
pub fn baseline_tables(entries: &[RegistryEntry]) -> Result<Vec<(String, Table)>, BibnetError> {
  let mut ror = Table::new([
    "id",
    "ror_display",
    "acronym",
    "website",
    "wikipedia",
    "established",
    "status",
    "nb_types",
    "nb_relationships",
    "main_type",
    "second_type",
    "third_type",
    "created_date",
    "created_schema_version",
    "last_modified_date",
    "last_modified_schema_version",
  ]);
  let mut location = Table::new(["id", "geonames_id"]);
  let mut location_id = Table::new(["geonames_id", "country_code", "country_name", "lat", "lng", "name"]);
  let mut external_id = Table::new(["id", "type", "value", "preferred"]);
  let mut names = Table::new(["id", "value", "type", "lang"]);
  let mut relationships = Table::new(["from", "type", "to", "to_ror_display"]);
  let mut domains = Table::new(["id", "domain"]);
  let mut seen_places = HashSet::new();

  for entry in entries {
    let admin = &entry.admin;
    ror.push(vec![
      text(&entry.id),
      opt_text(entry.display_name()),
      opt_text(entry.acronym()),
      opt_text(entry.link("website")),
      opt_text(entry.link("wikipedia")),
      Value::from(entry.established),
      text(entry.status.as_str()),
      Value::Integer(entry.types.len() as i64),
      Value::Integer(entry.relationships.len() as i64),
      opt_text(entry.types.first().map(String::as_str)),
      opt_text(entry.types.get(1).map(String::as_str)),
      opt_text(entry.types.get(2).map(String::as_str)),
      opt_text(admin.created.date.as_deref()),
      opt_text(admin.created.schema_version.as_deref()),
      opt_text(admin.last_modified.date.as_deref()),
      opt_text(admin.last_modified.schema_version.as_deref()),
    ])?;

    for place in &entry.locations {
      location.push(vec![text(&entry.id), Value::Integer(place.geonames_id)])?;
      if seen_places.insert(place.geonames_id) {
        let details = &place.geonames_details;
        location_id.push(vec![
          Value::Integer(place.geonames_id),
          opt_text(details.country_code.as_deref()),
          opt_text(details.country_name.as_deref()),
          Value::from(details.lat),
          Value::from(details.lng),
          opt_text(details.name.as_deref()),
        ])?;
      }
    }

    for external in &entry.external_ids {
      for value in external.values() {
        let preferred = external.preferred.as_deref().unwrap_or(value);
        external_id.push(vec![text(&entry.id), text(&external.kind), text(value), text(preferred)])?;
      }
    }

    for name in &entry.names {
      for kind in &name.types {
        names.push(vec![text(&entry.id), text(&name.value), text(kind), opt_text(name.lang.as_deref())])?;
      }
    }

    for relation in &entry.relationships {
      relationships.push(vec![
        text(&entry.id),
        text(&relation.kind),
        text(&relation.id),
        opt_text(relation.label.as_deref()),
      ])?;
    }

    for domain in &entry.domains {
      domains.push(vec![text(&entry.id), text(domain)])?;
    }
  }

  Ok(vec![
    ("ror".to_string(), ror),
    ("ror_location".to_string(), location),
    ("ror_location_id".to_string(), location_id),
    ("ror_external_id".to_string(), external_id),
    ("ror_names".to_string(), names),
    ("ror_relationships".to_string(), relationships),
    ("ror_domains".to_string(), domains),
  ])
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// A small dump: one active university, one withdrawn institute sharing a GRID id
  /// namespace, and one inactive lab.
  pub(crate) fn sample_entries() -> Vec<RegistryEntry> {
    serde_json::from_value(json!([
      {
        "id": "https://ror.org/01aaa",
        "status": "active",
        "types": ["education", "funder"],
        "established": 1850,
        "names": [
          {"value": "Alpha University", "types": ["ror_display", "label"], "lang": "en"},
          {"value": "AU", "types": ["acronym"]}
        ],
        "external_ids": [{"type": "grid", "all": ["grid.1.a"], "preferred": "grid.1.a"}],
        "locations": [{"geonames_id": 2158177, "geonames_details": {
          "country_code": "AU", "country_name": "Australia", "lat": -37.8, "lng": 144.9, "name": "Melbourne"
        }}],
        "relationships": [{"type": "child", "id": "https://ror.org/03ccc", "label": "Gamma Lab"}],
        "links": [{"type": "website", "value": "https://alpha.example"}],
        "domains": ["alpha.example"],
        "admin": {"created": {"date": "2018-11-14", "schema_version": "1.0"}}
      },
      {
        "id": "https://ror.org/02bbb",
        "status": "withdrawn",
        "names": [{"value": "Beta Institute", "types": ["ror_display"]}],
        "external_ids": [{"type": "grid", "all": ["grid.2.b"]}],
        "locations": [{"geonames_id": 2158177, "geonames_details": {"country_code": "AU"}}]
      },
      {
        "id": "https://ror.org/03ccc",
        "status": "inactive",
        "names": [{"value": "Gamma Lab", "types": ["ror_display"]}],
        "external_ids": [{"type": "isni", "all": ["0000 0001"]}]
      }
    ]))
    .unwrap()
  }

  #[test]
  fn test_only_active_entries_resolve() {
    let index = RegistryIndex::new(&sample_entries());
    assert_eq!(index.resolve("grid", "grid.1.a"), ["https://ror.org/01aaa".to_string()]);
    assert!(index.resolve("grid", "grid.2.b").is_empty());
    assert!(index.resolve("isni", "0000 0001").is_empty());
    assert!(index.resolve("ror", "03ccc").is_empty());
    assert_eq!(index.locations("https://ror.org/01aaa").len(), 1);
    assert!(index.locations("https://ror.org/02bbb").is_empty());
  }

  #[test]
  fn test_unrecognised_status_is_kept_but_never_resolves() {
    let entries: Vec<RegistryEntry> = serde_json::from_value(json!([
      {"id": "https://ror.org/04ddd", "status": "pending", "external_ids": [{"type": "grid", "all": ["grid.4.d"]}]},
      {"id": "https://ror.org/05eee", "status": "active", "external_ids": [{"type": "grid", "all": ["grid.5.e"]}]}
    ]))
    .unwrap();
    assert_eq!(entries[0].status, RegistryStatus::Unknown);
    assert!(!entries[0].is_active());

    let index = RegistryIndex::new(&entries);
    assert!(index.resolve("grid", "grid.4.d").is_empty());
    assert!(index.resolve("ror", "04ddd").is_empty());
    assert_eq!(index.resolve("grid", "grid.5.e"), ["https://ror.org/05eee".to_string()]);

    let tables = baseline_tables(&entries).unwrap();
    assert_eq!(tables[0].1.get(0, "status"), Some(&Value::Text("unknown".into())));
  }

  #[test]
  fn test_entry_accessors() {
    let entries = sample_entries();
    assert_eq!(entries[0].display_name(), Some("Alpha University"));
    assert_eq!(entries[0].acronym(), Some("AU"));
    assert_eq!(entries[0].link("website"), Some("https://alpha.example"));
    assert_eq!(entries[1].acronym(), None);
    assert_eq!(entries[0].external_ids[0].values(), vec!["grid.1.a"]);
  }

  #[test]
  fn test_baseline_tables() {
    let tables = baseline_tables(&sample_entries()).unwrap();
    let names: Vec<&str> = tables.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec![
      "ror",
      "ror_location",
      "ror_location_id",
      "ror_external_id",
      "ror_names",
      "ror_relationships",
      "ror_domains"
    ]);

    let ror = &tables[0].1;
    assert_eq!(ror.len(), 3);
    assert_eq!(ror.get(0, "main_type"), Some(&Value::Text("education".into())));
    assert_eq!(ror.get(0, "third_type"), Some(&Value::Null));
    assert_eq!(ror.get(1, "status"), Some(&Value::Text("withdrawn".into())));

    // Two entries share one place: two links, one place row.
    assert_eq!(tables[1].1.len(), 2);
    assert_eq!(tables[2].1.len(), 1);
    // The display name carries two roles.
    assert_eq!(tables[4].1.len(), 5);
  }

  #[tokio::test]
  async fn test_index_restored_from_store_matches_dump() -> Result<(), BibnetError> {
    let store = TabularStore::open_in_memory().await?;
    store.create_schema("baselines").await?;
    store.replace_tables("baselines", baseline_tables(&sample_entries())?).await?;

    let index = RegistryIndex::from_store(&store, "baselines").await?;
    assert_eq!(index.resolve("grid", "grid.1.a"), ["https://ror.org/01aaa".to_string()]);
    assert_eq!(index.resolve("ror", "01aaa"), ["https://ror.org/01aaa".to_string()]);
    assert!(index.resolve("grid", "grid.2.b").is_empty());

    let places = index.locations("https://ror.org/01aaa");
    assert_eq!(places.len(), 1);
    assert_eq!(places[0].name.as_deref(), Some("Melbourne"));
    assert_eq!(places[0].lat, Some(-37.8));
    Ok(())
  }
}
