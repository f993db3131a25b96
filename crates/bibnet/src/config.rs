//! Run settings: parsed from YAML, validated once, immutable afterwards.
//!
//! A settings document looks like:
//!
//! ```yaml
//! project:
//!   name: graphene
//!   variant: pilot
//!   start_year: 2015
//!   end_year: 2024
//! paths:
//!   data_dir: /srv/bibnet
//!   baseline_version: "2024-10"
//!   strategy: strategy.yaml
//! apis:
//!   search: {endpoint: "https://api.lens.org/scholarly/", apikey: "..."}
//!   openalex: {endpoint: "https://api.openalex.org/", mailto: "me@example.org"}
//! retrieval:
//!   page_size: 1000
//!   max_tries: 10
//! network:
//!   max_team_size: 20
//! ```
//!
//! Everything but `project.name` and `project.start_year` has a default. [`Settings::from_raw`]
//! checks the document and every path the pipeline needs derives from the validated value.
//!
//! # Examples
//!
//! ```
//! use bibnet::config::Settings;
//!
//! let settings = Settings::from_yaml_str(
//!   "project: {name: graphene, start_year: 2015, end_year: 2024}\npaths: {data_dir: /tmp/bibnet}",
//! )
//! .unwrap();
//!
//! assert_eq!(settings.project().years(), 2015..=2024);
//! assert!(settings.project_db().ends_with("graphene/graphene.db"));
//! ```

use std::ops::RangeInclusive;

use chrono::{Datelike, Utc};

use super::*;
use crate::{
  clients::{rate::RatePolicy, retry::RetryPolicy, search::MAX_PAGE_SIZE},
  store::validate_identifier,
};

/// Earliest accepted publication year.
pub const MIN_YEAR: i32 = 1800;

/// Years from here on are treated as "up to now".
pub const MAX_YEAR: i32 = 2100;

fn default_search_endpoint() -> String { "https://api.lens.org/scholarly/".to_string() }

fn default_openalex_endpoint() -> String { "https://api.openalex.org/".to_string() }

fn default_registry_endpoint() -> String { "https://zenodo.org/api/".to_string() }

fn default_baseline_version() -> String { "baseline".to_string() }

/// `project` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawProject {
  /// Project name, also used for file and table names
  #[serde(default)]
  pub name:       String,
  /// Optional variant; prefixes cache files and table names
  #[serde(default)]
  pub variant:    Option<String>,
  /// First year harvested
  #[serde(default)]
  pub start_year: Option<i32>,
  /// Last year harvested; out-of-range values mean the current year
  #[serde(default)]
  pub end_year:   Option<i32>,
}

/// `paths` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPaths {
  /// Root of all project and baseline data
  #[serde(default)]
  pub data_dir:         Option<PathBuf>,
  /// Version tag of the baseline store
  #[serde(default = "default_baseline_version")]
  pub baseline_version: String,
  /// Search strategy document, relative to the settings file
  #[serde(default)]
  pub strategy:         Option<PathBuf>,
}

impl Default for RawPaths {
  fn default() -> Self { Self { data_dir: None, baseline_version: default_baseline_version(), strategy: None } }
}

/// One API in the `apis` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawApi {
  /// Base URL
  #[serde(default)]
  pub endpoint: Option<String>,
  /// Bearer token
  #[serde(default)]
  pub apikey:   Option<String>,
  /// Contact address sent with requests
  #[serde(default)]
  pub mailto:   Option<String>,
}

/// `apis` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawApis {
  /// Scholarly search API
  #[serde(default)]
  pub search:   RawApi,
  /// Open scholarly graph, for the taxonomy
  #[serde(default)]
  pub openalex: RawApi,
  /// Repository hosting the registry dumps
  #[serde(default)]
  pub registry: RawApi,
}

/// `retrieval` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawRetrieval {
  /// Records per page
  pub page_size:                    usize,
  /// Attempts per request
  pub max_tries:                    usize,
  /// Sleep before every attempt
  pub request_delay_ms:             u64,
  /// Timeout of one attempt
  pub timeout_secs:                 u64,
  /// Call budget of paged searches
  pub paging_calls_per_minute:      usize,
  /// Call budget of aggregations
  pub aggregation_calls_per_minute: usize,
}

impl Default for RawRetrieval {
  fn default() -> Self {
    let retry = RetryPolicy::default();
    Self {
      page_size:                    1000,
      max_tries:                    retry.max_tries,
      request_delay_ms:             retry.delay.as_millis() as u64,
      timeout_secs:                 retry.timeout.as_secs(),
      paging_calls_per_minute:      RatePolicy::PAGING.max_calls,
      aggregation_calls_per_minute: RatePolicy::AGGREGATION.max_calls,
    }
  }
}

/// `network` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawNetwork {
  /// Records with more authors are excluded
  pub max_team_size: i64,
  /// Restrict the network to this many records
  pub sample_size:   Option<usize>,
  /// Seed of the sample
  pub sample_seed:   u64,
}

impl Default for RawNetwork {
  fn default() -> Self {
    Self {
      max_team_size: crate::network::DEFAULT_MAX_TEAM_SIZE,
      sample_size:   None,
      sample_seed:   crate::network::DEFAULT_SEED,
    }
  }
}

/// Settings document as written, before validation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSettings {
  /// `project`
  #[serde(default)]
  pub project:   RawProject,
  /// `paths`
  #[serde(default)]
  pub paths:     RawPaths,
  /// `apis`
  #[serde(default)]
  pub apis:      RawApis,
  /// `retrieval`
  #[serde(default)]
  pub retrieval: RawRetrieval,
  /// `network`
  #[serde(default)]
  pub network:   RawNetwork,
}

/// Validated project identity and harvest window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
  /// Project name
  pub name:       String,
  /// Variant, if any
  pub variant:    Option<String>,
  /// First year harvested
  pub start_year: i32,
  /// Last year harvested
  pub end_year:   i32,
}

impl ProjectSettings {
  /// Harvested years.
  pub fn years(&self) -> RangeInclusive<i32> { self.start_year..=self.end_year }
}

/// A validated API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
  /// Base URL, ending with `/`
  pub endpoint: String,
  /// Bearer token
  pub apikey:   Option<String>,
  /// Contact address
  pub mailto:   Option<String>,
}

/// Validated retrieval parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
  /// Records per page
  pub page_size:   usize,
  /// Retry behaviour
  pub retry:       RetryPolicy,
  /// Window of paged searches
  pub paging:      RatePolicy,
  /// Window of aggregations
  pub aggregation: RatePolicy,
}

/// Validated network parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
  /// Team-size ceiling
  pub max_team_size: i64,
  /// Sample size
  pub sample_size:   Option<usize>,
  /// Sample seed
  pub sample_seed:   u64,
}

/// Validated settings of a run.
#[derive(Debug, Clone)]
pub struct Settings {
  project:          ProjectSettings,
  data_dir:         PathBuf,
  baseline_version: String,
  strategy:         Option<PathBuf>,
  search:           ApiSettings,
  openalex:         ApiSettings,
  registry:         ApiSettings,
  retrieval:        RetrievalSettings,
  network:          NetworkSettings,
}

fn api(raw: RawApi, default_endpoint: fn() -> String, section: &str) -> Result<ApiSettings, BibnetError> {
  let endpoint = raw.endpoint.unwrap_or_else(default_endpoint);
  let mut endpoint = url::Url::parse(&endpoint)
    .map_err(|e| BibnetError::Config(format!("apis.{section}.endpoint `{endpoint}`: {e}")))?
    .to_string();
  if !endpoint.ends_with('/') {
    endpoint.push('/');
  }
  Ok(ApiSettings { endpoint, apikey: raw.apikey, mailto: raw.mailto })
}

fn at_least_one(value: usize, field: &str) -> Result<usize, BibnetError> {
  if value == 0 {
    return Err(BibnetError::Config(format!("{field} must be at least 1")));
  }
  Ok(value)
}

impl Settings {
  /// Validates a raw document.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] naming the first offending field.
  pub fn from_raw(raw: RawSettings) -> Result<Self, BibnetError> {
    let name = raw.project.name.trim().to_string();
    if name.is_empty() {
      return Err(BibnetError::Config("project.name is required".into()));
    }
    validate_identifier(&name)
      .map_err(|_| BibnetError::Config(format!("project.name `{name}` is not identifier-safe")))?;
    let variant = raw.project.variant.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    if let Some(variant) = &variant {
      validate_identifier(variant)
        .map_err(|_| BibnetError::Config(format!("project.variant `{variant}` is not identifier-safe")))?;
    }

    let start_year = raw
      .project
      .start_year
      .ok_or_else(|| BibnetError::Config("project.start_year is required".into()))?;
    if !(MIN_YEAR..MAX_YEAR).contains(&start_year) {
      return Err(BibnetError::Config(format!(
        "project.start_year {start_year} outside {MIN_YEAR}..{MAX_YEAR}"
      )));
    }
    let end_year = match raw.project.end_year {
      Some(year) if (MIN_YEAR..MAX_YEAR).contains(&year) => year,
      _ => Utc::now().year(),
    };
    if start_year > end_year {
      return Err(BibnetError::Config(format!("project.start_year {start_year} is after {end_year}")));
    }

    let retrieval = raw.retrieval;
    if !(1..=MAX_PAGE_SIZE).contains(&retrieval.page_size) {
      return Err(BibnetError::Config(format!(
        "retrieval.page_size {} outside 1..={MAX_PAGE_SIZE}",
        retrieval.page_size
      )));
    }
    let retrieval = RetrievalSettings {
      page_size:   retrieval.page_size,
      retry:       RetryPolicy {
        max_tries: at_least_one(retrieval.max_tries, "retrieval.max_tries")?,
        delay:     Duration::from_millis(retrieval.request_delay_ms),
        timeout:   Duration::from_secs(retrieval.timeout_secs.max(1)),
      },
      paging:      RatePolicy::per_minute(at_least_one(
        retrieval.paging_calls_per_minute,
        "retrieval.paging_calls_per_minute",
      )?),
      aggregation: RatePolicy::per_minute(at_least_one(
        retrieval.aggregation_calls_per_minute,
        "retrieval.aggregation_calls_per_minute",
      )?),
    };

    if raw.network.max_team_size < 2 {
      return Err(BibnetError::Config("network.max_team_size must be at least 2".into()));
    }
    if raw.network.sample_size == Some(0) {
      return Err(BibnetError::Config("network.sample_size must be at least 1".into()));
    }

    let baseline_version = raw.paths.baseline_version.trim().to_string();
    if baseline_version.is_empty() || baseline_version.contains(['/', '\\']) {
      return Err(BibnetError::Config(format!(
        "paths.baseline_version `{baseline_version}` is not a file name"
      )));
    }

    Ok(Self {
      project: ProjectSettings { name, variant, start_year, end_year },
      data_dir: raw.paths.data_dir.unwrap_or_else(Self::default_data_dir),
      baseline_version,
      strategy: raw.paths.strategy,
      search: api(raw.apis.search, default_search_endpoint, "search")?,
      openalex: api(raw.apis.openalex, default_openalex_endpoint, "openalex")?,
      registry: api(raw.apis.registry, default_registry_endpoint, "registry")?,
      retrieval,
      network: NetworkSettings {
        max_team_size: raw.network.max_team_size,
        sample_size:   raw.network.sample_size,
        sample_seed:   raw.network.sample_seed,
      },
    })
  }

  /// Parses and validates a YAML document.
  pub fn from_yaml_str(yaml: &str) -> Result<Self, BibnetError> {
    Self::from_raw(serde_yaml::from_str(yaml)?)
  }

  /// Loads settings from a file. A relative strategy path resolves against the file's directory.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, BibnetError> {
    let path = path.as_ref();
    debug!("Loading settings from {}", path.display());
    let mut raw: RawSettings = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;
    if let (Some(strategy), Some(parent)) = (&raw.paths.strategy, path.parent()) {
      if strategy.is_relative() {
        raw.paths.strategy = Some(parent.join(strategy));
      }
    }
    Self::from_raw(raw)
  }

  /// Where settings are looked up when no path is given.
  pub fn default_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("bibnet").join("settings.yaml")
  }

  /// Data directory used when the document names none.
  pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("bibnet")
  }

  /// Project identity and harvest window.
  pub fn project(&self) -> &ProjectSettings { &self.project }

  /// Scholarly search API.
  pub fn search_api(&self) -> &ApiSettings { &self.search }

  /// Open scholarly graph API.
  pub fn openalex_api(&self) -> &ApiSettings { &self.openalex }

  /// Registry dump repository.
  pub fn registry_api(&self) -> &ApiSettings { &self.registry }

  /// Retrieval parameters.
  pub fn retrieval(&self) -> &RetrievalSettings { &self.retrieval }

  /// Network parameters.
  pub fn network(&self) -> &NetworkSettings { &self.network }

  /// Root data directory.
  pub fn data_dir(&self) -> &Path { &self.data_dir }

  /// Baseline version tag.
  pub fn baseline_version(&self) -> &str { &self.baseline_version }

  /// Search strategy document, if configured.
  pub fn strategy_path(&self) -> Option<&Path> { self.strategy.as_deref() }

  /// `<data_dir>/<name>`
  pub fn project_dir(&self) -> PathBuf { self.data_dir.join(&self.project.name) }

  /// Scratch files and caches.
  pub fn temp_dir(&self) -> PathBuf { self.project_dir().join("temp_files") }

  /// Log files.
  pub fn log_dir(&self) -> PathBuf { self.project_dir().join("logs") }

  /// Project store.
  pub fn project_db(&self) -> PathBuf { self.project_dir().join(format!("{}.db", self.project.name)) }

  /// Baseline store, shared by every project on the same baseline version.
  pub fn baseline_db(&self) -> PathBuf {
    self.data_dir.join("baselines").join(format!("{}.db", self.baseline_version))
  }

  /// Prefix of variant-specific table and file names: `<variant>_` or nothing.
  pub fn table_prefix(&self) -> String {
    self.project.variant.as_ref().map(|v| format!("{v}_")).unwrap_or_default()
  }

  /// Raw record cache of the harvest stage.
  pub fn raw_cache_path(&self) -> PathBuf {
    self.temp_dir().join(format!("{}lens_scholarly_raw.jsonl", self.table_prefix()))
  }

  /// Records of a harvest that lost a year bucket; never reused as the raw cache.
  pub fn partial_cache_path(&self) -> PathBuf { self.raw_cache_path().with_extension("jsonl.partial") }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  const MINIMAL: &str = "project: {name: graphene, start_year: 2015, end_year: 2020}";

  fn config_error(yaml: &str) -> String {
    match Settings::from_yaml_str(yaml) {
      Err(BibnetError::Config(reason)) => reason,
      other => panic!("expected a configuration error, got {other:?}"),
    }
  }

  #[test]
  fn test_defaults() {
    let settings = Settings::from_yaml_str(MINIMAL).unwrap();
    assert_eq!(settings.project().years(), 2015..=2020);
    assert_eq!(settings.search_api().endpoint, "https://api.lens.org/scholarly/");
    assert_eq!(settings.retrieval().page_size, 1000);
    assert_eq!(settings.retrieval().retry, RetryPolicy::default());
    assert_eq!(settings.retrieval().paging, RatePolicy::PAGING);
    assert_eq!(settings.retrieval().aggregation, RatePolicy::AGGREGATION);
    assert_eq!(settings.network().max_team_size, 20);
    assert_eq!(settings.network().sample_seed, 42);
    assert_eq!(settings.table_prefix(), "");
  }

  #[test]
  fn test_derived_paths() {
    let settings = Settings::from_yaml_str(
      "project: {name: graphene, variant: pilot, start_year: 2015}\npaths: {data_dir: /data, baseline_version: v2}",
    )
    .unwrap();
    assert_eq!(settings.project_dir(), PathBuf::from("/data/graphene"));
    assert_eq!(settings.project_db(), PathBuf::from("/data/graphene/graphene.db"));
    assert_eq!(settings.baseline_db(), PathBuf::from("/data/baselines/v2.db"));
    assert_eq!(settings.log_dir(), PathBuf::from("/data/graphene/logs"));
    assert_eq!(
      settings.raw_cache_path(),
      PathBuf::from("/data/graphene/temp_files/pilot_lens_scholarly_raw.jsonl")
    );
    assert_eq!(
      settings.partial_cache_path(),
      PathBuf::from("/data/graphene/temp_files/pilot_lens_scholarly_raw.jsonl.partial")
    );
  }

  #[test]
  fn test_end_year_out_of_range_means_now() {
    let settings = Settings::from_yaml_str("project: {name: p, start_year: 2000, end_year: 9999}").unwrap();
    assert_eq!(settings.project().end_year, Utc::now().year());
    let settings = Settings::from_yaml_str("project: {name: p, start_year: 2000}").unwrap();
    assert_eq!(settings.project().end_year, Utc::now().year());
  }

  #[test]
  fn test_rejects_invalid_documents() {
    assert!(config_error("project: {name: '', start_year: 2015}").contains("project.name"));
    assert!(config_error("project: {name: 'my project', start_year: 2015}").contains("identifier"));
    assert!(config_error("project: {name: p}").contains("start_year"));
    assert!(config_error("project: {name: p, start_year: 1700}").contains("start_year"));
    assert!(config_error("project: {name: p, start_year: 2020, end_year: 2010}").contains("after"));
    assert!(config_error(&format!("{MINIMAL}\nretrieval: {{page_size: 20000}}")).contains("page_size"));
    assert!(config_error(&format!("{MINIMAL}\nretrieval: {{page_size: 0}}")).contains("page_size"));
    assert!(config_error(&format!("{MINIMAL}\nretrieval: {{max_tries: 0}}")).contains("max_tries"));
    assert!(config_error(&format!("{MINIMAL}\napis: {{search: {{endpoint: 'not a url'}}}}")).contains("apis.search"));
    assert!(config_error(&format!("{MINIMAL}\nnetwork: {{sample_size: 0}}")).contains("sample_size"));
  }

  #[test]
  fn test_endpoint_gets_trailing_slash() {
    let settings = Settings::from_yaml_str(&format!(
      "{MINIMAL}\napis: {{search: {{endpoint: 'http://localhost:8080/scholarly', apikey: k}}}}"
    ))
    .unwrap();
    assert_eq!(settings.search_api().endpoint, "http://localhost:8080/scholarly/");
    assert_eq!(settings.search_api().apikey.as_deref(), Some("k"));
  }

  #[test]
  fn test_load_resolves_strategy_next_to_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, format!("{MINIMAL}\npaths: {{strategy: strategy.yaml}}")).unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.strategy_path(), Some(dir.path().join("strategy.yaml").as_path()));
  }

  #[test]
  fn test_load_missing_file() {
    let dir = tempdir().unwrap();
    let result = Settings::load(dir.path().join("nope.yaml"));
    assert!(matches!(result, Err(BibnetError::Path(_))));
  }
}
