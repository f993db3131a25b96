//! The pipeline stages, wired from validated [`Settings`].
//!
//! Three stages run in order, each on its own and each safe to re-run:
//!
//! 1. [`Pipeline::baselines`] downloads the organisation registry and the subject taxonomies
//!    into the baseline store shared by every project on the same baseline version.
//! 2. [`Pipeline::harvest`] runs the strategy's main topics year by year and caches the raw
//!    records as JSON lines. A present cache is reused, so deleting it forces a refetch. A
//!    harvest that lost a year bucket only leaves a `.partial` file behind and is searched
//!    again next time. Secondary topics are run once per aggregation into aggregate tables.
//! 3. [`Pipeline::build`] normalizes the cached records, resolves organisation locations,
//!    links subject tags to the taxonomies, derives the collaboration network and writes
//!    every table in one transaction.
//!
//! [`Pipeline::normalisation`] is a further baseline stage: it needs the concept hierarchy of
//! [`Pipeline::baselines`] and runs one citation aggregation per discipline and publication
//! type.
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::{config::Settings, pipeline::Pipeline, strategy::SearchStrategy};
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let settings = Settings::load("settings.yaml")?;
//! let strategy = SearchStrategy::load(settings.strategy_path().unwrap())?;
//! let pipeline = Pipeline::new(settings);
//!
//! pipeline.baselines().await?;
//! pipeline.harvest(&strategy).await?;
//! let summary = pipeline.build().await?;
//! println!("{} records, {} edges", summary.records, summary.edges);
//! # Ok(())
//! # }
//! ```

use std::io::{BufRead, BufReader, BufWriter, Write};

use super::*;
use crate::{
  citations::{append_rows, citation_aggregation, citation_query, normalisation_table, NORMALISATION_TABLE},
  clients::{
    openalex::OpenAlexClient,
    rate::{RateLimiter, RatePolicy},
    registry::RegistryClient,
    retry::RetryingHttpClient,
    search::{BucketReport, BucketStatus, SearchClient, SearchQuery},
  },
  config::Settings,
  network::NetworkBuilder,
  normalize::{link_categories, normalize, resolve_locations},
  registry::{baseline_tables, RegistryIndex},
  store::TabularStore,
  strategy::{
    SearchStrategy,
    StrategyKind,
    MAIN_CATEGORY,
    PUBLICATION_TYPE,
    SCHOLARLY_SOURCE,
    SECONDARY_CATEGORY,
    UNIFICATION_CATEGORY,
  },
  taxonomy::{concept_tables, topic_tables, TaxonomyHierarchy},
};

/// Schema of the project tables.
pub const PROJECT_SCHEMA: &str = "project";

/// Schema of the baseline tables, inside the baseline store.
pub const BASELINE_SCHEMA: &str = "main";

/// Call budget of the taxonomy listing API.
const OPENALEX_POLICY: RatePolicy = RatePolicy { max_calls: 600, window: Duration::from_secs(60) };

/// What [`Pipeline::baselines`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BaselineSummary {
  /// Registry entries
  pub organisations: usize,
  /// Concepts
  pub concepts:      usize,
  /// Topics
  pub topics:        usize,
}

/// What [`Pipeline::normalisation`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalisationSummary {
  /// Discipline groups
  pub groups:       usize,
  /// Publication type groups
  pub types:        usize,
  /// Aggregation queries sent
  pub combinations: usize,
  /// Rows of the normalisation table
  pub rows:         usize,
}

/// What [`Pipeline::harvest`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HarvestSummary {
  /// Distinct records in the cache
  pub records:      usize,
  /// Whether the cache was reused instead of searched
  pub from_cache:   bool,
  /// Per-topic bucket reports; empty when the cache was reused
  pub buckets:      Vec<(String, BucketReport)>,
  /// Whether a bucket aborted, leaving the records in the partial cache only
  pub partial:      bool,
  /// Aggregate tables written
  pub aggregations: usize,
}

/// What [`Pipeline::build`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
  /// Records
  pub records:       usize,
  /// Contributions
  pub contributions: usize,
  /// Organisations
  pub organisations: usize,
  /// Organisation locations
  pub locations:     usize,
  /// Network edges
  pub edges:         usize,
  /// Network nodes
  pub nodes:         usize,
  /// Tables written
  pub tables:        usize,
}

/// Runs pipeline stages for one project.
#[derive(Debug, Clone)]
pub struct Pipeline {
  settings: Settings,
}

impl Pipeline {
  /// Creates a pipeline.
  pub fn new(settings: Settings) -> Self { Self { settings } }

  /// Settings in effect.
  pub fn settings(&self) -> &Settings { &self.settings }

  fn http(&self) -> Result<RetryingHttpClient, BibnetError> {
    RetryingHttpClient::new(self.settings.retrieval().retry)
  }

  async fn project_store(&self) -> Result<TabularStore, BibnetError> {
    let store = TabularStore::open(self.settings.project_db()).await?;
    store.create_schema(PROJECT_SCHEMA).await?;
    Ok(store)
  }

  fn prefixed(&self, tables: Vec<(String, Table)>) -> Vec<(String, Table)> {
    let prefix = self.settings.table_prefix();
    tables.into_iter().map(|(name, table)| (format!("{prefix}{name}"), table)).collect()
  }

  /// Downloads the registry dump and both taxonomies into the baseline store.
  pub async fn baselines(&self) -> Result<BaselineSummary, BibnetError> {
    let registry = RegistryClient::new(self.http()?, &self.settings.registry_api().endpoint)?;
    let entries = registry.fetch_dump().await?;

    let api = self.settings.openalex_api();
    let openalex = OpenAlexClient::new(self.http()?, &api.endpoint, api.mailto.as_deref())?;
    let mut limiter = RateLimiter::new(OPENALEX_POLICY);
    let concepts = openalex.fetch_concepts(&mut limiter).await?;
    let topics = openalex.fetch_topics(&mut limiter).await?;

    let mut tables = baseline_tables(&entries)?;
    tables.extend(concept_tables(&concepts)?);
    tables.extend(topic_tables(&topics)?);
    let concepts_hierarchy = TaxonomyHierarchy::from_concepts(&concepts).to_table()?;
    let topics_hierarchy = TaxonomyHierarchy::from_topics(&topics).to_table()?;
    tables.push(("concepts_hierarchy".to_string(), concepts_hierarchy));
    tables.push(("topics_hierarchy".to_string(), topics_hierarchy));

    let store = TabularStore::open(self.settings.baseline_db()).await?;
    store.replace_tables(BASELINE_SCHEMA, tables).await?;
    info!("Baselines written to {}", self.settings.baseline_db().display());

    Ok(BaselineSummary { organisations: entries.len(), concepts: concepts.len(), topics: topics.len() })
  }

  fn search_client(&self, stage: &str) -> Result<SearchClient, BibnetError> {
    let api = self.settings.search_api();
    let apikey = api
      .apikey
      .clone()
      .ok_or_else(|| BibnetError::Config(format!("apis.search.apikey is required to {stage}")))?;
    SearchClient::new(self.http()?, &api.endpoint, apikey)
  }

  /// Writes per-year citation statistics for every discipline and publication type pair into
  /// the baseline store.
  ///
  /// Disciplines are the level-1 groups of the stored concept hierarchy; publication types come
  /// from the strategy's `unification.publication_type` entry. Every query goes through the
  /// aggregation call budget.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] if the search API has no key, the baseline store has no
  /// concept hierarchy or the strategy defines no publication type.
  pub async fn normalisation(&self, strategy: &SearchStrategy) -> Result<NormalisationSummary, BibnetError> {
    let client = self.search_client("build citation baselines")?;
    let types = strategy.publication_types(SCHOLARLY_SOURCE)?;
    if types.is_empty() {
      return Err(BibnetError::Config(format!(
        "search strategy has no `{SCHOLARLY_SOURCE}.{UNIFICATION_CATEGORY}.{PUBLICATION_TYPE}` entry"
      )));
    }
    let path = self.settings.baseline_db();
    if !path.exists() {
      return Err(BibnetError::Config(format!("no baseline store at {}; run baselines first", path.display())));
    }
    let store = TabularStore::open(&path).await?;
    if !store.table_exists(BASELINE_SCHEMA, "concepts_hierarchy").await? {
      return Err(BibnetError::Config(format!(
        "baseline store {} has no concepts_hierarchy; run baselines first",
        path.display()
      )));
    }
    let groups = load_hierarchy(&store, "concepts_hierarchy").await?.field_groups();

    let project = self.settings.project();
    let mut limiter = RateLimiter::new(self.settings.retrieval().aggregation);
    let mut table = normalisation_table();
    let mut summary = NormalisationSummary { groups: groups.len(), types: types.len(), ..Default::default() };
    info!("Citation normalisation over {} disciplines and {} publication types", groups.len(), types.len());
    for group in &groups {
      for kind in &types {
        debug!("Citations of {} / {}", group.parent_name, kind.label);
        let query = SearchQuery::new(citation_query(group, kind))
          .with_page_size(0)?
          .with_sort(json!([{"created": "desc"}, {"year_published": "desc"}]))
          .with_aggregation(citation_aggregation());
        let result = client.aggregate(&query, project.start_year, project.end_year, &mut limiter).await?;
        summary.rows += append_rows(&mut table, &result, group, kind)?;
        summary.combinations += 1;
      }
    }

    store.create_or_replace_table(BASELINE_SCHEMA, NORMALISATION_TABLE, &table).await?;
    info!("{NORMALISATION_TABLE} written with {} rows", summary.rows);
    Ok(summary)
  }

  /// Harvests the strategy's main topics into the raw cache and runs its aggregations.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] if the search API has no key or the strategy has no main
  /// topic.
  pub async fn harvest(&self, strategy: &SearchStrategy) -> Result<HarvestSummary, BibnetError> {
    let client = self.search_client("harvest")?;
    let project = self.settings.project();
    let page_size = self.settings.retrieval().page_size;

    let mut summary = HarvestSummary::default();
    let cache = self.settings.raw_cache_path();
    if cache.exists() {
      info!("Reusing harvested records from {}", cache.display());
      summary.records = read_cache(&cache)?.len();
      summary.from_cache = true;
    } else {
      let topics: Vec<_> = strategy.select(SCHOLARLY_SOURCE, MAIN_CATEGORY, StrategyKind::Topic).collect();
      if topics.is_empty() {
        return Err(BibnetError::Config(format!(
          "search strategy has no `{SCHOLARLY_SOURCE}.{MAIN_CATEGORY}` topic"
        )));
      }

      let mut limiter = RateLimiter::new(self.settings.retrieval().paging);
      let mut merged = MergedRecords::default();
      for topic in topics {
        info!("Harvesting topic {}", topic.id);
        let query = SearchQuery::new(topic.value.clone()).with_page_size(page_size)?;
        let harvest = client.retrieve(&query, project.start_year, project.end_year, &mut limiter).await?;
        for record in harvest.records {
          merged.insert(record);
        }
        summary.buckets.extend(harvest.buckets.into_iter().map(|b| (topic.id.clone(), b)));
      }
      let records = merged.into_records();
      summary.records = records.len();
      let aborted: Vec<String> = summary
        .buckets
        .iter()
        .filter(|(_, bucket)| bucket.status == BucketStatus::Aborted)
        .map(|(topic, bucket)| format!("{topic}/{}", bucket.year))
        .collect();
      let partial = self.settings.partial_cache_path();
      if aborted.is_empty() {
        write_cache(&cache, &records)?;
        if partial.exists() {
          std::fs::remove_file(&partial)?;
        }
      } else {
        write_cache(&partial, &records)?;
        warn!(
          "Harvest lost {} ({}); {} records kept at {} and the next harvest searches again",
          if aborted.len() == 1 { "a bucket" } else { "several buckets" },
          aborted.join(", "),
          records.len(),
          partial.display()
        );
        summary.partial = true;
      }
    }

    let mut aggregates = Vec::new();
    let mut limiter = RateLimiter::new(self.settings.retrieval().aggregation);
    for topic in strategy.select(SCHOLARLY_SOURCE, SECONDARY_CATEGORY, StrategyKind::Topic) {
      for aggregation in strategy.aggregations(SCHOLARLY_SOURCE) {
        let query = SearchQuery::new(topic.value.clone()).with_aggregation(aggregation.value.clone());
        let result = client.aggregate(&query, project.start_year, project.end_year, &mut limiter).await?;
        aggregates.push((format!("aggregate_{}_{}", topic.id, aggregation.id), result.table));
      }
    }
    if !aggregates.is_empty() {
      summary.aggregations = aggregates.len();
      self.project_store().await?.replace_tables(PROJECT_SCHEMA, self.prefixed(aggregates)).await?;
    }

    info!("Harvest holds {} records", summary.records);
    Ok(summary)
  }

  /// Builds every project table from the raw cache.
  ///
  /// Location and category linking need the baseline store; without it they produce empty
  /// tables and a warning.
  ///
  /// # Errors
  ///
  /// - [`BibnetError::Config`] if nothing was harvested yet
  /// - [`BibnetError::Normalization`] if a cached record is malformed; nothing is written then
  pub async fn build(&self) -> Result<BuildSummary, BibnetError> {
    let cache = self.settings.raw_cache_path();
    if !cache.exists() {
      return Err(BibnetError::Config(format!(
        "no harvested records at {}; run harvest first",
        cache.display()
      )));
    }
    let records = read_cache(&cache)?;
    let tables = normalize(&records)?;

    let (index, concepts, topics) = self.load_baselines().await?;
    let locations = resolve_locations(&tables, &index);
    let network = NetworkBuilder::default()
      .with_max_team_size(self.settings.network().max_team_size)
      .with_sample_size(self.settings.network().sample_size)
      .with_seed(self.settings.network().sample_seed)
      .build(&tables);

    let summary = BuildSummary {
      records:       tables.records.len(),
      contributions: tables.contributions.len(),
      organisations: tables.organisations.len(),
      locations:     locations.len(),
      edges:         network.edges.len(),
      nodes:         network.nodes.len(),
      tables:        0,
    };

    let mut output = tables.tables();
    output.push(("locations".to_string(), Table::from_rows(&locations)));
    output.push((
      "categories_openalex_concepts".to_string(),
      link_categories(&tables.categories, &concepts)?,
    ));
    output.push(("categories_openalex_topics".to_string(), link_categories(&tables.categories, &topics)?));
    output.extend(network.tables());

    let output = self.prefixed(output);
    let summary = BuildSummary { tables: output.len(), ..summary };
    self.project_store().await?.replace_tables(PROJECT_SCHEMA, output).await?;
    info!("Project store {} updated with {} tables", self.settings.project_db().display(), summary.tables);
    Ok(summary)
  }

  async fn load_baselines(
    &self,
  ) -> Result<(RegistryIndex, TaxonomyHierarchy, TaxonomyHierarchy), BibnetError> {
    let path = self.settings.baseline_db();
    if !path.exists() {
      warn!("No baseline store at {}; locations and categories stay unlinked", path.display());
      return Ok((RegistryIndex::default(), TaxonomyHierarchy::default(), TaxonomyHierarchy::default()));
    }
    let store = TabularStore::open(&path).await?;
    let index = RegistryIndex::from_store(&store, BASELINE_SCHEMA).await?;
    let concepts = load_hierarchy(&store, "concepts_hierarchy").await?;
    let topics = load_hierarchy(&store, "topics_hierarchy").await?;
    Ok((index, concepts, topics))
  }
}

async fn load_hierarchy(store: &TabularStore, name: &str) -> Result<TaxonomyHierarchy, BibnetError> {
  if !store.table_exists(BASELINE_SCHEMA, name).await? {
    warn!("Baseline store has no {name}");
    return Ok(TaxonomyHierarchy::default());
  }
  TaxonomyHierarchy::from_table(&store.query(&format!("SELECT * FROM {BASELINE_SCHEMA}.{name}")).await?)
}

/// Records of several topics, deduplicated by id keeping the best-scored copy.
#[derive(Default)]
struct MergedRecords {
  records:  Vec<Json>,
  position: HashMap<String, usize>,
}

impl MergedRecords {
  fn insert(&mut self, record: Json) {
    let Some(id) = record_id(&record) else {
      warn!("Dropping a harvested record without id");
      return;
    };
    match self.position.get(&id) {
      Some(&i) => {
        if score(&record) > score(&self.records[i]) {
          self.records[i] = record;
        }
      },
      None => {
        self.position.insert(id, self.records.len());
        self.records.push(record);
      },
    }
  }

  fn into_records(self) -> Vec<Json> { self.records }
}

fn record_id(record: &Json) -> Option<String> {
  record.get("lens_id").or_else(|| record.get("record_id")).and_then(Json::as_str).map(str::to_string)
}

fn score(record: &Json) -> f64 { record.get("score").and_then(Json::as_f64).unwrap_or(0.0) }

/// Writes records as JSON lines, through a temporary file so a failed write leaves no cache.
pub fn write_cache(path: &Path, records: &[Json]) -> Result<(), BibnetError> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let mut partial = path.as_os_str().to_owned();
  partial.push(".part");
  let partial = PathBuf::from(partial);
  {
    let mut writer = BufWriter::new(std::fs::File::create(&partial)?);
    for record in records {
      serde_json::to_writer(&mut writer, record)?;
      writer.write_all(b"\n")?;
    }
    writer.flush()?;
  }
  std::fs::rename(&partial, path)?;
  debug!("Cached {} records at {}", records.len(), path.display());
  Ok(())
}

/// Reads a JSON lines cache, skipping blank lines.
pub fn read_cache(path: &Path) -> Result<Vec<Json>, BibnetError> {
  let reader = BufReader::new(std::fs::File::open(path)?);
  let mut records = Vec::new();
  for line in reader.lines() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    records.push(serde_json::from_str(&line)?);
  }
  Ok(records)
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use mockito::{Matcher, Server, ServerGuard};
  use tempfile::{tempdir, TempDir};

  use super::*;
  use crate::{registry::tests::sample_entries, taxonomy::tests::sample_concepts};

  fn settings(dir: &TempDir, server: Option<&ServerGuard>) -> Settings {
    let url = server.map(|s| s.url()).unwrap_or_else(|| "http://127.0.0.1:1".to_string());
    Settings::from_yaml_str(&format!(
      r#"
project: {{name: demo, variant: pilot, start_year: 2020, end_year: 2020}}
paths: {{data_dir: "{}", baseline_version: test}}
apis:
  search: {{endpoint: "{url}/scholarly/", apikey: secret}}
  openalex: {{endpoint: "{url}/openalex/"}}
  registry: {{endpoint: "{url}/api/"}}
retrieval: {{page_size: 10, max_tries: 1, request_delay_ms: 0, paging_calls_per_minute: 100, aggregation_calls_per_minute: 100}}
"#,
      dir.path().display()
    ))
    .unwrap()
  }

  fn strategy() -> SearchStrategy {
    SearchStrategy::from_yaml_str(
      r#"
lens_scholarly:
  main:
    topics:
      - one: {name: One, value: {"term": {"topic": "one"}}}
      - two: {name: Two, value: {"term": {"topic": "two"}}}
  secondary:
    topics:
      - three: {name: Three, value: {"term": {"topic": "three"}}}
  aggregation:
    aggregations:
      - by_year: {name: Per year, value: {"by_year": {"terms": {"field": "year_published"}}}}
"#,
    )
    .unwrap()
  }

  fn affiliated(id: &str, score: f64, orgs: &[(&str, &str)]) -> Json {
    let authors: Vec<Json> = orgs
      .iter()
      .map(|(name, grid)| {
        json!({"last_name": name, "affiliations": [{
          "name": name, "country_code": "AU", "grid_id": grid, "ids": [{"type": "grid", "value": grid}]
        }]})
      })
      .collect();
    json!({"lens_id": id, "year_published": 2020, "score": score, "fields_of_study": ["Physics"], "authors": authors})
  }

  #[traced_test]
  #[tokio::test]
  async fn test_harvest_merges_topics_and_reuses_cache() {
    let mut server = Server::new_async().await;
    let one = server
      .mock("POST", "/scholarly/search")
      .match_body(Matcher::Regex(r#""topic":"one""#.into()))
      .with_status(200)
      .with_body(
        json!({"total": 2, "max_score": 2.0, "data": [affiliated("a", 1.0, &[]), affiliated("b", 2.0, &[])]})
          .to_string(),
      )
      .expect(1)
      .create_async()
      .await;
    let two = server
      .mock("POST", "/scholarly/search")
      .match_body(Matcher::Regex(r#""topic":"two""#.into()))
      .with_status(200)
      .with_body(
        json!({"total": 2, "max_score": 5.0, "data": [affiliated("b", 1.5, &[]), affiliated("c", 5.0, &[])]})
          .to_string(),
      )
      .expect(1)
      .create_async()
      .await;
    let aggregate = server
      .mock("POST", "/scholarly/aggregate")
      .match_body(Matcher::Regex(r#""topic":"three""#.into()))
      .with_status(200)
      .with_body(
        json!({"total": 7, "aggregations": {"by_year": {"buckets": [{"key": 2020, "doc_count": 7}]}}})
          .to_string(),
      )
      .expect(2)
      .create_async()
      .await;

    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, Some(&server)));
    let summary = pipeline.harvest(&strategy()).await.unwrap();
    assert_eq!(summary.records, 3);
    assert!(!summary.from_cache);
    assert_eq!(summary.buckets.len(), 2);
    assert_eq!(summary.aggregations, 1);

    let cached = read_cache(&pipeline.settings().raw_cache_path()).unwrap();
    let b = cached.iter().find(|r| r["lens_id"] == "b").unwrap();
    assert_eq!(b["score"], json!(2.0));

    let again = pipeline.harvest(&strategy()).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.records, 3);

    one.assert_async().await;
    two.assert_async().await;
    aggregate.assert_async().await;

    let store = TabularStore::open(pipeline.settings().project_db()).await.unwrap();
    store.create_schema(PROJECT_SCHEMA).await.unwrap();
    let table = store.query("SELECT * FROM project.pilot_aggregate_three_by_year").await.unwrap();
    assert_eq!(table.get(0, "doc_count"), Some(&Value::Integer(7)));
  }

  #[traced_test]
  #[tokio::test]
  async fn test_aborted_bucket_is_not_cached() {
    let mut server = Server::new_async().await;
    let one = server
      .mock("POST", "/scholarly/search")
      .match_body(Matcher::Regex(r#""topic":"one""#.into()))
      .with_status(200)
      .with_body(json!({"total": 1, "max_score": 1.0, "data": [affiliated("a", 1.0, &[])]}).to_string())
      .expect(2)
      .create_async()
      .await;
    let failing = server
      .mock("POST", "/scholarly/search")
      .match_body(Matcher::Regex(r#""topic":"two""#.into()))
      .with_status(500)
      .expect(1)
      .create_async()
      .await;

    let strategy = SearchStrategy::from_yaml_str(
      r#"
lens_scholarly:
  main:
    topics:
      - one: {name: One, value: {"term": {"topic": "one"}}}
      - two: {name: Two, value: {"term": {"topic": "two"}}}
"#,
    )
    .unwrap();
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, Some(&server)));
    let cache = pipeline.settings().raw_cache_path();
    let partial = pipeline.settings().partial_cache_path();

    let summary = pipeline.harvest(&strategy).await.unwrap();
    assert!(summary.partial);
    assert_eq!(summary.records, 1);
    assert!(!cache.exists());
    assert_eq!(read_cache(&partial).unwrap().len(), 1);
    assert!(logs_contain("Harvest lost a bucket (two/2020)"));
    failing.assert_async().await;
    failing.remove_async().await;

    let two = server
      .mock("POST", "/scholarly/search")
      .match_body(Matcher::Regex(r#""topic":"two""#.into()))
      .with_status(200)
      .with_body(json!({"total": 1, "max_score": 1.0, "data": [affiliated("b", 1.0, &[])]}).to_string())
      .expect(1)
      .create_async()
      .await;

    let again = pipeline.harvest(&strategy).await.unwrap();
    assert!(!again.from_cache);
    assert!(!again.partial);
    assert_eq!(again.records, 2);
    assert!(cache.exists());
    assert!(!partial.exists());
    one.assert_async().await;
    two.assert_async().await;
  }

  fn normalisation_strategy() -> SearchStrategy {
    SearchStrategy::from_yaml_str(
      r#"
lens_scholarly:
  unification:
    thesaurus:
      - publication_type:
          name: Publication types
          value:
            ja: {label: Journal article, source_types: [journal article]}
            cp: {label: Conference proceedings, source_types: [conference paper]}
"#,
    )
    .unwrap()
  }

  #[traced_test]
  #[tokio::test]
  async fn test_normalisation_writes_citation_baseline() {
    let mut server = Server::new_async().await;
    let aggregation_body = || Matcher::PartialJson(json!({"size": 0, "aggregations": citation_aggregation()}));
    let graphene = server
      .mock("POST", "/scholarly/aggregate")
      .match_header("authorization", "Bearer secret")
      .match_body(Matcher::AllOf(vec![
        aggregation_body(),
        Matcher::Regex(r#""is_retracted":false"#.into()),
        Matcher::Regex(r#""field_of_study":"Graphene""#.into()),
      ]))
      .with_status(200)
      .with_body(
        json!({"total": 5, "aggregations": {"year_published": {"buckets": [{
          "key": 1_577_836_800_000_i64, "key_as_string": "2020", "doc_count": 5,
          "avg": {"value": 2.0}, "min": {"value": 0.0}, "max": {"value": 7.0}, "nb_distinct": {"value": 3}
        }]}}})
        .to_string(),
      )
      .expect(4)
      .create_async()
      .await;
    let metre = server
      .mock("POST", "/scholarly/aggregate")
      .match_body(Matcher::AllOf(vec![
        aggregation_body(),
        Matcher::Regex(r#""field_of_study":"Metre""#.into()),
        Matcher::Regex(r#""publication_type":"(journal article|conference paper)""#.into()),
      ]))
      .with_status(200)
      .with_body(json!({"total": 0, "aggregations": {"year_published": {"buckets": []}}}).to_string())
      .expect(2)
      .create_async()
      .await;

    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, Some(&server)));
    let hierarchy = TaxonomyHierarchy::from_concepts(&sample_concepts()).to_table().unwrap();
    let store = TabularStore::open(pipeline.settings().baseline_db()).await.unwrap();
    store.create_or_replace_table(BASELINE_SCHEMA, "concepts_hierarchy", &hierarchy).await.unwrap();

    let summary = pipeline.normalisation(&normalisation_strategy()).await.unwrap();
    assert_eq!(summary, NormalisationSummary { groups: 3, types: 2, combinations: 6, rows: 4 });
    graphene.assert_async().await;
    metre.assert_async().await;

    let table = store
      .query(&format!("SELECT * FROM main.{NORMALISATION_TABLE} ORDER BY parent_1, pubtype_id"))
      .await
      .unwrap();
    assert_eq!(table.len(), 4);
    assert_eq!(table.get(0, "parent_1"), Some(&Value::Text("C10".into())));
    assert_eq!(table.get(0, "pubtype_id"), Some(&Value::Text("cp".into())));
    assert_eq!(table.get(0, "year_published"), Some(&Value::Text("2020".into())));
    assert_eq!(table.get(0, "doc_count"), Some(&Value::Integer(5)));
    assert_eq!(table.get(3, "display_name_1"), Some(&Value::Text("Physical chemistry".into())));
    assert_eq!(table.get(3, "max"), Some(&Value::Real(7.0)));
  }

  #[tokio::test]
  async fn test_normalisation_requires_baselines_and_types() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, None));
    let result = pipeline.normalisation(&normalisation_strategy()).await;
    assert!(matches!(result, Err(BibnetError::Config(reason)) if reason.contains("run baselines first")));

    let result = pipeline.normalisation(&strategy()).await;
    assert!(matches!(result, Err(BibnetError::Config(reason)) if reason.contains("publication_type")));
  }

  #[tokio::test]
  async fn test_harvest_requires_api_key() {
    let dir = tempdir().unwrap();
    let settings = Settings::from_yaml_str(&format!(
      "project: {{name: demo, start_year: 2020}}\npaths: {{data_dir: \"{}\"}}",
      dir.path().display()
    ))
    .unwrap();
    let result = Pipeline::new(settings).harvest(&strategy()).await;
    assert!(matches!(result, Err(BibnetError::Config(_))));
  }

  #[traced_test]
  #[tokio::test]
  async fn test_build_writes_all_tables() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, None));

    let concepts = sample_concepts();
    let mut baselines = baseline_tables(&sample_entries()).unwrap();
    baselines.push(("concepts_hierarchy".into(), TaxonomyHierarchy::from_concepts(&concepts).to_table().unwrap()));
    let store = TabularStore::open(pipeline.settings().baseline_db()).await.unwrap();
    store.replace_tables(BASELINE_SCHEMA, baselines).await.unwrap();

    write_cache(&pipeline.settings().raw_cache_path(), &[
      affiliated("r1", 1.0, &[("Alpha", "grid.1.a"), ("Beta", "grid.2.b")]),
      affiliated("r2", 1.0, &[("Alpha", "grid.1.a"), ("Alpha", "grid.1.a")]),
    ])
    .unwrap();

    let summary = pipeline.build().await.unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.organisations, 2);
    assert_eq!(summary.locations, 1);
    assert_eq!(summary.edges, 2);
    assert_eq!(summary.tables, 15);
    assert!(logs_contain("Baseline store has no topics_hierarchy"));

    let project = pipeline.project_store().await.unwrap();
    let edges = project.query("SELECT * FROM project.pilot_net_org_edges").await.unwrap();
    assert_eq!(edges.len(), 2);
    let linked = project
      .query("SELECT category_id FROM project.pilot_categories_openalex_concepts WHERE record_id = 'r1'")
      .await
      .unwrap();
    assert_eq!(linked.get(0, "category_id"), Some(&Value::Text("C1".into())));
    assert!(project.table_exists(PROJECT_SCHEMA, "pilot_locations").await.unwrap());
  }

  #[tokio::test]
  async fn test_build_requires_harvest() {
    let dir = tempdir().unwrap();
    let result = Pipeline::new(settings(&dir, None)).build().await;
    assert!(matches!(result, Err(BibnetError::Config(_))));
  }

  #[traced_test]
  #[tokio::test]
  async fn test_build_without_baselines_still_writes_network() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, None));
    write_cache(&pipeline.settings().raw_cache_path(), &[affiliated("r1", 1.0, &[("Alpha", "g1"), ("Beta", "g2")])])
      .unwrap();

    let summary = pipeline.build().await.unwrap();
    assert_eq!(summary.edges, 1);
    assert_eq!(summary.locations, 0);
    assert!(logs_contain("No baseline store"));
  }

  #[tokio::test]
  async fn test_malformed_cache_writes_nothing() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, None));
    write_cache(&pipeline.settings().raw_cache_path(), &[json!({"lens_id": "r1", "authors": 7})]).unwrap();

    let result = pipeline.build().await;
    assert!(matches!(result, Err(BibnetError::Normalization { record: 0, .. })));
    assert!(!pipeline.settings().project_db().exists());
  }

  #[traced_test]
  #[tokio::test]
  async fn test_baselines_download_into_baseline_store() {
    let mut server = Server::new_async().await;
    let mut archive = Vec::new();
    {
      let mut zip = zip::ZipWriter::new(Cursor::new(&mut archive));
      zip.start_file("dump_schema_v2.json", zip::write::SimpleFileOptions::default()).unwrap();
      zip.write_all(&serde_json::to_vec(&sample_entries()).unwrap()).unwrap();
      zip.finish().unwrap();
    }
    server
      .mock("GET", "/api/communities/ror-data/records")
      .match_query(Matcher::Any)
      .with_body(
        json!({"hits": {"hits": [{"files": [{"key": "dump.zip", "links": {"self": format!("{}/files/dump.zip", server.url())}}]}]}})
          .to_string(),
      )
      .create_async()
      .await;
    server.mock("GET", "/files/dump.zip").with_body(archive).create_async().await;
    server
      .mock("GET", "/openalex/concepts")
      .match_query(Matcher::Any)
      .with_body(json!({"meta": {"count": 1, "next_cursor": null}, "results": [{
        "id": "https://openalex.org/C1", "display_name": "Physics", "level": 0
      }]}).to_string())
      .create_async()
      .await;
    server
      .mock("GET", "/openalex/topics")
      .match_query(Matcher::Any)
      .with_body(json!({"meta": {"count": 0, "next_cursor": null}, "results": []}).to_string())
      .create_async()
      .await;

    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(settings(&dir, Some(&server)));
    let summary = pipeline.baselines().await.unwrap();
    assert_eq!(summary, BaselineSummary { organisations: 3, concepts: 1, topics: 0 });

    let store = TabularStore::open(pipeline.settings().baseline_db()).await.unwrap();
    for table in ["ror", "ror_external_id", "concepts_nodes", "concepts_hierarchy", "topics_hierarchy"] {
      assert!(store.table_exists(BASELINE_SCHEMA, table).await.unwrap(), "{table} missing");
    }
    let index = RegistryIndex::from_store(&store, BASELINE_SCHEMA).await.unwrap();
    assert_eq!(index.resolve("grid", "grid.1.a").len(), 1);
  }
}
