//! Year-bucketed, scroll-continued retrieval from the scholarly search API.
//!
//! A [`SearchQuery`] is run once per publication year, from the most recent year back to the
//! earliest. Each year is an independent bucket:
//!
//! 1. The first page is requested with the full query body (base query AND filters AND a year
//!    clause), the page size and a one-minute scroll.
//! 2. If the API reports more hits than it returned and hands back a `scroll_id`, the bucket
//!    continues with bodies carrying only the scroll token, one page per step, until the page
//!    offset reaches the reported total.
//! 3. A missing token before the end truncates the bucket; a request that still fails after
//!    retries aborts it. Either way the records already fetched are kept and the next year
//!    starts.
//!
//! Aggregation queries take a one-shot path ([`SearchClient::aggregate`]) against the
//! `aggregate` endpoint and come back as a table keyed by the aggregation's grouping field.
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::{
//!   rate::{RateLimiter, RatePolicy},
//!   retry::{RetryPolicy, RetryingHttpClient},
//!   search::{BucketStatus, SearchClient, SearchQuery},
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let client = SearchClient::new(
//!   RetryingHttpClient::new(RetryPolicy::default())?,
//!   "https://api.lens.org/scholarly/",
//!   "token",
//! )?;
//! let query = SearchQuery::new(json!({"query_string": {"query": "perovskite"}}))
//!   .with_filters(vec![json!({"match": {"publication_type": "journal article"}})])
//!   .with_page_size(1000)?;
//!
//! let mut limiter = RateLimiter::new(RatePolicy::PAGING);
//! let harvest = client.retrieve(&query, 2015, 2024, &mut limiter).await?;
//! for bucket in &harvest.buckets {
//!   if bucket.status != BucketStatus::Done {
//!     println!("{}: {:?} after {} records", bucket.year, bucket.status, bucket.retrieved);
//!   }
//! }
//! # Ok(())
//! # }
//! ```

use serde_json::Map;

use super::{
  rate::RateLimiter,
  retry::{RetrievalRequest, RetryingHttpClient, SendOutcome},
  *,
};
use crate::store::json_value;

/// Largest page the search API accepts.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// How long the server keeps a scroll context alive between pages.
const SCROLL_KEEPALIVE: &str = "1m";

/// A search or aggregation request, validated before any network call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
  query:       Json,
  filters:     Vec<Json>,
  page_size:   usize,
  sort:        Json,
  include:     Option<Vec<String>>,
  exclude:     Option<Vec<String>>,
  stemming:    bool,
  regex:       bool,
  min_score:   f64,
  aggregation: Option<Json>,
}

impl SearchQuery {
  /// Wraps a base query with the API's default paging parameters.
  ///
  /// Defaults: 100 records per page, sorted by relevance then year (both descending), stemming
  /// on, regex off, no minimum score.
  pub fn new(query: Json) -> Self {
    Self {
      query,
      filters: Vec::new(),
      page_size: 100,
      sort: json!([{"relevance": "desc"}, {"year_published": "desc"}]),
      include: None,
      exclude: None,
      stemming: true,
      regex: false,
      min_score: 0.0,
      aggregation: None,
    }
  }

  /// Sets the page size.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] above [`MAX_PAGE_SIZE`]. A size of zero is accepted here
  /// but only aggregation queries can run with it.
  pub fn with_page_size(mut self, page_size: usize) -> Result<Self, BibnetError> {
    if page_size > MAX_PAGE_SIZE {
      return Err(BibnetError::Config(format!(
        "page size {page_size} is outside 0..={MAX_PAGE_SIZE}"
      )));
    }
    self.page_size = page_size;
    Ok(self)
  }

  /// Adds clauses that every bucket's query must also satisfy.
  pub fn with_filters(mut self, filters: Vec<Json>) -> Self {
    self.filters = filters;
    self
  }

  /// Restricts returned fields.
  pub fn with_include(mut self, fields: Vec<String>) -> Self {
    self.include = Some(fields);
    self
  }

  /// Excludes returned fields.
  pub fn with_exclude(mut self, fields: Vec<String>) -> Self {
    self.exclude = Some(fields);
    self
  }

  /// Replaces the sort order.
  pub fn with_sort(mut self, sort: Json) -> Self {
    self.sort = sort;
    self
  }

  /// Toggles stemming.
  pub fn with_stemming(mut self, stemming: bool) -> Self {
    self.stemming = stemming;
    self
  }

  /// Toggles regex matching.
  pub fn with_regex(mut self, regex: bool) -> Self {
    self.regex = regex;
    self
  }

  /// Drops hits scoring below `min_score`.
  pub fn with_min_score(mut self, min_score: f64) -> Self {
    self.min_score = min_score;
    self
  }

  /// Turns the query into an aggregation query.
  pub fn with_aggregation(mut self, aggregation: Json) -> Self {
    self.aggregation = Some(aggregation);
    self
  }

  /// Records per page.
  pub fn page_size(&self) -> usize { self.page_size }

  /// The aggregation document, if any.
  pub fn aggregation(&self) -> Option<&Json> { self.aggregation.as_ref() }

  /// Base query AND filters AND `restriction`, rebuilt on every call.
  fn combined(&self, restriction: Json) -> Json {
    let mut must = Vec::with_capacity(self.filters.len() + 2);
    must.push(self.query.clone());
    must.extend(self.filters.iter().cloned());
    must.push(restriction);
    json!({"bool": {"must": must}})
  }

  fn first_page_body(&self, year: i32) -> Json {
    let mut body = json!({
      "query": self.combined(json!({"match": {"year_published": year}})),
      "size": self.page_size,
      "sort": self.sort,
      "exclude": self.exclude,
      "scroll": SCROLL_KEEPALIVE,
      "stemming": self.stemming,
      "regex": self.regex,
      "min_score": self.min_score,
    });
    if let Some(include) = &self.include {
      body["include"] = json!(include);
    }
    body
  }

  fn continuation_body(&self, scroll_id: &str) -> Json {
    let mut body = json!({"scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id});
    if let Some(include) = &self.include {
      body["include"] = json!(include);
    }
    body
  }

  fn aggregation_body(&self, aggregation: &Json, start_year: i32, end_year: i32) -> Json {
    json!({
      "query": self.combined(
        json!({"range": {"year_published": {"gte": start_year, "lte": end_year}}})
      ),
      "aggregations": aggregation,
      "size": 0,
      "stemming": self.stemming,
      "regex": self.regex,
    })
  }
}

/// One page of search results as the API returns it.
#[derive(Debug, Deserialize)]
struct SearchPage {
  total:     usize,
  #[serde(default)]
  results:   Option<usize>,
  #[serde(default)]
  max_score: Option<f64>,
  #[serde(default)]
  data:      Vec<Json>,
  #[serde(default)]
  scroll_id: Option<String>,
}

/// How a year bucket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BucketStatus {
  /// Every reported hit was paged through.
  Done,
  /// The server stopped handing out scroll tokens before the total was reached.
  Truncated,
  /// A request failed after retries, returned an error status or an unreadable body.
  Aborted,
}

/// What happened to one year bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketReport {
  /// Publication year of the bucket
  pub year:       i32,
  /// Hits reported by the API
  pub total_hits: usize,
  /// Records actually kept
  pub retrieved:  usize,
  /// Page requests issued
  pub requests:   usize,
  /// How the bucket ended
  pub status:     BucketStatus,
}

/// Records and bucket reports of one [`SearchClient::retrieve`] run.
#[derive(Debug, Clone, Default)]
pub struct SearchHarvest {
  /// Raw records, most recent year first
  pub records:   Vec<Json>,
  /// One report per year, most recent first
  pub buckets:   Vec<BucketReport>,
  /// Highest relevance score seen
  pub max_score: f64,
}

impl SearchHarvest {
  /// Page requests issued across all buckets.
  pub fn total_requests(&self) -> usize { self.buckets.iter().map(|b| b.requests).sum() }
}

/// Result of an aggregation query: one row per bucket of the grouping field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationTable {
  /// Name of the grouping aggregation, also the first column
  pub key:   String,
  /// Hits the aggregation covered
  pub total: usize,
  /// Bucket rows
  pub table: Table,
}

/// Client for the scholarly search and aggregation endpoints.
#[derive(Debug, Clone)]
pub struct SearchClient {
  http:     RetryingHttpClient,
  endpoint: String,
  apikey:   String,
}

impl SearchClient {
  /// Creates a client for `endpoint` (for example `https://api.lens.org/scholarly/`).
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::InvalidUrl`] if the endpoint does not parse.
  pub fn new(
    http: RetryingHttpClient,
    endpoint: &str,
    apikey: impl Into<String>,
  ) -> Result<Self, BibnetError> {
    let mut endpoint = url::Url::parse(endpoint)?.to_string();
    if !endpoint.ends_with('/') {
      endpoint.push('/');
    }
    Ok(Self { http, endpoint, apikey: apikey.into() })
  }

  fn request(&self, path: &str, body: Json) -> RetrievalRequest {
    RetrievalRequest::post(format!("{}{path}", self.endpoint), body)
      .with_header("Authorization", format!("Bearer {}", self.apikey))
      .with_header("Content-Type", "application/json")
  }

  /// Sends one rate-limited request and decodes a search page.
  ///
  /// Any failure is logged and reported as `None` so the bucket can be aborted.
  async fn fetch_page(
    &self,
    body: Json,
    year: i32,
    limiter: &mut RateLimiter,
  ) -> Option<SearchPage> {
    limiter.admit().await;
    let outcome = self.http.send(&self.request("search", body)).await;
    limiter.track();
    match outcome {
      SendOutcome::Failed(failure) => {
        warn!("Aborting {year}: no response after {} attempts ({})", failure.attempts, failure.last_error);
        None
      },
      SendOutcome::Completed(response) if response.status != 200 => {
        warn!("Aborting {year}: search returned status {}", response.status);
        None
      },
      SendOutcome::Completed(response) => match response.json::<SearchPage>() {
        Ok(page) => Some(page),
        Err(e) => {
          warn!("Aborting {year}: {e}");
          None
        },
      },
    }
  }

  /// Harvests every record matching `query` for each year from `end_year` down to
  /// `start_year`.
  ///
  /// Bucket failures never fail the run; they show up in [`SearchHarvest::buckets`].
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] if the page size is zero or the year range is inverted.
  pub async fn retrieve(
    &self,
    query: &SearchQuery,
    start_year: i32,
    end_year: i32,
    limiter: &mut RateLimiter,
  ) -> Result<SearchHarvest, BibnetError> {
    if query.page_size == 0 {
      return Err(BibnetError::Config(
        "page size 0 returns no documents; run it as an aggregation".to_string(),
      ));
    }
    if start_year > end_year {
      return Err(BibnetError::Config(format!("start year {start_year} is after end year {end_year}")));
    }

    info!("Starting search over {start_year}..={end_year}");
    let mut harvest = SearchHarvest::default();
    for year in (start_year..=end_year).rev() {
      let report = self.retrieve_year(query, year, limiter, &mut harvest).await;
      info!("{year}: {} of {} records ({:?})", report.retrieved, report.total_hits, report.status);
      harvest.buckets.push(report);
    }
    info!("Search finished with {} records", harvest.records.len());
    Ok(harvest)
  }

  async fn retrieve_year(
    &self,
    query: &SearchQuery,
    year: i32,
    limiter: &mut RateLimiter,
    harvest: &mut SearchHarvest,
  ) -> BucketReport {
    let mut report =
      BucketReport { year, total_hits: 0, retrieved: 0, requests: 1, status: BucketStatus::Done };

    let Some(page) = self.fetch_page(query.first_page_body(year), year, limiter).await else {
      report.status = BucketStatus::Aborted;
      return report;
    };
    report.total_hits = page.total;
    if page.total == 0 {
      return report;
    }

    let max_score = page.max_score.unwrap_or(0.0);
    harvest.max_score = harvest.max_score.max(max_score);
    let returned = page.results.unwrap_or(page.data.len());
    report.retrieved += push_scored(&mut harvest.records, page.data, max_score);

    if page.total <= returned {
      return report;
    }
    let Some(mut scroll_id) = page.scroll_id else {
      warn!("Truncating {year}: {} hits but no scroll token after the first page", page.total);
      report.status = BucketStatus::Truncated;
      return report;
    };

    let mut offset = returned;
    while offset < page.total {
      report.requests += 1;
      let Some(next) = self.fetch_page(query.continuation_body(&scroll_id), year, limiter).await
      else {
        report.status = BucketStatus::Aborted;
        return report;
      };
      let received = next.data.len();
      report.retrieved += push_scored(&mut harvest.records, next.data, max_score);
      debug!("{year}: {} of {} records retrieved", report.retrieved, page.total);
      offset += query.page_size;

      if offset >= page.total {
        break;
      }
      match next.scroll_id {
        Some(token) if received > 0 => scroll_id = token,
        _ => {
          warn!("Truncating {year}: scroll ended at {} of {} hits", report.retrieved, page.total);
          report.status = BucketStatus::Truncated;
          break;
        },
      }
    }
    report
  }

  /// Runs `query`'s aggregation once over `start_year..=end_year`.
  ///
  /// An unusable answer (transport failure, error status, missing `aggregations`) is logged and
  /// yields an empty table.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::Config`] if the query carries no aggregation.
  pub async fn aggregate(
    &self,
    query: &SearchQuery,
    start_year: i32,
    end_year: i32,
    limiter: &mut RateLimiter,
  ) -> Result<AggregationTable, BibnetError> {
    let aggregation = query
      .aggregation
      .as_ref()
      .ok_or_else(|| BibnetError::Config("query has no aggregation".to_string()))?;
    let key = aggregation
      .as_object()
      .and_then(|obj| obj.keys().next().cloned())
      .ok_or_else(|| BibnetError::Config("aggregation must be a non-empty object".to_string()))?;

    limiter.admit().await;
    let outcome = self
      .http
      .send(&self.request("aggregate", query.aggregation_body(aggregation, start_year, end_year)))
      .await;
    limiter.track();

    let empty = AggregationTable { key: key.clone(), total: 0, table: Table::new([key.as_str()]) };
    let response = match outcome {
      SendOutcome::Completed(response) if response.status == 200 => response,
      SendOutcome::Completed(response) => {
        warn!("Aggregation {key} returned status {}", response.status);
        return Ok(empty);
      },
      SendOutcome::Failed(failure) => {
        warn!("Aggregation {key} failed after {} attempts: {}", failure.attempts, failure.last_error);
        return Ok(empty);
      },
    };

    match response.json::<Json>().and_then(|body| parse_aggregation(&body)) {
      Ok(table) => {
        info!("Aggregation {} returned {} buckets", table.key, table.table.len());
        Ok(table)
      },
      Err(e) if e.is_malformed_response() => {
        warn!("Aggregation {key}: {e}");
        Ok(empty)
      },
      Err(e) => Err(e),
    }
  }
}

/// Appends records, tagging those without a `score` with the bucket's best score.
fn push_scored(records: &mut Vec<Json>, data: Vec<Json>, max_score: f64) -> usize {
  let count = data.len();
  for mut record in data {
    if let Some(obj) = record.as_object_mut() {
      obj.entry("score").or_insert_with(|| json!(max_score));
    }
    records.push(record);
  }
  count
}

/// Flattens an aggregation response into one row per bucket.
fn parse_aggregation(body: &Json) -> Result<AggregationTable, BibnetError> {
  let total = body
    .get("total")
    .and_then(Json::as_u64)
    .ok_or_else(|| BibnetError::MalformedResponse("aggregation without `total`".to_string()))?
    as usize;
  let aggregations = body
    .get("aggregations")
    .and_then(Json::as_object)
    .ok_or_else(|| BibnetError::MalformedResponse("missing `aggregations`".to_string()))?;
  let (key, grouped) = aggregations
    .iter()
    .next()
    .ok_or_else(|| BibnetError::MalformedResponse("empty `aggregations`".to_string()))?;

  let mut rows: Vec<Vec<(String, Value)>> = Vec::new();
  match grouped {
    Json::Object(obj) => match obj.get("buckets") {
      Some(Json::Array(buckets)) => {
        for bucket in buckets {
          let label = bucket
            .get("key_as_string")
            .or_else(|| bucket.get("key"))
            .map(json_value)
            .unwrap_or(Value::Null);
          let mut row = vec![(key.clone(), label)];
          if let Some(fields) = bucket.as_object() {
            flatten_bucket(fields, &["key", "key_as_string"], &mut row);
          }
          rows.push(row);
        }
      },
      _ => {
        for (label, entry) in obj {
          let mut row = vec![(key.clone(), Value::Text(label.clone()))];
          match entry {
            Json::Object(fields) => flatten_bucket(fields, &[], &mut row),
            other => row.push(("value".to_string(), json_value(other))),
          }
          rows.push(row);
        }
      },
    },
    other => rows.push(vec![(key.clone(), Value::Text(key.clone())), ("value".to_string(), json_value(other))]),
  }

  let mut columns: Vec<String> = vec![key.clone()];
  for row in &rows {
    for (name, _) in row {
      if !columns.contains(name) {
        columns.push(name.clone());
      }
    }
  }
  let mut table = Table::new(columns.clone());
  for row in rows {
    let mut cells: HashMap<String, Value> = row.into_iter().collect();
    table.push(columns.iter().map(|c| cells.remove(c).unwrap_or(Value::Null)).collect())?;
  }
  Ok(AggregationTable { key: key.clone(), total, table })
}

/// Scalar bucket fields become columns; metric sub-aggregations contribute their `value`.
fn flatten_bucket(fields: &Map<String, Json>, skip: &[&str], row: &mut Vec<(String, Value)>) {
  for (name, field) in fields {
    if skip.contains(&name.as_str()) {
      continue;
    }
    let cell = match field {
      Json::Object(inner) => match inner.get("value") {
        Some(value) => json_value(value),
        None => json_value(field),
      },
      other => json_value(other),
    };
    row.push((name.clone(), cell));
  }
}
