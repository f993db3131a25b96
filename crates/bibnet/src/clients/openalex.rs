//! Cursor-paged download of the OpenAlex concept and topic vocabularies.
//!
//! Listing endpoints return at most 200 entities per page. Paging starts with `cursor=*` and
//! follows `meta.next_cursor` until the API stops returning one. Requests carry a `mailto`
//! parameter so they are served from the polite pool.
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::{
//!   openalex::OpenAlexClient,
//!   rate::{RateLimiter, RatePolicy},
//!   retry::{RetryPolicy, RetryingHttpClient},
//! };
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let http = RetryingHttpClient::new(RetryPolicy::default())?;
//! let client = OpenAlexClient::new(http, "https://api.openalex.org/", Some("me@example.org"))?;
//! let mut limiter = RateLimiter::new(RatePolicy::per_minute(600));
//! let topics = client.fetch_topics(&mut limiter).await?;
//! println!("{} topics", topics.len());
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use url::Url;

use super::{
  rate::RateLimiter,
  retry::{RetrievalRequest, RetryingHttpClient},
  *,
};
use crate::taxonomy::{Concept, Topic};

/// Entities per page; the API maximum.
const PER_PAGE: usize = 200;

#[derive(Debug, Deserialize)]
struct ListPage<T> {
  meta:    ListMeta,
  #[serde(default = "Vec::new")]
  results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
  #[serde(default)]
  count:       Option<usize>,
  #[serde(default)]
  next_cursor: Option<String>,
}

/// Client for the OpenAlex listing API.
#[derive(Debug, Clone)]
pub struct OpenAlexClient {
  http:     RetryingHttpClient,
  endpoint: Url,
  mailto:   Option<String>,
}

impl OpenAlexClient {
  /// Creates a client; `mailto` identifies the caller to the polite pool.
  pub fn new(
    http: RetryingHttpClient,
    endpoint: &str,
    mailto: Option<&str>,
  ) -> Result<Self, BibnetError> {
    let mut endpoint = Url::parse(endpoint)?;
    if !endpoint.path().ends_with('/') {
      let path = format!("{}/", endpoint.path());
      endpoint.set_path(&path);
    }
    Ok(Self { http, endpoint, mailto: mailto.map(str::to_string) })
  }

  fn page_url(&self, entity: &str, cursor: &str) -> Result<Url, BibnetError> {
    let mut url = self.endpoint.join(entity)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("per-page", &PER_PAGE.to_string());
      query.append_pair("cursor", cursor);
      if let Some(mailto) = &self.mailto {
        query.append_pair("mailto", mailto);
      }
    }
    Ok(url)
  }

  /// Downloads every entity of a listing.
  async fn fetch_all<T: DeserializeOwned>(
    &self,
    entity: &str,
    limiter: &mut RateLimiter,
  ) -> Result<Vec<T>, BibnetError> {
    let mut items = Vec::new();
    let mut cursor = "*".to_string();
    loop {
      let url = self.page_url(entity, &cursor)?;
      limiter.admit().await;
      let response = self.http.send(&RetrievalRequest::get(url.as_str())).await;
      limiter.track();

      let page: ListPage<T> = response.into_success(entity)?.json()?;
      let received = page.results.len();
      items.extend(page.results);
      debug!("{entity}: {} of {:?}", items.len(), page.meta.count);

      match page.meta.next_cursor {
        Some(next) if received > 0 => cursor = next,
        _ => break,
      }
    }
    info!("Downloaded {} {entity}", items.len());
    Ok(items)
  }

  /// Downloads every concept.
  pub async fn fetch_concepts(&self, limiter: &mut RateLimiter) -> Result<Vec<Concept>, BibnetError> {
    self.fetch_all("concepts", limiter).await
  }

  /// Downloads every topic.
  pub async fn fetch_topics(&self, limiter: &mut RateLimiter) -> Result<Vec<Topic>, BibnetError> {
    self.fetch_all("topics", limiter).await
  }
}
