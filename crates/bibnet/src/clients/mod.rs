//! Clients for the external APIs the pipeline harvests from.
//!
//! Every remote call goes through the same two building blocks:
//! - [`rate::RateLimiter`] keeps a sliding window of recent calls and blocks until a new call
//!   fits the quota
//! - [`retry::RetryingHttpClient`] sleeps a fixed delay before each attempt and retries
//!   transport failures a bounded number of times
//!
//! On top of those sit the source-specific clients:
//! - [`search`] - year-bucketed, scroll-continued retrieval and one-shot aggregations against
//!   the scholarly search API
//! - [`registry`] - download of the organisation registry dump archive
//! - [`openalex`] - cursor-paged download of the concepts and topics taxonomies
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::{
//!   rate::{RateLimiter, RatePolicy},
//!   retry::{RetryPolicy, RetryingHttpClient},
//!   search::{SearchClient, SearchQuery},
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let http = RetryingHttpClient::new(RetryPolicy::default())?;
//! let client = SearchClient::new(http, "https://api.lens.org/scholarly/", "token")?;
//! let query = SearchQuery::new(json!({"match": {"title": "graphene"}})).with_page_size(100)?;
//!
//! let mut limiter = RateLimiter::new(RatePolicy::PAGING);
//! let harvest = client.retrieve(&query, 2020, 2023, &mut limiter).await?;
//! println!("{} records", harvest.records.len());
//! # Ok(())
//! # }
//! ```

use super::*;

pub mod openalex;
pub mod rate;
pub mod registry;
pub mod retry;
pub mod search;

pub use openalex::OpenAlexClient;
pub use rate::{RateLimiter, RatePolicy};
pub use registry::RegistryClient;
pub use retry::{HttpResponse, RetrievalRequest, RetryPolicy, RetryingHttpClient, SendOutcome};
pub use search::{SearchClient, SearchQuery};
