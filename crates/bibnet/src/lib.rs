//! A library for harvesting bibliometric records from scholarly search APIs, normalizing them
//! into relational tables and deriving organisation collaboration networks from shared
//! authorship.
//!
//! The crate is organised leaf-first:
//! - [`clients`] - rate limiting, retrying HTTP, paged search retrieval and the registry / taxonomy
//!   downloads
//! - [`registry`] - organisation registry model and identity index
//! - [`taxonomy`] - subject classification hierarchies
//! - [`normalize`] - explode nested records into surrogate-keyed tables
//! - [`network`] - weighted co-affiliation graph derivation
//! - [`citations`] - per-discipline citation statistics for normalisation
//! - [`store`] - SQLite-backed tabular sink
//! - [`config`] and [`strategy`] - validated settings and search strategy documents
//! - [`pipeline`] - stage entry points wiring the above together
//!
//! # Example
//! ```rust,no_run
//! use bibnet::{config::Settings, pipeline::Pipeline, strategy::SearchStrategy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!   let settings = Settings::load("settings.yaml")?;
//!   let strategy = SearchStrategy::load("search_strategy.yaml")?;
//!   let pipeline = Pipeline::new(settings);
//!
//!   pipeline.harvest(&strategy).await?;
//!   let summary = pipeline.build().await?;
//!   println!("{} records, {} edges", summary.records, summary.edges);
//!
//!   Ok(())
//! }
//! ```

#![warn(missing_docs)]
use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info, trace, warn};
#[cfg(test)] use tracing_test::traced_test;

pub mod citations;
pub mod clients;
pub mod config;
pub mod errors;
pub mod network;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod taxonomy;

use errors::BibnetError;
use store::{Table, TableRow, Value};
