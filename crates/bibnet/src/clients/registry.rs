//! Download of the organisation registry data dump.
//!
//! The registry publishes its dumps as records of a community on a research repository. The
//! newest record's first file is a zip archive holding, among others, a JSON document in the
//! v2 schema named after the archive (`v1.55-2024-10-31-ror-data.zip` contains
//! `v1.55-2024-10-31-ror-data_schema_v2.json`).
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::{registry::RegistryClient, retry::{RetryPolicy, RetryingHttpClient}};
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let http = RetryingHttpClient::new(RetryPolicy::default())?;
//! let client = RegistryClient::new(http, "https://zenodo.org/api/")?;
//! let entries = client.fetch_dump().await?;
//! println!("{} organisations", entries.len());
//! # Ok(())
//! # }
//! ```

use std::io::Cursor;

use super::{
  retry::{RetrievalRequest, RetryingHttpClient},
  *,
};
use crate::registry::RegistryEntry;

/// Search listing the registry community's records, newest first.
const DUMP_SEARCH: &str = "communities/ror-data/records?q=&sort=newest";

#[derive(Debug, Deserialize)]
struct DumpSearch {
  hits: DumpHits,
}

#[derive(Debug, Deserialize)]
struct DumpHits {
  hits: Vec<DumpRecord>,
}

#[derive(Debug, Deserialize)]
struct DumpRecord {
  files: Vec<DumpFile>,
}

#[derive(Debug, Deserialize)]
struct DumpFile {
  key:   String,
  links: DumpLinks,
}

#[derive(Debug, Deserialize)]
struct DumpLinks {
  #[serde(rename = "self")]
  download: String,
}

/// Client for the repository hosting registry dumps.
#[derive(Debug, Clone)]
pub struct RegistryClient {
  http:     RetryingHttpClient,
  endpoint: String,
}

impl RegistryClient {
  /// Creates a client for the repository API at `endpoint`.
  pub fn new(http: RetryingHttpClient, endpoint: &str) -> Result<Self, BibnetError> {
    let mut endpoint = url::Url::parse(endpoint)?.to_string();
    if !endpoint.ends_with('/') {
      endpoint.push('/');
    }
    Ok(Self { http, endpoint })
  }

  /// Downloads and parses the newest dump.
  ///
  /// # Errors
  ///
  /// - [`BibnetError::ApiError`] if the listing or the archive cannot be fetched
  /// - [`BibnetError::MalformedResponse`] if the listing has no file
  /// - [`BibnetError::Zip`] if the archive lacks the v2 document
  pub async fn fetch_dump(&self) -> Result<Vec<RegistryEntry>, BibnetError> {
    info!("Looking up the newest registry dump");
    let listing = self
      .http
      .send(&RetrievalRequest::get(format!("{}{DUMP_SEARCH}", self.endpoint)))
      .await
      .into_success("registry dump search")?
      .json::<DumpSearch>()?;

    let file = listing
      .hits
      .hits
      .into_iter()
      .next()
      .and_then(|record| record.files.into_iter().next())
      .ok_or_else(|| BibnetError::MalformedResponse("registry listing has no dump file".into()))?;
    let document = file.key.replace(".zip", "_schema_v2.json");

    info!("Downloading {} from {}", file.key, file.links.download);
    let archive = self
      .http
      .send(&RetrievalRequest::get(&file.links.download))
      .await
      .into_success("registry dump download")?;

    let entries = read_dump_archive(&archive.body, &document)?;
    info!("Registry dump holds {} organisations", entries.len());
    Ok(entries)
  }
}

/// Reads `document` out of a zipped dump.
pub fn read_dump_archive(bytes: &[u8], document: &str) -> Result<Vec<RegistryEntry>, BibnetError> {
  let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
  let file = archive.by_name(document)?;
  Ok(serde_json::from_reader(file)?)
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use mockito::Server;

  use super::*;
  use crate::clients::retry::RetryPolicy;

  fn zipped(name: &str, contents: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
      let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
      zip.start_file(name, zip::write::SimpleFileOptions::default()).unwrap();
      zip.write_all(contents.as_bytes()).unwrap();
      zip.finish().unwrap();
    }
    buf
  }

  fn client(server: &mockito::ServerGuard) -> RegistryClient {
    let policy = RetryPolicy { max_tries: 1, delay: Duration::ZERO, timeout: Duration::from_secs(5) };
    RegistryClient::new(RetryingHttpClient::new(policy).unwrap(), &format!("{}/api/", server.url()))
      .unwrap()
  }

  #[traced_test]
  #[tokio::test]
  async fn test_fetch_dump_follows_listing_to_archive() {
    let mut server = Server::new_async().await;
    let dump = json!([{"id": "https://ror.org/01aaa", "status": "active"}]).to_string();
    let listing = server
      .mock("GET", "/api/communities/ror-data/records")
      .match_query(mockito::Matcher::Any)
      .with_status(200)
      .with_body(
        json!({"hits": {"hits": [{"files": [{
          "key": "v1.55-ror-data.zip",
          "links": {"self": format!("{}/files/v1.55-ror-data.zip", server.url())}
        }]}]}})
        .to_string(),
      )
      .create_async()
      .await;
    let archive = server
      .mock("GET", "/files/v1.55-ror-data.zip")
      .with_status(200)
      .with_body(zipped("v1.55-ror-data_schema_v2.json", &dump))
      .create_async()
      .await;

    let entries = client(&server).fetch_dump().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_active());
    listing.assert_async().await;
    archive.assert_async().await;
  }

  #[tokio::test]
  async fn test_empty_listing_is_malformed() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/api/communities/ror-data/records")
      .match_query(mockito::Matcher::Any)
      .with_status(200)
      .with_body(json!({"hits": {"hits": []}}).to_string())
      .create_async()
      .await;

    let err = client(&server).fetch_dump().await.unwrap_err();
    assert!(err.is_malformed_response());
  }

  #[test]
  fn test_archive_without_v2_document() {
    let bytes = zipped("v1.55-ror-data.json", "[]");
    let err = read_dump_archive(&bytes, "v1.55-ror-data_schema_v2.json").unwrap_err();
    assert!(matches!(err, BibnetError::Zip(_)));
  }
}
