//! HTTP client for the public Internet Archive API.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use archivist_shared::{ArchiveConfig, ArchivistError, ItemMetadata, Result};

use crate::{ArchiveClient, SearchResponse};

/// User-Agent string for archive requests.
const USER_AGENT: &str = concat!("Archivist/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow (downloads bounce to a data node).
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AdvancedSearch {
    response: AdvancedSearchBody,
}

#[derive(Debug, Deserialize)]
struct AdvancedSearchBody {
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Deserialize)]
struct SearchDoc {
    identifier: Option<String>,
}

// ---------------------------------------------------------------------------
// InternetArchive
// ---------------------------------------------------------------------------

/// Internet Archive client backed by `reqwest`.
pub struct InternetArchive {
    client: Client,
    base_url: Url,
    max_results: usize,
    query_suffix: String,
}

impl InternetArchive {
    /// Build a client from the `[archive]` config section.
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ArchivistError::config(format!("invalid archive base_url '{}': {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ArchivistError::config(format!(
                "archive base_url '{base_url}' cannot carry a path"
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ArchivistError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            max_results: config.max_results,
            query_suffix: config.query_suffix.trim().to_string(),
        })
    }

    /// Join path segments onto the base URL, percent-encoding each one.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ArchivistError::config("archive base_url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Apply the configured suffix to a user query.
    fn full_query(&self, query: &str) -> String {
        if self.query_suffix.is_empty() {
            query.to_string()
        } else {
            format!("{query} {}", self.query_suffix)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ArchivistError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchivistError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ArchivistError::parse(format!("{url}: invalid JSON body: {e}")))
    }

    /// Stream a single file to `dest`, going through a `.part` file.
    async fn download_file(&self, url: Url, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ArchivistError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchivistError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchivistError::io(parent, e))?;
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| ArchivistError::io(&part, e))?;

        let mut written: u64 = 0;
        let streamed: Result<()> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| ArchivistError::Network(format!("{url}: {e}")))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| ArchivistError::io(&part, e))?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| ArchivistError::io(&part, e))
        }
        .await;
        drop(file);

        if let Err(e) = streamed {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| ArchivistError::io(dest, e))?;

        Ok(written)
    }
}

#[async_trait]
impl ArchiveClient for InternetArchive {
    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> Result<SearchResponse> {
        let mut url = self.endpoint(["advancedsearch.php"])?;
        url.query_pairs_mut()
            .append_pair("q", &self.full_query(query))
            .append_pair("fl[]", "identifier")
            .append_pair("rows", &self.max_results.to_string())
            .append_pair("page", "1")
            .append_pair("output", "json");

        let body: AdvancedSearch = self.get_json(url).await?;
        let items: Vec<String> = body
            .response
            .docs
            .into_iter()
            .filter_map(|doc| doc.identifier)
            .take(self.max_results)
            .collect();

        debug!(count = items.len(), "search returned identifiers");
        Ok(SearchResponse::from_items(items))
    }

    #[instrument(skip(self))]
    async fn item_metadata(&self, identifier: &str) -> Result<ItemMetadata> {
        check_identifier(identifier)?;
        let url = self.endpoint(["metadata", identifier])?;
        let body: serde_json::Value = self.get_json(url).await?;

        // Unknown items come back as `{}` with a 200.
        if body.get("metadata").is_none() {
            return Err(ArchivistError::validation(format!(
                "unknown archive item '{identifier}'"
            )));
        }

        serde_json::from_value(body).map_err(|e| {
            ArchivistError::parse(format!("metadata for '{identifier}' is malformed: {e}"))
        })
    }

    #[instrument(skip(self, files, target_dir), fields(files = files.len()))]
    async fn download(&self, identifier: &str, files: &[String], target_dir: &Path) -> Result<()> {
        check_identifier(identifier)?;
        let item_dir = target_dir.join(identifier);

        for name in files {
            let relative = safe_relative_path(name)?;
            let dest = item_dir.join(&relative);
            let url = self.endpoint(
                ["download", identifier]
                    .into_iter()
                    .chain(name.split('/').filter(|s| !s.is_empty())),
            )?;

            match self.download_file(url, &dest).await {
                Ok(bytes) => info!(file = %name, bytes, dest = %dest.display(), "downloaded"),
                Err(e) => {
                    warn!(file = %name, error = %e, "download failed");
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Archive identifiers are a single path segment.
fn check_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.contains(['/', '\\'])
    {
        return Err(ArchivistError::validation(format!(
            "invalid archive identifier '{identifier}'"
        )));
    }
    Ok(())
}

/// Turn an archive file name into a relative path that cannot escape the item directory.
fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ArchivistError::validation(format!(
                    "refusing unsafe file name '{name}'"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ArchivistError::validation("empty file name"));
    }
    Ok(out)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}
