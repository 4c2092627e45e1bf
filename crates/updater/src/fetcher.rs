use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Body of a release asset, possibly starting part-way into the file.
pub struct AssetStream {
    /// Offset the server actually honoured: the requested one for a ranged
    /// (206) response, zero when it sent the whole file.
    pub offset: u64,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Abstraction over fetching named blobs from a release host by tag and file name.
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    /// Tag of the newest published release, if any.
    async fn latest_tag(&self) -> Result<Option<String>>;

    /// Fetch a whole (small) asset into memory.
    async fn fetch_bytes(&self, tag: &str, file: &str) -> Result<Vec<u8>>;

    /// Stream an asset, asking the server to start at `offset`.
    async fn open_stream(&self, tag: &str, file: &str, offset: u64) -> Result<AssetStream>;
}

#[async_trait]
impl<T: ReleaseFetcher + ?Sized> ReleaseFetcher for Arc<T> {
    async fn latest_tag(&self) -> Result<Option<String>> {
        (**self).latest_tag().await
    }

    async fn fetch_bytes(&self, tag: &str, file: &str) -> Result<Vec<u8>> {
        (**self).fetch_bytes(tag, file).await
    }

    async fn open_stream(&self, tag: &str, file: &str, offset: u64) -> Result<AssetStream> {
        (**self).open_stream(tag, file, offset).await
    }
}

/// Builder for [`GitHubReleaseClient`].
#[derive(Default)]
pub struct GitHubReleaseClientBuilder {
    repo: Option<String>,
    api_base: Option<Url>,
    download_base: Option<Url>,
    client: Option<Client>,
    timeout: Option<Duration>,
}

impl GitHubReleaseClientBuilder {
    /// Repository in `owner/name` form.
    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// API base URL (defaults to `https://api.github.com/`).
    pub fn api_base(mut self, url: Url) -> Self {
        self.api_base = Some(url);
        self
    }

    /// Download base URL (defaults to `https://github.com/`).
    pub fn download_base(mut self, url: Url) -> Self {
        self.download_base = Some(url);
        self
    }

    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Connect timeout used when the builder creates the client. Stalled
    /// bodies are bounded by [`DownloadManager::read_timeout`](crate::DownloadManager::read_timeout).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<GitHubReleaseClient> {
        let repo = self
            .repo
            .filter(|repo| repo.split('/').filter(|part| !part.is_empty()).count() == 2)
            .ok_or_else(|| UpdaterError::validation("repository must be given as owner/name"))?;
        let api_base = match self.api_base {
            Some(url) => url,
            None => parse_base(crate::config::DEFAULT_API_BASE)?,
        };
        let download_base = match self.download_base {
            Some(url) => url,
            None => parse_base(crate::config::DEFAULT_DOWNLOAD_BASE)?,
        };
        let client = match self.client {
            Some(client) => client,
            None => {
                let mut builder = Client::builder();
                if let Some(timeout) = self.timeout {
                    builder = builder.connect_timeout(timeout);
                }
                builder.build()?
            }
        };

        Ok(GitHubReleaseClient {
            repo,
            api_base,
            download_base,
            client,
        })
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| UpdaterError::validation(format!("invalid base URL {raw}: {err}")))
}

/// Release host speaking the GitHub releases API and download URL scheme.
#[derive(Clone)]
pub struct GitHubReleaseClient {
    repo: String,
    api_base: Url,
    download_base: Url,
    client: Client,
}

#[derive(Deserialize)]
struct ReleaseSummary {
    tag_name: Option<String>,
}

impl GitHubReleaseClient {
    /// Create a new builder.
    pub fn builder() -> GitHubReleaseClientBuilder {
        GitHubReleaseClientBuilder::default()
    }

    /// Client for the repository and hosts named in `config`.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Self::builder()
            .repo(config.repo.clone())
            .api_base(parse_base(&config.api_base)?)
            .download_base(parse_base(&config.download_base)?)
            .timeout(config.download_timeout())
            .build()
    }

    fn releases_url(&self) -> Result<Url> {
        let mut url = self
            .api_base
            .join(&format!("repos/{}/releases", self.repo))
            .map_err(|err| UpdaterError::validation(format!("invalid API URL: {err}")))?;
        url.set_query(Some("per_page=1"));
        Ok(url)
    }

    fn asset_url(&self, tag: &str, file: &str) -> Result<Url> {
        self.download_base
            .join(&format!("{}/releases/download/{tag}/{file}", self.repo))
            .map_err(|err| UpdaterError::validation(format!("invalid download URL: {err}")))
    }

    fn check_status(url: &Url, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(UpdaterError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

#[async_trait]
impl ReleaseFetcher for GitHubReleaseClient {
    async fn latest_tag(&self) -> Result<Option<String>> {
        let url = self.releases_url()?;
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("updater/", env!("CARGO_PKG_VERSION")))
            .send()
            .await?;
        Self::check_status(&url, response.status())?;
        let releases: Vec<ReleaseSummary> = response.json().await?;
        Ok(releases.into_iter().next().and_then(|release| release.tag_name))
    }

    async fn fetch_bytes(&self, tag: &str, file: &str) -> Result<Vec<u8>> {
        let url = self.asset_url(tag, file)?;
        let response = self.client.get(url.clone()).send().await?;
        Self::check_status(&url, response.status())?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn open_stream(&self, tag: &str, file: &str, offset: u64) -> Result<AssetStream> {
        let url = self.asset_url(tag, file)?;
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        let status = response.status();
        Self::check_status(&url, status)?;

        let honoured = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let body = response.bytes_stream().map_err(UpdaterError::from).boxed();
        Ok(AssetStream {
            offset: honoured,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_release_layout() {
        let client = GitHubReleaseClient::builder()
            .repo("owner/app")
            .build()
            .unwrap();
        assert_eq!(
            client.asset_url("v1.2.0", "update-v1.1.0-to-v1.2.0.zip").unwrap().as_str(),
            "https://github.com/owner/app/releases/download/v1.2.0/update-v1.1.0-to-v1.2.0.zip"
        );
        assert_eq!(
            client.releases_url().unwrap().as_str(),
            "https://api.github.com/repos/owner/app/releases?per_page=1"
        );
    }

    #[test]
    fn config_hosts_are_used() {
        let config = UpdaterConfig {
            repo: "owner/app".into(),
            download_base: "http://127.0.0.1:8080/mirror/".into(),
            ..UpdaterConfig::default()
        };
        let client = GitHubReleaseClient::from_config(&config).unwrap();
        assert_eq!(
            client.asset_url("v2", "manifest.json").unwrap().as_str(),
            "http://127.0.0.1:8080/mirror/owner/app/releases/download/v2/manifest.json"
        );
    }

    #[test]
    fn repository_must_be_owner_and_name() {
        assert!(GitHubReleaseClient::builder().repo("just-a-name").build().is_err());
        assert!(GitHubReleaseClient::builder().build().is_err());
    }
}
