use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::DumpConfig;

/// Expansion requested for page bodies: storage markup plus version info.
pub const PAGE_EXPAND: &str = "body.storage.value,version";
pub const STATUS_CURRENT: &str = "current";

const ATTACHMENT_BATCH_SIZE: usize = 50;

/// Failure talking to the content service, classified for retry decisions.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed with HTTP {status}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Decode { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageDescriptor {
    pub id: String,
    pub title: String,
    pub body_raw: String,
    pub version_timestamp: String,
    pub web_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentDescriptor {
    pub page_id: String,
    pub title: String,
    pub media_type: String,
    pub download_path: String,
}

/// Filters for the "list pages in space" call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub space: String,
    pub status: String,
    pub expand: String,
}

impl PageQuery {
    /// Published pages only: archived and trashed content is excluded.
    pub fn current(space: &str) -> Self {
        Self {
            space: space.to_string(),
            status: STATUS_CURRENT.to_string(),
            expand: PAGE_EXPAND.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl Download {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait ContentApi {
    fn list_pages(
        &mut self,
        query: &PageQuery,
        start: usize,
        limit: usize,
    ) -> Result<Vec<PageDescriptor>>;
    fn get_page(&mut self, page_id: &str, expand: &str) -> Result<PageDescriptor>;
    fn list_attachments(&mut self, page_id: &str) -> Result<Vec<AttachmentDescriptor>>;
    fn download(&mut self, url: &str) -> Result<Download>;
    fn request_count(&self) -> usize;
}

impl<A: ContentApi + ?Sized> ContentApi for &mut A {
    fn list_pages(
        &mut self,
        query: &PageQuery,
        start: usize,
        limit: usize,
    ) -> Result<Vec<PageDescriptor>> {
        (**self).list_pages(query, start, limit)
    }

    fn get_page(&mut self, page_id: &str, expand: &str) -> Result<PageDescriptor> {
        (**self).get_page(page_id, expand)
    }

    fn list_attachments(&mut self, page_id: &str) -> Result<Vec<AttachmentDescriptor>> {
        (**self).list_attachments(page_id)
    }

    fn download(&mut self, url: &str) -> Result<Download> {
        (**self).download(url)
    }

    fn request_count(&self) -> usize {
        (**self).request_count()
    }
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub username: String,
    pub api_token: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &DumpConfig) -> Result<Self> {
        let credentials = config.credentials()?;
        Ok(Self {
            base_url: config.base_url()?,
            username: credentials.username,
            api_token: credentials.api_token,
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            rate_limit_ms: config.rate_limit_ms(),
        })
    }
}

/// Blocking client for the Confluence Cloud content REST API.
pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .header("User-Agent", self.config.user_agent.clone())
    }

    fn get_json<T: DeserializeOwned>(&mut self, url: &str, query: &[(&str, String)]) -> Result<T> {
        self.apply_rate_limit();
        let request = self.authorized(self.client.get(url)).query(query);
        let response = request.send().map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let payload = response.json::<T>().map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })?;
        Ok(payload)
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl ContentApi for ConfluenceClient {
    fn list_pages(
        &mut self,
        query: &PageQuery,
        start: usize,
        limit: usize,
    ) -> Result<Vec<PageDescriptor>> {
        let url = self.endpoint("/rest/api/content");
        let params = vec![
            ("spaceKey", query.space.clone()),
            ("type", "page".to_string()),
            ("status", query.status.clone()),
            ("expand", query.expand.clone()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
        ];
        let parsed: ContentListResponse = self
            .get_json(&url, &params)
            .with_context(|| format!("failed to list pages in space {}", query.space))?;
        Ok(parsed.results.into_iter().map(PageDescriptor::from).collect())
    }

    fn get_page(&mut self, page_id: &str, expand: &str) -> Result<PageDescriptor> {
        let url = self.endpoint(&format!("/rest/api/content/{page_id}"));
        let parsed: ContentItem = self
            .get_json(&url, &[("expand", expand.to_string())])
            .with_context(|| format!("failed to fetch page {page_id}"))?;
        Ok(parsed.into())
    }

    fn list_attachments(&mut self, page_id: &str) -> Result<Vec<AttachmentDescriptor>> {
        let url = self.endpoint(&format!("/rest/api/content/{page_id}/child/attachment"));
        collect_batches(|start| {
            let params = vec![
                ("start", start.to_string()),
                ("limit", ATTACHMENT_BATCH_SIZE.to_string()),
            ];
            let parsed: AttachmentListResponse = self
                .get_json(&url, &params)
                .with_context(|| format!("failed to list attachments of page {page_id}"))?;
            Ok(parsed
                .results
                .into_iter()
                .map(|item| item.into_descriptor(page_id))
                .collect())
        })
    }

    fn download(&mut self, url: &str) -> Result<Download> {
        self.apply_rate_limit();
        let response = self
            .authorized(self.client.get(url))
            .send()
            .map_err(|source| RemoteError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Download {
                status: status.as_u16(),
                bytes: Vec::new(),
            });
        }
        let bytes = response.bytes().map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;
        Ok(Download {
            status: status.as_u16(),
            bytes: bytes.to_vec(),
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Append an API-relative path (`/spaces/...`, `/download/...`) to a base URL.
pub fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Request batches at `start = collected so far` until one comes back empty.
/// The server may return fewer items than the requested limit.
fn collect_batches<T, F>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize) -> Result<Vec<T>>,
{
    let mut items = Vec::new();
    loop {
        let batch = fetch(items.len())?;
        if batch.is_empty() {
            break;
        }
        items.extend(batch);
    }
    Ok(items)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

#[derive(Debug, Deserialize, Default)]
struct ContentListResponse {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<ContentBody>,
    #[serde(default)]
    version: Option<ContentVersion>,
    #[serde(default, rename = "_links")]
    links: ContentLinks,
}

#[derive(Debug, Deserialize, Default)]
struct ContentBody {
    storage: Option<StorageValue>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct ContentVersion {
    when: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ContentLinks {
    webui: Option<String>,
    download: Option<String>,
}

impl From<ContentItem> for PageDescriptor {
    fn from(item: ContentItem) -> Self {
        Self {
            id: item.id,
            title: item.title,
            body_raw: item
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            version_timestamp: item
                .version
                .and_then(|version| version.when)
                .unwrap_or_default(),
            web_path: item.links.webui.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AttachmentListResponse {
    #[serde(default)]
    results: Vec<AttachmentItem>,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    metadata: AttachmentMetadata,
    #[serde(default, rename = "_links")]
    links: ContentLinks,
}

#[derive(Debug, Deserialize, Default)]
struct AttachmentMetadata {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

impl AttachmentItem {
    fn into_descriptor(self, page_id: &str) -> AttachmentDescriptor {
        AttachmentDescriptor {
            page_id: page_id.to_string(),
            title: self.title,
            media_type: self.metadata.media_type.unwrap_or_default(),
            download_path: self.links.download.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AttachmentListResponse, ContentListResponse, Download, PageDescriptor, PageQuery,
        RemoteError, collect_batches, join_url,
    };

    #[test]
    fn decodes_page_listing() {
        let payload = r#"{
            "results": [
                {
                    "id": "65537",
                    "type": "page",
                    "status": "current",
                    "title": "Onboarding",
                    "body": {"storage": {"value": "<p>Hello</p>", "representation": "storage"}},
                    "version": {"when": "2023-05-04T10:11:12.000Z", "number": 7},
                    "_links": {"webui": "/spaces/ENG/pages/65537/Onboarding"}
                },
                {"id": "65538", "title": "Bare"}
            ],
            "start": 0,
            "limit": 50,
            "size": 2
        }"#;
        let parsed: ContentListResponse = serde_json::from_str(payload).expect("decode");
        let pages = parsed
            .results
            .into_iter()
            .map(PageDescriptor::from)
            .collect::<Vec<_>>();

        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[0],
            PageDescriptor {
                id: "65537".to_string(),
                title: "Onboarding".to_string(),
                body_raw: "<p>Hello</p>".to_string(),
                version_timestamp: "2023-05-04T10:11:12.000Z".to_string(),
                web_path: "/spaces/ENG/pages/65537/Onboarding".to_string(),
            }
        );
        assert_eq!(pages[1].body_raw, "");
        assert_eq!(pages[1].web_path, "");
    }

    #[test]
    fn decodes_attachment_listing() {
        let payload = r#"{
            "results": [
                {
                    "id": "att1",
                    "title": "diagram.png",
                    "metadata": {"mediaType": "image/png"},
                    "_links": {"download": "/download/attachments/65537/diagram.png?api=v2"}
                }
            ]
        }"#;
        let parsed: AttachmentListResponse = serde_json::from_str(payload).expect("decode");
        let attachment = parsed
            .results
            .into_iter()
            .next()
            .expect("one attachment")
            .into_descriptor("65537");

        assert_eq!(attachment.page_id, "65537");
        assert_eq!(attachment.title, "diagram.png");
        assert_eq!(attachment.media_type, "image/png");
        assert_eq!(
            attachment.download_path,
            "/download/attachments/65537/diagram.png?api=v2"
        );
    }

    #[test]
    fn status_errors_classify_transience() {
        let status = |status| RemoteError::Status {
            status,
            url: "https://example.test".to_string(),
        };
        assert!(status(429).is_transient());
        assert!(status(408).is_transient());
        assert!(status(502).is_transient());
        assert!(!status(401).is_transient());
        assert!(!status(404).is_transient());
    }

    #[test]
    fn current_query_filters_published_pages() {
        let query = PageQuery::current("ENG");
        assert_eq!(query.space, "ENG");
        assert_eq!(query.status, "current");
        assert_eq!(query.expand, "body.storage.value,version");
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("https://acme.atlassian.net/wiki/", "/spaces/ENG"),
            "https://acme.atlassian.net/wiki/spaces/ENG"
        );
        assert_eq!(
            join_url("https://acme.atlassian.net/wiki", "rest/api/content"),
            "https://acme.atlassian.net/wiki/rest/api/content"
        );
    }

    #[test]
    fn download_success_range() {
        let ok = Download {
            status: 204,
            bytes: Vec::new(),
        };
        let missing = Download {
            status: 404,
            bytes: Vec::new(),
        };
        assert!(ok.is_success());
        assert!(!missing.is_success());
    }

    #[test]
    fn collect_batches_keeps_going_past_short_batches() {
        let total = 40usize;
        let server_cap = 25usize;
        let mut starts = Vec::new();
        let collected = collect_batches(|start| {
            starts.push(start);
            Ok((start..total).take(server_cap).collect::<Vec<_>>())
        })
        .expect("collect");

        assert_eq!(collected, (0..total).collect::<Vec<_>>());
        assert_eq!(starts, vec![0, 25, 40]);
    }

    #[test]
    fn collect_batches_propagates_errors() {
        let result: anyhow::Result<Vec<usize>> =
            collect_batches(|_| Err(anyhow::anyhow!("listing failed")));
        assert!(result.is_err());
    }
}
