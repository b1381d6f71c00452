use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, error, field, info, info_span, warn};

use crate::ledger::{LEDGER_FILENAME, Ledger, MetadataRecord, PAGE_CONTENT_TYPE, normalize_path};
use crate::normalize::normalize;
use crate::remote::{
    AttachmentDescriptor, ContentApi, PAGE_EXPAND, PageDescriptor, PageQuery, join_url,
};
use crate::retry::{RetryPolicy, Sleeper, paginate, with_retry};

/// What the controller does after a page fails to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorPolicy {
    #[default]
    Continue,
    Abort,
}

/// Extraction lifecycle of one page, inferred from its file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Pending,
    Extracted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PageOutcome {
    Skipped,
    Extracted {
        attachments_written: usize,
        attachments_skipped: usize,
    },
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub content_dir: PathBuf,
    pub base_url: String,
    pub retry: RetryPolicy,
    pub on_page_error: PageErrorPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub page_id: String,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub success: bool,
    pub discovered: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub failed: Vec<PageFailure>,
    pub attachments_written: usize,
    pub attachments_skipped: usize,
    pub request_count: usize,
}

impl ExtractReport {
    fn record(&mut self, outcome: &PageOutcome) {
        match outcome {
            PageOutcome::Skipped => self.skipped += 1,
            PageOutcome::Extracted {
                attachments_written,
                attachments_skipped,
            } => {
                self.extracted += 1;
                self.attachments_written += attachments_written;
                self.attachments_skipped += attachments_skipped;
            }
        }
    }
}

/// Per-page work: skip check, fetch, normalize, write, attachments, ledger.
pub struct PageProcessor<A, S> {
    api: A,
    sleeper: S,
    retry: RetryPolicy,
    ledger: Ledger,
    content_dir: PathBuf,
    base_url: String,
}

impl<A: ContentApi, S: Sleeper> PageProcessor<A, S> {
    pub fn new(api: A, sleeper: S, options: &ExtractOptions) -> Self {
        Self {
            api,
            sleeper,
            retry: options.retry,
            ledger: Ledger::in_dir(&options.content_dir),
            content_dir: options.content_dir.clone(),
            base_url: options.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn page_path(&self, page_id: &str) -> Result<PathBuf> {
        let file_name = format!("{page_id}.html");
        ensure_plain_file_name(&file_name)
            .with_context(|| format!("unusable page id {page_id:?}"))?;
        Ok(self.content_dir.join(file_name))
    }

    pub fn page_state(&self, page_id: &str) -> Result<PageState> {
        if self.page_path(page_id)?.exists() {
            Ok(PageState::Extracted)
        } else {
            Ok(PageState::Pending)
        }
    }

    /// Extract one page unless its file already exists.
    ///
    /// The page record is appended last, after the HTML file and every
    /// attachment record. A failure before that leaves no page record.
    pub fn process(
        &mut self,
        page: &PageDescriptor,
        include_attachments: bool,
    ) -> Result<PageOutcome> {
        let file_path = self.page_path(&page.id)?;
        if file_path.exists() {
            debug!(page_id = %page.id, path = %normalize_path(&file_path), "already extracted, skipping");
            return Ok(PageOutcome::Skipped);
        }

        info!(page_id = %page.id, title = %page.title, "processing page");
        let full = with_retry(&self.retry, &mut self.sleeper, "get_page", || {
            self.api.get_page(&page.id, PAGE_EXPAND)
        })
        .with_context(|| format!("failed to fetch content of page {}", page.id))?;

        let html = normalize(&full.body_raw);
        fs::write(&file_path, html)
            .with_context(|| format!("failed to write {}", file_path.display()))?;

        let (attachments_written, attachments_skipped) = if include_attachments {
            self.process_attachments(page)?
        } else {
            (0, 0)
        };

        let version = if page.version_timestamp.is_empty() {
            full.version_timestamp.clone()
        } else {
            page.version_timestamp.clone()
        };
        let web_path = if page.web_path.is_empty() {
            &full.web_path
        } else {
            &page.web_path
        };
        self.ledger.append(&MetadataRecord {
            page_title: page.title.clone(),
            page_id: page.id.clone(),
            source: join_url(&self.base_url, web_path),
            version,
            file_path: normalize_path(&file_path),
            content_type: PAGE_CONTENT_TYPE.to_string(),
        })?;

        Ok(PageOutcome::Extracted {
            attachments_written,
            attachments_skipped,
        })
    }

    fn process_attachments(&mut self, page: &PageDescriptor) -> Result<(usize, usize)> {
        let attachments = with_retry(&self.retry, &mut self.sleeper, "list_attachments", || {
            self.api.list_attachments(&page.id)
        })
        .with_context(|| format!("failed to list attachments of page {}", page.id))?;

        let mut written = 0usize;
        let mut skipped = 0usize;
        for attachment in &attachments {
            if self.save_attachment(page, attachment)? {
                written += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((written, skipped))
    }

    /// Attachments share the content directory with page files, so a title may
    /// neither name a page file (`{digits}.html`) nor replace an existing one.
    fn ensure_attachment_target(&self, title: &str) -> Result<()> {
        ensure_plain_file_name(title)?;
        if is_page_file_name(title) {
            bail!("file name {title:?} is reserved for page content");
        }
        let target = self.content_dir.join(title);
        if has_html_extension(title) && target.exists() {
            bail!("refusing to overwrite existing page file {title:?}");
        }
        Ok(())
    }

    /// Returns `false` when the attachment was skipped. Filesystem and ledger
    /// errors still propagate.
    fn save_attachment(
        &mut self,
        page: &PageDescriptor,
        attachment: &AttachmentDescriptor,
    ) -> Result<bool> {
        let url = join_url(&self.base_url, &attachment.download_path);
        if let Err(reason) = self.ensure_attachment_target(&attachment.title) {
            warn!(
                page_id = %page.id,
                attachment = %attachment.title,
                url = %url,
                reason = %reason,
                "skipping attachment with unusable file name"
            );
            return Ok(false);
        }

        let download = match self.api.download(&url) {
            Ok(download) => download,
            Err(error) => {
                warn!(
                    page_id = %page.id,
                    attachment = %attachment.title,
                    url = %url,
                    error = %format!("{error:#}"),
                    "attachment download failed, skipping"
                );
                return Ok(false);
            }
        };
        if !download.is_success() {
            warn!(
                page_id = %page.id,
                attachment = %attachment.title,
                url = %url,
                status = download.status,
                "attachment download returned non-success status, skipping"
            );
            return Ok(false);
        }

        let file_path = self.content_dir.join(&attachment.title);
        fs::write(&file_path, &download.bytes)
            .with_context(|| format!("failed to write {}", file_path.display()))?;
        self.ledger.append(&MetadataRecord {
            page_title: attachment.title.clone(),
            page_id: page.id.clone(),
            source: url,
            version: String::new(),
            file_path: normalize_path(&file_path),
            content_type: attachment.media_type.clone(),
        })?;
        debug!(page_id = %page.id, attachment = %attachment.title, "attachment saved");
        Ok(true)
    }
}

/// Lists a space and drives the [`PageProcessor`] over every page, one at a
/// time. Running two extractors against one content directory is not
/// supported.
pub struct Extractor<A, S> {
    processor: PageProcessor<A, S>,
    on_page_error: PageErrorPolicy,
    span: Span,
}

impl<A: ContentApi, S: Sleeper> Extractor<A, S> {
    pub fn new(api: A, sleeper: S, options: ExtractOptions) -> Self {
        let span = info_span!(
            "extract",
            content_dir = %normalize_path(&options.content_dir),
            space = field::Empty
        );
        Self {
            processor: PageProcessor::new(api, sleeper, &options),
            on_page_error: options.on_page_error,
            span,
        }
    }

    pub fn processor(&self) -> &PageProcessor<A, S> {
        &self.processor
    }

    pub fn extract_all(
        &mut self,
        space_key: &str,
        include_attachments: bool,
        page_size: usize,
        max_pages: usize,
    ) -> Result<ExtractReport> {
        self.span.record("space", space_key);
        let run_span = self.span.clone();
        let _run = run_span.enter();

        let query = PageQuery::current(space_key);
        let PageProcessor {
            api,
            sleeper,
            retry,
            ..
        } = &mut self.processor;
        let pages = paginate(&*retry, sleeper, page_size, max_pages, |start, limit| {
            api.list_pages(&query, start, limit)
        })
        .with_context(|| format!("failed to list pages in space {space_key}"))?;

        info!(space = space_key, count = pages.len(), "found {} pages", pages.len());

        let mut report = ExtractReport {
            discovered: pages.len(),
            ..ExtractReport::default()
        };
        for page in &pages {
            let page_span = info_span!(parent: &self.span, "page", page_id = %page.id);
            let _page = page_span.enter();
            match self.processor.process(page, include_attachments) {
                Ok(outcome) => report.record(&outcome),
                Err(error) => {
                    error!(
                        page_id = %page.id,
                        title = %page.title,
                        error = %format!("{error:#}"),
                        "failed to extract page"
                    );
                    if self.on_page_error == PageErrorPolicy::Abort {
                        return Err(error.context(format!(
                            "extraction aborted at page {} ({})",
                            page.id, page.title
                        )));
                    }
                    report.failed.push(PageFailure {
                        page_id: page.id.clone(),
                        title: page.title.clone(),
                        error: format!("{error:#}"),
                    });
                }
            }
        }

        report.request_count = self.processor.api.request_count();
        report.success = report.failed.is_empty();
        Ok(report)
    }

    /// Extract a single page by id, outside of a space listing.
    pub fn extract_page(&mut self, page_id: &str, include_attachments: bool) -> Result<PageOutcome> {
        let run_span = self.span.clone();
        let _run = run_span.enter();

        if self.processor.page_state(page_id)? == PageState::Extracted {
            debug!(page_id, "already extracted, skipping");
            return Ok(PageOutcome::Skipped);
        }
        let processor = &mut self.processor;
        let page = with_retry(&processor.retry, &mut processor.sleeper, "get_page", || {
            processor.api.get_page(page_id, PAGE_EXPAND)
        })
        .with_context(|| format!("failed to fetch page {page_id}"))?;
        processor.process(&page, include_attachments)
    }
}

/// Reject names that would escape the content directory or clobber the ledger.
fn ensure_plain_file_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("empty file name");
    }
    if trimmed == "." || trimmed == ".." {
        bail!("relative path component {trimmed:?}");
    }
    if name.contains(['/', '\\', '\0']) {
        bail!("file name {name:?} contains a path separator");
    }
    if name == LEDGER_FILENAME {
        bail!("file name collides with the metadata ledger");
    }
    let path = Path::new(name);
    if path.file_name().map(|file| file.len()) != Some(name.len()) {
        bail!("file name {name:?} is not a plain file name");
    }
    Ok(())
}

fn has_html_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html"))
}

fn is_page_file_name(name: &str) -> bool {
    has_html_extension(name)
        && Path::new(name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| !stem.is_empty() && stem.bytes().all(|byte| byte.is_ascii_digit()))
}
