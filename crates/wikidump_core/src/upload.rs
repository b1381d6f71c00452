use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde::Serialize;
use tracing::{error, info, info_span};

use crate::config::UploadTarget;
use crate::ledger::{Ledger, normalize_path};
use crate::remote::RemoteError;
use crate::retry::{RetryPolicy, Sleeper, with_retry};

const UPLOAD_TIMEOUT_SECS: u64 = 120;

/// Destination for extracted artifacts.
pub trait UploadSink {
    fn upload(&mut self, bytes: &[u8], filename: &str) -> Result<()>;
}

impl<U: UploadSink + ?Sized> UploadSink for &mut U {
    fn upload(&mut self, bytes: &[u8], filename: &str) -> Result<()> {
        (**self).upload(bytes, filename)
    }
}

/// Posts each file as a multipart `file` part to `{backend_url}/upload`.
pub struct HttpUploadSink {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpUploadSink {
    pub fn new(target: &UploadTarget) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .context("failed to build upload HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/upload", target.backend_url.trim_end_matches('/')),
            api_key: target.api_key.clone(),
        })
    }
}

impl UploadSink for HttpUploadSink {
    fn upload(&mut self, bytes: &[u8], filename: &str) -> Result<()> {
        let form = Form::new().part(
            "file",
            Part::bytes(bytes.to_vec()).file_name(filename.to_string()),
        );
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("enable_summarization", "false")])
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .map_err(|source| RemoteError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            }
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub file_path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub total: usize,
    pub uploaded: usize,
    pub failed: Vec<UploadFailure>,
}

/// Push every artifact named in the content directory's ledger to `sink`.
///
/// A missing ledger is an error. Individual files that cannot be read or
/// uploaded are logged and reported, and the remaining files still go out.
pub fn upload_from_ledger<U, S>(
    content_dir: &Path,
    sink: &mut U,
    policy: &RetryPolicy,
    sleeper: &mut S,
) -> Result<UploadReport>
where
    U: UploadSink + ?Sized,
    S: Sleeper + ?Sized,
{
    let span = info_span!("upload", content_dir = %normalize_path(content_dir));
    let _entered = span.enter();

    let records = Ledger::in_dir(content_dir).read_records()?;
    let mut report = UploadReport {
        total: records.len(),
        ..UploadReport::default()
    };

    for record in &records {
        match upload_one(&record.file_path, sink, policy, sleeper) {
            Ok(()) => {
                report.uploaded += 1;
                info!(file = %record.file_path, page_id = %record.page_id, "uploaded");
            }
            Err(upload_error) => {
                let message = format!("{upload_error:#}");
                error!(file = %record.file_path, error = %message, "upload failed");
                report.failed.push(UploadFailure {
                    file_path: record.file_path.clone(),
                    error: message,
                });
            }
        }
    }
    Ok(report)
}

fn upload_one<U, S>(
    file_path: &str,
    sink: &mut U,
    policy: &RetryPolicy,
    sleeper: &mut S,
) -> Result<()>
where
    U: UploadSink + ?Sized,
    S: Sleeper + ?Sized,
{
    let path = Path::new(file_path);
    let bytes = fs::read(path).with_context(|| format!("failed to read {file_path}"))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());
    with_retry(policy, sleeper, "upload", || sink.upload(&bytes, &filename))
        .with_context(|| format!("failed to upload {file_path}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{UploadSink, upload_from_ledger};
    use crate::ledger::{Ledger, MetadataRecord, normalize_path};
    use crate::retry::RetryPolicy;
    use crate::retry::tests::{RecordingSleeper, unavailable};

    #[derive(Default)]
    struct MockSink {
        received: Vec<(String, Vec<u8>)>,
        transient_failures: BTreeMap<String, usize>,
    }

    impl UploadSink for MockSink {
        fn upload(&mut self, bytes: &[u8], filename: &str) -> anyhow::Result<()> {
            if let Some(remaining) = self.transient_failures.get_mut(filename)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(unavailable());
            }
            self.received.push((filename.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    fn record(page_id: &str, file_path: &str, content_type: &str) -> MetadataRecord {
        MetadataRecord {
            page_title: file_path.to_string(),
            page_id: page_id.to_string(),
            source: format!("https://acme.atlassian.net/wiki/pages/{page_id}"),
            version: String::new(),
            file_path: file_path.to_string(),
            content_type: content_type.to_string(),
        }
    }

    #[test]
    fn missing_ledger_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let mut sink = MockSink::default();
        let mut sleeper = RecordingSleeper::default();
        let error = upload_from_ledger(
            temp.path(),
            &mut sink,
            &RetryPolicy::upload_default(),
            &mut sleeper,
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("__metadata__.jsonl"));
        assert!(sink.received.is_empty());
    }

    #[test]
    fn uploads_every_artifact_and_reports_failures() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        let page = dir.join("1.html");
        let image = dir.join("chart.png");
        fs::write(&page, "<p>one</p>").expect("write page");
        fs::write(&image, b"PNG").expect("write image");

        let ledger = Ledger::in_dir(dir);
        ledger
            .append(&record("1", &normalize_path(&image), "image/png"))
            .expect("append");
        ledger
            .append(&record("1", &normalize_path(&dir.join("lost.pdf")), "application/pdf"))
            .expect("append");
        ledger
            .append(&record("1", &normalize_path(&page), "page"))
            .expect("append");

        let mut sink = MockSink::default();
        sink.transient_failures.insert("1.html".to_string(), 1);
        let mut sleeper = RecordingSleeper::default();
        let report = upload_from_ledger(dir, &mut sink, &RetryPolicy::upload_default(), &mut sleeper)
            .expect("upload");

        assert_eq!(report.total, 3);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].file_path.ends_with("lost.pdf"));
        assert_eq!(
            sink.received,
            vec![
                ("chart.png".to_string(), b"PNG".to_vec()),
                ("1.html".to_string(), b"<p>one</p>".to_vec()),
            ]
        );
        assert_eq!(sleeper.sleeps, vec![Duration::from_secs(1)]);
    }
}
