use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const LEDGER_FILENAME: &str = "__metadata__.jsonl";
pub const PAGE_CONTENT_TYPE: &str = "page";

/// One persisted artifact, as consumed by the downstream uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub page_title: String,
    pub page_id: String,
    pub source: String,
    pub version: String,
    pub file_path: String,
    pub content_type: String,
}

impl MetadataRecord {
    pub fn is_page(&self) -> bool {
        self.content_type == PAGE_CONTENT_TYPE
    }
}

/// Append-only JSON Lines manifest living next to the extracted files.
///
/// Appends are only safe from a single writer; two extractions sharing a
/// content directory will interleave lines.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn in_dir(content_dir: &Path) -> Self {
        Self {
            path: content_dir.join(LEDGER_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn append(&self, record: &MetadataRecord) -> Result<()> {
        let mut line =
            serde_json::to_string(record).context("failed to serialize metadata record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }

    pub fn read_records(&self) -> Result<Vec<MetadataRecord>> {
        if !self.exists() {
            bail!(
                "no {LEDGER_FILENAME} file found in {}",
                self.path
                    .parent()
                    .map(|parent| parent.display().to_string())
                    .unwrap_or_default()
            );
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: MetadataRecord = serde_json::from_str(line).with_context(|| {
                format!(
                    "failed to decode {} line {}",
                    self.path.display(),
                    index + 1
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub ledger_path: String,
    pub ledger_exists: bool,
    pub total_records: usize,
    pub by_content_type: BTreeMap<String, usize>,
    /// Records whose artifact file is gone or empty.
    pub missing_files: Vec<String>,
    /// Page files with no ledger record, left behind by an interrupted run.
    pub orphan_pages: Vec<String>,
}

/// Reconcile the ledger against the files actually present in `content_dir`.
pub fn inspect_ledger(content_dir: &Path) -> Result<LedgerStatus> {
    let ledger = Ledger::in_dir(content_dir);
    let records = if ledger.exists() {
        ledger.read_records()?
    } else {
        Vec::new()
    };

    let mut by_content_type = BTreeMap::new();
    let mut missing_files = Vec::new();
    let mut recorded_pages = BTreeSet::new();
    for record in &records {
        *by_content_type
            .entry(record.content_type.clone())
            .or_insert(0usize) += 1;
        let artifact = Path::new(&record.file_path);
        let present = fs::metadata(artifact)
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false);
        if !present {
            missing_files.push(record.file_path.clone());
        }
        if record.is_page() {
            recorded_pages.insert(record.page_id.clone());
        }
    }

    let mut orphan_pages = Vec::new();
    if content_dir.is_dir() {
        for entry in fs::read_dir(content_dir)
            .with_context(|| format!("failed to list {}", content_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed to list {}", content_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("html") {
                continue;
            }
            let Some(page_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !recorded_pages.contains(page_id) {
                orphan_pages.push(normalize_path(&path));
            }
        }
    }
    orphan_pages.sort();

    Ok(LedgerStatus {
        ledger_path: normalize_path(ledger.path()),
        ledger_exists: ledger.exists(),
        total_records: records.len(),
        by_content_type,
        missing_files,
        orphan_pages,
    })
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{LEDGER_FILENAME, Ledger, MetadataRecord, inspect_ledger, normalize_path};

    fn record(page_id: &str, file_path: &str, content_type: &str) -> MetadataRecord {
        MetadataRecord {
            page_title: format!("Page {page_id}"),
            page_id: page_id.to_string(),
            source: format!("https://acme.atlassian.net/wiki/pages/{page_id}"),
            version: "2024-01-01T00:00:00.000Z".to_string(),
            file_path: file_path.to_string(),
            content_type: content_type.to_string(),
        }
    }

    #[test]
    fn append_writes_one_json_object_per_line() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::in_dir(temp.path());
        assert!(!ledger.exists());

        ledger.append(&record("1", "a.html", "page")).expect("append");
        ledger
            .append(&record("1", "a.png", "image/png"))
            .expect("append");

        let raw = fs::read_to_string(temp.path().join(LEDGER_FILENAME)).expect("read ledger");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(raw.ends_with('\n'));
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["page_id"], "1");
        assert_eq!(first["content_type"], "page");
        assert_eq!(first["file_path"], "a.html");
    }

    #[test]
    fn append_keeps_existing_records() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::in_dir(temp.path());
        ledger.append(&record("1", "a.html", "page")).expect("append");

        let reopened = Ledger::in_dir(temp.path());
        reopened
            .append(&record("2", "b.html", "page"))
            .expect("append");

        let records = reopened.read_records().expect("read");
        assert_eq!(
            records
                .iter()
                .map(|item| item.page_id.as_str())
                .collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }

    #[test]
    fn read_records_requires_ledger() {
        let temp = tempdir().expect("tempdir");
        let error = Ledger::in_dir(temp.path())
            .read_records()
            .expect_err("must fail");
        assert!(error.to_string().contains(LEDGER_FILENAME));
    }

    #[test]
    fn read_records_reports_bad_line_number() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::in_dir(temp.path());
        ledger.append(&record("1", "a.html", "page")).expect("append");
        let mut raw = fs::read_to_string(ledger.path()).expect("read");
        raw.push_str("\n{not json}\n");
        fs::write(ledger.path(), raw).expect("write");

        let error = ledger.read_records().expect_err("must fail");
        assert!(format!("{error:#}").contains("line 3"));
    }

    #[test]
    fn inspect_reports_missing_and_orphan_files() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        let present = dir.join("1.html");
        fs::write(&present, "<p>one</p>").expect("write page");
        fs::write(dir.join("9.html"), "<p>orphan</p>").expect("write orphan");

        let ledger = Ledger::in_dir(dir);
        ledger
            .append(&record("1", &normalize_path(&present), "page"))
            .expect("append");
        ledger
            .append(&record(
                "1",
                &normalize_path(&dir.join("gone.pdf")),
                "application/pdf",
            ))
            .expect("append");

        let status = inspect_ledger(dir).expect("inspect");
        assert!(status.ledger_exists);
        assert_eq!(status.total_records, 2);
        assert_eq!(status.by_content_type.get("page"), Some(&1));
        assert_eq!(status.by_content_type.get("application/pdf"), Some(&1));
        assert_eq!(status.missing_files.len(), 1);
        assert!(status.missing_files[0].ends_with("gone.pdf"));
        assert_eq!(status.orphan_pages.len(), 1);
        assert!(status.orphan_pages[0].ends_with("9.html"));
    }

    #[test]
    fn inspect_tolerates_missing_ledger() {
        let temp = tempdir().expect("tempdir");
        let status = inspect_ledger(temp.path()).expect("inspect");
        assert!(!status.ledger_exists);
        assert_eq!(status.total_records, 0);
    }
}
