use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::DumpConfig;
use crate::ledger::normalize_path;

pub const STATE_DIR_NAME: &str = ".wikidump";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})",
            normalize_path(&self.project_root),
            self.root_source.as_str(),
            normalize_path(&self.state_dir),
            normalize_path(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDir {
    pub path: PathBuf,
    pub source: ValueSource,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = if let Some(path) = overrides.project_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WIKIDUMP_PROJECT_ROOT")) {
        (
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let state_dir = project_root.join(STATE_DIR_NAME);
    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WIKIDUMP_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        root_source,
        config_source,
    })
}

/// Where a space is extracted to.
///
/// An explicit directory is used as-is; otherwise the configured base folder
/// gets the space key appended (`{base}-{space}`).
pub fn resolve_content_dir(
    paths: &ResolvedPaths,
    config: &DumpConfig,
    space_key: &str,
    explicit: Option<&Path>,
) -> Result<ContentDir> {
    if let Some(path) = explicit {
        return Ok(ContentDir {
            path: absolutize(path, &paths.project_root),
            source: ValueSource::Flag,
        });
    }
    let space_key = space_key.trim();
    if space_key.is_empty() {
        bail!("a space key is required to derive the content directory");
    }
    let source = if config.extract.content_dir.is_some() {
        ValueSource::Config
    } else {
        ValueSource::Default
    };
    let base = config.content_base().trim_end_matches(['/', '\\']);
    Ok(ContentDir {
        path: absolutize(Path::new(&format!("{base}-{space_key}")), &paths.project_root),
        source,
    })
}

/// Create the content directory if needed. Returns `true` when it was created.
pub fn ensure_content_dir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    if path.exists() {
        bail!(
            "content path exists but is not a directory: {}",
            normalize_path(path)
        );
    }
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(true)
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    if !paths.state_dir.exists() {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
        created_dirs.push(paths.state_dir.clone());
    }

    let wrote_config = write_text_file(&paths.config_path, &render_config_template(), options.force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_config_template() -> String {
    format!(
        "# wikidump configuration (materialized by `wikidump init`)\n# Environment variables override these values; keep secrets in .env.\n\n[confluence]\n# site = \"your-site\"            # {site}\n# username = \"you@example.com\"  # {user}\n# api_token = \"...\"             # {token}\n# space = \"ENG\"                 # {space}\n# user_agent = \"wikidump/0.1\"\n# timeout_ms = 30000\n# rate_limit_ms = 200\n\n[extract]\n# content_dir = \"confluence_content\"  # {folder}; the space key is appended\ninclude_attachments = false\npage_size = 50\nmax_pages = 1000\non_page_error = \"continue\"  # or \"abort\"\n\n[retry]\nmax_attempts = 3\nmin_backoff_secs = 2\nmax_backoff_secs = 10\n\n[upload]\n# backend_url = \"https://ingest.example.com\"  # {backend}\n# api_key = \"...\"                             # {backend_key}\n",
        site = crate::config::ENV_SITENAME,
        user = crate::config::ENV_USERNAME,
        token = crate::config::ENV_API_KEY,
        space = crate::config::ENV_SPACE_KEY,
        folder = crate::config::ENV_CONTENT_FOLDER,
        backend = crate::config::ENV_BACKEND_URL,
        backend_key = crate::config::ENV_BACKEND_API_KEY,
    )
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
