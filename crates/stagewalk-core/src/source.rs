//! Module sources: the release list, checksum manifests and module set of
//! every configured artifact repository.
//!
//! A [`Source`] is built once per configured source at startup through a
//! [`SourceBackend`]. The only mutation afterwards is [`Source::advance`],
//! which moves the current/previous release pointer once per release
//! iteration of the walk.

use crate::config::{Config, Module, SourceConfig};
use crate::error::{Result, RolloutError};
use crate::paths;
use crate::release::{self, Release};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const MODULES_PREFIX: &str = "modules/";
pub const PROVIDERS_PREFIX: &str = "providers/";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Per-release content hashes, keyed by tracked path
/// (`modules/<group>/<name>` or `providers/<name>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(path.into(), digest.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Module paths (`<group>/<name>`) listed in the manifest.
    pub fn module_paths(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .filter_map(|k| k.strip_prefix(MODULES_PREFIX))
    }

    /// Parse `<path>: <hex-digest>` lines. Blank lines and `#` comments are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = || RolloutError::InvalidManifest {
                line: idx + 1,
                content: raw.to_string(),
            };
            let (path, digest) = line.rsplit_once(':').ok_or_else(invalid)?;
            let (path, digest) = (path.trim(), digest.trim());
            if path.is_empty()
                || digest.is_empty()
                || !digest.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(invalid());
            }
            manifest.insert(path, digest.to_ascii_lowercase());
        }
        Ok(manifest)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (path, digest) in &self.entries {
            out.push_str(path);
            out.push_str(": ");
            out.push_str(digest);
            out.push('\n');
        }
        out
    }

    /// Compute the manifest of a release tree: one digest per
    /// `modules/<group>/<name>` and `providers/<name>` directory.
    pub fn compute(release_dir: &Path) -> Result<Self> {
        let mut manifest = Self::new();

        let modules = release_dir.join("modules");
        for group in sorted_subdirs(&modules)? {
            for module in sorted_subdirs(&group)? {
                let rel = relative_path(release_dir, &module);
                manifest.insert(rel, hash_tree(&module)?);
            }
        }

        let providers = release_dir.join("providers");
        for provider in sorted_subdirs(&providers)? {
            let rel = relative_path(release_dir, &provider);
            manifest.insert(rel, hash_tree(&provider)?);
        }

        Ok(manifest)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map_or(true, |n| n.to_string_lossy().starts_with('.'));
        if path.is_dir() && !hidden {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn relative_path(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// SHA-256 over every file below `dir`, in file-name order: relative path,
/// NUL, contents, NUL.
fn hash_tree(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_path(dir, entry.path());
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(std::fs::read(entry.path())?);
        hasher.update(b"\0");
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// SourceBackend
// ---------------------------------------------------------------------------

/// Where release lists and manifests come from.
pub trait SourceBackend {
    /// Every release tag published for the source, in any order.
    fn releases(&self, url: &str) -> Result<Vec<String>>;

    fn manifest(&self, url: &str, tag: &str) -> Result<Manifest>;
}

/// Reads mirrored releases from `sources/<name>/<tag>/` under a project
/// root. A release directory either carries `checksums.sha256` or the
/// `modules/`/`providers/` trees the manifest is computed from.
#[derive(Debug, Clone)]
pub struct LocalSourceBackend {
    dir: PathBuf,
}

impl LocalSourceBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: paths::sources_dir(root),
        }
    }

    fn source_dir(&self, url: &str) -> PathBuf {
        self.dir.join(paths::source_dir_name(url))
    }
}

impl SourceBackend for LocalSourceBackend {
    fn releases(&self, url: &str) -> Result<Vec<String>> {
        let dir = self.source_dir(url);
        if !dir.is_dir() {
            return Err(RolloutError::SourceNotFound(url.to_string()));
        }
        let mut tags = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                tags.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(tags)
    }

    fn manifest(&self, url: &str, tag: &str) -> Result<Manifest> {
        let release_dir = self.source_dir(url).join(tag);
        match crate::io::read_optional(&release_dir.join(paths::MANIFEST_FILE))? {
            Some(text) => Manifest::parse(&text),
            None => Manifest::compute(&release_dir),
        }
    }
}

/// In-memory backend: url → [(tag, manifest)].
#[derive(Debug, Clone, Default)]
pub struct MemorySourceBackend {
    sources: HashMap<String, Vec<(String, Manifest)>>,
}

impl MemorySourceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_release(&mut self, url: &str, tag: &str, manifest: Manifest) -> &mut Self {
        self.sources
            .entry(url.to_string())
            .or_default()
            .push((tag.to_string(), manifest));
        self
    }
}

impl SourceBackend for MemorySourceBackend {
    fn releases(&self, url: &str) -> Result<Vec<String>> {
        self.sources
            .get(url)
            .map(|r| r.iter().map(|(t, _)| t.clone()).collect())
            .ok_or_else(|| RolloutError::SourceNotFound(url.to_string()))
    }

    fn manifest(&self, url: &str, tag: &str) -> Result<Manifest> {
        self.sources
            .get(url)
            .and_then(|r| r.iter().find(|(t, _)| t == tag))
            .map(|(_, m)| m.clone())
            .ok_or_else(|| RolloutError::SourceNotFound(format!("{url}@{tag}")))
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Source {
    pub url: String,
    /// Version ceiling from config.
    pub version: String,
    releases: Vec<Release>,
    manifests: HashMap<String, Manifest>,
    modules: BTreeSet<String>,
    walk: Vec<Release>,
    current: Option<usize>,
    previous: Option<usize>,
}

impl Source {
    pub fn load(cfg: &SourceConfig, backend: &dyn SourceBackend) -> Result<Self> {
        let ceiling = if release::is_stable(&cfg.version) {
            None
        } else {
            Some(release::parse_version(&cfg.version)?)
        };

        let mut releases = Vec::new();
        for tag in backend.releases(&cfg.url)? {
            match Release::parse(&tag) {
                Ok(r) if ceiling.as_ref().map_or(true, |c| r.version <= *c) => releases.push(r),
                Ok(r) => debug!(source = %cfg.url, tag = %r.tag, "release above version ceiling"),
                Err(_) => warn!(source = %cfg.url, tag = %tag, "ignoring non-version release tag"),
            }
        }
        releases.sort();
        releases.dedup_by(|a, b| a.version == b.version);
        if releases.is_empty() {
            return Err(RolloutError::NoReleases(cfg.url.clone()));
        }

        let mut manifests = HashMap::new();
        for r in &releases {
            manifests.insert(r.tag.clone(), backend.manifest(&cfg.url, &r.tag)?);
        }

        let newest = &releases[releases.len() - 1];
        let modules = manifests
            .get(&newest.tag)
            .map(|m| {
                m.module_paths()
                    .filter(|p| passes_filters(p, &cfg.include, &cfg.exclude))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            source = %cfg.url,
            releases = releases.len(),
            stable = %newest.tag,
            "source loaded"
        );

        Ok(Self {
            url: cfg.url.clone(),
            version: cfg.version.clone(),
            releases,
            manifests,
            modules,
            walk: Vec::new(),
            current: None,
            previous: None,
        })
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    /// Newest release under the ceiling.
    pub fn stable(&self) -> &Release {
        // `load` rejects sources without releases
        &self.releases[self.releases.len() - 1]
    }

    pub fn serves(&self, module_source: &str) -> bool {
        self.modules.contains(module_source)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    /// Newest release not newer than `version`; `stable` is the newest
    /// release. Versions older than every release resolve to the first one.
    pub fn resolve_tag(&self, version: &str) -> Result<&Release> {
        if release::is_stable(version) {
            return Ok(self.stable());
        }
        let wanted = release::parse_version(version)?;
        Ok(self
            .releases
            .iter()
            .rev()
            .find(|r| r.version <= wanted)
            .unwrap_or(&self.releases[0]))
    }

    /// Set the releases this source steps through: `[stable]` when the
    /// oldest bound is unbounded or already at stable, else every release
    /// between the two bounds inclusive.
    pub fn set_walk(&mut self, oldest: &str, newest: &str) -> Result<()> {
        let stable = self.stable().clone();
        if release::is_stable(oldest) || self.resolve_tag(oldest)? == &stable {
            self.walk = vec![stable];
        } else {
            let from = self.resolve_tag(oldest)?.version.clone();
            let to = self.resolve_tag(newest)?.version.clone();
            self.walk = self
                .releases
                .iter()
                .filter(|r| r.version >= from && r.version <= to)
                .cloned()
                .collect();
            if self.walk.is_empty() {
                self.walk.push(stable);
            }
        }
        self.current = None;
        self.previous = None;
        Ok(())
    }

    pub fn walk(&self) -> &[Release] {
        &self.walk
    }

    /// The walk's release at `index`, `None` past its end.
    pub fn walk_release(&self, index: usize) -> Option<&Release> {
        self.walk.get(index)
    }

    /// Move to release `index` of the walk, clamped to the walk's length.
    /// The first call compares a release with itself.
    pub fn advance(&mut self, index: usize) {
        if self.walk.is_empty() {
            return;
        }
        let idx = index.min(self.walk.len() - 1);
        self.previous = self.current.or(Some(idx));
        self.current = Some(idx);
    }

    pub fn current_release(&self) -> Option<&Release> {
        self.current.and_then(|i| self.walk.get(i))
    }

    pub fn previous_release(&self) -> Option<&Release> {
        self.previous.and_then(|i| self.walk.get(i))
    }

    pub fn checksum(&self, tag: &str, path: &str) -> Option<&str> {
        self.manifests.get(tag).and_then(|m| m.get(path))
    }

    pub fn current_checksum(&self, path: &str) -> Option<&str> {
        self.current_release().and_then(|r| self.checksum(&r.tag, path))
    }

    pub fn previous_checksum(&self, path: &str) -> Option<&str> {
        self.previous_release()
            .and_then(|r| self.checksum(&r.tag, path))
    }
}

fn passes_filters(path: &str, include: &[String], exclude: &[String]) -> bool {
    let matches = |pattern: &String| {
        let pattern = pattern.trim_end_matches('/');
        path == pattern || path.starts_with(&format!("{pattern}/"))
    };
    (include.is_empty() || include.iter().any(matches)) && !exclude.iter().any(matches)
}

// ---------------------------------------------------------------------------
// SourceRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn load(config: &Config, backend: &dyn SourceBackend) -> Result<Self> {
        let sources = config
            .sources
            .iter()
            .map(|s| Source::load(s, backend))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sources })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.sources.iter_mut()
    }

    pub fn by_url(&self, url: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.url == url)
    }

    /// First configured source that serves the module.
    pub fn source_for(&self, module: &Module) -> Option<&Source> {
        if module.is_client() {
            return None;
        }
        self.sources.iter().find(|s| s.serves(&module.source))
    }

    pub fn advance(&mut self, index: usize) {
        for source in &mut self.sources {
            source.advance(index);
        }
    }

    /// Longest walk across sources; a registry without sources still makes
    /// one pass so client modules are applied.
    pub fn walk_len(&self) -> usize {
        self.sources
            .iter()
            .map(|s| s.walk.len())
            .max()
            .unwrap_or(1)
            .max(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
