//! Code extraction: turns a checkout into an immutable [`CodeSnapshot`].
//!
//! Walks the tree with walkdir, skipping vendored and build directories,
//! counts lines for recognized source files, detects the primary language
//! by file count and the framework from dependency manifests. Per-file read
//! failures are logged and skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::errors::ExtractError;

/// Directories never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "venv",
    ".venv",
    "__pycache__",
    "dist",
    "build",
    "target",
    ".idea",
    ".vscode",
    "coverage",
    ".pytest_cache",
    "vendor",
    "bower_components",
    ".next",
    "out",
];

/// Files larger than this are listed but not line-counted.
const MAX_COUNTED_BYTES: u64 = 2 * 1024 * 1024;

/// One recognized source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub language: String,
    pub lines: usize,
    pub bytes: u64,
}

/// Read-only view of a repository handed to every analysis agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSnapshot {
    /// Recognized source files, sorted by path.
    pub files: Vec<SourceFile>,
    /// Every non-ignored file path (source or not), sorted.
    pub paths: Vec<String>,
    pub total_files: usize,
    pub total_lines: usize,
    pub primary_language: Option<String>,
    pub framework: Option<String>,
    pub language_distribution: BTreeMap<String, usize>,
    /// Declared dependency names keyed by ecosystem (`python`, `node`, `rust`, `go`).
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl CodeSnapshot {
    /// Whether any path satisfies the predicate (matched case-insensitively).
    pub fn any_path(&self, mut pred: impl FnMut(&str) -> bool) -> bool {
        self.paths.iter().any(|p| pred(&p.to_lowercase()))
    }

    /// File name component of each path.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.paths
            .iter()
            .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.values().map(Vec::len).sum()
    }
}

/// Produces a snapshot from a local tree.
#[async_trait]
pub trait CodeExtractor: Send + Sync {
    async fn extract(&self, root: &Path) -> Result<CodeSnapshot, ExtractError>;
}

/// Filesystem extractor used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsExtractor;

#[async_trait]
impl CodeExtractor for FsExtractor {
    async fn extract(&self, root: &Path) -> Result<CodeSnapshot, ExtractError> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || extract_snapshot(&root))
            .await
            .map_err(|e| ExtractError::Task(e.to_string()))?
    }
}

/// Map a file extension (without dot, lowercase) to a language label.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "py" => "Python",
        "ipynb" => "Jupyter Notebook",
        "js" | "mjs" | "cjs" => "JavaScript",
        "jsx" => "React",
        "ts" => "TypeScript",
        "tsx" => "React TypeScript",
        "java" => "Java",
        "go" => "Go",
        "rb" => "Ruby",
        "php" => "PHP",
        "cs" => "C#",
        "cpp" | "cc" | "cxx" | "hpp" => "C++",
        "c" | "h" => "C",
        "rs" => "Rust",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "scala" => "Scala",
        "html" | "htm" => "HTML",
        "css" | "scss" | "sass" => "CSS",
        "vue" => "Vue",
        "svelte" => "Svelte",
        "sol" => "Solidity",
        _ => return None,
    };
    Some(lang)
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

fn count_lines(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
    if bytes.last() == Some(&b'\n') {
        newlines
    } else {
        newlines + 1
    }
}

/// Synchronous extraction; [`FsExtractor`] runs this on the blocking pool.
pub fn extract_snapshot(root: &Path) -> Result<CodeSnapshot, ExtractError> {
    if !root.is_dir() {
        return Err(ExtractError::RootMissing(root.to_path_buf()));
    }

    let mut snapshot = CodeSnapshot::default();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        snapshot.paths.push(rel.clone());

        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        let Some(language) = ext.as_deref().and_then(language_for_extension) else {
            continue;
        };

        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let lines = if bytes > MAX_COUNTED_BYTES {
            debug!(file = %rel, bytes, "not counting lines in oversized file");
            0
        } else {
            match fs::read(entry.path()) {
                Ok(content) => count_lines(&content),
                Err(e) => {
                    warn!("Failed to read {}: {}", rel, e);
                    continue;
                }
            }
        };

        *snapshot
            .language_distribution
            .entry(language.to_string())
            .or_insert(0) += 1;
        snapshot.total_lines += lines;
        snapshot.files.push(SourceFile {
            path: rel,
            language: language.to_string(),
            lines,
            bytes,
        });
    }

    snapshot.total_files = snapshot.files.len();
    snapshot.primary_language = snapshot
        .language_distribution
        .iter()
        .max_by(|(a_name, a_count), (b_name, b_count)| {
            a_count.cmp(b_count).then_with(|| b_name.cmp(a_name))
        })
        .map(|(name, _)| name.clone());
    snapshot.dependencies = extract_dependencies(root);
    snapshot.framework = detect_framework(root, &snapshot.dependencies);

    debug!(
        files = snapshot.total_files,
        lines = snapshot.total_lines,
        "extracted snapshot from {}",
        root.display()
    );
    Ok(snapshot)
}

fn read_manifest(root: &Path, name: &str) -> Option<String> {
    let path = root.join(name);
    if !path.is_file() {
        return None;
    }
    match fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("Failed to read {}: {}", name, e);
            None
        }
    }
}

/// Collect declared dependency names from root-level manifests.
pub fn extract_dependencies(root: &Path) -> BTreeMap<String, Vec<String>> {
    let mut deps = BTreeMap::new();

    if let Some(content) = read_manifest(root, "requirements.txt") {
        let names: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
            .filter_map(|l| {
                l.split(|c: char| "=<>~![; ".contains(c))
                    .next()
                    .map(|n| n.trim().to_string())
            })
            .filter(|n| !n.is_empty())
            .collect();
        if !names.is_empty() {
            deps.insert("python".to_string(), names);
        }
    }

    if let Some(content) = read_manifest(root, "package.json") {
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(pkg) => {
                let mut names = Vec::new();
                for section in ["dependencies", "devDependencies"] {
                    if let Some(map) = pkg.get(section).and_then(|v| v.as_object()) {
                        names.extend(map.keys().cloned());
                    }
                }
                if !names.is_empty() {
                    deps.insert("node".to_string(), names);
                }
            }
            Err(e) => warn!("Failed to parse package.json: {}", e),
        }
    }

    if let Some(content) = read_manifest(root, "Cargo.toml") {
        match toml::from_str::<toml::Table>(&content) {
            Ok(manifest) => {
                let mut names = Vec::new();
                for section in ["dependencies", "dev-dependencies"] {
                    if let Some(table) = manifest.get(section).and_then(|v| v.as_table()) {
                        names.extend(table.keys().cloned());
                    }
                }
                if !names.is_empty() {
                    deps.insert("rust".to_string(), names);
                }
            }
            Err(e) => warn!("Failed to parse Cargo.toml: {}", e),
        }
    }

    if let Some(content) = read_manifest(root, "go.mod") {
        let names = parse_go_mod(&content);
        if !names.is_empty() {
            deps.insert("go".to_string(), names);
        }
    }

    deps
}

fn parse_go_mod(content: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_block = false;
    for line in content.lines().map(str::trim) {
        if in_block {
            if line == ")" {
                in_block = false;
            } else if let Some(name) = line.split_whitespace().next()
                && !name.starts_with("//")
            {
                names.push(name.to_string());
            }
        } else if line.starts_with("require (") {
            in_block = true;
        } else if let Some(rest) = line.strip_prefix("require ")
            && let Some(name) = rest.split_whitespace().next()
        {
            names.push(name.to_string());
        }
    }
    names
}

/// Dependency name → framework label, checked in order.
const FRAMEWORK_DEPENDENCIES: &[(&str, &str)] = &[
    ("next", "Next.js"),
    ("react", "React"),
    ("vue", "Vue"),
    ("@angular/core", "Angular"),
    ("svelte", "Svelte"),
    ("express", "Express"),
    ("django", "Django"),
    ("flask", "Flask"),
    ("fastapi", "FastAPI"),
    ("axum", "Axum"),
    ("actix-web", "Actix Web"),
    ("rocket", "Rocket"),
    ("github.com/gin-gonic/gin", "Gin"),
    ("github.com/labstack/echo/v4", "Echo"),
];

/// Manifest file → (content marker, framework label).
const FRAMEWORK_MANIFESTS: &[(&str, &str, &str)] = &[
    ("pom.xml", "spring-boot", "Spring Boot"),
    ("build.gradle", "spring-boot", "Spring Boot"),
    ("Gemfile", "rails", "Rails"),
    ("Gemfile", "sinatra", "Sinatra"),
    ("composer.json", "laravel", "Laravel"),
    ("composer.json", "symfony", "Symfony"),
];

fn detect_framework(root: &Path, deps: &BTreeMap<String, Vec<String>>) -> Option<String> {
    for (dep, label) in FRAMEWORK_DEPENDENCIES {
        if deps
            .values()
            .flatten()
            .any(|d| d.eq_ignore_ascii_case(dep))
        {
            return Some(label.to_string());
        }
    }
    for (manifest, marker, label) in FRAMEWORK_MANIFESTS {
        if let Some(content) = read_manifest(root, manifest)
            && content.to_lowercase().contains(marker)
        {
            return Some(label.to_string());
        }
    }
    None
}
