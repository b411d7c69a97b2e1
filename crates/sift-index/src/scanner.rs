//! Project tree walker.
//!
//! Honours `.gitignore`, `.ignore` and the project rule file `.siftignore`
//! at every directory level, plus built-in excludes for dependency, build
//! and VCS directories. Each call to [`Scanner::walk`] starts a fresh,
//! lazy traversal.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::{Match, WalkBuilder};

use crate::error::Result;

/// Project-specific ignore file, same syntax as `.gitignore`.
pub const RULE_FILE: &str = ".siftignore";

const RULE_FILES: &[&str] = &[".gitignore", ".ignore", RULE_FILE];

/// Excluded regardless of ignore files.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git/",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    "vendor/",
    "__pycache__/",
    ".venv/",
    "*.lock",
    "package-lock.json",
    "pnpm-lock.yaml",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd", "pdf", "zip", "gz", "tgz",
    "tar", "bz2", "xz", "7z", "rar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o",
    "obj", "lib", "bin", "wasm", "pyc", "pyo", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4",
    "mov", "avi", "mkv", "wav", "flac", "ogg", "db", "sqlite", "sqlite3",
];

/// Bytes inspected for a NUL when classifying a file as binary.
const SNIFF_LEN: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Larger files are skipped (default: 1 MiB).
    pub max_file_size: u64,
    pub follow_symlinks: bool,
    pub include_hidden: bool,
    /// Additional gitignore-style exclude globs.
    pub extra_ignores: Vec<String>,
    /// Engine state directory, never indexed.
    pub state_dir: Option<PathBuf>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            follow_symlinks: false,
            include_hidden: false,
            extra_ignores: Vec::new(),
            state_dir: None,
        }
    }
}

/// Cheap to clone; the walk itself runs on whichever thread drives it.
#[derive(Debug, Clone)]
pub struct Scanner {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    config: ScannerConfig,
    overrides: Override,
}

impl Scanner {
    /// # Errors
    ///
    /// Returns an error if `root` cannot be canonicalised or an exclude glob
    /// is malformed.
    pub fn new(root: &Path, config: ScannerConfig) -> Result<Self> {
        let root = root.canonicalize()?;
        let mut builder = OverrideBuilder::new(&root);
        for pattern in DEFAULT_EXCLUDES {
            builder.add(&format!("!{pattern}"))?;
        }
        for pattern in &config.extra_ignores {
            builder.add(&format!("!{}", pattern.trim_start_matches('!')))?;
        }
        if let Some(rel) = config
            .state_dir
            .as_deref()
            .and_then(|dir| dir.strip_prefix(&root).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
        {
            builder.add(&format!("!/{}/", to_slash(rel)))?;
        }
        let overrides = builder.build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                config,
                overrides,
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Lazily yield absolute paths of eligible files.
    ///
    /// Unreadable directories and symlink loops are logged and skipped.
    #[must_use]
    pub fn walk(&self) -> Walk {
        let inner = &self.inner;
        let mut builder = WalkBuilder::new(&inner.root);
        builder
            .hidden(!inner.config.include_hidden)
            .parents(false)
            .ignore(true)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .require_git(false)
            .follow_links(inner.config.follow_symlinks)
            .add_custom_ignore_filename(RULE_FILE)
            .overrides(inner.overrides.clone());
        Walk {
            walk: builder.build(),
            scanner: self.clone(),
        }
    }

    /// Answer "would a walk yield this path right now?" for a single path.
    ///
    /// Rule files of every directory between the root and the path are
    /// evaluated, deepest first.
    #[must_use]
    pub fn is_eligible(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.inner.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() || self.in_state_dir(path) {
            return false;
        }
        if !self.inner.config.include_hidden && has_hidden_component(rel) {
            return false;
        }
        if self.excluded_by_overrides(rel) || self.excluded_by_rule_files(path, rel) {
            return false;
        }
        self.is_indexable_file(path)
    }

    /// Store key for an absolute path: relative to the root, `/`-separated.
    #[must_use]
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.inner.root).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(to_slash(rel))
    }

    /// Absolute path for a store key.
    #[must_use]
    pub fn absolute_path(&self, rel: &str) -> PathBuf {
        self.inner.root.join(rel)
    }

    /// True for files whose change can alter the eligible set.
    #[must_use]
    pub fn is_rule_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| RULE_FILES.contains(&n))
    }

    pub(crate) fn in_state_dir(&self, path: &Path) -> bool {
        self.inner
            .config
            .state_dir
            .as_deref()
            .is_some_and(|dir| path.starts_with(dir))
    }

    fn excluded_by_overrides(&self, rel: &Path) -> bool {
        let overrides = &self.inner.overrides;
        let mut prefix = PathBuf::new();
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            prefix.push(component);
            let is_dir = components.peek().is_some();
            if matches!(overrides.matched(&prefix, is_dir), Match::Ignore(_)) {
                return true;
            }
        }
        false
    }

    fn excluded_by_rule_files(&self, path: &Path, rel: &Path) -> bool {
        let mut dirs = vec![self.inner.root.clone()];
        if let Some(parent) = rel.parent() {
            let mut current = self.inner.root.clone();
            for component in parent.components() {
                current.push(component);
                dirs.push(current.clone());
            }
        }
        for dir in dirs.iter().rev() {
            let matcher = directory_rules(dir, dir == &self.inner.root);
            match matcher.matched_path_or_any_parents(path, false) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
        false
    }

    /// Size, extension and content checks shared by walks and single paths.
    fn is_indexable_file(&self, path: &Path) -> bool {
        let metadata = if self.inner.config.follow_symlinks {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        };
        let Ok(metadata) = metadata else {
            return false;
        };
        if !metadata.is_file() || metadata.len() > self.inner.config.max_file_size {
            return false;
        }
        !has_binary_extension(path) && !sniff_binary(path)
    }
}

/// Iterator returned by [`Scanner::walk`].
pub struct Walk {
    walk: ignore::Walk,
    scanner: Scanner,
}

impl Iterator for Walk {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let path = entry.into_path();
            if self.scanner.in_state_dir(&path) || !self.scanner.is_indexable_file(&path) {
                continue;
            }
            return Some(path);
        }
    }
}

fn directory_rules(dir: &Path, is_root: bool) -> Gitignore {
    let mut builder = GitignoreBuilder::new(dir);
    for name in RULE_FILES {
        let file = dir.join(name);
        if file.is_file()
            && let Some(e) = builder.add(&file)
        {
            tracing::debug!(path = %file.display(), "partial ignore file: {e}");
        }
    }
    if is_root {
        let exclude = dir.join(".git").join("info").join("exclude");
        if exclude.is_file()
            && let Some(e) = builder.add(&exclude)
        {
            tracing::debug!(path = %exclude.display(), "partial exclude file: {e}");
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(dir = %dir.display(), "invalid ignore rules: {e}");
        Gitignore::empty()
    })
}

fn has_hidden_component(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| n.starts_with('.')),
        _ => false,
    })
}

fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn sniff_binary(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut head = Vec::with_capacity(SNIFF_LEN);
    match file.take(SNIFF_LEN as u64).read_to_end(&mut head) {
        Ok(_) => head.contains(&0),
        Err(_) => false,
    }
}

fn to_slash(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
