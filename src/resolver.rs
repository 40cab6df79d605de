//! Maps GETFILE request paths to readable local files for the cache daemon.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

/// Where the daemon finds files.
#[derive(Debug, Clone)]
pub enum FileResolver {
    /// Serve files from under a root directory.
    Directory(PathBuf),
    /// Explicit request-path to local-file table (a `locals.txt` manifest).
    Manifest(HashMap<String, PathBuf>),
}

impl FileResolver {
    /// Directory mode when `cache_dir` is a directory, manifest mode when it
    /// is a file.
    pub fn from_cache_dir(cache_dir: &Path) -> Result<Self> {
        if cache_dir.is_dir() {
            let root = cache_dir
                .canonicalize()
                .with_context(|| format!("canonicalize {}", cache_dir.display()))?;
            return Ok(FileResolver::Directory(root));
        }
        let text = std::fs::read_to_string(cache_dir)
            .with_context(|| format!("read manifest {}", cache_dir.display()))?;
        let base = cache_dir.parent().unwrap_or_else(|| Path::new("."));
        Self::parse_manifest(&text, base)
    }

    /// Each non-empty, non-comment line is `<request-path> <local-file>`.
    /// Relative local files are taken relative to `base`.
    pub fn parse_manifest(text: &str, base: &Path) -> Result<Self> {
        let mut table = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(key), Some(local), None) = (parts.next(), parts.next(), parts.next()) else {
                bail!("manifest line {}: expected `<path> <file>`", lineno + 1);
            };
            let local = Path::new(local);
            let local = if local.is_absolute() {
                local.to_path_buf()
            } else {
                base.join(local)
            };
            table.insert(key.to_string(), local);
        }
        Ok(FileResolver::Manifest(table))
    }

    /// Open the file behind `request_path` and return it with its length.
    /// None when the path does not resolve or cannot be read.
    pub fn open(&self, request_path: &str) -> Option<(File, u64)> {
        let local = match self {
            FileResolver::Manifest(table) => table.get(request_path)?.clone(),
            FileResolver::Directory(root) => {
                let rel = request_path.trim_start_matches('/');
                normalize_under_root(root, Path::new(rel)).ok()?
            }
        };
        let file = File::open(&local).ok()?;
        let meta = file.metadata().ok()?;
        if !meta.is_file() {
            return None;
        }
        Some((file, meta.len()))
    }

    pub fn manifest_entries(&self) -> Option<usize> {
        match self {
            FileResolver::Manifest(table) => Some(table.len()),
            FileResolver::Directory(_) => None,
        }
    }
}

/// Resolve `p` under `root`, refusing `..`, absolute components, NUL bytes
/// and symlinks that lead outside the root. `root` must be canonical.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let joined = root.join(&safe);
    // Only existing files can be served, so resolve symlinks fully
    let final_path = joined
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {:?}", joined))?;

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }
    Ok(final_path)
}
