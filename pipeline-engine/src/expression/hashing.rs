// hashFiles support
// File listing is supplied by a collaborator; digests are combined order-independently

use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};

use crate::error::EvaluationError;

/// Digest of one file matched by a `hashFiles` pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub path: String,
    /// Hex-encoded content digest
    pub digest: String,
}

impl FileDigest {
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
        }
    }
}

/// Supplies the files matched by `hashFiles` patterns together with their digests
pub trait FileHasher: Send + Sync {
    fn hash_files(&self, patterns: &[String]) -> Result<Vec<FileDigest>, EvaluationError>;
}

/// Combine per-file digests into one SHA-256.
///
/// Digests are sorted first so the result does not depend on listing order.
/// An empty set yields an empty string.
pub fn aggregate_digests(digests: &[FileDigest]) -> String {
    if digests.is_empty() {
        return String::new();
    }

    let mut sorted: Vec<&str> = digests.iter().map(|d| d.digest.as_str()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for digest in sorted {
        match hex::decode(digest) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(digest.as_bytes()),
        }
    }
    hex::encode(hasher.finalize())
}

/// Hashes files under a workspace root.
///
/// `*` does not cross `/`; patterns starting with `!` exclude matches.
#[derive(Debug, Clone)]
pub struct WorkspaceHasher {
    root: PathBuf,
}

impl WorkspaceHasher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_sets(patterns: &[String]) -> Result<(GlobSet, GlobSet), EvaluationError> {
        let mut include = GlobSetBuilder::new();
        let mut exclude = GlobSetBuilder::new();

        for pattern in patterns {
            let (builder, raw) = match pattern.strip_prefix('!') {
                Some(rest) => (&mut exclude, rest),
                None => (&mut include, pattern.as_str()),
            };
            let raw = raw.trim_start_matches("./");
            let glob = GlobBuilder::new(raw)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    EvaluationError::type_mismatch(format!(
                        "invalid hashFiles pattern '{}': {}",
                        pattern, e
                    ))
                })?;
            builder.add(glob);
        }

        let build = |b: GlobSetBuilder| {
            b.build().map_err(|e| {
                EvaluationError::type_mismatch(format!("invalid hashFiles patterns: {}", e))
            })
        };
        Ok((build(include)?, build(exclude)?))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name() == ".git" {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => self.walk(&path, out),
                Ok(ft) if ft.is_file() => out.push(path),
                _ => {}
            }
        }
    }
}

impl FileHasher for WorkspaceHasher {
    fn hash_files(&self, patterns: &[String]) -> Result<Vec<FileDigest>, EvaluationError> {
        let (include, exclude) = Self::build_sets(patterns)?;

        let mut files = Vec::new();
        self.walk(&self.root, &mut files);
        files.sort();

        let mut digests = Vec::new();
        for file in files {
            let Ok(relative) = file.strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if !include.is_match(&relative) || exclude.is_match(&relative) {
                continue;
            }
            let Ok(contents) = fs::read(&file) else {
                tracing::debug!(path = %relative, "skipping unreadable file");
                continue;
            };
            digests.push(FileDigest::new(
                relative,
                hex::encode(Sha256::digest(&contents)),
            ));
        }

        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_aggregate_empty() {
        assert_eq!(aggregate_digests(&[]), "");
    }

    #[test]
    fn test_aggregate_order_independent() {
        let a = FileDigest::new("a", "aa");
        let b = FileDigest::new("b", "bb");
        assert_eq!(
            aggregate_digests(&[a.clone(), b.clone()]),
            aggregate_digests(&[b, a])
        );
    }

    #[test]
    fn test_workspace_hasher_matches_patterns() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("crates/core")).unwrap();
        fs::write(root.join("Cargo.lock"), "root").unwrap();
        fs::write(root.join("crates/core/Cargo.lock"), "nested").unwrap();
        fs::write(root.join("README.md"), "docs").unwrap();

        let hasher = WorkspaceHasher::new(root);

        let top = hasher.hash_files(&["*.lock".to_string()]).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].path, "Cargo.lock");

        let all = hasher.hash_files(&["**/Cargo.lock".to_string()]).unwrap();
        assert_eq!(all.len(), 2);

        let filtered = hasher
            .hash_files(&["**/Cargo.lock".to_string(), "!crates/**".to_string()])
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_workspace_hasher_content_sensitive() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("deps.txt"), "v1").unwrap();
        let hasher = WorkspaceHasher::new(temp.path());
        let before = aggregate_digests(&hasher.hash_files(&["deps.txt".into()]).unwrap());

        fs::write(temp.path().join("deps.txt"), "v2").unwrap();
        let after = aggregate_digests(&hasher.hash_files(&["deps.txt".into()]).unwrap());

        assert_ne!(before, after);
    }
}
