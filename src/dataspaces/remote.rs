//! File-level access to one shared space.
//!
//! Paths handed to these methods are relative to the space root and use `/`
//! separators; anything escaping the root with `..` is rejected.

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::selector::FileSelector;
use super::{DataSpaceError, SpaceKind};
use crate::util::normalize_relative;

#[derive(Debug, Clone)]
pub struct RemoteSpace {
    kind: SpaceKind,
    root: PathBuf,
    url: String,
}

impl RemoteSpace {
    pub fn new(kind: SpaceKind, root: PathBuf) -> Self {
        let url = url::Url::from_directory_path(&root)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| root.to_string_lossy().to_string());
        Self { kind, root, url }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn space_url(&self) -> &str {
        &self.url
    }

    /// Absolute path of `relative` inside this space.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, DataSpaceError> {
        let normalized = normalize_relative(relative)
            .ok_or_else(|| DataSpaceError::PathEscapesRoot(relative.to_string()))?;
        Ok(self.root.join(normalized))
    }

    /// Every regular file below the root, as sorted relative paths.
    /// A missing root lists as empty.
    pub fn list(&self) -> Result<Vec<String>, DataSpaceError> {
        list_files(&self.root)
    }

    /// Relative paths of the files matched by `selector`.
    pub fn matching(&self, selector: &FileSelector) -> Result<Vec<String>, DataSpaceError> {
        let compiled = selector.compile()?;
        Ok(self
            .list()?
            .into_iter()
            .filter(|path| compiled.matches(path))
            .collect())
    }

    /// Copy `relative` from this space into `dest_root` at the same relative path.
    pub async fn pull_file(&self, relative: &str, dest_root: &Path) -> Result<PathBuf, DataSpaceError> {
        let source = self.resolve(relative)?;
        let dest = dest_root.join(
            normalize_relative(relative)
                .ok_or_else(|| DataSpaceError::PathEscapesRoot(relative.to_string()))?,
        );
        copy_file(&source, &dest).await?;
        debug!(space = %self.kind, file = relative, "Pulled file");
        Ok(dest)
    }

    /// Pull every file matching `selector`.
    pub async fn pull_files(
        &self,
        selector: &FileSelector,
        dest_root: &Path,
    ) -> Result<Vec<PathBuf>, DataSpaceError> {
        let mut pulled = Vec::new();
        for relative in self.matching(selector)? {
            pulled.push(self.pull_file(&relative, dest_root).await?);
        }
        Ok(pulled)
    }

    /// Copy `source` into this space at `relative`, creating parent folders.
    pub async fn push_file(&self, source: &Path, relative: &str) -> Result<(), DataSpaceError> {
        let dest = self.resolve(relative)?;
        copy_file(source, &dest).await?;
        debug!(space = %self.kind, file = relative, "Pushed file");
        Ok(())
    }

    /// Push every file below `source_root` matching `selector`.
    pub async fn push_files(
        &self,
        selector: &FileSelector,
        source_root: &Path,
    ) -> Result<Vec<String>, DataSpaceError> {
        let compiled = selector.compile()?;
        let mut pushed = Vec::new();
        for relative in list_files(source_root)? {
            if compiled.matches(&relative) {
                self.push_file(&source_root.join(&relative), &relative).await?;
                pushed.push(relative);
            }
        }
        Ok(pushed)
    }

    pub async fn delete_file(&self, relative: &str) -> Result<(), DataSpaceError> {
        let path = self.resolve(relative)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| DataSpaceError::io(&path, e))
    }

    /// Delete every file matching `selector`, returning the deleted paths.
    pub async fn delete_files(&self, selector: &FileSelector) -> Result<Vec<String>, DataSpaceError> {
        let matched = self.matching(selector)?;
        for relative in &matched {
            self.delete_file(relative).await?;
        }
        Ok(matched)
    }
}

/// Regular files below `root`, relative and `/`-separated.
pub(crate) fn list_files(root: &Path) -> Result<Vec<String>, DataSpaceError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            DataSpaceError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            files.push(parts.join("/"));
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) async fn copy_file(source: &Path, dest: &Path) -> Result<(), DataSpaceError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DataSpaceError::io(parent, e))?;
    }
    tokio::fs::copy(source, dest)
        .await
        .map_err(|e| DataSpaceError::io(source, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspaces::TransferMode;
    use tempfile::TempDir;

    fn space_with(files: &[&str]) -> (TempDir, RemoteSpace) {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, file.as_bytes()).unwrap();
        }
        let space = RemoteSpace::new(SpaceKind::Input, dir.path().to_path_buf());
        (dir, space)
    }

    #[test]
    fn list_returns_relative_sorted_paths() {
        let (_dir, space) = space_with(&["b.txt", "a/c.txt"]);
        assert_eq!(space.list().unwrap(), vec!["a/c.txt", "b.txt"]);
        assert!(space.space_url().starts_with("file://"));
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let (_dir, space) = space_with(&[]);
        assert!(matches!(
            space.resolve("../etc/passwd"),
            Err(DataSpaceError::PathEscapesRoot(_))
        ));
    }

    #[tokio::test]
    async fn pull_push_and_delete_by_pattern() {
        let (_dir, space) = space_with(&["in/one.dat", "in/two.dat", "skip.log"]);
        let scratch = TempDir::new().unwrap();
        let selector = FileSelector::new(TransferMode::TransferFromInputSpace, &["in/*.dat"]);

        let pulled = space.pull_files(&selector, scratch.path()).await.unwrap();
        assert_eq!(pulled.len(), 2);
        assert_eq!(
            std::fs::read_to_string(scratch.path().join("in/one.dat")).unwrap(),
            "in/one.dat"
        );

        let target = TempDir::new().unwrap();
        let out = RemoteSpace::new(SpaceKind::Output, target.path().to_path_buf());
        let pushed = out.push_files(&selector, scratch.path()).await.unwrap();
        assert_eq!(pushed, vec!["in/one.dat", "in/two.dat"]);

        let deleted = out.delete_files(&selector).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(out.list().unwrap().is_empty());
    }
}
