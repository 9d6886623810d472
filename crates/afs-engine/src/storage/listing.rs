//! Lazy, restartable directory listings.
//!
//! A listing is a pre-order depth-first walk with children sorted by name.
//! That order is exactly the component-wise ordering of paths, so a walk
//! can be resumed from any previously returned path without remembering
//! anything but that path.

use std::path::{Path, PathBuf};

use super::types::Entry;
use crate::error::{AfsError, AfsResult};

struct Child {
    path: PathBuf,
    symlink: bool,
}

/// Lazy listing over one path.
pub struct Listing {
    stack: Vec<std::vec::IntoIter<Child>>,
    single: Option<Entry>,
    recursive: bool,
    after: Option<PathBuf>,
}

impl Listing {
    /// Open a listing. Fails with `NotFound` when `path` is absent.
    pub async fn open(path: &Path, recursive: bool) -> AfsResult<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| AfsError::io(path, e))?;
        if !meta.is_dir() {
            return Ok(Self {
                stack: Vec::new(),
                single: Some(Entry::from_metadata(path.to_path_buf(), &meta)),
                recursive,
                after: None,
            });
        }
        let children = read_children(path).await?;
        Ok(Self {
            stack: vec![children.into_iter()],
            single: None,
            recursive,
            after: None,
        })
    }

    /// Skip every entry up to and including `path`.
    pub fn resume_after(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if self.single.as_ref().is_some_and(|single| single.path <= path) {
            self.single = None;
        }
        self.after = Some(path);
        self
    }

    /// Next entry, or `None` when the walk is done.
    ///
    /// Entries that vanish mid-walk are skipped.
    pub async fn next(&mut self) -> AfsResult<Option<Entry>> {
        if let Some(entry) = self.single.take() {
            return Ok(Some(entry));
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(child) = frame.next() else {
                self.stack.pop();
                continue;
            };

            let skip = self.after.as_ref().is_some_and(|after| child.path <= *after);
            // Subtrees wholly before the resume point are not walked at all.
            let descend_skipped = self
                .after
                .as_ref()
                .is_some_and(|after| after.starts_with(&child.path));

            let meta = match tokio::fs::metadata(&child.path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AfsError::io(&child.path, e)),
            };

            if self.recursive && meta.is_dir() && !child.symlink && (!skip || descend_skipped) {
                match read_children(&child.path).await {
                    Ok(children) => self.stack.push(children.into_iter()),
                    Err(AfsError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }

            if skip {
                continue;
            }
            return Ok(Some(Entry::from_metadata(child.path, &meta)));
        }
    }

    /// Up to `limit` entries.
    pub async fn take(&mut self, limit: usize) -> AfsResult<Vec<Entry>> {
        let mut out = Vec::new();
        while out.len() < limit {
            match self.next().await? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    /// Every remaining entry.
    pub async fn collect(mut self) -> AfsResult<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}

async fn read_children(dir: &Path) -> AfsResult<Vec<Child>> {
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| AfsError::io(dir, e))?;
    let mut children = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| AfsError::io(dir, e))? {
        let symlink = entry
            .file_type()
            .await
            .map(|t| t.is_symlink())
            .unwrap_or(false);
        children.push(Child {
            path: entry.path(),
            symlink,
        });
    }
    children.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(children)
}
