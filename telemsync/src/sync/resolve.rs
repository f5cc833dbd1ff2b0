use std::path::{Path, PathBuf};

use super::paths::{PathError, segments};
use super::tree::FolderTree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub existing: PathBuf,
    pub remainder: PathBuf,
}

impl Split {
    pub fn is_complete(&self) -> bool {
        self.remainder.as_os_str().is_empty()
    }

    pub fn missing_segments(&self) -> Result<Vec<&str>, PathError> {
        segments(&self.remainder)
    }
}

pub fn split_by_existence(tree: &FolderTree, path: &Path) -> Result<Split, PathError> {
    let existing = tree.longest_existing_prefix(path)?;
    let mut remainder = PathBuf::new();
    for part in segments(path)?.into_iter().skip(segments(&existing)?.len()) {
        remainder.push(part);
    }
    Ok(Split {
        existing,
        remainder,
    })
}
