use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(String),
}

pub fn segments(path: &Path) -> Result<Vec<&str>, PathError> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| PathError::NonUtf8(path.display().to_string()))?;
                out.push(part);
            }
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

pub fn local_path_for(dir: &Path, remote_name: &str) -> Result<PathBuf, PathError> {
    if remote_name.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(remote_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(dir.join(remote_name)),
        _ => Err(PathError::UnsupportedComponent(remote_name.to_string())),
    }
}
