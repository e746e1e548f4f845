use crate::error::DetectorError;
use std::path::{Component, Path, PathBuf};

/// A caller-supplied file reference: a directory relative to the data
/// directory plus a file name. Directory references leave `filename` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePath {
    pub directory: String,
    pub filename: String,
}

impl FilePath {
    pub fn new(directory: &str, filename: &str) -> Self {
        Self {
            directory: directory.to_string(),
            filename: filename.to_string(),
        }
    }

    pub fn is_absolute(&self) -> bool {
        is_absolute_reference(&self.directory)
    }
}

impl From<detector_proto::FilePath> for FilePath {
    fn from(path: detector_proto::FilePath) -> Self {
        Self {
            directory: path.directory,
            filename: path.filename,
        }
    }
}

/// Leading `/` or `\`, or a drive marker such as `C:`.
fn is_absolute_reference(directory: &str) -> bool {
    let bytes = directory.as_bytes();
    matches!(bytes.first(), Some(b'/') | Some(b'\\')) || (bytes.len() > 1 && bytes[1] == b':')
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    data_dir: PathBuf,
    allow_absolute: bool,
}

impl PathResolver {
    pub fn new(data_dir: impl Into<PathBuf>, allow_absolute: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            allow_absolute,
        }
    }

    pub fn resolve(&self, file: &FilePath) -> Result<PathBuf, DetectorError> {
        if file.is_absolute() {
            if !self.allow_absolute {
                return Err(DetectorError::InvalidPath(format!(
                    "absolute reference {:?} is outside the data directory",
                    file.directory
                )));
            }
            return Ok(Path::new(&file.directory).join(&file.filename));
        }

        let relative = Path::new(&file.directory).join(&file.filename);
        if !self.allow_absolute && escapes(&relative) {
            return Err(DetectorError::InvalidPath(format!(
                "{:?} climbs out of the data directory",
                relative
            )));
        }

        Ok(self.data_dir.join(relative))
    }
}

fn escapes(relative: &Path) -> bool {
    relative.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
