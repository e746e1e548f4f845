use crate::error::DetectorError;
use flate2::read::GzDecoder;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Component, Path, PathBuf},
};
use tar::Archive;

/// Manifest mapping logical ids to files inside a model package.
pub const USAGE_ORDER_FILE: &str = "usageOrder.txt";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Contents of a model package after extraction.
#[derive(Debug, Clone)]
pub struct ExtractedArchive {
    root: PathBuf,
    files: Vec<PathBuf>,
    usage: HashMap<String, PathBuf>,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Looks up a file by the logical id registered in the package manifest.
    /// Only regular files that resolve inside the extraction root are returned.
    pub fn locate(&self, logical_id: &str) -> Option<&Path> {
        self.usage
            .get(logical_id)
            .map(PathBuf::as_path)
            .filter(|path| path.is_file() && self.contains(path))
    }

    fn contains(&self, path: &Path) -> bool {
        match (std::fs::canonicalize(&self.root), std::fs::canonicalize(path)) {
            (Ok(root), Ok(path)) => path.starts_with(root),
            _ => false,
        }
    }
}

/// Unpacks a tar or gzip-compressed tar package into `dest`, replacing
/// anything a previous extraction left there.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<ExtractedArchive, DetectorError> {
    let archive_error = |reason: String| DetectorError::ModelArchive {
        path: archive_path.to_path_buf(),
        reason,
    };

    let mut file = File::open(archive_path).map_err(|e| archive_error(e.to_string()))?;
    let mut magic = [0u8; 2];
    let compressed = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(_) => false,
    };
    file.seek(SeekFrom::Start(0))
        .map_err(|e| archive_error(e.to_string()))?;

    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| archive_error(e.to_string()))?;
    }
    std::fs::create_dir_all(dest).map_err(|e| archive_error(e.to_string()))?;

    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);
    #[cfg(any(unix, target_os = "redox"))]
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| archive_error(format!("bad archive: {}", e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_error(format!("bad entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| archive_error(format!("invalid entry path: {}", e)))?
            .to_path_buf();
        let is_file = entry.header().entry_type().is_file();

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| archive_error(format!("failed to unpack {:?}: {}", entry_path, e)))?;
        if !unpacked {
            tracing::warn!("Skipped archive entry {:?} outside the sandbox", entry_path);
            continue;
        }
        if is_file {
            files.push(dest.join(&entry_path));
        }
    }

    let usage = match files
        .iter()
        .find(|path| path.file_name().is_some_and(|name| name == USAGE_ORDER_FILE))
    {
        Some(manifest) => read_usage_order(manifest, dest)
            .map_err(|e| archive_error(format!("unreadable {}: {}", USAGE_ORDER_FILE, e)))?,
        None => HashMap::new(),
    };

    tracing::debug!(
        "Unpacked {} files from {:?} into {:?}",
        files.len(),
        archive_path,
        dest
    );

    Ok(ExtractedArchive {
        root: dest.to_path_buf(),
        files,
        usage,
    })
}

/// Manifest paths must stay relative and never climb upwards.
fn is_contained(file: &Path) -> bool {
    file.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Parses `ID:relative/path` lines. Paths resolve against the manifest's
/// directory, then the extraction root.
fn read_usage_order(manifest: &Path, root: &Path) -> std::io::Result<HashMap<String, PathBuf>> {
    let base = manifest.parent().unwrap_or(root);
    let reader = BufReader::new(File::open(manifest)?);
    let mut usage = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((id, file)) = line.split_once(':') else {
            tracing::warn!("Ignoring malformed {} line: {}", USAGE_ORDER_FILE, line);
            continue;
        };
        let file = Path::new(file.trim());
        if !is_contained(file) {
            tracing::warn!(
                "Ignoring {} entry {:?} pointing outside the package",
                USAGE_ORDER_FILE,
                file
            );
            continue;
        }
        let candidate = base.join(file);
        let path = if candidate.is_file() {
            candidate
        } else {
            root.join(file)
        };
        usage.insert(id.trim().to_string(), path);
    }

    Ok(usage)
}
