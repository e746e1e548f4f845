use crate::{
    config::{RunSetConfig, DEFAULT_SKIP_FRAMES},
    paths::{FilePath, PathResolver},
};
use std::{
    collections::{BTreeSet, VecDeque},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory { recursive: bool },
    /// A directory of frames, thinned out by the frame-skip stride.
    Sequence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSetEntry {
    pub kind: EntryKind,
    pub path: FilePath,
    /// Ground-truth label supplied by the caller, carried onto every item.
    pub label: Option<String>,
}

impl RunSetEntry {
    pub fn file(directory: &str, filename: &str) -> Self {
        Self {
            kind: EntryKind::File,
            path: FilePath::new(directory, filename),
            label: None,
        }
    }

    pub fn directory(directory: &str, recursive: bool) -> Self {
        Self {
            kind: EntryKind::Directory { recursive },
            path: FilePath::new(directory, ""),
            label: None,
        }
    }

    pub fn sequence(directory: &str) -> Self {
        Self {
            kind: EntryKind::Sequence,
            path: FilePath::new(directory, ""),
            label: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

impl From<detector_proto::RunSetEntry> for RunSetEntry {
    fn from(entry: detector_proto::RunSetEntry) -> Self {
        let kind = match entry.kind() {
            detector_proto::EntryKind::File => EntryKind::File,
            detector_proto::EntryKind::Directory => EntryKind::Directory {
                recursive: entry.recursive,
            },
            detector_proto::EntryKind::Sequence => EntryKind::Sequence,
        };
        Self {
            kind,
            path: entry.path.map(FilePath::from).unwrap_or_default(),
            label: entry.label.filter(|label| !label.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSetConstraints {
    /// File extensions admitted, compared case-sensitively. Empty admits all.
    pub admitted_types: BTreeSet<String>,
    /// Keep every Nth frame of sequence entries; 0 and 1 keep all of them.
    pub skip_frames: usize,
}

impl RunSetConstraints {
    pub fn new<I, S>(admitted_types: I, skip_frames: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admitted_types: admitted_types.into_iter().map(Into::into).collect(),
            skip_frames,
        }
    }

    pub fn admits(&self, path: &Path) -> bool {
        if self.admitted_types.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.admitted_types.contains(ext))
    }

    fn stride(&self) -> usize {
        self.skip_frames.max(1)
    }
}

impl Default for RunSetConstraints {
    fn default() -> Self {
        Self {
            admitted_types: BTreeSet::new(),
            skip_frames: DEFAULT_SKIP_FRAMES,
        }
    }
}

impl From<&RunSetConfig> for RunSetConstraints {
    fn from(config: &RunSetConfig) -> Self {
        Self {
            admitted_types: config.admitted_types.clone(),
            skip_frames: config.skip_frames,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDescription {
    pub entries: Vec<RunSetEntry>,
    pub constraints: RunSetConstraints,
}

impl JobDescription {
    pub fn new(entries: Vec<RunSetEntry>, constraints: RunSetConstraints) -> Self {
        Self {
            entries,
            constraints,
        }
    }
}

/// One unit of work: a resolved path waiting for its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelableItem {
    pub path: PathBuf,
    pub label: Option<String>,
    /// Position among the admitted frames of a sequence entry.
    pub frame_index: Option<usize>,
}

impl LabelableItem {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            label: None,
            frame_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Active,
    Exhausted,
    InitFailed,
}

struct ResolvedEntry {
    kind: EntryKind,
    path: PathBuf,
    label: Option<String>,
}

enum Cursor {
    Directory {
        walker: walkdir::IntoIter,
        label: Option<String>,
    },
    Sequence {
        frames: walkdir::IntoIter,
        admitted: usize,
        label: Option<String>,
    },
}

impl Cursor {
    fn directory(root: &Path, recursive: bool, label: Option<String>) -> Self {
        let depth = if recursive { usize::MAX } else { 1 };
        Cursor::Directory {
            walker: walk(root, depth),
            label,
        }
    }

    fn sequence(root: &Path, label: Option<String>) -> Self {
        Cursor::Sequence {
            frames: walk(root, 1),
            admitted: 0,
            label,
        }
    }

    fn next_item(&mut self, constraints: &RunSetConstraints) -> Option<LabelableItem> {
        match self {
            Cursor::Directory { walker, label } => {
                for path in files(walker) {
                    if constraints.admits(&path) {
                        return Some(LabelableItem {
                            path,
                            label: label.clone(),
                            frame_index: None,
                        });
                    }
                }
                None
            }
            Cursor::Sequence {
                frames,
                admitted,
                label,
            } => {
                let stride = constraints.stride();
                for path in files(frames) {
                    if !constraints.admits(&path) {
                        continue;
                    }
                    let position = *admitted;
                    *admitted += 1;
                    if position % stride == 0 {
                        return Some(LabelableItem {
                            path,
                            label: label.clone(),
                            frame_index: Some(position),
                        });
                    }
                }
                None
            }
        }
    }
}

/// Sorted, depth-first walk below `root`. Symlinked directories are never
/// entered, so link cycles cannot repeat a listing.
fn walk(root: &Path, max_depth: usize) -> walkdir::IntoIter {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
}

/// Regular files (or links to them) yielded by a walk. Unreadable entries are
/// logged and skipped.
fn files(walker: &mut walkdir::IntoIter) -> impl Iterator<Item = PathBuf> + '_ {
    walker.filter_map(|entry| match entry {
        Ok(entry) if !entry.file_type().is_dir() && entry.path().is_file() => {
            Some(entry.into_path())
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Cannot list run set entry: {}", e);
            None
        }
    })
}

/// Lazy, single-pass expansion of a job description into labelable items.
pub struct RunSetIterator {
    pending: VecDeque<ResolvedEntry>,
    cursor: Option<Cursor>,
    constraints: RunSetConstraints,
    peeked: Option<LabelableItem>,
    state: IteratorState,
}

impl RunSetIterator {
    pub fn build(job: JobDescription, resolver: &PathResolver) -> Self {
        let mut pending = VecDeque::with_capacity(job.entries.len());

        for entry in job.entries {
            let path = match resolver.resolve(&entry.path) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping run set entry: {}", e);
                    continue;
                }
            };
            if entry.kind != EntryKind::File && !path.is_dir() {
                tracing::warn!("Skipping run set entry: {:?} is not a directory", path);
                continue;
            }
            pending.push_back(ResolvedEntry {
                kind: entry.kind,
                path,
                label: entry.label,
            });
        }

        let state = if pending.is_empty() {
            tracing::warn!("Run set references nothing resolvable");
            IteratorState::InitFailed
        } else {
            IteratorState::Active
        };

        Self {
            pending,
            cursor: None,
            constraints: job.constraints,
            peeked: None,
            state,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn init_failed(&self) -> bool {
        self.state == IteratorState::InitFailed
    }

    pub fn has_next(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.is_some()
    }

    pub fn get_next(&mut self) -> Option<LabelableItem> {
        self.peeked.take().or_else(|| self.advance())
    }

    fn advance(&mut self) -> Option<LabelableItem> {
        if self.state != IteratorState::Active {
            return None;
        }

        loop {
            if let Some(cursor) = self.cursor.as_mut() {
                if let Some(item) = cursor.next_item(&self.constraints) {
                    return Some(item);
                }
                self.cursor = None;
            }

            let Some(entry) = self.pending.pop_front() else {
                self.state = IteratorState::Exhausted;
                return None;
            };

            match entry.kind {
                EntryKind::File => {
                    if self.constraints.admits(&entry.path) {
                        return Some(LabelableItem {
                            path: entry.path,
                            label: entry.label,
                            frame_index: None,
                        });
                    }
                }
                EntryKind::Directory { recursive } => {
                    self.cursor = Some(Cursor::directory(&entry.path, recursive, entry.label));
                }
                EntryKind::Sequence => {
                    self.cursor = Some(Cursor::sequence(&entry.path, entry.label));
                }
            }
        }
    }
}

impl Iterator for RunSetIterator {
    type Item = LabelableItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next()
    }
}
