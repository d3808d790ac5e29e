use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::header::{HeaderReader, HeaderValue, SliceHeader};

/// Default header fields a sequence is identified by.
pub const DEFAULT_GROUP_BY: &[&str] = &["SeriesInstanceUID", "SeriesNumber", "SeriesDescription"];

/// One parsed slice file.
#[derive(Clone, Debug)]
pub struct SliceRecord {
    pub path: PathBuf,
    pub header: SliceHeader,
    pub acquisition_index: Option<i64>,
}

/// Values of the grouping fields for one acquisition, in grouping order.
///
/// A field missing from the header is kept as `None` so that slices lacking
/// the same fields still group together.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey(pub Vec<Option<HeaderValue>>);

impl SequenceKey {
    /// The last key element, used as the human readable label when textual.
    pub fn label(&self) -> Option<&str> {
        self.0.last()?.as_ref()?.as_text()
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|value| match value {
                Some(value) => value.to_string(),
                None => "-".to_string(),
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

pub type SequenceGroups = BTreeMap<SequenceKey, Vec<SliceRecord>>;

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// All non-hidden files under `root`, as absolute paths.
///
/// Hidden directories are not descended into. Entries are visited in file
/// name order so that discovery order is stable between runs.
pub fn discover_files(root: impl AsRef<Path>, recursive: bool) -> std::io::Result<Vec<PathBuf>> {
    let root = std::path::absolute(root.as_ref())?;
    let max_depth = if recursive { usize::MAX } else { 1 };
    let files = WalkDir::new(&root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() || entry.path_is_symlink())
        .map(DirEntry::into_path)
        .filter(|path| path.is_file())
        .collect();
    Ok(files)
}

/// Groups slice files into sequences by a tuple of header fields.
pub struct SequenceGrouper<'a> {
    reader: &'a dyn HeaderReader,
    group_by: Vec<String>,
}

impl<'a> SequenceGrouper<'a> {
    pub fn new<S: AsRef<str>>(reader: &'a dyn HeaderReader, group_by: &[S]) -> Self {
        Self {
            reader,
            group_by: group_by.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    fn key_of(&self, header: &SliceHeader) -> SequenceKey {
        SequenceKey(
            self.group_by
                .iter()
                .map(|field| header.get(field).cloned())
                .collect(),
        )
    }

    /// Reads every file's header and groups the readable ones.
    ///
    /// Unreadable files are logged and left out. Within a group, slices are
    /// ordered by acquisition index when all of them carry one, otherwise they
    /// keep discovery order.
    pub fn group(&self, paths: &[PathBuf]) -> SequenceGroups {
        let mut groups = SequenceGroups::new();
        for path in paths {
            let header = match self.reader.read_header(path) {
                Ok(header) => header,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable slice");
                    continue;
                }
            };
            let record = SliceRecord {
                path: path.clone(),
                acquisition_index: header.acquisition_index(),
                header,
            };
            groups
                .entry(self.key_of(&record.header))
                .or_default()
                .push(record);
        }

        for (key, records) in groups.iter_mut() {
            if records.iter().all(|r| r.acquisition_index.is_some()) {
                records.sort_by_key(|r| r.acquisition_index);
            } else {
                debug!(%key, "not every slice has an acquisition index; keeping discovery order");
            }
        }
        groups
    }
}
