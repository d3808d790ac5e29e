use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::enums::OrganizeMode;
use crate::header::{HeaderError, HeaderReader};
use crate::identifiers::{self, MissingMetadataError};

/// Extension given to staged slice files.
pub const SLICE_EXTENSION: &str = "dcm";

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("no slices to organize")]
    Empty,

    #[error("cannot stage {from} as {to}: {source}")]
    Stage {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Metadata(#[from] MissingMetadataError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Creates `dir` and its parents; an existing directory is not an error.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Symlinks `link` to `target`, replacing a link already at `link`.
pub fn replace_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if fs::symlink_metadata(link).is_ok_and(|meta| meta.file_type().is_symlink()) {
        fs::remove_file(link)?;
    }
    symlink(target, link)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Renames `from` to `to`, copying and removing when they sit on different
/// filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(error) if error.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        other => other,
    }
}

/// Stages the slices of one sequence under deterministic names.
pub struct SequenceOrganizer<'a> {
    reader: &'a dyn HeaderReader,
    mode: OrganizeMode,
}

impl<'a> SequenceOrganizer<'a> {
    pub fn new(reader: &'a dyn HeaderReader, mode: OrganizeMode) -> Self {
        Self { reader, mode }
    }

    /// `<subject>_<sequence>` read from the first slice.
    fn derive_prefix(&self, first: &Path) -> Result<String, OrganizeError> {
        let header = self.reader.read_header(first)?;
        Ok(identifiers::output_prefix(
            &identifiers::subject_id(&header)?,
            &identifiers::sequence_label(&header)?,
        ))
    }

    /// Stages `slices` in `destination` as `<prefix>_<000001>.dcm`, ... and
    /// returns the staged paths in input order.
    ///
    /// With [`OrganizeMode::Skip`] the input paths are returned untouched.
    pub fn organize(
        &self,
        slices: &[PathBuf],
        destination: &Path,
        prefix: Option<&str>,
    ) -> Result<Vec<PathBuf>, OrganizeError> {
        if self.mode == OrganizeMode::Skip {
            return Ok(slices.to_vec());
        }
        let first = slices.first().ok_or(OrganizeError::Empty)?;
        let prefix = match prefix {
            Some(prefix) => prefix.to_string(),
            None => self.derive_prefix(first)?,
        };
        ensure_dir(destination)?;

        let mut staged = Vec::with_capacity(slices.len());
        for (count, slice) in slices.iter().enumerate() {
            let source = std::path::absolute(slice)?;
            let target =
                destination.join(format!("{prefix}_{:06}.{SLICE_EXTENSION}", count + 1));
            let result = match self.mode {
                OrganizeMode::Link => replace_symlink(&source, &target),
                OrganizeMode::Copy => fs::copy(&source, &target).map(|_| ()),
                OrganizeMode::Move => move_file(&source, &target),
                OrganizeMode::Skip => Ok(()),
            };
            result.map_err(|source_error| OrganizeError::Stage {
                from: source.clone(),
                to: target.clone(),
                source: source_error,
            })?;
            staged.push(target);
        }
        debug!(count = staged.len(), destination = %destination.display(), mode = ?self.mode, "staged slices");
        Ok(staged)
    }
}
