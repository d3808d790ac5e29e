//! Conversion of one selected sequence into reoriented volumes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::converter::{ConverterError, ConverterFlags, ConverterRun, SliceConverter, Unenhancer};
use crate::gradients::{self, GradientError, GradientTable};
use crate::header::{HeaderError, HeaderReader};
use crate::identifiers;
use crate::orientation::{self, OrientationCode, OrientationError};
use crate::organizer::{ensure_dir, move_file};
use crate::volume_loader::{VolumeLoader, VolumeLoaderError};

/// Extension of converted volumes.
pub const VOLUME_EXTENSION: &str = "nii.gz";

/// Sequence keywords whose jobs may legitimately yield several volumes.
pub const DEFAULT_MULTI_OUTPUT_EXEMPT: &[&str] = &["DTI"];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("conversion job has no slices")]
    Empty,

    #[error("{volume}: bval lists {bvals} gradients but the volume has {volumes}")]
    GradientMismatch {
        volume: PathBuf,
        bvals: usize,
        volumes: usize,
    },

    #[error("cannot find matching bval and bvec files for {volume}")]
    MissingGradients { volume: PathBuf },

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Converter(#[from] ConverterError),

    #[error(transparent)]
    Volume(#[from] VolumeLoaderError),

    #[error(transparent)]
    Orientation(#[from] OrientationError),

    #[error(transparent)]
    Gradient(#[from] GradientError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One sequence to convert.
#[derive(Clone, Debug)]
pub struct ConversionJob {
    pub subject: String,
    pub sequence: String,
    /// File name stem of the outputs, `<subject>_<sequence>` by default.
    pub prefix: String,
    pub slices: Vec<PathBuf>,
    pub destination: PathBuf,
    pub orientation: OrientationCode,
    /// Scratch directory supplied by the caller; it is left in place.
    pub staging_dir: Option<PathBuf>,
}

impl ConversionJob {
    pub fn new(
        subject: impl Into<String>,
        sequence: impl Into<String>,
        slices: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
        orientation: OrientationCode,
    ) -> Self {
        let subject = subject.into();
        let sequence = sequence.into();
        Self {
            prefix: identifiers::output_prefix(&subject, &sequence),
            subject,
            sequence,
            slices,
            destination: destination.into(),
            orientation,
            staging_dir: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_staging_dir(mut self, staging_dir: Option<PathBuf>) -> Self {
        self.staging_dir = staging_dir;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradientFiles {
    pub bval: PathBuf,
    pub bvec: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvertedVolume {
    pub volume: PathBuf,
    pub gradients: Option<GradientFiles>,
}

/// Terminal result of one sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversionOutcome {
    Converted { volumes: Vec<ConvertedVolume> },
    SortFailed,
    ConvertFailed,
    /// Already recorded as converted; nothing was done.
    Skipped,
}

impl ConversionOutcome {
    pub fn volume_paths(&self) -> Vec<&Path> {
        match self {
            ConversionOutcome::Converted { volumes } => {
                volumes.iter().map(|v| v.volume.as_path()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Scratch space for one job, removed on drop unless borrowed from the caller.
enum Scratch {
    Owned(TempDir),
    Borrowed(PathBuf),
}

impl Scratch {
    fn path(&self) -> &Path {
        match self {
            Scratch::Owned(dir) => dir.path(),
            Scratch::Borrowed(path) => path,
        }
    }
}

/// Spreadsheet style letters: 0 is `A`, 25 is `Z`, 26 is `AA`.
fn letter_suffix(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().map(|&b| b as char).collect()
}

/// Part of the file name before the first dot.
fn name_stem(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .and_then(|name| name.split('.').next().map(str::to_string))
        .unwrap_or_default()
}

fn with_x_prefix(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("x{name}"))
}

fn first_containing<'r>(candidates: &'r [PathBuf], stem: &str) -> Option<&'r PathBuf> {
    candidates.iter().find(|candidate| {
        candidate
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains(stem))
    })
}

pub struct ConversionOrchestrator<'a> {
    reader: &'a dyn HeaderReader,
    converter: &'a dyn SliceConverter,
    unenhancer: Option<&'a dyn Unenhancer>,
    scratch_root: Option<PathBuf>,
    multi_output_exempt: Vec<String>,
}

impl<'a> ConversionOrchestrator<'a> {
    pub fn new(reader: &'a dyn HeaderReader, converter: &'a dyn SliceConverter) -> Self {
        Self {
            reader,
            converter,
            unenhancer: None,
            scratch_root: None,
            multi_output_exempt: DEFAULT_MULTI_OUTPUT_EXEMPT
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_unenhancer(mut self, unenhancer: Option<&'a dyn Unenhancer>) -> Self {
        self.unenhancer = unenhancer;
        self
    }

    /// Directory under which per-job scratch directories are created.
    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn with_multi_output_exempt(mut self, keywords: Vec<String>) -> Self {
        self.multi_output_exempt = keywords;
        self
    }

    fn scratch(&self, job: &ConversionJob) -> io::Result<Scratch> {
        if let Some(dir) = &job.staging_dir {
            ensure_dir(dir)?;
            return Ok(Scratch::Borrowed(dir.clone()));
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("dicom-nifti-");
        let dir = match &self.scratch_root {
            Some(root) => {
                ensure_dir(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Scratch::Owned(dir))
    }

    fn is_multi_output_exempt(&self, sequence: &str) -> bool {
        let sequence = sequence.to_uppercase();
        self.multi_output_exempt
            .iter()
            .any(|keyword| sequence.contains(&keyword.to_uppercase()))
    }

    /// Replaces enhanced multi-frame files by their classic expansion.
    fn unenhance(
        &self,
        job: &ConversionJob,
        scratch: &Path,
    ) -> Result<Option<Vec<PathBuf>>, ConvertError> {
        let mut enhanced = Vec::with_capacity(job.slices.len());
        for slice in &job.slices {
            enhanced.push(self.reader.read_header(slice)?.is_enhanced());
        }
        if !enhanced.iter().any(|&e| e) {
            return Ok(None);
        }
        warn!(
            files = enhanced.iter().filter(|&&e| e).count(),
            "input is in enhanced multi-frame format, expanding to classic slices"
        );
        let unenhancer = self.unenhancer.ok_or(ConverterError::NotFound {
            program: crate::converter::Dcuncat::PROGRAM,
        })?;

        let classic_dir = scratch.join(&job.sequence);
        let mut expanded = Vec::new();
        for (count, (slice, is_enhanced)) in job.slices.iter().zip(enhanced).enumerate() {
            if !is_enhanced {
                expanded.push(slice.clone());
                continue;
            }
            let prefix = format!("{}_{count}_", job.sequence);
            match unenhancer.unenhance(slice, &classic_dir, &prefix) {
                Ok(files) => expanded.extend(files),
                Err(error) => warn!(slice = %slice.display(), %error, "cannot expand enhanced file, leaving it out"),
            }
        }
        Ok(Some(expanded))
    }

    /// Pairs an output volume with the gradient files the converter declared
    /// for it.
    fn match_gradients(
        &self,
        volume: &Path,
        run: &ConverterRun,
    ) -> Result<Option<GradientFiles>, ConvertError> {
        if run.bvals.is_empty() || run.bvecs.is_empty() {
            return Ok(None);
        }
        let stem = name_stem(volume);
        let bval = first_containing(&run.bvals, &stem);
        let bvec = first_containing(&run.bvecs, &stem);

        let files = match (bval, bvec) {
            (None, None) => return Ok(None),
            (Some(bval), Some(bvec)) if bval.is_file() && bvec.is_file() => GradientFiles {
                bval: bval.clone(),
                bvec: bvec.clone(),
            },
            (Some(bval), Some(bvec)) if !bval.exists() && !bvec.exists() => {
                // Written under an `x` prefix when extra directions were trimmed.
                let alternate = GradientFiles {
                    bval: with_x_prefix(bval),
                    bvec: with_x_prefix(bvec),
                };
                if !(alternate.bval.is_file() && alternate.bvec.is_file()) {
                    return Err(ConvertError::MissingGradients {
                        volume: volume.to_path_buf(),
                    });
                }
                debug!(bval = %alternate.bval.display(), "using trimmed gradient files");
                alternate
            }
            _ => {
                return Err(ConvertError::MissingGradients {
                    volume: volume.to_path_buf(),
                });
            }
        };

        let bvals = gradients::bval_count(&files.bval)?;
        let volumes = VolumeLoader::load_header(volume)?
            .dims()
            .get(3)
            .copied()
            .unwrap_or(1);
        if bvals != volumes {
            return Err(ConvertError::GradientMismatch {
                volume: volume.to_path_buf(),
                bvals,
                volumes,
            });
        }
        Ok(Some(files))
    }

    /// Moves or reorients one converter output into the destination as
    /// `<prefix>.nii.gz` with `.bval`/`.bvec` companions.
    fn place(
        &self,
        source: &Path,
        gradients: Option<GradientFiles>,
        job: &ConversionJob,
        prefix: &str,
    ) -> Result<ConvertedVolume, ConvertError> {
        let target = job.destination.join(format!("{prefix}.{VOLUME_EXTENSION}"));
        let target_gradients = gradients.as_ref().map(|_| GradientFiles {
            bval: job.destination.join(format!("{prefix}.bval")),
            bvec: job.destination.join(format!("{prefix}.bvec")),
        });

        if job.orientation == self.converter.native_orientation() {
            move_file(source, &target)?;
            if let (Some(from), Some(to)) = (&gradients, &target_gradients) {
                move_file(&from.bval, &to.bval)?;
                move_file(&from.bvec, &to.bvec)?;
            }
        } else {
            let volume = VolumeLoader::load_from_file(source)?;
            let table = gradients
                .as_ref()
                .map(|files| GradientTable::read_bvec(&files.bvec))
                .transpose()?;
            let reoriented = orientation::reorient(&volume, job.orientation, table.as_ref())?;
            VolumeLoader::save_to_file(&reoriented.volume, &target)?;
            fs::remove_file(source)?;
            if let (Some(from), Some(to), Some(table)) =
                (&gradients, &target_gradients, &reoriented.gradients)
            {
                table.write_bvec(&to.bvec)?;
                fs::remove_file(&from.bvec)?;
                move_file(&from.bval, &to.bval)?;
            }
        }

        Ok(ConvertedVolume {
            volume: target,
            gradients: target_gradients,
        })
    }

    /// Converts one sequence.
    ///
    /// # Errors
    ///
    /// Returns error when the converter cannot be run, when gradient files
    /// are missing or disagree with their volume, or when placing an output
    /// fails. Scratch space owned by the job is removed in every case.
    pub fn convert(&self, job: &ConversionJob) -> Result<ConversionOutcome, ConvertError> {
        if job.slices.is_empty() {
            return Err(ConvertError::Empty);
        }
        let scratch = self.scratch(job)?;

        let mut flags = ConverterFlags::new(true);
        let slices = match self.unenhance(job, scratch.path())? {
            Some(expanded) => expanded,
            None => job.slices.clone(),
        };
        if slices.len() == 1 {
            // Otherwise the converter also picks up sibling files.
            flags.expand_all_parameter_sets = false;
        }
        debug!(slices = slices.len(), "converting");

        let output_dir = scratch.path().join("converted");
        let run = self.converter.convert(&slices, &output_dir, &flags)?;
        if run.volumes.is_empty() {
            warn!("converter produced no volumes");
            return Ok(ConversionOutcome::ConvertFailed);
        }
        if run.volumes.len() > 1 {
            warn!(count = run.volumes.len(), "sequence produced more than one volume");
        }

        ensure_dir(&job.destination)?;
        let exempt = self.is_multi_output_exempt(&job.sequence);
        let mut volumes: Vec<ConvertedVolume> = Vec::with_capacity(run.volumes.len());
        let mut placed_from: Vec<&Path> = Vec::with_capacity(run.volumes.len());
        for (index, source) in run.volumes.iter().enumerate() {
            let prefix = if index > 0 && !exempt {
                format!("{}_{}", job.prefix, letter_suffix(index - 1))
            } else {
                job.prefix.clone()
            };
            debug!(output = %source.display(), index = index + 1, total = run.volumes.len(), "placing output");
            let gradients = self.match_gradients(source, &run)?;
            let placed = self.place(source, gradients, job, &prefix)?;
            match volumes.iter().position(|known| known.volume == placed.volume) {
                Some(earlier) => {
                    warn!(
                        discarded = %placed_from[earlier].display(),
                        kept = %source.display(),
                        target = %placed.volume.display(),
                        "output overwritten by a later volume of the same sequence"
                    );
                    volumes[earlier] = placed;
                    placed_from[earlier] = source.as_path();
                }
                None => {
                    volumes.push(placed);
                    placed_from.push(source.as_path());
                }
            }
        }

        volumes.retain(|placed| placed.volume.starts_with(&job.destination));
        info!(volumes = volumes.len(), "converted");
        Ok(ConversionOutcome::Converted { volumes })
    }
}
