//! One run over an input directory: discover, group and select sequences,
//! then stage, convert and record each of them in turn.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::config::PipelineConfig;
use crate::converter::{SliceConverter, Unenhancer};
use crate::enums::OrganizeMode;
use crate::grouper::{self, SequenceGrouper};
use crate::header::HeaderReader;
use crate::identifiers;
use crate::ledger::{ConversionLedger, LedgerError, LedgerTarget};
use crate::orchestrator::{ConversionJob, ConversionOrchestrator, ConversionOutcome};
use crate::organizer::{SLICE_EXTENSION, SequenceOrganizer, ensure_dir, replace_symlink};
use crate::selector::SequenceSelector;

/// Longest path, in bytes, the converter accepts is one less than this.
pub const MAX_CONVERTER_PATH: usize = 255;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot scan {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceResult {
    pub subject: String,
    pub sequence: String,
    pub outcome: ConversionOutcome,
    /// Ledger file that received the outcome, if any.
    pub ledger: Option<LedgerTarget>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub sequences: usize,
    pub selected: usize,
    /// Selected sequences whose subject or label could not be derived.
    pub unidentified: usize,
    pub results: Vec<SequenceResult>,
}

impl RunSummary {
    fn count(&self, matches: impl Fn(&ConversionOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| matches(&r.outcome)).count()
    }

    pub fn converted(&self) -> usize {
        self.count(|o| matches!(o, ConversionOutcome::Converted { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ConversionOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ConversionOutcome::SortFailed | ConversionOutcome::ConvertFailed))
    }
}

fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}

/// Paths to hand to the converter when staged names may be too long for it.
///
/// Falls back to the source paths, or to short links in `scratch` when those
/// are too long as well.
pub fn converter_paths(
    staged: Vec<PathBuf>,
    sources: &[PathBuf],
    scratch: &Path,
) -> io::Result<Vec<PathBuf>> {
    let too_long = |paths: &[PathBuf]| paths.first().is_some_and(|p| path_len(p) >= MAX_CONVERTER_PATH);
    if !too_long(&staged) {
        return Ok(staged);
    }
    if !too_long(sources) {
        return Ok(sources.to_vec());
    }
    ensure_dir(scratch)?;
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| -> io::Result<PathBuf> {
            let link = scratch.join(format!("{index}.{SLICE_EXTENSION}"));
            replace_symlink(source, &link)?;
            Ok(link)
        })
        .collect()
}

pub struct Pipeline<'a> {
    config: PipelineConfig,
    reader: &'a dyn HeaderReader,
    converter: &'a dyn SliceConverter,
    unenhancer: Option<&'a dyn Unenhancer>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: PipelineConfig,
        reader: &'a dyn HeaderReader,
        converter: &'a dyn SliceConverter,
    ) -> Self {
        Self {
            config,
            reader,
            converter,
            unenhancer: None,
        }
    }

    pub fn with_unenhancer(mut self, unenhancer: Option<&'a dyn Unenhancer>) -> Self {
        self.unenhancer = unenhancer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Converts every selected sequence under `input_dir`.
    ///
    /// Failures of a single sequence end up in its result and in the ledger;
    /// only problems with the shared output, scratch or ledger files abort
    /// the run.
    pub fn run(&self, input_dir: impl AsRef<Path>) -> Result<RunSummary, PipelineError> {
        let input_dir = input_dir.as_ref();
        let config = &self.config;
        for dir in [config.dicom_dir(), config.nifti_dir()] {
            ensure_dir(&dir).map_err(|source| PipelineError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }
        let (workdir, _owned_workdir) = match &config.workdir {
            Some(dir) => {
                ensure_dir(dir)?;
                (dir.clone(), None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("dicom-nifti-run-").tempdir()?;
                (dir.path().to_path_buf(), Some::<TempDir>(dir))
            }
        };

        info!(input = %input_dir.display(), "crawling the input directory");
        let files = grouper::discover_files(input_dir, config.recursive).map_err(|source| {
            PipelineError::Discover {
                path: input_dir.to_path_buf(),
                source,
            }
        })?;
        info!(count = files.len(), "slice files found");

        let groups = SequenceGrouper::new(self.reader, &config.group_by).group(&files);
        for key in groups.keys() {
            info!(sequence = %key, "sequence found");
        }
        let mut summary = RunSummary {
            discovered: files.len(),
            sequences: groups.len(),
            ..RunSummary::default()
        };
        let selected =
            SequenceSelector::new(config.keywords.clone(), config.exclude.clone()).select(groups);
        summary.selected = selected.len();

        let ledger = config
            .ledger
            .as_ref()
            .map(|path| ConversionLedger::new(path, config.lock_policy()));
        let orchestrator = ConversionOrchestrator::new(self.reader, self.converter)
            .with_unenhancer(self.unenhancer)
            .with_scratch_root(Some(workdir.clone()))
            .with_multi_output_exempt(config.multi_output_exempt.clone());
        let organizer = SequenceOrganizer::new(self.reader, config.mode);

        for (key, slices) in selected {
            let Some((subject, sequence)) = self.identify(&slices) else {
                warn!(sequence = %key, "cannot identify sequence, skipping it");
                summary.unidentified += 1;
                continue;
            };
            let span = info_span!("sequence", subject = %subject, sequence = %sequence);
            let _entered = span.enter();

            let outcome = self.process(
                &subject,
                &sequence,
                &slices,
                &workdir,
                ledger.as_ref(),
                &organizer,
                &orchestrator,
            )?;
            let target = match &ledger {
                Some(ledger) => ledger.log_outcome(&subject, &sequence, &outcome)?,
                None => None,
            };
            summary.results.push(SequenceResult {
                subject,
                sequence,
                outcome,
                ledger: target,
            });
        }

        info!(
            converted = summary.converted(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "run finished"
        );
        Ok(summary)
    }

    fn identify(&self, slices: &[PathBuf]) -> Option<(String, String)> {
        let first = slices.first()?;
        let header = match self.reader.read_header(first) {
            Ok(header) => header,
            Err(error) => {
                error!(%error, "cannot read first slice");
                return None;
            }
        };
        match (identifiers::subject_id(&header), identifiers::sequence_label(&header)) {
            (Ok(subject), Ok(sequence)) => Some((subject, sequence)),
            (Err(error), _) | (_, Err(error)) => {
                error!(%error, slice = %first.display(), "missing metadata");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process(
        &self,
        subject: &str,
        sequence: &str,
        slices: &[PathBuf],
        workdir: &Path,
        ledger: Option<&ConversionLedger>,
        organizer: &SequenceOrganizer<'_>,
        orchestrator: &ConversionOrchestrator<'_>,
    ) -> Result<ConversionOutcome, PipelineError> {
        let config = &self.config;
        info!("working on sequence");
        if let Some(ledger) = ledger {
            if !config.force && ledger.is_converted(subject, sequence)? {
                warn!("already converted");
                return Ok(ConversionOutcome::Skipped);
            }
        }

        let prefix = identifiers::output_prefix(subject, sequence);
        let staged = if config.mode == OrganizeMode::Skip {
            slices.to_vec()
        } else {
            info!("sorting");
            let destination = config.dicom_dir().join(subject).join(sequence);
            match organizer.organize(slices, &destination, Some(&prefix)) {
                Ok(staged) => staged,
                Err(error) => {
                    error!(%error, "sorting failed");
                    return Ok(ConversionOutcome::SortFailed);
                }
            }
        };
        let inputs = match converter_paths(staged, slices, &workdir.join(subject).join(sequence)) {
            Ok(inputs) => inputs,
            Err(error) => {
                error!(%error, "cannot link slices under short names");
                return Ok(ConversionOutcome::SortFailed);
            }
        };

        info!("converting");
        let job = ConversionJob::new(
            subject,
            sequence,
            inputs,
            config.nifti_dir().join(subject),
            config.orientation,
        )
        .with_prefix(prefix);
        match orchestrator.convert(&job) {
            Ok(ConversionOutcome::ConvertFailed) => {
                error!("conversion produced no output");
                Ok(ConversionOutcome::ConvertFailed)
            }
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                error!(%error, "conversion failed");
                Ok(ConversionOutcome::ConvertFailed)
            }
        }
    }
}
