use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dicom_nifti::converter::{ConverterError, ConverterFlags, ConverterRun};
use dicom_nifti::header::{HeaderError, HeaderValue, SliceHeader};
use dicom_nifti::nifti_header::Affine;
use dicom_nifti::{
    ConversionOutcome, HeaderReader, Ledger, OrientationCode, Pipeline, PipelineConfig,
    SliceConverter, Volume, VolumeLoader,
};
use ndarray::{ArrayD, IxDyn};
use tempfile::TempDir;

const SUBJECT: &str = "P-20200101";
const SEQUENCE: &str = "T1_AX-3";

const LAS: Affine = [
    [-1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Reads `Field=value` lines; series and instance numbers are integers.
struct TextHeaderReader;

impl HeaderReader for TextHeaderReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, HeaderError> {
        let text = fs::read_to_string(path)?;
        let mut header = SliceHeader::new();
        for line in text.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = match name {
                "SeriesNumber" | "InstanceNumber" => value
                    .parse()
                    .map(HeaderValue::Integer)
                    .map_err(|_| HeaderError::Malformed {
                        path: path.to_path_buf(),
                        reason: format!("{name} is not a number"),
                    })?,
                _ => HeaderValue::Text(value.to_string()),
            };
            header.insert(name, value);
        }
        Ok(header)
    }
}

/// Writes one small LAS volume per call and counts the calls. Fails when the
/// first slice mentions `fail_on`.
#[derive(Default)]
struct CountingConverter {
    calls: Cell<usize>,
    inputs: Cell<usize>,
    fail_on: Option<&'static str>,
}

impl CountingConverter {
    fn failing_on(description: &'static str) -> Self {
        Self {
            fail_on: Some(description),
            ..Self::default()
        }
    }
}

impl SliceConverter for CountingConverter {
    fn convert(
        &self,
        slices: &[PathBuf],
        output_dir: &Path,
        _flags: &ConverterFlags,
    ) -> Result<ConverterRun, ConverterError> {
        self.calls.set(self.calls.get() + 1);
        self.inputs.set(slices.len());
        if let (Some(description), Some(first)) = (self.fail_on, slices.first()) {
            if fs::read_to_string(first)?.contains(description) {
                return Err(io::Error::other("converter crashed").into());
            }
        }
        fs::create_dir_all(output_dir)?;
        let data = ArrayD::from_shape_fn(IxDyn(&[2, 3, slices.len(), 1]), |idx| {
            (idx[0] + 2 * idx[1] + 6 * idx[2]) as u8
        });
        let path = output_dir.join("s003a1001.nii.gz");
        VolumeLoader::save_to_file(&Volume::new(data, 2, LAS), &path)
            .map_err(|error| io::Error::other(error.to_string()))?;
        Ok(ConverterRun {
            volumes: vec![path],
            ..ConverterRun::default()
        })
    }
}

fn write_slice(dir: &Path, name: &str, uid: &str, number: i64, description: &str, instance: usize) {
    let text = format!(
        "PatientID=P\nAcquisitionDate=20200101\nSeriesInstanceUID={uid}\n\
         SeriesNumber={number}\nSeriesDescription={description}\nInstanceNumber={instance}\n"
    );
    fs::write(dir.join(name), text).unwrap();
}

fn write_series(dir: &Path, uid: &str, number: i64, description: &str, count: usize) {
    for i in 1..=count {
        write_slice(dir, &format!("{description}_{i}"), uid, number, description, i);
    }
}

fn result<'s>(summary: &'s dicom_nifti::RunSummary, sequence: &str) -> &'s ConversionOutcome {
    &summary
        .results
        .iter()
        .find(|result| result.sequence == sequence)
        .unwrap_or_else(|| panic!("no result for {sequence}"))
        .outcome
}

struct Fixture {
    _root: TempDir,
    input: PathBuf,
    output: PathBuf,
    ledger: PathBuf,
}

impl Fixture {
    /// Five T1 slices, written in reverse instance order, and three
    /// localizer slices.
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let input = root.path().join("incoming");
        let scan = input.join("scan");
        fs::create_dir_all(&scan).unwrap();
        for i in 1..=5 {
            write_slice(&scan, &format!("IM{}", 6 - i), "UID-A", 3, "T1_AX", i);
        }
        for i in 1..=3 {
            write_slice(&scan, &format!("LOC{i}"), "UID-B", 4, "Localizer", i);
        }
        fs::write(input.join(".DS_Store"), b"not a slice").unwrap();
        let output = root.path().join("converted");
        let ledger = output.join("ledger.csv");
        Self {
            _root: root,
            input,
            output,
            ledger,
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            output_dir: self.output.clone(),
            ledger: Some(self.ledger.clone()),
            lock_timeout_secs: 5,
            lock_poll_interval_ms: 10,
            ..PipelineConfig::default()
        }
    }

    fn staged_dir(&self) -> PathBuf {
        self.output.join("dicoms").join(SUBJECT).join(SEQUENCE)
    }

    fn volume(&self) -> PathBuf {
        self.volume_of(SEQUENCE)
    }

    fn volume_of(&self, sequence: &str) -> PathBuf {
        self.output
            .join("Nifti")
            .join(SUBJECT)
            .join(format!("{SUBJECT}_{sequence}.nii.gz"))
    }

    /// Adds a four slice T2 series to the scan directory.
    fn add_t2(&self) {
        write_series(&self.input.join("scan"), "UID-C", 5, "T2_AX", 4);
    }
}

#[test]
fn converts_stages_and_records_the_selected_sequence() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.discovered, 8);
    assert_eq!(summary.sequences, 2);
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.converted(), 1);
    assert_eq!(converter.calls.get(), 1);
    assert_eq!(converter.inputs.get(), 5);

    let staged: Vec<String> = {
        let mut names: Vec<String> = fs::read_dir(fixture.staged_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };
    assert_eq!(staged.len(), 5);
    assert_eq!(staged[0], format!("{SUBJECT}_{SEQUENCE}_000001.dcm"));
    // Staged in instance order, not file name order.
    let first = fs::read_to_string(fixture.staged_dir().join(&staged[0])).unwrap();
    assert!(first.contains("InstanceNumber=1\n"));

    let volume = VolumeLoader::load_from_file(fixture.volume()).unwrap();
    assert_eq!(OrientationCode::from_affine(&volume.affine), OrientationCode::LPS);
    assert_eq!(volume.dim(), vec![2, 3, 5]);

    let result = &summary.results[0];
    assert_eq!((result.subject.as_str(), result.sequence.as_str()), (SUBJECT, SEQUENCE));
    assert_eq!(result.outcome.volume_paths(), vec![fixture.volume().as_path()]);

    let ledger = Ledger::read(&fixture.ledger).unwrap();
    let expected = fixture.volume().to_string_lossy().into_owned();
    assert_eq!(ledger.cell(SUBJECT, SEQUENCE), Some(expected.as_str()));
    assert!(ledger.cell(SUBJECT, "Time_Last_Update").is_some());
}

#[test]
fn second_run_skips_recorded_sequences() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();
    let ledger_bytes = fs::read(&fixture.ledger).unwrap();
    fs::remove_dir_all(fixture.staged_dir()).unwrap();

    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.results[0].outcome, ConversionOutcome::Skipped);
    assert_eq!(summary.results[0].ledger, None);
    assert_eq!(converter.calls.get(), 1);
    assert!(!fixture.staged_dir().exists());
    assert_eq!(fs::read(&fixture.ledger).unwrap(), ledger_bytes);
}

#[test]
fn deleted_output_is_converted_again() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();
    fs::remove_file(fixture.volume()).unwrap();

    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.converted(), 1);
    assert_eq!(converter.calls.get(), 2);
    assert!(fixture.volume().is_file());
}

#[test]
fn force_converts_recorded_sequences() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    let config = PipelineConfig {
        force: true,
        ..fixture.config()
    };
    let summary = Pipeline::new(config, &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.converted(), 1);
    assert_eq!(converter.calls.get(), 2);
}

#[test]
fn keywords_and_empty_exclude_change_the_selection() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    let config = PipelineConfig {
        ledger: None,
        keywords: Some(vec!["localizer".to_string()]),
        exclude: Some(Vec::new()),
        ..fixture.config()
    };
    let summary = Pipeline::new(config, &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.selected, 1);
    assert_eq!(summary.results[0].sequence, "Localizer-4");
    assert!(!fixture.ledger.exists());
}

#[test]
fn native_orientation_output_is_moved_unchanged() {
    let fixture = Fixture::new();
    let converter = CountingConverter::default();
    let config = PipelineConfig {
        orientation: OrientationCode::LAS,
        ..fixture.config()
    };
    Pipeline::new(config, &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    let volume = VolumeLoader::load_from_file(fixture.volume()).unwrap();
    assert_eq!(OrientationCode::from_affine(&volume.affine), OrientationCode::LAS);
}

#[test]
fn side_ledger_receives_outcomes_while_the_ledger_is_locked() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.output).unwrap();
    let lock = dicom_nifti::lock::lock_path(&fixture.ledger);
    fs::write(&lock, b"someone else").unwrap();

    let converter = CountingConverter::default();
    let config = PipelineConfig {
        lock_timeout_secs: 0,
        ..fixture.config()
    };
    let summary = Pipeline::new(config, &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.results[0].ledger, Some(dicom_nifti::ledger::LedgerTarget::Side));
    assert!(!fixture.ledger.exists());
    let side: Vec<PathBuf> = fs::read_dir(&fixture.output)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().contains("ledger.csv_"))
        .collect();
    assert_eq!(side.len(), 1);
    assert!(lock.exists());
}

#[cfg(unix)]
#[test]
fn short_name_link_failure_only_fails_its_sequence() {
    let root = TempDir::new().unwrap();
    let input = root.path().join("n".repeat(200)).join("m".repeat(60));
    fs::create_dir_all(&input).unwrap();
    write_series(&input, "UID-A", 3, "T1_AX", 3);
    write_series(&input, "UID-C", 5, "T2_AX", 3);
    let output = root.path().join("o".repeat(250));
    let ledger = output.join("ledger.csv");
    let workdir = root.path().join("work");
    fs::create_dir_all(workdir.join(SUBJECT)).unwrap();
    fs::write(workdir.join(SUBJECT).join(SEQUENCE), b"in the way").unwrap();

    let converter = CountingConverter::default();
    let config = PipelineConfig {
        output_dir: output.clone(),
        ledger: Some(ledger.clone()),
        workdir: Some(workdir),
        lock_timeout_secs: 5,
        lock_poll_interval_ms: 10,
        ..PipelineConfig::default()
    };
    let summary = Pipeline::new(config, &TextHeaderReader, &converter)
        .run(&input)
        .unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(result(&summary, SEQUENCE), &ConversionOutcome::SortFailed);
    assert!(matches!(result(&summary, "T2_AX-5"), ConversionOutcome::Converted { .. }));
    assert_eq!(converter.calls.get(), 1);
    assert_eq!(converter.inputs.get(), 3);

    let ledger = Ledger::read(&ledger).unwrap();
    assert_eq!(ledger.cell(SUBJECT, SEQUENCE), Some("SORT_FAILED"));
    assert!(ledger.cell(SUBJECT, "T2_AX-5").is_some_and(|cell| cell.ends_with(".nii.gz")));
}

#[test]
fn blocked_staging_is_recorded_as_sort_failed() {
    let fixture = Fixture::new();
    fixture.add_t2();
    let staged = fixture.staged_dir();
    fs::create_dir_all(staged.parent().unwrap()).unwrap();
    fs::write(&staged, b"not a directory").unwrap();

    let converter = CountingConverter::default();
    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(result(&summary, SEQUENCE), &ConversionOutcome::SortFailed);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.converted(), 1);
    assert_eq!(converter.calls.get(), 1);
    assert!(fixture.volume_of("T2_AX-5").is_file());

    let ledger = Ledger::read(&fixture.ledger).unwrap();
    assert_eq!(ledger.cell(SUBJECT, SEQUENCE), Some("SORT_FAILED"));
}

#[test]
fn converter_failure_is_recorded_and_later_sequences_convert() {
    let fixture = Fixture::new();
    fixture.add_t2();

    let converter = CountingConverter::failing_on("T1_AX");
    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(converter.calls.get(), 2);
    assert_eq!(result(&summary, SEQUENCE), &ConversionOutcome::ConvertFailed);
    assert!(!fixture.volume().exists());
    let t2 = fixture.volume_of("T2_AX-5");
    assert_eq!(result(&summary, "T2_AX-5").volume_paths(), vec![t2.as_path()]);

    let ledger = Ledger::read(&fixture.ledger).unwrap();
    assert_eq!(ledger.cell(SUBJECT, SEQUENCE), Some("CONVERT_FAILED"));
    let expected = t2.to_string_lossy().into_owned();
    assert_eq!(ledger.cell(SUBJECT, "T2_AX-5"), Some(expected.as_str()));
}

#[test]
fn sequences_without_an_identity_are_skipped() {
    let fixture = Fixture::new();
    let anonymous = fixture.input.join("anonymous");
    fs::create_dir_all(&anonymous).unwrap();
    for i in 1..=2 {
        let text = format!(
            "AcquisitionDate=20200101\nSeriesInstanceUID=UID-D\nSeriesNumber=6\n\
             SeriesDescription=T1_SAG\nInstanceNumber={i}\n"
        );
        fs::write(anonymous.join(format!("IM{i}")), text).unwrap();
    }

    let converter = CountingConverter::default();
    let summary = Pipeline::new(fixture.config(), &TextHeaderReader, &converter)
        .run(&fixture.input)
        .unwrap();

    assert_eq!(summary.selected, 2);
    assert_eq!(summary.unidentified, 1);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.converted(), 1);
    assert!(fixture.volume().is_file());
    let ledger = Ledger::read(&fixture.ledger).unwrap();
    assert_eq!(ledger.sequences().collect::<Vec<_>>(), vec![SEQUENCE]);
}
