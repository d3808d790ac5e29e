//! External slice-to-volume tools.
//!
//! [`SliceConverter`] and [`Unenhancer`] are the seams to the subprocesses
//! that do the actual encoding. [`Dcm2nii`] and [`Dcuncat`] drive the
//! command line tools and recover their output files.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use directories::BaseDirs;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::orientation::OrientationCode;

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("{program} cannot be found in the system path")]
    NotFound { program: &'static str },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Options handed to the converter for one invocation.
///
/// Output is always gzipped, never anonymized, never reoriented and never
/// date-stamped; only the parameter set expansion varies per job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConverterFlags {
    pub gzip: bool,
    pub anonymize: bool,
    pub reorient: bool,
    pub date_in_filename: bool,
    pub expand_all_parameter_sets: bool,
}

impl ConverterFlags {
    pub fn new(expand_all_parameter_sets: bool) -> Self {
        Self {
            gzip: true,
            anonymize: false,
            reorient: false,
            date_in_filename: false,
            expand_all_parameter_sets,
        }
    }
}

impl Default for ConverterFlags {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Files reported by one converter run. `bvals` and `bvecs` are parallel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConverterRun {
    pub volumes: Vec<PathBuf>,
    pub bvals: Vec<PathBuf>,
    pub bvecs: Vec<PathBuf>,
}

pub trait SliceConverter {
    /// Orientation of the volumes the converter writes.
    fn native_orientation(&self) -> OrientationCode {
        OrientationCode::LAS
    }

    /// Converts `slices` into volumes under `output_dir`.
    ///
    /// A run that finishes with an error status is not an error here: the
    /// outputs it managed to write are still reported. Only a failure to
    /// run the tool at all is.
    fn convert(
        &self,
        slices: &[PathBuf],
        output_dir: &Path,
        flags: &ConverterFlags,
    ) -> Result<ConverterRun, ConverterError>;
}

pub trait Unenhancer {
    /// Expands one enhanced multi-frame file into classic single-frame files
    /// named `<prefix>...` under `output_dir`.
    fn unenhance(
        &self,
        source: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<Vec<PathBuf>, ConverterError>;
}

/// Searches the `PATH` for an executable called `name`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_executable_in(name, env::split_paths(&path))
}

fn find_executable_in(name: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

fn yes_no(value: bool) -> &'static str {
    if value { "y" } else { "n" }
}

fn run(program: &Path, args: &[OsString]) -> Result<Output, ConverterError> {
    debug!(program = %program.display(), args = ?args, "running");
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ConverterError::Spawn {
            program: program.to_path_buf(),
            source,
        })
}

/// The `dcm2nii` command line converter.
#[derive(Clone, Debug)]
pub struct Dcm2nii {
    program: PathBuf,
    config_file: Option<PathBuf>,
}

impl Dcm2nii {
    pub const PROGRAM: &'static str = "dcm2nii";

    /// Finds `dcm2nii` on the `PATH` and picks up `~/.dcm2nii/dcm2nii.ini`
    /// when it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConverterError::NotFound`] if the executable is missing
    pub fn locate() -> Result<Self, ConverterError> {
        let program = find_executable(Self::PROGRAM).ok_or(ConverterError::NotFound {
            program: Self::PROGRAM,
        })?;
        Ok(Self::new(program).with_config_file(Self::user_config_file()))
    }

    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            config_file: None,
        }
    }

    pub fn with_config_file(mut self, config_file: Option<PathBuf>) -> Self {
        self.config_file = config_file;
        self
    }

    fn user_config_file() -> Option<PathBuf> {
        BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".dcm2nii").join("dcm2nii.ini"))
            .filter(|path| path.is_file())
    }

    fn arguments(&self, slices: &[PathBuf], output_dir: &Path, flags: &ConverterFlags) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            ("-a", flags.anonymize),
            ("-d", flags.date_in_filename),
            ("-g", flags.gzip),
            ("-r", flags.reorient),
            ("-x", flags.reorient),
            ("-v", flags.expand_all_parameter_sets),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [OsString::from(flag), OsString::from(yes_no(value))])
        .collect();
        if let Some(config) = &self.config_file {
            args.push("-b".into());
            args.push(config.into());
        }
        args.push("-o".into());
        args.push(output_dir.into());
        args.extend(slices.iter().map(OsString::from));
        args
    }
}

/// Strips `.nii.gz`, `.nii` or any single extension.
fn strip_volume_extension(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .map(str::to_string)
        .unwrap_or_else(|| {
            Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    path.with_file_name(stem)
}

/// Recovers output files from the console report of `dcm2nii`.
pub fn parse_report(stdout: &str, output_dir: &Path) -> ConverterRun {
    let mut run = ConverterRun::default();
    let mut last_added: Option<PathBuf> = None;
    let mut skip = false;

    for line in stdout.lines() {
        trace!(target: "dicom_nifti::converter::stdout", "{line}");
        if skip {
            skip = false;
            continue;
        }
        let mut output = None;
        if let Some(path) = line.strip_prefix("Saving ") {
            output = Some(PathBuf::from(path.trim()));
        } else if let Some(name) = line.strip_prefix("GZip...") {
            let name = name.trim();
            // The uncompressed file reported before is replaced by this one.
            let replaces_last = run.volumes.last().and_then(|last| last.file_name()).is_some_and(
                |last| name.strip_suffix(".gz").is_some_and(|plain| last == plain),
            );
            if replaces_last {
                run.volumes.pop();
            }
            output = Some(output_dir.join(name));
        } else if line.starts_with("Number of diffusion directions ") {
            if let Some(last) = &last_added {
                let base = strip_volume_extension(last).into_os_string();
                for (list, extension) in [(&mut run.bvecs, ".bvec"), (&mut run.bvals, ".bval")] {
                    let mut path = base.clone();
                    path.push(extension);
                    list.push(PathBuf::from(path));
                }
            }
        } else if line.starts_with("Removed DWI from DTI scan") {
            debug!("converter trimmed extra diffusion directions");
        } else if let Some((_, name)) = line.split_once("->") {
            let path = output_dir.join(name.trim());
            if path.exists() {
                output = Some(path);
            }
        } else if line.starts_with("Reorienting as ") || line.starts_with("Cropping NIfTI/Analyze image ") {
            skip = true;
        }

        if let Some(path) = output {
            if !run.volumes.contains(&path) {
                run.volumes.push(path.clone());
                last_added = Some(path);
            }
        }
    }
    run
}

impl SliceConverter for Dcm2nii {
    fn convert(
        &self,
        slices: &[PathBuf],
        output_dir: &Path,
        flags: &ConverterFlags,
    ) -> Result<ConverterRun, ConverterError> {
        fs::create_dir_all(output_dir)?;
        let args = self.arguments(slices, output_dir, flags);
        let output = run(&self.program, &args)?;
        if !output.status.success() {
            warn!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "dcm2nii reported an error, collecting what it wrote"
            );
        }
        let report = parse_report(&String::from_utf8_lossy(&output.stdout), output_dir);
        debug!(volumes = report.volumes.len(), bvals = report.bvals.len(), "converter finished");
        Ok(report)
    }
}

/// The `dcuncat` tool from dicom3tools, used to split enhanced files.
#[derive(Clone, Debug)]
pub struct Dcuncat {
    program: PathBuf,
}

impl Dcuncat {
    pub const PROGRAM: &'static str = "dcuncat";

    pub fn locate() -> Result<Self, ConverterError> {
        find_executable(Self::PROGRAM)
            .map(Self::new)
            .ok_or(ConverterError::NotFound {
                program: Self::PROGRAM,
            })
    }

    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

fn files_with_prefix(dir: &Path, prefix: &str) -> io::Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let matches = entry.file_name().to_string_lossy().starts_with(prefix);
        if matches && entry.file_type()?.is_file() {
            files.insert(entry.path());
        }
    }
    Ok(files)
}

impl Unenhancer for Dcuncat {
    fn unenhance(
        &self,
        source: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<Vec<PathBuf>, ConverterError> {
        fs::create_dir_all(output_dir)?;
        let before = files_with_prefix(output_dir, prefix)?;
        let args = vec![
            OsString::from("-unenhance"),
            OsString::from("-of"),
            output_dir.join(prefix).into_os_string(),
            source.into(),
        ];
        let output = run(&self.program, &args)?;
        if !output.status.success() {
            return Err(ConverterError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let after = files_with_prefix(output_dir, prefix)?;
        Ok(after.difference(&before).cloned().collect())
    }
}
