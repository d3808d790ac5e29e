//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dicom_nifti::OrientationCode;
use dicom_nifti::enums::OrganizeMode;

#[derive(Parser)]
#[command(
    name = "dicom-nifti",
    version,
    about = "Batch convert DICOM sequences into NIfTI volumes",
    long_about = "Sort DICOM slices into sequences, convert them with dcm2nii and keep\n\
                  track of converted subjects in a shared CSV ledger."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Adjust log verbosity (-v for debug, -vv for trace, -q for warnings only).
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Log output format (pretty for human, json for machine parsing).
    #[arg(
        long = "log-format",
        value_enum,
        default_value = "pretty",
        global = true
    )]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr.
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Convert every selected sequence found under an input directory.
    Convert(ConvertArgs),

    /// Collapse the sequence columns of a ledger into modality columns.
    Merge(MergeArgs),

    /// Update a master sheet and a renamed link tree from a merged ledger.
    Rename(RenameArgs),
}

#[derive(Args)]
pub struct ConvertArgs {
    /// Directory to search for DICOM slices.
    #[arg(short = 'i', long = "input", value_name = "DIR")]
    pub input: PathBuf,

    /// Root of the sorted and converted output (default: current directory).
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// CSV ledger shared between runs.
    #[arg(short = 'l', long = "ledger", value_name = "CSV")]
    pub ledger: Option<PathBuf>,

    /// Header fields that identify a sequence.
    #[arg(short = 'g', long = "group-by", value_name = "FIELD", num_args = 1..)]
    pub group_by: Option<Vec<String>>,

    /// Drop sequences whose label contains any of these.
    #[arg(short = 'E', long = "exclude", value_name = "TEXT", num_args = 1..)]
    pub exclude: Option<Vec<String>>,

    /// Only convert sequences whose label contains one of these.
    #[arg(short = 'e', long = "keyword", value_name = "TEXT", num_args = 1..)]
    pub keywords: Option<Vec<String>>,

    /// Voxel orientation of the written volumes, e.g. LPS or RAS.
    #[arg(short = 'r', long = "orientation", value_name = "CODE")]
    pub orientation: Option<OrientationCode>,

    /// How slices are staged under the sorted tree.
    #[arg(short = 'm', long = "mode", value_enum)]
    pub mode: Option<ModeArg>,

    /// Scratch directory kept after the run.
    #[arg(short = 'w', long = "workdir", value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Convert even when the ledger lists existing output.
    #[arg(short = 'f', long = "force")]
    pub force: bool,

    /// Only look at files directly inside the input directory.
    #[arg(long = "shallow")]
    pub shallow: bool,

    /// Seconds to wait for the ledger lock before using a side ledger.
    #[arg(long = "lock-timeout", value_name = "SECS")]
    pub lock_timeout: Option<u64>,

    /// TOML file with defaults for the options above.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Ledger to read.
    #[arg(short = 'i', long = "input", value_name = "CSV")]
    pub input: PathBuf,

    /// Merged ledger to write.
    #[arg(short = 'o', long = "output", value_name = "CSV")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct RenameArgs {
    /// Merged ledger to read.
    #[arg(short = 'i', long = "input", value_name = "CSV")]
    pub input: PathBuf,

    /// Master sheet to create or update.
    #[arg(short = 'l', long = "master", value_name = "CSV")]
    pub master: Option<PathBuf>,

    /// Root of the renamed link tree.
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Modality columns to use (default: every column of the merged ledger).
    #[arg(short = 'm', long = "modality", value_name = "COLUMN", num_args = 1..)]
    pub modalities: Option<Vec<String>>,

    /// Master sheet column naming each subject's directory.
    #[arg(short = 'p', long = "pid-column", value_name = "COLUMN")]
    pub pid_column: Option<String>,

    /// Write the sheet and links; without it only report what would change.
    #[arg(long = "execute")]
    pub execute: bool,
}

/// CLI staging mode choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Link,
    Copy,
    Move,
    Skip,
}

impl From<ModeArg> for OrganizeMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Link => OrganizeMode::Link,
            ModeArg::Copy => OrganizeMode::Copy,
            ModeArg::Move => OrganizeMode::Move,
            ModeArg::Skip => OrganizeMode::Skip,
        }
    }
}

/// CLI log format choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_flags_parse() {
        let cli = Cli::try_parse_from([
            "dicom-nifti", "convert", "-i", "in", "-o", "out", "-e", "T1", "DTI", "-r", "ras",
            "-m", "copy", "-f",
        ])
        .unwrap();
        let Command::Convert(args) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(args.keywords, Some(vec!["T1".to_string(), "DTI".to_string()]));
        assert_eq!(args.orientation, Some(OrientationCode::RAS));
        assert!(matches!(args.mode, Some(ModeArg::Copy)));
        assert!(args.force && !args.shallow);
    }

    #[test]
    fn rename_defaults_to_a_dry_run() {
        let cli = Cli::try_parse_from([
            "dicom-nifti", "rename", "-i", "merged.csv", "-l", "master.csv", "-m", "T1", "DTI",
        ])
        .unwrap();
        let Command::Rename(args) = cli.command else {
            panic!("expected rename");
        };
        assert_eq!(args.modalities, Some(vec!["T1".to_string(), "DTI".to_string()]));
        assert_eq!(args.master, Some(PathBuf::from("master.csv")));
        assert!(args.output.is_none() && args.pid_column.is_none());
        assert!(!args.execute);
    }

    #[test]
    fn invalid_orientation_is_rejected() {
        assert!(Cli::try_parse_from(["dicom-nifti", "convert", "-i", "in", "-r", "LLS"]).is_err());
    }
}
