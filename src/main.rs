//! dicom-nifti CLI.

use anyhow::Context;
use clap::Parser;
use dicom_nifti::ledger::{
    Ledger, count_existing_files, default_modality_rules, merge_by_modality,
};
use dicom_nifti::logging::{LogConfig, LogFormat, init_logging};
use dicom_nifti::master::{self, RenamePlan};
use dicom_nifti::{
    ConversionOutcome, Dcm2nii, Dcuncat, DicomHeaderReader, Pipeline, PipelineConfig, RunSummary,
    Unenhancer,
};
use std::io::{self, IsTerminal};
use tracing::{info, warn};

mod cli;

use crate::cli::{Cli, Command, ConvertArgs, LogFormatArg, MergeArgs, RenameArgs};

fn main() {
    let cli = Cli::parse();
    let log_config = log_config_from_cli(&cli);
    if let Err(error) = init_logging(&log_config) {
        eprintln!("error: failed to initialize logging: {error}");
        std::process::exit(1);
    }
    let exit_code = match cli.command {
        Command::Convert(args) => match run_convert(&args) {
            Ok(summary) => {
                print_summary(&summary);
                0
            }
            Err(error) => {
                eprintln!("error: {error:#}");
                1
            }
        },
        Command::Merge(args) => match run_merge(&args) {
            Ok(()) => 0,
            Err(error) => {
                eprintln!("error: {error:#}");
                1
            }
        },
        Command::Rename(args) => match run_rename(&args) {
            Ok(()) => 0,
            Err(error) => {
                eprintln!("error: {error:#}");
                1
            }
        },
    };
    std::process::exit(exit_code);
}

/// Build logging configuration from CLI flags with consistent precedence.
fn log_config_from_cli(cli: &Cli) -> LogConfig {
    LogConfig {
        level_filter: cli.verbosity.tracing_level_filter(),
        use_env_filter: !cli.verbosity.is_present(),
        format: match cli.log_format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        },
        log_file: cli.log_file.clone(),
        with_ansi: cli.log_file.is_none() && io::stderr().is_terminal(),
        ..LogConfig::default()
    }
}

/// Configuration file values, overridden by whatever flags were given.
fn pipeline_config(args: &ConvertArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(ledger) = &args.ledger {
        config.ledger = Some(ledger.clone());
    }
    if let Some(workdir) = &args.workdir {
        config.workdir = Some(workdir.clone());
    }
    if let Some(group_by) = &args.group_by {
        config.group_by = group_by.clone();
    }
    if args.exclude.is_some() {
        config.exclude = args.exclude.clone();
    }
    if args.keywords.is_some() {
        config.keywords = args.keywords.clone();
    }
    if let Some(orientation) = args.orientation {
        config.orientation = orientation;
    }
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(secs) = args.lock_timeout {
        config.lock_timeout_secs = secs;
    }
    config.force |= args.force;
    config.recursive &= !args.shallow;
    Ok(config)
}

fn run_convert(args: &ConvertArgs) -> anyhow::Result<RunSummary> {
    let config = pipeline_config(args)?;
    let converter = Dcm2nii::locate().context("the slice converter is required")?;
    let unenhancer = match Dcuncat::locate() {
        Ok(unenhancer) => Some(unenhancer),
        Err(error) => {
            warn!(%error, "enhanced DICOM files will not be converted");
            None
        }
    };
    let reader = DicomHeaderReader::new(&config.group_by);
    let pipeline = Pipeline::new(config, &reader, &converter)
        .with_unenhancer(unenhancer.as_ref().map(|u| u as &dyn Unenhancer));
    pipeline
        .run(&args.input)
        .with_context(|| format!("conversion of {} failed", args.input.display()))
}

fn run_merge(args: &MergeArgs) -> anyhow::Result<()> {
    let ledger = Ledger::read(&args.input)?;
    let merged = merge_by_modality(&ledger, &default_modality_rules());
    merged
        .write(&args.output)
        .with_context(|| format!("cannot write merged ledger {}", args.output.display()))?;
    for modality in merged.sequences() {
        let files: usize = merged
            .subjects()
            .filter_map(|subject| merged.cell(subject, modality))
            .map(count_existing_files)
            .sum();
        println!("{modality}: {files} file(s)");
    }
    Ok(())
}

/// Brings the master sheet and the link tree up to date. Nothing is written
/// without `--execute`.
fn run_rename(args: &RenameArgs) -> anyhow::Result<()> {
    let merged = Ledger::read(&args.input)?;
    let modalities = args
        .modalities
        .clone()
        .unwrap_or_else(|| merged.sequences().map(str::to_string).collect());
    let mut subjects: Vec<String> = merged.subjects().map(str::to_string).collect();
    let mut pids = None;

    if let Some(path) = &args.master {
        let fresh = master::create_master(&merged, &modalities);
        let sheet = if path.exists() {
            let existing = Ledger::read(path)?;
            let update = master::update_master(&existing, &fresh, &modalities);
            if update.is_empty() {
                println!("no updates");
            }
            for subject in &update.updated {
                println!("updated {subject}");
            }
            for subject in &update.added {
                println!("new case {subject}");
            }
            subjects = update.changed();
            if let Some(column) = &args.pid_column {
                pids = Some(master::pid_map(&update.sheet, column));
            }
            update.sheet
        } else {
            fresh
        };
        if args.execute {
            sheet
                .write(path)
                .with_context(|| format!("cannot write master sheet {}", path.display()))?;
            info!(master = %path.display(), "master sheet written");
        } else {
            println!("dry run: {} not written", path.display());
        }
    }

    if let Some(dir) = &args.output {
        let plan = master::plan_links(
            &merged,
            subjects.iter().map(String::as_str),
            &modalities,
            dir,
            pids.as_ref(),
        )?;
        if args.execute {
            master::apply_links(&plan)?;
        } else {
            print_plan(&plan);
        }
    }
    Ok(())
}

fn print_plan(plan: &RenamePlan) {
    for stale in &plan.stale {
        println!("would remove {}", stale.display());
    }
    for planned in &plan.links {
        println!("would link {} -> {}", planned.link.display(), planned.source.display());
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} files, {} sequences, {} selected",
        summary.discovered, summary.sequences, summary.selected
    );
    for result in &summary.results {
        let status = match &result.outcome {
            ConversionOutcome::Converted { volumes } => format!("{} volume(s)", volumes.len()),
            ConversionOutcome::Skipped => "already converted".to_string(),
            ConversionOutcome::SortFailed => "sorting failed".to_string(),
            ConversionOutcome::ConvertFailed => "conversion failed".to_string(),
        };
        println!("  {} / {}: {status}", result.subject, result.sequence);
    }
    println!(
        "converted {}, skipped {}, failed {}, unidentified {}",
        summary.converted(),
        summary.skipped(),
        summary.failed(),
        summary.unidentified
    );
}
