//! Master sheet and renamed link tree built from a modality-merged ledger.
//!
//! The master sheet keeps one row per subject with the number of existing
//! files per modality, the subject id split into its dataset id and scan
//! date, and free `Exclude`/`Notes` columns that updates never touch. The
//! link tree exposes every volume as
//! `<dir>/<pid>/<ID>/<ID>_<MODALITY>[_<n>].nii.gz`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerError, UPDATED_COLUMN, count_existing_files};
use crate::organizer::{ensure_dir, replace_symlink};

pub const SUBJECT_COLUMN: &str = "subj_id";
pub const DATE_COLUMN: &str = "scan_date";
pub const EXCLUDE_COLUMN: &str = "Exclude";
pub const NOTES_COLUMN: &str = "Notes";

const DIFFUSION_MODALITY: &str = "DTI";
const VOLUME_SUFFIX: &str = ".nii.gz";

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MasterError + '_ {
    move |source| MasterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Splits `<dataset id>-<date>` at the last dash. Ids without a dash are all
/// date.
pub fn split_subject(id: &str) -> (&str, &str) {
    id.rsplit_once('-').unwrap_or(("", id))
}

fn count_of(sheet: &Ledger, subject: &str, modality: &str) -> usize {
    sheet
        .cell(subject, modality)
        .and_then(|cell| cell.trim().parse().ok())
        .unwrap_or(0)
}

/// Builds a master sheet from `merged`, counting existing files in each of
/// `modalities`.
pub fn create_master_at(merged: &Ledger, modalities: &[String], at: NaiveDateTime) -> Ledger {
    let mut sheet = Ledger::new();
    for subject in merged.subjects() {
        let (dataset, date) = split_subject(subject);
        sheet.set(subject, SUBJECT_COLUMN, dataset);
        sheet.set(subject, DATE_COLUMN, date);
        for modality in modalities {
            let files = merged
                .cell(subject, modality)
                .map_or(0, count_existing_files);
            sheet.set(subject, modality, files.to_string());
        }
        sheet.set(subject, EXCLUDE_COLUMN, "");
        sheet.set(subject, NOTES_COLUMN, "");
        sheet.stamp(subject, at);
    }
    sheet
}

pub fn create_master(merged: &Ledger, modalities: &[String]) -> Ledger {
    create_master_at(merged, modalities, Local::now().naive_local())
}

/// An existing master sheet brought up to date with a fresh one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterUpdate {
    pub sheet: Ledger,
    /// Subjects whose modality counts changed.
    pub updated: Vec<String>,
    /// Subjects that were not in the existing sheet.
    pub added: Vec<String>,
}

impl MasterUpdate {
    /// Updated and added subjects, in sheet order.
    pub fn changed(&self) -> Vec<String> {
        self.sheet
            .subjects()
            .filter(|subject| self.updated.iter().chain(&self.added).any(|s| s == subject))
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.added.is_empty()
    }
}

fn copy_cells(sheet: &mut Ledger, fresh: &Ledger, subject: &str, columns: &[&str]) {
    for column in columns {
        sheet.set(subject, column, fresh.cell(subject, column).unwrap_or(""));
    }
}

/// Merges `fresh` into `existing`.
///
/// Rows of `existing` keep their `Exclude`/`Notes` cells and, unless a
/// modality count changed, their last-updated time. Subjects missing from
/// `existing` are appended as they are in `fresh`.
pub fn update_master(existing: &Ledger, fresh: &Ledger, modalities: &[String]) -> MasterUpdate {
    let mut sheet = existing.clone();
    let mut updated = Vec::new();
    let mut added = Vec::new();
    let mut counted: Vec<&str> = vec![SUBJECT_COLUMN, DATE_COLUMN];
    counted.extend(modalities.iter().map(String::as_str));

    for subject in fresh.subjects() {
        if existing.subjects().any(|known| known == subject) {
            let changed = modalities
                .iter()
                .any(|m| count_of(existing, subject, m) != count_of(fresh, subject, m));
            if changed {
                debug!(subject, "modality counts changed");
                copy_cells(&mut sheet, fresh, subject, &counted);
                copy_cells(&mut sheet, fresh, subject, &[UPDATED_COLUMN]);
                updated.push(subject.to_string());
            }
        } else {
            let columns: Vec<&str> = fresh.sequences().chain([UPDATED_COLUMN]).collect();
            copy_cells(&mut sheet, fresh, subject, &columns);
            added.push(subject.to_string());
        }
    }
    MasterUpdate {
        sheet,
        updated,
        added,
    }
}

/// Directory names per subject taken from `column` of `sheet`.
pub fn pid_map(sheet: &Ledger, column: &str) -> BTreeMap<String, String> {
    sheet
        .subjects()
        .filter_map(|subject| {
            sheet
                .cell(subject, column)
                .map(|pid| (subject.to_string(), pid.trim().to_string()))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedLink {
    pub source: PathBuf,
    pub link: PathBuf,
}

/// Links to remove and links to create for a set of subjects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenamePlan {
    pub stale: Vec<PathBuf>,
    pub links: Vec<PlannedLink>,
}

/// `<stem>.<extension>` next to a `<stem>.nii.gz` volume.
fn companion(volume: &Path, extension: &str) -> PathBuf {
    let text = volume.to_string_lossy();
    match text.strip_suffix(VOLUME_SUFFIX) {
        Some(stem) => PathBuf::from(format!("{stem}.{extension}")),
        None => volume.with_extension(extension),
    }
}

/// Whether `name` is one of the links made for `<id>_<modality>`.
fn is_modality_link(name: &str, id: &str, modality: &str) -> bool {
    name.strip_prefix(&format!("{id}_{modality}"))
        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('_'))
}

fn stale_links(dir: &Path, id: &str, modality: &str) -> Result<Vec<PathBuf>, MasterError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut stale = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let is_link = entry.file_type().map_err(io_error(dir))?.is_symlink();
        if is_link && is_modality_link(&entry.file_name().to_string_lossy(), id, modality) {
            stale.push(entry.path());
        }
    }
    stale.sort();
    Ok(stale)
}

/// Plans the link tree under `base_dir` for `subjects` of `merged`.
///
/// Only files that exist are linked. A modality with several files gets
/// numbered links; diffusion volumes also link their `.bval`/`.bvec` files.
pub fn plan_links<'s>(
    merged: &Ledger,
    subjects: impl IntoIterator<Item = &'s str>,
    modalities: &[String],
    base_dir: &Path,
    pids: Option<&BTreeMap<String, String>>,
) -> Result<RenamePlan, MasterError> {
    let mut plan = RenamePlan::default();
    for subject in subjects {
        let pid = pids
            .and_then(|pids| pids.get(subject).map(String::as_str))
            .unwrap_or_else(|| split_subject(subject).0);
        let dir = base_dir.join(pid).join(subject);
        for modality in modalities {
            plan.stale.extend(stale_links(&dir, subject, modality)?);
            let Some(cell) = merged.cell(subject, modality) else {
                continue;
            };
            let files: Vec<&Path> = cell
                .split_whitespace()
                .map(Path::new)
                .filter(|path| path.exists())
                .collect();
            for (index, source) in files.iter().enumerate() {
                let stem = if files.len() > 1 {
                    format!("{subject}_{modality}_{}", index + 1)
                } else {
                    format!("{subject}_{modality}")
                };
                plan.links.push(PlannedLink {
                    source: source.to_path_buf(),
                    link: dir.join(format!("{stem}{VOLUME_SUFFIX}")),
                });
                if modality.eq_ignore_ascii_case(DIFFUSION_MODALITY) {
                    for extension in ["bval", "bvec"] {
                        let gradient = companion(source, extension);
                        if gradient.exists() {
                            plan.links.push(PlannedLink {
                                source: gradient,
                                link: dir.join(format!("{stem}.{extension}")),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(plan)
}

/// Removes the stale links of `plan` and creates its new ones.
pub fn apply_links(plan: &RenamePlan) -> Result<(), MasterError> {
    for stale in &plan.stale {
        fs::remove_file(stale).map_err(io_error(stale))?;
    }
    for planned in &plan.links {
        if let Some(parent) = planned.link.parent() {
            ensure_dir(parent).map_err(io_error(parent))?;
        }
        replace_symlink(&planned.source, &planned.link).map_err(io_error(&planned.link))?;
    }
    info!(removed = plan.stale.len(), linked = plan.links.len(), "link tree updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, second)
            .unwrap()
    }

    fn modalities(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn file(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn subject_ids_split_at_the_last_dash() {
        assert_eq!(split_subject("SUBJ-01-20200101"), ("SUBJ-01", "20200101"));
        assert_eq!(split_subject("20200101"), ("", "20200101"));
    }

    #[test]
    fn master_counts_existing_files() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (file(dir.path(), "a.nii.gz"), file(dir.path(), "b.nii.gz"));
        let gone = dir.path().join("gone.nii.gz").to_string_lossy().into_owned();
        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", format!("{a} {b}"));
        merged.set("P1-20200101", "DTI", gone);
        merged.set("P2-20200305", "T1", a);

        let sheet = create_master_at(&merged, &modalities(&["T1", "DTI", "FLAIR"]), at(5));
        assert_eq!(sheet.cell("P1-20200101", SUBJECT_COLUMN), Some("P1"));
        assert_eq!(sheet.cell("P1-20200101", DATE_COLUMN), Some("20200101"));
        assert_eq!(sheet.cell("P1-20200101", "T1"), Some("2"));
        assert_eq!(sheet.cell("P1-20200101", "DTI"), Some("0"));
        assert_eq!(sheet.cell("P2-20200305", "FLAIR"), Some("0"));
        assert_eq!(sheet.cell("P2-20200305", UPDATED_COLUMN), Some("2024/03/01-12:00:05"));
        let columns: Vec<&str> = sheet.sequences().collect();
        assert_eq!(
            columns,
            [SUBJECT_COLUMN, DATE_COLUMN, "T1", "DTI", "FLAIR", EXCLUDE_COLUMN, NOTES_COLUMN]
        );
    }

    #[test]
    fn master_round_trips_with_empty_note_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sheets/master.csv");
        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", "SORT_FAILED");
        let sheet = create_master_at(&merged, &modalities(&["T1"]), at(0));
        sheet.write(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ID,Time_Last_Update,subj_id,scan_date,T1,Exclude,Notes\n"));
        assert!(text.contains("P1-20200101,2024/03/01-12:00:00,P1,20200101,0,,\n"));
    }

    #[test]
    fn update_keeps_notes_and_unchanged_timestamps() {
        let dir = TempDir::new().unwrap();
        let a = file(dir.path(), "a.nii.gz");
        let mods = modalities(&["T1"]);
        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", a.clone());
        let mut existing = create_master_at(&merged, &mods, at(1));
        existing.set("P1-20200101", NOTES_COLUMN, "motion");

        merged.set("P2-20200102", "T1", a.clone());
        let update = update_master(&existing, &create_master_at(&merged, &mods, at(9)), &mods);
        assert!(update.updated.is_empty());
        assert_eq!(update.added, ["P2-20200102"]);
        let sheet = &update.sheet;
        assert_eq!(sheet.cell("P1-20200101", NOTES_COLUMN), Some("motion"));
        assert_eq!(sheet.cell("P1-20200101", UPDATED_COLUMN), Some("2024/03/01-12:00:01"));
        assert_eq!(sheet.cell("P2-20200102", UPDATED_COLUMN), Some("2024/03/01-12:00:09"));
        assert_eq!(sheet.cell("P2-20200102", "T1"), Some("1"));

        let b = file(dir.path(), "b.nii.gz");
        merged.set("P1-20200101", "T1", format!("{a} {b}"));
        let update = update_master(sheet, &create_master_at(&merged, &mods, at(20)), &mods);
        assert_eq!(update.updated, ["P1-20200101"]);
        assert_eq!(update.changed(), ["P1-20200101"]);
        assert_eq!(update.sheet.cell("P1-20200101", "T1"), Some("2"));
        assert_eq!(update.sheet.cell("P1-20200101", NOTES_COLUMN), Some("motion"));
        assert_eq!(
            update.sheet.cell("P1-20200101", UPDATED_COLUMN),
            Some("2024/03/01-12:00:20")
        );
    }

    #[test]
    fn plan_numbers_repeated_modalities_and_links_gradients() {
        let data = TempDir::new().unwrap();
        let (t1, t1b) = (file(data.path(), "t1.nii.gz"), file(data.path(), "t1b.nii.gz"));
        let dti = file(data.path(), "dti.nii.gz");
        file(data.path(), "dti.bval");
        file(data.path(), "dti.bvec");
        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", format!("{t1} {t1b}"));
        merged.set("P1-20200101", "DTI", dti.clone());

        let base = Path::new("/links");
        let plan = plan_links(
            &merged,
            ["P1-20200101"],
            &modalities(&["T1", "DTI", "FLAIR"]),
            base,
            None,
        )
        .unwrap();
        let dir = base.join("P1/P1-20200101");
        let links: Vec<(&Path, PathBuf)> = plan
            .links
            .iter()
            .map(|planned| (planned.source.as_path(), planned.link.clone()))
            .collect();
        assert_eq!(
            links,
            [
                (Path::new(&t1), dir.join("P1-20200101_T1_1.nii.gz")),
                (Path::new(&t1b), dir.join("P1-20200101_T1_2.nii.gz")),
                (Path::new(&dti), dir.join("P1-20200101_DTI.nii.gz")),
                (data.path().join("dti.bval").as_path(), dir.join("P1-20200101_DTI.bval")),
                (data.path().join("dti.bvec").as_path(), dir.join("P1-20200101_DTI.bvec")),
            ]
        );
        assert!(plan.stale.is_empty());
    }

    #[test]
    fn pid_column_names_the_subject_directory() {
        let data = TempDir::new().unwrap();
        let t1 = file(data.path(), "t1.nii.gz");
        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", t1);
        let mut sheet = create_master_at(&merged, &modalities(&["T1"]), at(0));
        sheet.set("P1-20200101", "pid", "study-007");

        let pids = pid_map(&sheet, "pid");
        let plan =
            plan_links(&merged, ["P1-20200101"], &modalities(&["T1"]), Path::new("/l"), Some(&pids))
                .unwrap();
        assert_eq!(
            plan.links[0].link,
            Path::new("/l/study-007/P1-20200101/P1-20200101_T1.nii.gz")
        );
    }

    #[cfg(unix)]
    #[test]
    fn applying_replaces_stale_links_only() {
        let data = TempDir::new().unwrap();
        let t1 = file(data.path(), "t1.nii.gz");
        let base = TempDir::new().unwrap();
        let dir = base.path().join("P1/P1-20200101");
        fs::create_dir_all(&dir).unwrap();
        let old = dir.join("P1-20200101_T1_3.nii.gz");
        std::os::unix::fs::symlink(&t1, &old).unwrap();
        fs::write(dir.join("P1-20200101_T1_notes.txt"), b"keep").unwrap();
        std::os::unix::fs::symlink(&t1, dir.join("P1-20200101_T1C.nii.gz")).unwrap();

        let mut merged = Ledger::new();
        merged.set("P1-20200101", "T1", t1.clone());
        let mods = modalities(&["T1"]);
        let plan = plan_links(&merged, ["P1-20200101"], &mods, base.path(), None).unwrap();
        assert_eq!(plan.stale, [old.clone()]);
        apply_links(&plan).unwrap();

        let link = dir.join("P1-20200101_T1.nii.gz");
        assert_eq!(fs::read_link(&link).unwrap(), Path::new(&t1));
        assert!(fs::symlink_metadata(&old).is_err());
        assert!(dir.join("P1-20200101_T1_notes.txt").is_file());
        assert!(dir.join("P1-20200101_T1C.nii.gz").exists());

        let again = plan_links(&merged, ["P1-20200101"], &mods, base.path(), None).unwrap();
        assert_eq!(again.stale, [link.clone()]);
        apply_links(&again).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), Path::new(&t1));
    }
}
