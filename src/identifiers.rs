//! Subject and sequence identifiers derived from slice headers.
//!
//! The identifiers end up in directory names, file names and ledger keys, so
//! they are sanitized to be filesystem safe.

use thiserror::Error;

use crate::header::SliceHeader;

const DATASET_ID_FIELDS: &[&str] = &["PatientID", "StudyID", "AccessionNumber"];
const DATASET_DATE_FIELDS: &[&str] = &["AcquisitionDate", "StudyDate"];
const SEQUENCE_FIELDS: &[&str] = &["SeriesDescription", "ProtocolName", "SequenceName"];
const SERIES_NUMBER_FIELD: &str = "SeriesNumber";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MissingMetadataError {
    #[error("cannot derive {what}: none of {candidates:?} is present")]
    Absent {
        what: &'static str,
        candidates: &'static [&'static str],
    },

    #[error("cannot derive {what}: {field} is empty")]
    Empty {
        what: &'static str,
        field: &'static str,
    },
}

/// First present field among `candidates`, with its name.
fn first_present(
    header: &SliceHeader,
    candidates: &'static [&'static str],
) -> Option<(&'static str, String)> {
    candidates
        .iter()
        .find_map(|name| header.get(name).map(|value| (*name, value.to_string())))
}

fn sanitize_dataset_id(raw: &str) -> String {
    raw.replace(' ', "_").replace('$', "").replace(':', ".")
}

fn sanitize_sequence(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            ' ' | '/' => Some('_'),
            '(' | ')' | '*' | '&' | '$' => None,
            ':' => Some('.'),
            other => Some(other),
        })
        .collect()
}

/// Patient ID, else Study ID, else Accession Number.
pub fn dataset_id(header: &SliceHeader) -> Result<String, MissingMetadataError> {
    let what = "dataset identifier";
    let (field, value) =
        first_present(header, DATASET_ID_FIELDS).ok_or(MissingMetadataError::Absent {
            what,
            candidates: DATASET_ID_FIELDS,
        })?;
    if value.trim().is_empty() {
        return Err(MissingMetadataError::Empty { what, field });
    }
    Ok(sanitize_dataset_id(&value))
}

/// Acquisition date, else study date.
pub fn dataset_date(header: &SliceHeader) -> Result<String, MissingMetadataError> {
    let what = "dataset date";
    let (field, value) =
        first_present(header, DATASET_DATE_FIELDS).ok_or(MissingMetadataError::Absent {
            what,
            candidates: DATASET_DATE_FIELDS,
        })?;
    if value.trim().is_empty() {
        return Err(MissingMetadataError::Empty { what, field });
    }
    Ok(value)
}

/// `<description>-<series number>`, the description falling back to the
/// protocol name and then the sequence name.
pub fn sequence_label(header: &SliceHeader) -> Result<String, MissingMetadataError> {
    let what = "sequence label";
    let (field, mut label) =
        first_present(header, SEQUENCE_FIELDS).ok_or(MissingMetadataError::Absent {
            what,
            candidates: SEQUENCE_FIELDS,
        })?;
    if let Some(number) = header.get(SERIES_NUMBER_FIELD) {
        label = format!("{label}-{number}");
    }
    if label.is_empty() {
        return Err(MissingMetadataError::Empty { what, field });
    }
    Ok(sanitize_sequence(&label))
}

/// `<dataset id>-<dataset date>`.
pub fn subject_id(header: &SliceHeader) -> Result<String, MissingMetadataError> {
    Ok(format!("{}-{}", dataset_id(header)?, dataset_date(header)?))
}

/// File name prefix shared by staged slices and converted volumes.
pub fn output_prefix(subject: &str, sequence: &str) -> String {
    format!("{subject}_{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderValue;

    fn text(value: &str) -> HeaderValue {
        HeaderValue::Text(value.to_string())
    }

    fn header() -> SliceHeader {
        SliceHeader::new()
            .with_field("PatientID", text("SUBJ 01$"))
            .with_field("StudyID", text("ignored"))
            .with_field("AcquisitionDate", text("20200101"))
            .with_field("StudyDate", text("19990101"))
            .with_field("SeriesDescription", text("AX T1 (POST)/GAD*"))
            .with_field("SeriesNumber", HeaderValue::Integer(3))
    }

    #[test]
    fn dataset_id_prefers_patient_id_and_sanitizes() {
        assert_eq!(dataset_id(&header()).unwrap(), "SUBJ_01");
    }

    #[test]
    fn dataset_id_falls_back_to_accession_number() {
        let header = SliceHeader::new().with_field("AccessionNumber", text("ACC:9"));
        assert_eq!(dataset_id(&header).unwrap(), "ACC.9");
    }

    #[test]
    fn dataset_id_without_any_field_is_missing() {
        let header = SliceHeader::new().with_field("StudyDate", text("20200101"));
        assert_eq!(
            dataset_id(&header),
            Err(MissingMetadataError::Absent {
                what: "dataset identifier",
                candidates: DATASET_ID_FIELDS,
            })
        );
    }

    #[test]
    fn empty_patient_id_is_missing() {
        let header = SliceHeader::new()
            .with_field("PatientID", text(""))
            .with_field("StudyID", text("S1"));
        assert!(matches!(
            dataset_id(&header),
            Err(MissingMetadataError::Empty {
                field: "PatientID",
                ..
            })
        ));
    }

    #[test]
    fn date_prefers_acquisition_date() {
        assert_eq!(dataset_date(&header()).unwrap(), "20200101");
        let header = SliceHeader::new().with_field("StudyDate", text("19990101"));
        assert_eq!(dataset_date(&header).unwrap(), "19990101");
        assert!(dataset_date(&SliceHeader::new()).is_err());
    }

    #[test]
    fn sequence_label_appends_series_number() {
        assert_eq!(sequence_label(&header()).unwrap(), "AX_T1_POST_GAD-3");
    }

    #[test]
    fn sequence_label_falls_back_to_protocol_name() {
        let header = SliceHeader::new().with_field("ProtocolName", text("t2 tse: ax"));
        assert_eq!(sequence_label(&header).unwrap(), "t2_tse._ax");
    }

    #[test]
    fn empty_sequence_label_is_missing() {
        let header = SliceHeader::new().with_field("SeriesDescription", text(""));
        assert!(sequence_label(&header).is_err());
    }

    #[test]
    fn subject_id_is_deterministic() {
        let first = subject_id(&header()).unwrap();
        let second = subject_id(&header()).unwrap();
        assert_eq!(first, "SUBJ_01-20200101");
        assert_eq!(first, second);
        assert_eq!(
            output_prefix(&first, &sequence_label(&header()).unwrap()),
            "SUBJ_01-20200101_AX_T1_POST_GAD-3"
        );
    }
}
