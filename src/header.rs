use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dicom::core::VR;
use dicom::object::{InMemDicomObject, OpenFileOptions, mem::InMemElement};
use dicom_dictionary_std::tags;
use thiserror::Error;

/// Field name under which the file meta Media Storage SOP Class UID is exposed.
pub const MEDIA_STORAGE_SOP_CLASS_UID: &str = "MediaStorageSOPClassUID";

/// SOP class of multi-frame Enhanced MR Image Storage files.
pub const ENHANCED_MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";

/// Field used to order slices inside a sequence.
pub const ACQUISITION_INDEX_FIELD: &str = "InstanceNumber";

/// Fields needed for identifier derivation, ordering and format detection,
/// read regardless of the configured grouping fields.
pub const IDENTITY_FIELDS: &[&str] = &[
    "PatientID",
    "StudyID",
    "AccessionNumber",
    "AcquisitionDate",
    "StudyDate",
    "SeriesDescription",
    "ProtocolName",
    "SequenceName",
    "SeriesNumber",
    "SeriesInstanceUID",
    ACQUISITION_INDEX_FIELD,
];

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("{path} cannot be read as a DICOM slice: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: dicom::object::ReadError,
    },

    #[error("{path} has a malformed header: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single header value as used for grouping and naming.
///
/// Integer string and binary integer VRs become [`HeaderValue::Integer`];
/// everything else is kept as trimmed text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(text) => Some(text),
            HeaderValue::Integer(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(value) => Some(*value),
            HeaderValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(text) => f.write_str(text),
            HeaderValue::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// Named header fields of one slice file. Absent fields are not stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    fields: BTreeMap<String, HeaderValue>,
}

impl SliceHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn acquisition_index(&self) -> Option<i64> {
        self.get(ACQUISITION_INDEX_FIELD)
            .and_then(HeaderValue::as_integer)
    }

    pub fn sop_class_uid(&self) -> Option<&str> {
        self.get(MEDIA_STORAGE_SOP_CLASS_UID)
            .and_then(HeaderValue::as_text)
    }

    /// Whether the slice is an enhanced multi-frame file.
    pub fn is_enhanced(&self) -> bool {
        self.sop_class_uid() == Some(ENHANCED_MR_IMAGE_STORAGE)
    }
}

/// Extracts named header fields from a slice file without decoding pixels.
pub trait HeaderReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, HeaderError>;
}

/// [`HeaderReader`] backed by the dicom-rs object reader.
///
/// Parsing stops before the pixel data element, so reading a header costs
/// roughly the size of the metadata rather than the image.
pub struct DicomHeaderReader {
    fields: Vec<String>,
}

impl DicomHeaderReader {
    /// Reader exposing [`IDENTITY_FIELDS`] plus the given extra fields.
    pub fn new<S: AsRef<str>>(extra_fields: &[S]) -> Self {
        let mut fields: Vec<String> = IDENTITY_FIELDS.iter().map(|f| f.to_string()).collect();
        for field in extra_fields {
            let field = field.as_ref();
            if !fields.iter().any(|known| known == field) {
                fields.push(field.to_string());
            }
        }
        Self { fields }
    }

    fn element_value(element: &InMemElement) -> Option<HeaderValue> {
        match element.vr() {
            VR::IS | VR::SL | VR::SS | VR::UL | VR::US | VR::SV | VR::UV => element
                .to_int::<i64>()
                .ok()
                .map(HeaderValue::Integer),
            VR::SQ => None,
            _ => element.to_str().ok().map(|value| {
                HeaderValue::Text(value.trim_end_matches('\0').trim().to_string())
            }),
        }
    }

    fn collect_fields(&self, object: &InMemDicomObject) -> SliceHeader {
        let mut header = SliceHeader::new();
        for name in &self.fields {
            let value = object
                .element_by_name(name)
                .ok()
                .and_then(Self::element_value);
            if let Some(value) = value {
                header.insert(name.clone(), value);
            }
        }
        header
    }
}

impl HeaderReader for DicomHeaderReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, HeaderError> {
        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|source| HeaderError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;

        let mut header = self.collect_fields(&object);
        let sop_class = object
            .meta()
            .media_storage_sop_class_uid()
            .trim_end_matches('\0')
            .trim();
        if !sop_class.is_empty() {
            header.insert(
                MEDIA_STORAGE_SOP_CLASS_UID,
                HeaderValue::Text(sop_class.to_string()),
            );
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_values_are_not_text() {
        let value = HeaderValue::Integer(3);
        assert_eq!(value.as_text(), None);
        assert_eq!(value.as_integer(), Some(3));
        assert_eq!(value.to_string(), "3");
    }

    #[test]
    fn acquisition_index_accepts_numeric_text() {
        let header = SliceHeader::new()
            .with_field(ACQUISITION_INDEX_FIELD, HeaderValue::Text(" 12 ".into()));
        assert_eq!(header.acquisition_index(), Some(12));
    }

    #[test]
    fn reader_deduplicates_requested_fields() {
        let reader = DicomHeaderReader::new(&["SeriesNumber", "EchoTime"]);
        let count = reader
            .fields
            .iter()
            .filter(|field| *field == "SeriesNumber")
            .count();
        assert_eq!(count, 1);
        assert!(reader.fields.iter().any(|field| field == "EchoTime"));
    }

    #[test]
    fn non_dicom_file_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "not a slice").unwrap();
        let result = DicomHeaderReader::new::<&str>(&[]).read_header(&path);
        assert!(matches!(result, Err(HeaderError::Unreadable { .. })));
    }
}
