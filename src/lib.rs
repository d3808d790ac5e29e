//! # DICOM to NIfTI library
//!
//! This crate converts directories of DICOM slices into NIfTI volumes in
//! batch. Slices are grouped into sequences by their header fields, filtered
//! by label, staged into a per-subject tree and handed to an external
//! converter. The converter output is renamed, reoriented to the requested
//! [`OrientationCode`] and recorded in a CSV ledger that several processes
//! may share.
//!
//! The external tools are:
//!  - `dcm2nii` for the slice to volume conversion
//!  - `dcuncat`, optionally, to split enhanced multi-frame files
//!
//! Output layout for a subject `P-20200101` and a sequence `T1_AX-3`:
//!
//! ```text
//! <output>/dicoms/P-20200101/T1_AX-3/P-20200101_T1_AX-3_000001.dcm
//! <output>/Nifti/P-20200101/P-20200101_T1_AX-3.nii.gz
//! ```
//!
//! # Examples
//!
//! ## Converting a directory
//!
//! ```no_run
//! # use dicom_nifti::{Dcm2nii, DicomHeaderReader, Pipeline, PipelineConfig};
//! let config = PipelineConfig {
//!     output_dir: "converted".into(),
//!     ledger: Some("converted/ledger.csv".into()),
//!     ..PipelineConfig::default()
//! };
//! let reader = DicomHeaderReader::new(&config.group_by);
//! let converter = Dcm2nii::locate().expect("dcm2nii should be on PATH");
//! let summary = Pipeline::new(config, &reader, &converter)
//!     .run("incoming")
//!     .expect("should have converted the directory");
//! println!("{} sequences converted", summary.converted());
//! ```
//!
//! ## Reorienting a volume
//!
//! ```no_run
//! # use dicom_nifti::{OrientationCode, VolumeLoader, orientation::reorient};
//! let volume = VolumeLoader::load_from_file("t1.nii.gz").expect("should have loaded volume");
//! let reoriented = reorient(&volume, OrientationCode::RAS, None).expect("volume is 3D");
//! VolumeLoader::save_to_file(&reoriented.volume, "t1_ras.nii.gz").expect("should have saved");
//! ```

pub mod config;
pub mod converter;
pub mod enums;
pub mod gradients;
pub mod grouper;
pub mod header;
pub mod identifiers;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod master;
pub mod nifti_header;
pub mod orchestrator;
pub mod organizer;
pub mod orientation;
pub mod pipeline;
pub mod selector;
pub mod volume;
pub mod volume_loader;

pub use config::PipelineConfig;
pub use converter::{Dcm2nii, Dcuncat, SliceConverter, Unenhancer};
pub use header::{DicomHeaderReader, HeaderReader};
pub use ledger::{ConversionLedger, Ledger};
pub use orchestrator::{ConversionJob, ConversionOrchestrator, ConversionOutcome};
pub use orientation::OrientationCode;
pub use pipeline::{Pipeline, RunSummary};
pub use volume::Volume;
pub use volume_loader::VolumeLoader;
