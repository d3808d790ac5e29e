use crate::nifti_header::{HEADER_SIZE, NiftiHeader, SINGLE_FILE_MAGIC};
use crate::volume::Volume;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use ndarray::{ArrayD, IxDyn};
use std::{
    fs::{self, File},
    io::{BufWriter, Read, Write},
    path::Path,
};
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("File is too short to hold a NIfTI header")]
    Truncated,

    #[error("Not a single-file NIfTI-1 image")]
    NotNifti,

    #[error("Big endian NIfTI files are not supported")]
    BigEndian,

    #[error("Unsupported bits per voxel: {0}")]
    UnsupportedBitpix(i16),

    #[error("Voxel data is shorter than the header dimensions require")]
    InconsistentDimensions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    fn read_bytes(path: &Path) -> Result<Vec<u8>, VolumeLoaderError> {
        let raw = fs::read(path)?;
        if raw.starts_with(&GZIP_MAGIC) {
            let mut bytes = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut bytes)?;
            Ok(bytes)
        } else {
            Ok(raw)
        }
    }

    /// Reads only the header of a `.nii` or `.nii.gz` file.
    pub fn load_header(path: impl AsRef<Path>) -> Result<NiftiHeader, VolumeLoaderError> {
        let bytes = Self::read_bytes(path.as_ref())?;
        Self::parse_header(&bytes)
    }

    fn parse_header(bytes: &[u8]) -> Result<NiftiHeader, VolumeLoaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(VolumeLoaderError::Truncated);
        }
        let header: NiftiHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        if header.sizeof_hdr != HEADER_SIZE as i32 {
            if header.sizeof_hdr.swap_bytes() == HEADER_SIZE as i32 {
                return Err(VolumeLoaderError::BigEndian);
            }
            return Err(VolumeLoaderError::NotNifti);
        }
        if header.magic != SINGLE_FILE_MAGIC {
            return Err(VolumeLoaderError::NotNifti);
        }
        Ok(header)
    }

    /// Load a volume from a `.nii` or `.nii.gz` file
    ///
    /// # Errors
    ///
    /// Returns error if the file is not a little endian single-file NIfTI-1
    /// image or holds fewer voxels than its header declares
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let bytes = Self::read_bytes(path.as_ref())?;
        let header = Self::parse_header(&bytes)?;
        let voxel_bytes = header
            .bytes_per_voxel()
            .ok_or(VolumeLoaderError::UnsupportedBitpix(header.bitpix))?;

        let mut dims = header.dims();
        while dims.len() < 3 {
            dims.push(1);
        }
        let offset = (header.vox_offset as usize).max(HEADER_SIZE);
        let length = dims.iter().product::<usize>() * voxel_bytes;
        let voxels = bytes
            .get(offset..offset + length)
            .ok_or(VolumeLoaderError::InconsistentDimensions)?;
        let extension = bytes[HEADER_SIZE..offset].to_vec();

        // File order has x varying fastest: read it as a row-major array with
        // the axes reversed, then flip the axis order back.
        let mut storage_shape: Vec<usize> = dims.iter().rev().copied().collect();
        storage_shape.push(voxel_bytes);
        let ndim = storage_shape.len();
        let data = ArrayD::from_shape_vec(IxDyn(&storage_shape), voxels.to_vec())?
            .permuted_axes(Volume::storage_axes(ndim));

        let affine = header.best_affine();
        Ok(Volume {
            header,
            extension,
            data,
            affine,
        })
    }

    /// Write a volume, gzip compressed when the path ends in `.gz`
    pub fn save_to_file(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeLoaderError> {
        let path = path.as_ref();
        let mut volume = volume.clone();
        volume.sync_header();
        let extension = if volume.extension.len() < 4 {
            vec![0; 4]
        } else {
            volume.extension.clone()
        };
        volume.header.vox_offset = (HEADER_SIZE + extension.len()) as f32;

        let mut payload = Vec::with_capacity(HEADER_SIZE + extension.len() + volume.data.len());
        payload.extend_from_slice(bytemuck::bytes_of(&volume.header));
        payload.extend_from_slice(&extension);
        payload.extend(volume.to_storage_bytes());

        let file = BufWriter::new(File::create(path)?);
        let gzip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        if gzip {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&payload)?;
            encoder.finish()?.flush()?;
        } else {
            let mut file = file;
            file.write_all(&payload)?;
            file.flush()?;
        }
        Ok(())
    }
}
