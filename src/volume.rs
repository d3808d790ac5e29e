use ndarray::{ArrayD, IxDyn};

use crate::nifti_header::{Affine, NiftiHeader};

/// A loaded NIfTI volume.
///
/// Voxels are kept as raw bytes so that any data type survives reorientation
/// bit for bit. The array is indexed `[x, y, z, (t, ...), byte]`; the trailing
/// axis holds the bytes of one voxel.
#[derive(Clone, Debug)]
pub struct Volume {
    pub header: NiftiHeader,
    /// Bytes between the header and the voxel data (extension flag and
    /// extensions), written back unchanged.
    pub extension: Vec<u8>,
    pub data: ArrayD<u8>,
    pub affine: Affine,
}

impl Volume {
    /// Builds a volume from voxel bytes in `[x, y, z, ..., byte]` layout.
    pub fn new(data: ArrayD<u8>, datatype: i16, affine: Affine) -> Self {
        let shape = data.shape();
        let voxel_bytes = shape.last().copied().unwrap_or(1);
        let dims = &shape[..shape.len().saturating_sub(1)];
        let mut header = NiftiHeader::new(dims, datatype, (voxel_bytes * 8) as i16);
        header.set_affine(&affine);
        Self {
            header,
            extension: vec![0; 4],
            data,
            affine,
        }
    }

    /// Spatial and higher dimensions, without the byte axis.
    pub fn dim(&self) -> Vec<usize> {
        let shape = self.data.shape();
        shape[..shape.len() - 1].to_vec()
    }

    /// Extent of the fourth (volume/gradient) dimension, 1 for 3-D data.
    pub fn volume_count(&self) -> usize {
        self.dim().get(3).copied().unwrap_or(1)
    }

    pub fn data(&self) -> &ArrayD<u8> {
        &self.data
    }

    /// Axis order that maps between the NIfTI file order (first axis fastest)
    /// and a row-major array with the byte axis last. It is its own inverse.
    pub(crate) fn storage_axes(ndim: usize) -> IxDyn {
        let mut axes: Vec<usize> = (0..ndim - 1).rev().collect();
        axes.push(ndim - 1);
        IxDyn(&axes)
    }

    /// Voxel bytes in NIfTI storage order.
    pub fn to_storage_bytes(&self) -> Vec<u8> {
        let axes = Self::storage_axes(self.data.ndim());
        self.data.view().permuted_axes(axes).iter().copied().collect()
    }

    /// Copies the current shape and affine into the header.
    pub fn sync_header(&mut self) {
        let dims = self.dim();
        self.header.set_dims(&dims);
        self.header.set_affine(&self.affine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_header::identity;

    #[test]
    fn storage_order_puts_first_axis_fastest() {
        // Two 16-bit voxels along x, one along y and z.
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 2]), vec![1, 2, 3, 4]).unwrap();
        let volume = Volume::new(data, 4, identity());
        assert_eq!(volume.to_storage_bytes(), vec![1, 2, 3, 4]);
        assert_eq!(volume.dim(), vec![2, 1, 1]);
    }

    #[test]
    fn storage_order_for_plane() {
        // value = 10 * x + y, one byte per voxel.
        let data = ArrayD::from_shape_fn(IxDyn(&[3, 2, 1, 1]), |idx| (10 * idx[0] + idx[1]) as u8);
        let volume = Volume::new(data, 2, identity());
        assert_eq!(volume.to_storage_bytes(), vec![0, 10, 20, 1, 11, 21]);
        assert_eq!(volume.volume_count(), 1);
    }
}
