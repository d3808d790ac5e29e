//! Axis orientation codes and reorientation of volumes and gradient tables.
//!
//! An orientation code has one letter per voxel axis naming the direction the
//! axis increases toward, e.g. `LPS`: x toward left, y toward posterior,
//! z toward superior.

use std::fmt;
use std::str::FromStr;

use ndarray::{Axis, IxDyn};
use serde::Deserialize;
use thiserror::Error;

use crate::gradients::GradientTable;
use crate::nifti_header::{Affine, identity, matmul};
use crate::volume::Volume;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrientationError {
    #[error("invalid orientation '{0}': expected one letter each from L/R, A/P and S/I")]
    InvalidOrientation(String),

    #[error("volume has {0} dimensions, at least 3 are required")]
    NotVolumetric(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AxisCode {
    L,
    R,
    A,
    P,
    S,
    I,
}

impl AxisCode {
    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'L' => Some(AxisCode::L),
            'R' => Some(AxisCode::R),
            'A' => Some(AxisCode::A),
            'P' => Some(AxisCode::P),
            'S' => Some(AxisCode::S),
            'I' => Some(AxisCode::I),
            _ => None,
        }
    }

    fn letter(self) -> char {
        match self {
            AxisCode::L => 'L',
            AxisCode::R => 'R',
            AxisCode::A => 'A',
            AxisCode::P => 'P',
            AxisCode::S => 'S',
            AxisCode::I => 'I',
        }
    }

    /// World axis (0 = x, 1 = y, 2 = z in RAS+) and direction along it.
    fn world_axis(self) -> AxisFlip {
        match self {
            AxisCode::R => AxisFlip { axis: 0, flip: 1 },
            AxisCode::L => AxisFlip { axis: 0, flip: -1 },
            AxisCode::A => AxisFlip { axis: 1, flip: 1 },
            AxisCode::P => AxisFlip { axis: 1, flip: -1 },
            AxisCode::S => AxisFlip { axis: 2, flip: 1 },
            AxisCode::I => AxisFlip { axis: 2, flip: -1 },
        }
    }

    fn from_world_axis(axis: usize, positive: bool) -> Self {
        match (axis, positive) {
            (0, true) => AxisCode::R,
            (0, false) => AxisCode::L,
            (1, true) => AxisCode::A,
            (1, false) => AxisCode::P,
            (2, true) => AxisCode::S,
            _ => AxisCode::I,
        }
    }
}

/// Where one axis goes and whether it is reversed on the way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisFlip {
    pub axis: usize,
    pub flip: i8,
}

/// Per input axis: target axis and flip.
pub type AxisTransform = [AxisFlip; 3];

/// A validated three letter orientation code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct OrientationCode([AxisCode; 3]);

impl OrientationCode {
    pub const LPS: OrientationCode = OrientationCode([AxisCode::L, AxisCode::P, AxisCode::S]);
    pub const LAS: OrientationCode = OrientationCode([AxisCode::L, AxisCode::A, AxisCode::S]);
    pub const RAS: OrientationCode = OrientationCode([AxisCode::R, AxisCode::A, AxisCode::S]);

    pub fn axes(&self) -> [AxisCode; 3] {
        self.0
    }

    fn world_axes(&self) -> AxisTransform {
        self.0.map(AxisCode::world_axis)
    }

    /// The orientation of the voxel axes of `affine`.
    ///
    /// Each voxel axis in turn is assigned the world axis its direction
    /// cosine points along most; that world axis is then no longer available
    /// to the remaining voxel axes, so the result is always a valid code.
    pub fn from_affine(affine: &Affine) -> Self {
        let mut cosines = [[0.0f64; 3]; 3];
        for col in 0..3 {
            let norm = (0..3)
                .map(|row| affine[row][col] * affine[row][col])
                .sum::<f64>()
                .sqrt();
            for row in 0..3 {
                cosines[row][col] = if norm == 0.0 {
                    0.0
                } else {
                    affine[row][col] / norm
                };
            }
        }

        let mut taken = [false; 3];
        let mut codes = [AxisCode::R; 3];
        for (voxel_axis, code) in codes.iter_mut().enumerate() {
            let (world_axis, value) = (0..3)
                .filter(|&row| !taken[row])
                .map(|row| (row, cosines[row][voxel_axis]))
                .fold((usize::MAX, -1.0_f64), |best, candidate| {
                    if candidate.1.abs() > best.1.abs() || best.0 == usize::MAX {
                        candidate
                    } else {
                        best
                    }
                });
            taken[world_axis] = true;
            *code = AxisCode::from_world_axis(world_axis, value >= 0.0);
        }
        OrientationCode(codes)
    }
}

impl FromStr for OrientationCode {
    type Err = OrientationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || OrientationError::InvalidOrientation(s.to_string());
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 3 {
            return Err(invalid());
        }
        let mut codes = [AxisCode::R; 3];
        let mut seen = [false; 3];
        for (slot, c) in codes.iter_mut().zip(chars) {
            let code = AxisCode::from_char(c).ok_or_else(invalid)?;
            let world = code.world_axis().axis;
            if seen[world] {
                return Err(invalid());
            }
            seen[world] = true;
            *slot = code;
        }
        Ok(OrientationCode(codes))
    }
}

impl TryFrom<String> for OrientationCode {
    type Error = OrientationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for OrientationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|code| write!(f, "{}", code.letter()))
    }
}

/// Whether `s` names one direction from each of L/R, A/P and S/I.
pub fn is_valid_orientation(s: &str) -> bool {
    s.parse::<OrientationCode>().is_ok()
}

/// Axis moves and flips turning orientation `from` into `to`.
pub fn orientation_transform(from: OrientationCode, to: OrientationCode) -> AxisTransform {
    let start = from.world_axes();
    let end = to.world_axes();
    start.map(|source| {
        let (target, target_axis) = end
            .iter()
            .enumerate()
            .find(|(_, e)| e.axis == source.axis)
            .map(|(i, e)| (i, *e))
            .unwrap_or((0, AxisFlip { axis: 0, flip: 1 }));
        AxisFlip {
            axis: target,
            flip: source.flip * target_axis.flip,
        }
    })
}

/// Affine taking voxel indices of the transformed array back to indices of
/// the original array of spatial `shape`.
pub fn inverse_transform_affine(transform: &AxisTransform, shape: [usize; 3]) -> Affine {
    // Reorder: row i picks the new axis that input axis i moved to.
    let mut undo_reorder = [[0.0; 4]; 4];
    for (i, t) in transform.iter().enumerate() {
        undo_reorder[i][t.axis] = 1.0;
    }
    undo_reorder[3][3] = 1.0;

    let mut undo_flip = identity();
    for (i, t) in transform.iter().enumerate() {
        let flip = f64::from(t.flip);
        let center = -((shape[i] as f64) - 1.0) / 2.0;
        undo_flip[i][i] = flip;
        undo_flip[i][3] = flip * center - center;
    }
    matmul(&undo_flip, &undo_reorder)
}

/// A reoriented volume and, when one was given, its reoriented gradients.
#[derive(Clone, Debug)]
pub struct Reoriented {
    pub volume: Volume,
    pub gradients: Option<GradientTable>,
}

/// Reorients `volume` from the orientation of its affine to `target`.
///
/// Voxels are flipped and permuted, the affine is composed with the inverse
/// index mapping, and gradient vectors receive only the rotation part.
pub fn reorient(
    volume: &Volume,
    target: OrientationCode,
    gradients: Option<&GradientTable>,
) -> Result<Reoriented, OrientationError> {
    let ndim = volume.data.ndim();
    if ndim < 4 {
        return Err(OrientationError::NotVolumetric(ndim.saturating_sub(1)));
    }
    let native = OrientationCode::from_affine(&volume.affine);
    let transform = orientation_transform(native, target);

    let mut data = volume.data.view();
    for (axis, t) in transform.iter().enumerate() {
        if t.flip < 0 {
            data.invert_axis(Axis(axis));
        }
    }
    let mut axes: Vec<usize> = (0..ndim).collect();
    for (source, t) in transform.iter().enumerate() {
        axes[t.axis] = source;
    }
    let data = data.permuted_axes(IxDyn(&axes)).as_standard_layout().into_owned();

    let shape = [0, 1, 2].map(|axis| volume.data.shape()[axis]);
    let inverse = inverse_transform_affine(&transform, shape);
    let affine = matmul(&volume.affine, &inverse);

    let mut reoriented = Volume {
        header: volume.header,
        extension: volume.extension.clone(),
        data,
        affine,
    };
    reoriented.sync_header();

    let gradients = gradients.map(|table| table.transformed(&inverse));
    Ok(Reoriented {
        volume: reoriented,
        gradients,
    })
}
