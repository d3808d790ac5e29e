//! The NIfTI-1 single file header and its voxel-to-world transforms.

use bytemuck::{Pod, Zeroable};

/// Row-major 4x4 homogeneous transform from voxel indices to world (RAS+) mm.
pub type Affine = [[f64; 4]; 4];

pub const HEADER_SIZE: usize = 348;
pub const SINGLE_FILE_MAGIC: [u8; 4] = *b"n+1\0";

/// Transform codes used for qform/sform.
pub const XFORM_UNKNOWN: i16 = 0;
pub const XFORM_ALIGNED: i16 = 2;

/// On-disk layout of the 348 byte NIfTI-1 header, little endian.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct NiftiHeader {
    pub sizeof_hdr: i32,
    pub data_type: [u8; 10],
    pub db_name: [u8; 18],
    pub extents: i32,
    pub session_error: i16,
    pub regular: u8,
    pub dim_info: u8,
    pub dim: [i16; 8],
    pub intent_p1: f32,
    pub intent_p2: f32,
    pub intent_p3: f32,
    pub intent_code: i16,
    pub datatype: i16,
    pub bitpix: i16,
    pub slice_start: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub slice_end: i16,
    pub slice_code: u8,
    pub xyzt_units: u8,
    pub cal_max: f32,
    pub cal_min: f32,
    pub slice_duration: f32,
    pub toffset: f32,
    pub glmax: i32,
    pub glmin: i32,
    pub descrip: [u8; 80],
    pub aux_file: [u8; 24],
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern_b: f32,
    pub quatern_c: f32,
    pub quatern_d: f32,
    pub qoffset_x: f32,
    pub qoffset_y: f32,
    pub qoffset_z: f32,
    pub srow_x: [f32; 4],
    pub srow_y: [f32; 4],
    pub srow_z: [f32; 4],
    pub intent_name: [u8; 16],
    pub magic: [u8; 4],
}

impl NiftiHeader {
    /// Minimal single-file header for `dims` voxels of `datatype`.
    pub fn new(dims: &[usize], datatype: i16, bitpix: i16) -> Self {
        let mut header = Self::zeroed();
        header.sizeof_hdr = HEADER_SIZE as i32;
        header.regular = b'r';
        header.datatype = datatype;
        header.bitpix = bitpix;
        header.vox_offset = (HEADER_SIZE + 4) as f32;
        header.scl_slope = 1.0;
        header.magic = SINGLE_FILE_MAGIC;
        header.pixdim = [1.0; 8];
        header.set_dims(dims);
        header
    }

    /// Number of dimensions in use and their extents.
    pub fn dims(&self) -> Vec<usize> {
        let ndim = self.dim[0].clamp(0, 7) as usize;
        self.dim[1..=ndim]
            .iter()
            .map(|&extent| extent.max(1) as usize)
            .collect()
    }

    pub fn set_dims(&mut self, dims: &[usize]) {
        self.dim = [1; 8];
        self.dim[0] = dims.len() as i16;
        for (slot, &extent) in self.dim[1..].iter_mut().zip(dims) {
            *slot = extent as i16;
        }
    }

    pub fn bytes_per_voxel(&self) -> Option<usize> {
        (self.bitpix > 0 && self.bitpix % 8 == 0).then(|| (self.bitpix / 8) as usize)
    }

    fn spatial_shape(&self) -> [f64; 3] {
        let mut shape = [1.0; 3];
        for (axis, extent) in self.dims().into_iter().take(3).enumerate() {
            shape[axis] = extent as f64;
        }
        shape
    }

    fn zooms(&self) -> [f64; 3] {
        [1, 2, 3].map(|i| {
            let zoom = f64::from(self.pixdim[i]);
            if zoom == 0.0 { 1.0 } else { zoom.abs() }
        })
    }

    /// sform when set, else qform when set, else a centred scaling with the
    /// first axis flipped.
    pub fn best_affine(&self) -> Affine {
        if self.sform_code > XFORM_UNKNOWN {
            self.sform()
        } else if self.qform_code > XFORM_UNKNOWN {
            self.qform()
        } else {
            let zooms = self.zooms();
            let shape = self.spatial_shape();
            let mut affine = identity();
            affine[0][0] = -zooms[0];
            affine[1][1] = zooms[1];
            affine[2][2] = zooms[2];
            for axis in 0..3 {
                let origin = (shape[axis] - 1.0) / 2.0;
                affine[axis][3] = -origin * affine[axis][axis];
            }
            affine
        }
    }

    pub fn sform(&self) -> Affine {
        let row = |r: [f32; 4]| r.map(f64::from);
        [
            row(self.srow_x),
            row(self.srow_y),
            row(self.srow_z),
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// The affine encoded by the quaternion, offsets, pixdim and qfac.
    pub fn qform(&self) -> Affine {
        let (mut b, mut c, mut d) = (
            f64::from(self.quatern_b),
            f64::from(self.quatern_c),
            f64::from(self.quatern_d),
        );
        let mut a = 1.0 - (b * b + c * c + d * d);
        if a < 1.0e-7 {
            let norm = (b * b + c * c + d * d).sqrt();
            a = 0.0;
            b /= norm;
            c /= norm;
            d /= norm;
        } else {
            a = a.sqrt();
        }
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let [dx, dy, dz] = self.zooms();
        let dz = dz * qfac;

        let rotation = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - c * c - b * b,
            ],
        ];
        let offsets = [self.qoffset_x, self.qoffset_y, self.qoffset_z].map(f64::from);
        let mut affine = identity();
        for row in 0..3 {
            affine[row][0] = rotation[row][0] * dx;
            affine[row][1] = rotation[row][1] * dy;
            affine[row][2] = rotation[row][2] * dz;
            affine[row][3] = offsets[row];
        }
        affine
    }

    /// Stores `affine` as sform and as the equivalent qform, updating pixdim.
    ///
    /// Both codes keep their current value, or become "aligned" when unset,
    /// so that readers preferring either transform see the same geometry.
    pub fn set_affine(&mut self, affine: &Affine) {
        let to_row = |row: &[f64; 4]| row.map(|v| v as f32);
        self.srow_x = to_row(&affine[0]);
        self.srow_y = to_row(&affine[1]);
        self.srow_z = to_row(&affine[2]);
        if self.sform_code == XFORM_UNKNOWN {
            self.sform_code = XFORM_ALIGNED;
        }
        self.set_qform(affine);
        if self.qform_code == XFORM_UNKNOWN {
            self.qform_code = XFORM_ALIGNED;
        }
    }

    fn set_qform(&mut self, affine: &Affine) {
        let mut zooms = [0.0; 3];
        let mut rotation = [[0.0; 3]; 3];
        for col in 0..3 {
            let norm = (0..3)
                .map(|row| affine[row][col] * affine[row][col])
                .sum::<f64>()
                .sqrt();
            zooms[col] = if norm == 0.0 { 1.0 } else { norm };
            for row in 0..3 {
                rotation[row][col] = affine[row][col] / zooms[col];
            }
        }
        let qfac = if determinant3(&rotation) > 0.0 {
            1.0
        } else {
            for row in rotation.iter_mut() {
                row[2] = -row[2];
            }
            -1.0
        };
        let rotation = orthogonalize(rotation);
        let [_, b, c, d] = rotation_to_quaternion(&rotation);

        self.quatern_b = b as f32;
        self.quatern_c = c as f32;
        self.quatern_d = d as f32;
        self.qoffset_x = affine[0][3] as f32;
        self.qoffset_y = affine[1][3] as f32;
        self.qoffset_z = affine[2][3] as f32;
        self.pixdim[0] = qfac as f32;
        for axis in 0..3 {
            self.pixdim[axis + 1] = zooms[axis] as f32;
        }
    }
}

pub fn identity() -> Affine {
    let mut affine = [[0.0; 4]; 4];
    for (i, row) in affine.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    affine
}

pub fn matmul(left: &Affine, right: &Affine) -> Affine {
    let mut out = [[0.0; 4]; 4];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..4).map(|k| left[i][k] * right[k][j]).sum();
        }
    }
    out
}

fn determinant3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn inverse_transpose3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = determinant3(m);
    if det.abs() < f64::EPSILON {
        return None;
    }
    // The cofactor matrix divided by the determinant is the inverse transposed.
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            let (r1, r2) = ((i + 1) % 3, (i + 2) % 3);
            let (c1, c2) = ((j + 1) % 3, (j + 2) % 3);
            *cell = (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]) / det;
        }
    }
    Some(out)
}

/// Nearest rotation by polar iteration; exact input rotations are returned
/// unchanged after the first step.
fn orthogonalize(mut m: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    for _ in 0..32 {
        let Some(inv_t) = inverse_transpose3(&m) else {
            return m;
        };
        let mut next = [[0.0; 3]; 3];
        let mut delta: f64 = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                next[i][j] = 0.5 * (m[i][j] + inv_t[i][j]);
                delta = delta.max((next[i][j] - m[i][j]).abs());
            }
        }
        m = next;
        if delta < 1.0e-12 {
            break;
        }
    }
    m
}

/// `[a, b, c, d]` with `a >= 0` for a proper rotation matrix.
fn rotation_to_quaternion(r: &[[f64; 3]; 3]) -> [f64; 4] {
    let (r11, r12, r13) = (r[0][0], r[0][1], r[0][2]);
    let (r21, r22, r23) = (r[1][0], r[1][1], r[1][2]);
    let (r31, r32, r33) = (r[2][0], r[2][1], r[2][2]);

    let trace = r11 + r22 + r33 + 1.0;
    let a;
    let b;
    let c;
    let d;
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r32 - r23) / a;
        c = 0.25 * (r13 - r31) / a;
        d = 0.25 * (r21 - r12) / a;
    } else {
        let xd = 1.0 + r11 - (r22 + r33);
        let yd = 1.0 + r22 - (r11 + r33);
        let zd = 1.0 + r33 - (r11 + r22);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r12 + r21) / b;
            d = 0.25 * (r13 + r31) / b;
            a = 0.25 * (r32 - r23) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r12 + r21) / c;
            d = 0.25 * (r23 + r32) / c;
            a = 0.25 * (r13 - r31) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r13 + r31) / d;
            c = 0.25 * (r23 + r32) / d;
            a = 0.25 * (r21 - r12) / d;
        }
    }
    if a < 0.0 { [-a, -b, -c, -d] } else { [a, b, c, d] }
}
