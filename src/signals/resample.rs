//! Image grids and resampling of scans onto the atlas grid

use crate::structs::{Affine, FcError, Result};
use nifti::NiftiHeader;
use ndarray::{s, Array4};

/// Affines closer than this (element-wise) describe the same grid
const SAME_GRID_TOL: f64 = 1e-6;
/// Relative determinant below which a transform cannot be inverted
const SINGULAR_TOL: f64 = 1e-12;
/// Sample points this far outside the source grid still snap to its edge
const EDGE_TOL: f64 = 1e-6;

impl Affine {
    #[cfg(test)]
    pub const fn identity() -> Self {
        Self {
            linear: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            offset: [0.0; 3],
        }
    }

    /// Axis-aligned grid with the given voxel sizes and origin
    #[must_use]
    pub const fn scaled(zooms: [f64; 3], offset: [f64; 3]) -> Self {
        Self {
            linear: [
                [zooms[0], 0.0, 0.0],
                [0.0, zooms[1], 0.0],
                [0.0, 0.0, zooms[2]],
            ],
            offset,
        }
    }

    /// Transform stored in a NIfTI header: sform if set, else qform, else voxel sizes
    #[must_use]
    pub fn from_header(header: &NiftiHeader) -> Self {
        if header.sform_code > 0 {
            let rows = [header.srow_x, header.srow_y, header.srow_z];
            let mut linear = [[0.0; 3]; 3];
            let mut offset = [0.0; 3];
            for (r, row) in rows.iter().enumerate() {
                for c in 0..3 {
                    linear[r][c] = f64::from(row[c]);
                }
                offset[r] = f64::from(row[3]);
            }
            return Self { linear, offset };
        }

        let zoom = |i: usize| {
            let v = f64::from(header.pixdim[i]);
            if v > 0.0 {
                v
            } else {
                1.0
            }
        };
        let zooms = [zoom(1), zoom(2), zoom(3)];
        if header.qform_code <= 0 {
            return Self::scaled(zooms, [0.0; 3]);
        }

        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
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
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let scale = [zooms[0], zooms[1], zooms[2] * qfac];

        let mut linear = [[0.0; 3]; 3];
        for (r, row) in rotation.iter().enumerate() {
            for c in 0..3 {
                linear[r][c] = row[c] * scale[c];
            }
        }
        Self {
            linear,
            offset: [
                f64::from(header.quatern_x),
                f64::from(header.quatern_y),
                f64::from(header.quatern_z),
            ],
        }
    }

    #[must_use]
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = self.offset;
        for (r, row) in self.linear.iter().enumerate() {
            out[r] += row[0] * p[0] + row[1] * p[1] + row[2] * p[2];
        }
        out
    }

    /// `self` after `inner`: maps p to `self(inner(p))`
    #[must_use]
    pub fn compose(&self, inner: &Self) -> Self {
        let mut linear = [[0.0; 3]; 3];
        for (r, row) in linear.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = (0..3).map(|k| self.linear[r][k] * inner.linear[k][c]).sum();
            }
        }
        Self {
            linear,
            offset: self.apply(inner.offset),
        }
    }

    /// World-to-voxel transform
    ///
    /// # Errors
    /// Returns error if the transform is singular or not finite
    pub fn inverse(&self) -> Result<Self> {
        let m = &self.linear;
        let cofactor = |r: usize, c: usize| {
            let (r1, r2) = ((r + 1) % 3, (r + 2) % 3);
            let (c1, c2) = ((c + 1) % 3, (c + 2) % 3);
            m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]
        };
        let det: f64 = (0..3).map(|c| m[0][c] * cofactor(0, c)).sum();
        let scale = m.iter().flatten().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if !det.is_finite() || det.abs() <= SINGULAR_TOL * scale.powi(3) {
            return Err(FcError::Shape(format!(
                "image affine is singular (determinant {det:e})"
            )));
        }

        let mut linear = [[0.0; 3]; 3];
        for (r, row) in linear.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                // inverse = adjugate / det, adjugate = cofactor transpose
                *v = cofactor(c, r) / det;
            }
        }
        let shifted = Self {
            linear,
            offset: [0.0; 3],
        }
        .apply(self.offset);
        Ok(Self {
            linear,
            offset: shifted.map(|v| -v),
        })
    }

    #[must_use]
    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        let linear = self
            .linear
            .iter()
            .flatten()
            .zip(other.linear.iter().flatten());
        let offset = self.offset.iter().zip(&other.offset);
        linear.chain(offset).all(|(a, b)| (a - b).abs() <= tol)
    }
}

/// Bring a 4-D scan onto a target grid by trilinear interpolation of every frame
///
/// Target voxels that fall outside the scan are set to zero. A scan already on the
/// target grid is returned unchanged.
///
/// # Errors
/// Returns error if the scan affine cannot be inverted
pub fn resample_to_grid(
    func: Array4<f64>,
    source: &Affine,
    target: &Affine,
    target_shape: (usize, usize, usize),
) -> Result<Array4<f64>> {
    let (sx, sy, sz, n_frames) = func.dim();
    if (sx, sy, sz) == target_shape && source.approx_eq(target, SAME_GRID_TOL) {
        return Ok(func);
    }

    // target voxel -> world -> source voxel
    let to_source = source.inverse()?.compose(target);
    let (tx, ty, tz) = target_shape;
    let mut out = Array4::<f64>::zeros((tx, ty, tz, n_frames));

    for x in 0..tx {
        for y in 0..ty {
            for z in 0..tz {
                #[allow(clippy::cast_precision_loss)]
                let p = to_source.apply([x as f64, y as f64, z as f64]);
                let (Some(wx), Some(wy), Some(wz)) = (
                    axis_weights(p[0], sx),
                    axis_weights(p[1], sy),
                    axis_weights(p[2], sz),
                ) else {
                    continue;
                };

                let mut voxel = out.slice_mut(s![x, y, z, ..]);
                for &(ix, fx) in &wx {
                    for &(iy, fy) in &wy {
                        for &(iz, fz) in &wz {
                            let w = fx * fy * fz;
                            if w > 0.0 {
                                voxel.scaled_add(w, &func.slice(s![ix, iy, iz, ..]));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// The two neighbouring indices of coordinate `c` on an axis of length `n`, with
/// their linear weights; `None` outside the axis
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn axis_weights(c: f64, n: usize) -> Option<[(usize, f64); 2]> {
    if n == 0 {
        return None;
    }
    let last = (n - 1) as f64;
    if !c.is_finite() || c < -EDGE_TOL || c > last + EDGE_TOL {
        return None;
    }
    let c = c.clamp(0.0, last);
    let i0 = (c.floor() as usize).min(n.saturating_sub(2));
    let i1 = (i0 + 1).min(n - 1);
    let frac = c - i0 as f64;
    if i0 == i1 {
        return Some([(i0, 1.0), (i1, 0.0)]);
    }
    Some([(i0, 1.0 - frac), (i1, frac)])
}
