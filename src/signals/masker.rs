//! Reduce voxel time series to region time series with an atlas

use crate::ml::linalg::psd_pinv;
use crate::structs::{Atlas, FcError, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView4, Axis, Ix3, Ix4};

/// Pseudo-inverse cutoff for the maps Gram matrix
const MAPS_RCOND: f64 = 1e-12;

impl Atlas {
    /// Build an atlas from a loaded volume
    ///
    /// A 3-D volume (or a 4-D volume with a single map) is a label image; a 4-D volume is
    /// a stack of probabilistic maps.
    ///
    /// # Errors
    /// Returns error if the volume is neither 3-D nor 4-D, or has no regions
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_volume(volume: ArrayD<f64>) -> Result<Self> {
        let to_labels = |labels: Array3<f64>| labels.mapv(|v| v.round() as i64);
        match volume.ndim() {
            3 => {
                let labels = volume.into_dimensionality::<Ix3>().map_err(shape_err)?;
                Self::from_labels(to_labels(labels))
            }
            4 if volume.shape()[3] == 1 => {
                let labels = volume
                    .into_dimensionality::<Ix4>()
                    .map_err(shape_err)?
                    .index_axis_move(Axis(3), 0);
                Self::from_labels(to_labels(labels))
            }
            4 => Self::from_maps(volume.into_dimensionality::<Ix4>().map_err(shape_err)?),
            n => Err(FcError::Shape(format!(
                "atlas must be a 3-D label image or 4-D maps image, got {n} dimensions"
            ))),
        }
    }

    /// Label atlas; regions are the distinct non-zero labels in ascending order
    ///
    /// # Errors
    /// Returns error if the image only contains background
    pub fn from_labels(labels: Array3<i64>) -> Result<Self> {
        let mut regions: Vec<i64> = labels.iter().copied().filter(|&l| l != 0).collect();
        regions.sort_unstable();
        regions.dedup();
        if regions.is_empty() {
            return Err(FcError::Shape("atlas label image has no regions".into()));
        }
        Ok(Self::Labels { labels, regions })
    }

    /// Probabilistic maps atlas
    ///
    /// # Errors
    /// Returns error if there are no maps
    pub fn from_maps(maps: Array4<f64>) -> Result<Self> {
        if maps.shape()[3] == 0 {
            return Err(FcError::Shape("atlas has no maps".into()));
        }
        Ok(Self::Maps { maps })
    }

    #[must_use]
    pub fn n_regions(&self) -> usize {
        match self {
            Self::Labels { regions, .. } => regions.len(),
            Self::Maps { maps } => maps.shape()[3],
        }
    }

    #[must_use]
    pub fn spatial_shape(&self) -> (usize, usize, usize) {
        match self {
            Self::Labels { labels, .. } => labels.dim(),
            Self::Maps { maps } => {
                let (x, y, z, _) = maps.dim();
                (x, y, z)
            }
        }
    }

    /// Region signals (time points x regions) of a 4-D functional scan
    ///
    /// # Errors
    /// Returns error if the scan is not on the atlas grid
    pub fn transform(&self, func: &ArrayView4<'_, f64>) -> Result<Array2<f64>> {
        let (nx, ny, nz, _) = func.dim();
        if (nx, ny, nz) != self.spatial_shape() {
            return Err(FcError::Shape(format!(
                "scan grid {:?} does not match atlas grid {:?}",
                (nx, ny, nz),
                self.spatial_shape()
            )));
        }

        match self {
            Self::Labels { labels, regions } => Ok(label_signals(labels, regions, func)),
            Self::Maps { maps } => maps_signals(maps, func),
        }
    }
}

fn shape_err(e: ndarray::ShapeError) -> FcError {
    FcError::Shape(e.to_string())
}

/// Mean signal over the voxels of each label
#[allow(clippy::cast_precision_loss)]
fn label_signals(labels: &Array3<i64>, regions: &[i64], func: &ArrayView4<'_, f64>) -> Array2<f64> {
    let n_frames = func.dim().3;
    let mut sums = Array2::<f64>::zeros((n_frames, regions.len()));
    let mut counts = vec![0usize; regions.len()];

    for ((x, y, z), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let Ok(region) = regions.binary_search(&label) else {
            continue;
        };
        counts[region] += 1;
        let voxel = func.slice(s![x, y, z, ..]);
        let mut column = sums.column_mut(region);
        column += &voxel;
    }

    for (mut column, &count) in sums.columns_mut().into_iter().zip(&counts) {
        if count > 0 {
            column /= count as f64;
        }
    }
    sums
}

/// Least-squares fit of voxel data onto the maps: `S = Yᵀ M (Mᵀ M)⁺`
fn maps_signals(maps: &Array4<f64>, func: &ArrayView4<'_, f64>) -> Result<Array2<f64>> {
    let (nx, ny, nz, n_maps) = maps.dim();
    let n_frames = func.dim().3;

    let mut support = Vec::new();
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if maps.slice(s![x, y, z, ..]).iter().any(|&w| w != 0.0) {
                    support.push((x, y, z));
                }
            }
        }
    }
    if support.is_empty() {
        return Err(FcError::Shape("atlas maps are empty".into()));
    }

    let mut weights = Array2::<f64>::zeros((support.len(), n_maps));
    let mut voxels = Array2::<f64>::zeros((support.len(), n_frames));
    for (v, &(x, y, z)) in support.iter().enumerate() {
        weights.row_mut(v).assign(&maps.slice(s![x, y, z, ..]));
        voxels.row_mut(v).assign(&func.slice(s![x, y, z, ..]));
    }

    let gram_pinv = psd_pinv(&weights.t().dot(&weights), MAPS_RCOND)?;
    Ok(voxels.t().dot(&weights).dot(&gram_pinv))
}
