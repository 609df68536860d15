//! NIfTI volume loading (.nii and .nii.gz)

use crate::structs::{Affine, Atlas, FcError, Result};
use ndarray::{Array4, ArrayD, Ix4};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::Path;

/// Read any volume as a dynamic-dimension array with scaling applied, and its grid
///
/// # Errors
/// Returns error if the file cannot be read or decoded
pub fn load_volume(path: &Path) -> Result<(ArrayD<f64>, Affine)> {
    let object = ReaderOptions::new().read_file(path)?;
    let affine = Affine::from_header(object.header());
    let data = object.into_volume().into_ndarray::<f64>()?;
    Ok((data, affine))
}

/// Read a functional scan; the last axis is time
///
/// # Errors
/// Returns error if the file cannot be read or is not 4-D
pub fn load_functional(path: &Path) -> Result<(Array4<f64>, Affine)> {
    let (volume, affine) = load_volume(path)?;
    let ndim = volume.ndim();
    let data = volume.into_dimensionality::<Ix4>().map_err(|_| {
        FcError::Shape(format!(
            "{} is a {ndim}-D image, functional scans must be 4-D",
            path.display()
        ))
    })?;
    Ok((data, affine))
}

/// Read an atlas image, label or maps
///
/// # Errors
/// Returns error if the file cannot be read or holds no regions
pub fn load_atlas(path: &Path) -> Result<(Atlas, Affine)> {
    let (volume, affine) = load_volume(path)?;
    Ok((Atlas::from_volume(volume)?, affine))
}
