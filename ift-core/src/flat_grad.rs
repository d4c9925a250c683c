//! Conversion between per-parameter gradients and one contiguous vector.
//!
//! Every function walks parameters in the order they are supplied, so
//! [`flatten`] followed by [`unflatten_into`] over the same group is exact.
use crate::nn::Parameter;
use anyhow::{anyhow, Result};
use ndarray::{Array1, ArrayD, ArrayView1, IxDyn};

/// Concatenates the gradients of `params`. Parameters without a gradient
/// contribute a zero block of their own size.
pub fn flatten<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Array1<f64> {
    let mut flat = Vec::new();
    for p in params {
        match &p.grad {
            Some(grad) => flat.extend(grad.iter().cloned()),
            None => flat.extend(std::iter::repeat(0.0).take(p.len())),
        }
    }
    Array1::from_vec(flat)
}

pub fn flatten_tensors(grads: &[ArrayD<f64>]) -> Array1<f64> {
    Array1::from_iter(grads.iter().flat_map(|g| g.iter().cloned()))
}

pub fn flatten_values<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Array1<f64> {
    Array1::from_iter(
        params
            .into_iter()
            .flat_map(|p| p.value.iter().cloned()),
    )
}

/// Zeroes every present gradient. Absent gradients stay absent.
pub fn zero<'a>(params: impl IntoIterator<Item = &'a mut Parameter>) {
    for p in params {
        if let Some(grad) = p.grad.as_mut() {
            grad.fill(0.0);
        }
    }
}

/// Splits `flat` into per-parameter chunks and assigns each as that
/// parameter's gradient. Nothing is written when the length does not match.
pub fn unflatten_into<'a>(
    params: impl IntoIterator<Item = &'a mut Parameter>,
    flat: ArrayView1<f64>,
) -> Result<()> {
    let params: Vec<&mut Parameter> = params.into_iter().collect();
    let total: usize = params.iter().map(|p| p.len()).sum();
    if total != flat.len() {
        return Err(anyhow!(
            "Flat gradient has {} entries but parameters hold {}",
            flat.len(),
            total
        ));
    }
    let mut offset = 0;
    for p in params {
        let n = p.len();
        let chunk = flat.slice(ndarray::s![offset..offset + n]).to_vec();
        let grad = ArrayD::from_shape_vec(IxDyn(p.value.shape()), chunk)
            .map_err(|e| anyhow!("Cannot reshape gradient for '{}': {}", p.name, e))?;
        p.grad = Some(grad);
        offset += n;
    }
    Ok(())
}
