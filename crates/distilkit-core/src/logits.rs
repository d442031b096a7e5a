//! Logit selection and probability shift.

use candle_core::{DType, Tensor, D};

use crate::error::{CoreError, CoreResult};

/// Flattened indices of the non-zero entries of `mask`, as a `u32` tensor.
pub fn mask_indices(mask: &Tensor) -> CoreResult<Tensor> {
    let flat = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let idx: Vec<u32> = flat
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0.0)
        .map(|(i, _)| i as u32)
        .collect();
    let n = idx.len();
    Ok(Tensor::from_vec(idx, n, mask.device())?)
}

/// Keep the logits rows whose mask entry is non-zero.
///
/// `logits` has shape `(..., num_labels)` and `mask` the same shape without
/// the label dimension. The result is `(n_selected, num_labels)`; when the
/// mask selects nothing the result has zero rows.
pub fn select_logits_with_mask(logits: &Tensor, mask: &Tensor) -> CoreResult<Tensor> {
    let num_labels = logits.dim(D::Minus1)?;
    let rows = logits.elem_count() / num_labels.max(1);
    if mask.elem_count() != rows {
        return Err(CoreError::ShapeMismatch {
            op: "select_logits_with_mask",
            student: logits.dims().to_vec(),
            teacher: mask.dims().to_vec(),
        });
    }
    let flat = logits.reshape((rows, num_labels))?;
    let idx = mask_indices(mask)?;
    if idx.elem_count() == 0 {
        return Ok(Tensor::zeros((0, num_labels), logits.dtype(), logits.device())?);
    }
    Ok(flat.index_select(&idx, 0)?)
}

/// Swap, in every row, the largest logit with the logit of the true label.
///
/// After the shift the teacher always ranks the ground-truth label first.
/// Labels outside `0..num_labels` (e.g. an ignore index of `-100`) leave
/// their row untouched. The result is detached and keeps the input's dtype.
pub fn probability_shift(logits: &Tensor, labels: &Tensor) -> CoreResult<Tensor> {
    let num_labels = logits.dim(D::Minus1)?;
    let rows = logits.elem_count() / num_labels.max(1);
    if labels.elem_count() != rows {
        return Err(CoreError::ShapeMismatch {
            op: "probability_shift",
            student: labels.dims().to_vec(),
            teacher: logits.dims().to_vec(),
        });
    }
    let mut values = logits
        .detach()
        .to_dtype(DType::F32)?
        .reshape((rows, num_labels))?
        .to_vec2::<f32>()?;
    let labels = labels.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;

    for (row, &label) in values.iter_mut().zip(labels.iter()) {
        if label < 0.0 || label as usize >= num_labels {
            continue;
        }
        let truth = label as usize;
        let argmax = row
            .iter()
            .enumerate()
            .fold(0, |best, (i, &v)| if v > row[best] { i } else { best });
        row.swap(argmax, truth);
    }

    let flat: Vec<f32> = values.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, logits.dims(), logits.device())?.to_dtype(logits.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn select_keeps_masked_rows() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]]], &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1]], &dev).unwrap();
        let selected = select_logits_with_mask(&logits, &mask).unwrap();
        assert_eq!(selected.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0], vec![5.0, 6.0]]);
    }

    #[test]
    fn select_with_empty_mask_has_zero_rows() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &dev).unwrap();
        let mask = Tensor::new(&[0.0f32, 0.0], &dev).unwrap();
        let selected = select_logits_with_mask(&logits, &mask).unwrap();
        assert_eq!(selected.dims(), &[0, 2]);
    }

    #[test]
    fn select_rejects_mismatched_mask() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &dev).unwrap();
        let mask = Tensor::new(&[1.0f32, 0.0, 1.0], &dev).unwrap();
        assert!(select_logits_with_mask(&logits, &mask).is_err());
    }

    #[test]
    fn probability_shift_moves_truth_to_top() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9, 0.5], [0.7, 0.2, 0.1]], &dev).unwrap();
        let labels = Tensor::new(&[2u32, 0], &dev).unwrap();
        let shifted = probability_shift(&logits, &labels).unwrap();
        assert_eq!(
            shifted.to_vec2::<f32>().unwrap(),
            vec![vec![0.1, 0.5, 0.9], vec![0.7, 0.2, 0.1]]
        );
    }

    #[test]
    fn probability_shift_skips_ignored_labels() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9]], &dev).unwrap();
        let labels = Tensor::new(&[-100i64], &dev).unwrap();
        let shifted = probability_shift(&logits, &labels).unwrap();
        assert_eq!(shifted.to_vec2::<f32>().unwrap(), vec![vec![0.1, 0.9]]);
    }
}
