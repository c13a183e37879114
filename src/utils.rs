/// Utility functions shared by the trainers
use candle_core::{DType, Device, Result, Tensor, D};

/// Number of rows whose argmax equals the label
pub fn count_correct(pred: &Tensor, labels: &Tensor) -> Result<usize> {
    let hits = pred.argmax(D::Minus1)?.eq(labels)?;
    Ok(hits.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? as usize)
}

/// Fraction of rows whose argmax equals the label
pub fn accuracy(pred: &Tensor, labels: &Tensor) -> Result<f64> {
    let total = labels.dim(0)?;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(count_correct(pred, labels)? as f64 / total as f64)
}

/// Value of a single-element tensor as `f64`, for logging
pub fn scalar_value(tensor: &Tensor) -> Result<f64> {
    tensor.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()
}

/// Geometric mean of positive counts
pub fn gmean(values: &[usize]) -> f64 {
    if values.is_empty() || values.contains(&0) {
        return 0.0;
    }
    let log_sum: f64 = values.iter().map(|&v| (v as f64).ln()).sum();
    (log_sum / values.len() as f64).exp()
}

/// Percentage with a zero-total guard, for log lines
pub fn percent(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    }
}

/// CUDA device when an ordinal is given and CUDA is available, CPU otherwise
pub fn select_device(cuda_device: Option<usize>) -> Result<Device> {
    match cuda_device {
        Some(ordinal) => Device::cuda_if_available(ordinal),
        None => Ok(Device::Cpu),
    }
}

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}
