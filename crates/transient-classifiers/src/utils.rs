use candle_core::{Device, Tensor};
use ndarray::Array2;

use crate::error::{ClassifierError, Result};

/// Resolve a device string such as `cpu`, `cuda`, `cuda:1` or `metal`.
pub fn get_device(device_str: &str) -> Result<Device> {
    if device_str.starts_with("cuda") {
        let cuda_index = if device_str == "cuda" {
            0
        } else {
            device_str
                .split(':')
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        let device = Device::cuda_if_available(cuda_index)?;
        if !device.is_cuda() {
            return Err(ClassifierError::Configuration(format!(
                "CUDA device {} is not available",
                cuda_index
            )));
        }
        Ok(device)
    } else {
        match device_str {
            "cpu" => Ok(Device::Cpu),
            "metal" => Ok(Device::new_metal(0)?),
            _ => Err(ClassifierError::Configuration(format!(
                "Unsupported device type: {}",
                device_str
            ))),
        }
    }
}

/// Replace NaN and infinite feature values with 0.
pub fn sanitize_features(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| if v.is_finite() { v } else { 0.0 })
}

/// Copy a feature matrix into a `(rows, cols)` tensor on `device`.
pub fn array_to_tensor(x: &Array2<f32>, device: &Device) -> Result<Tensor> {
    let shape = (x.nrows(), x.ncols());
    let data: Vec<f32> = x.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
