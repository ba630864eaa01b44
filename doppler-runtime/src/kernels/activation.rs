//! Elementwise kernels: activations and residual adds.

use candle_core::Tensor;

use crate::recorder::CommandRecorder;
use crate::Result;

pub fn silu(rec: &mut CommandRecorder, x: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok(candle_nn::ops::silu(x)?)
}

pub fn gelu(rec: &mut CommandRecorder, x: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok(x.gelu()?)
}

/// The gated half of SwiGLU/GeGLU: `act(gate) ⊙ up`.
pub fn swiglu_gate(rec: &mut CommandRecorder, gate: &Tensor, up: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok((candle_nn::ops::silu(gate)? * up)?)
}

pub fn residual_add(rec: &mut CommandRecorder, x: &Tensor, delta: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok((x + delta)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Runtime;
    use candle_core::Device;

    #[test]
    fn test_silu_at_zero() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let x = Tensor::from_vec(vec![0f32, 1.0], 2, &Device::Cpu).unwrap();
        let y = silu(&mut rec, &x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y[0], 0.0);
        // silu(1) = 1 / (1 + e^-1)
        assert!((y[1] - 1.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-5);
    }

    #[test]
    fn test_swiglu_gate_zero_gate_blocks_up() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let gate = Tensor::from_vec(vec![0f32, 0.0], 2, &Device::Cpu).unwrap();
        let up = Tensor::from_vec(vec![5f32, -7.0], 2, &Device::Cpu).unwrap();
        let y = swiglu_gate(&mut rec, &gate, &up).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![0.0, 0.0]);
    }

    #[test]
    fn test_residual_add() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let x = Tensor::from_vec(vec![1f32, 2.0], 2, &Device::Cpu).unwrap();
        let d = Tensor::from_vec(vec![0.5f32, -2.0], 2, &Device::Cpu).unwrap();
        let y = residual_add(&mut rec, &x, &d).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![1.5, 0.0]);
    }
}
