use crate::core::model::names::Gpt2Names;
use crate::core::model::Forward;
use crate::core::Result;
use candle_core::Tensor;
use candle_nn::{linear, Activation, Linear, Module, VarBuilder};

/// `c_fc` → activation → `c_proj`, both projections biased.
pub struct Gpt2Mlp {
    up_proj: Linear,
    act: Activation,
    down_proj: Linear,
}

impl Gpt2Mlp {
    pub fn new(
        hidden_dim: usize,
        ffn_hidden: usize,
        act: Activation,
        names: &Gpt2Names,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            up_proj: linear(hidden_dim, ffn_hidden, vb.pp(&names.up_proj_name))?,
            act,
            down_proj: linear(ffn_hidden, hidden_dim, vb.pp(&names.down_proj_name))?,
        })
    }
}

impl Forward for Gpt2Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.up_proj.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        Ok(self.down_proj.forward(&xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_shape_preserved() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mlp = Gpt2Mlp::new(8, 32, Activation::NewGelu, &Gpt2Names::default(), vb.pp("mlp")).unwrap();
        let x = Tensor::ones((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 3, 8]);

        let sum = y.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 0.0);
    }
}
