use crate::core::cache::ResettableCache;
use crate::core::{Gpt2Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};
use parking_lot::Mutex;

/// Learned absolute position table, `(max_positions, hidden)`.
pub struct PositionEmbedding {
    weight: Tensor,
    max_positions: usize,
}

impl PositionEmbedding {
    pub fn new(max_positions: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (max_positions, hidden_size),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            weight,
            max_positions,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Rows `offset..offset + seq_len` of the table, shaped `(1, seq_len, hidden)`
    /// so they broadcast over the batch.
    pub fn clip(&self, offset: usize, seq_len: usize) -> Result<Tensor> {
        check_range(offset, seq_len, self.max_positions)?;
        Ok(self.weight.narrow(0, offset, seq_len)?.unsqueeze(0)?)
    }
}

fn check_range(offset: usize, seq_len: usize, max: usize) -> Result<()> {
    if offset + seq_len > max {
        return Err(Gpt2Error::PositionOutOfRange {
            offset,
            seq_len,
            max,
        });
    }
    Ok(())
}

/// Cos/sin tables for rotary position encoding, built on first use and
/// rebuilt when a caller asks for another dtype or device.
pub struct RotaryTables {
    label: String,
    head_dim: usize,
    theta: f32,
    max_positions: usize,
    tables: Mutex<Option<(Tensor, Tensor)>>,
}

impl RotaryTables {
    pub fn new(label: impl Into<String>, head_dim: usize, theta: f32, max_positions: usize) -> Self {
        Self {
            label: label.into(),
            head_dim,
            theta,
            max_positions,
            tables: Mutex::new(None),
        }
    }

    /// `(cos, sin)` for positions `offset..offset + seq_len`, each `(seq_len, head_dim / 2)`.
    pub fn slice(
        &self,
        offset: usize,
        seq_len: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        check_range(offset, seq_len, self.max_positions)?;
        let mut tables = self.tables.lock();
        let reusable = tables
            .as_ref()
            .filter(|(cos, _)| cos.dtype() == dtype && cos.device().same_device(device))
            .cloned();
        let (cos, sin) = match reusable {
            Some(built) => built,
            None => {
                let built = self.build(device, dtype)?;
                *tables = Some(built.clone());
                built
            }
        };
        Ok((cos.narrow(0, offset, seq_len)?, sin.narrow(0, offset, seq_len)?))
    }

    fn build(&self, device: &Device, dtype: DType) -> Result<(Tensor, Tensor)> {
        let inv_freq: Vec<f32> = (0..self.head_dim)
            .step_by(2)
            .map(|i| 1.0 / self.theta.powf(i as f32 / self.head_dim as f32))
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, self.max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((self.max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

impl ResettableCache for RotaryTables {
    fn label(&self) -> &str {
        &self.label
    }

    fn len(&self) -> usize {
        if self.tables.lock().is_some() {
            self.max_positions
        } else {
            0
        }
    }

    fn capacity(&self) -> usize {
        self.max_positions
    }

    fn clear(&self) {
        *self.tables.lock() = None;
    }

    fn tracks_positions(&self) -> bool {
        false
    }
}
