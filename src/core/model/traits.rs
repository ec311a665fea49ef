use crate::core::Result;
use candle_core::Tensor;

/// A graph component that maps an input tensor to an output tensor.
///
/// Implemented by the feed-forward sublayer, the transformer block and the
/// full model; larger components own the smaller ones and call them in
/// order.
pub trait Forward: Send + Sync {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;
}
