pub mod traits;

pub use traits::{CacheHandle, ResettableCache};

use crate::core::{Gpt2Error, Result};
use candle_core::Tensor;
use candle_nn::kv_cache::KvCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Key/value storage of one attention layer, laid out `(batch, heads, seq, head_dim)`.
pub struct LayerKvCache {
    label: String,
    limit: usize,
    inner: Mutex<KvCache>,
}

impl LayerKvCache {
    /// Sequence axis of the cached key/value tensors.
    const SEQ_DIM: usize = 2;

    pub fn new(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit,
            inner: Mutex::new(KvCache::new(Self::SEQ_DIM, limit)),
        }
    }

    /// Appends the new keys and values and returns the full cached history.
    pub fn append(&self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut inner = self.inner.lock();
        let incoming = key.dim(Self::SEQ_DIM)?;
        let held = inner.current_seq_len();
        if held + incoming > self.limit {
            return Err(Gpt2Error::CacheState(format!(
                "{}: appending {} position(s) to {} exceeds the cache limit of {}",
                self.label, incoming, held, self.limit
            )));
        }
        let (k, v) = inner.append(&key.contiguous()?, &value.contiguous()?)?;
        Ok((k, v))
    }
}

impl ResettableCache for LayerKvCache {
    fn label(&self) -> &str {
        &self.label
    }

    fn len(&self) -> usize {
        self.inner.lock().current_seq_len()
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn clear(&self) {
        self.inner.lock().reset();
    }
}

/// Number of positions the model has consumed in the current session.
pub struct PositionCursor {
    label: String,
    max: usize,
    position: AtomicUsize,
}

impl PositionCursor {
    pub fn new(label: impl Into<String>, max: usize) -> Self {
        Self {
            label: label.into(),
            max,
            position: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    pub fn advance(&self, by: usize) {
        self.position.fetch_add(by, Ordering::AcqRel);
    }
}

impl ResettableCache for PositionCursor {
    fn label(&self) -> &str {
        &self.label
    }

    fn len(&self) -> usize {
        self.get()
    }

    fn capacity(&self) -> usize {
        self.max
    }

    fn clear(&self) {
        self.position.store(0, Ordering::Release);
    }
}

/// Every resettable handle of a model, collected once at construction.
#[derive(Default, Clone)]
pub struct CacheSet {
    handles: Vec<CacheHandle>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: CacheHandle) {
        self.handles.push(handle);
    }

    pub fn extend<I: IntoIterator<Item = CacheHandle>>(&mut self, handles: I) {
        self.handles.extend(handles);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheHandle> {
        self.handles.iter()
    }

    pub fn clear_all(&self) {
        for handle in &self.handles {
            handle.clear();
        }
    }

    /// Positions consumed by the session, failing if the position-tracking
    /// handles disagree (e.g. only some of them were cleared).
    pub fn consumed_positions(&self) -> Result<usize> {
        let mut tracked = self.handles.iter().filter(|h| h.tracks_positions());
        let Some(first) = tracked.next() else {
            return Ok(0);
        };
        let expected = first.len();
        for handle in tracked {
            if handle.len() != expected {
                return Err(Gpt2Error::CacheState(format!(
                    "{} holds {} position(s) but {} holds {}; reset the whole model",
                    handle.label(),
                    handle.len(),
                    first.label(),
                    expected
                )));
            }
        }
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::sync::Arc;

    fn kv(len: usize) -> Tensor {
        Tensor::zeros((1, 2, len, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_kv_cache_append_and_clear() {
        let cache = LayerKvCache::new("h.0.attn", 8);
        let (k, v) = cache.append(&kv(3), &kv(3)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 3, 4]);
        assert_eq!(v.dims(), &[1, 2, 3, 4]);

        let (k, _) = cache.append(&kv(1), &kv(1)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(cache.len(), 4);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_kv_cache_limit() {
        let cache = LayerKvCache::new("h.0.attn", 4);
        cache.append(&kv(3), &kv(3)).unwrap();
        let err = cache.append(&kv(2), &kv(2)).unwrap_err();
        assert!(matches!(err, Gpt2Error::CacheState(_)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_partial_reset_detected() {
        let a = Arc::new(LayerKvCache::new("h.0.attn", 8));
        let b = Arc::new(LayerKvCache::new("h.1.attn", 8));
        let cursor = Arc::new(PositionCursor::new("position", 8));

        let mut set = CacheSet::new();
        set.push(a.clone());
        set.push(b.clone());
        set.push(cursor.clone());

        a.append(&kv(2), &kv(2)).unwrap();
        b.append(&kv(2), &kv(2)).unwrap();
        cursor.advance(2);
        assert_eq!(set.consumed_positions().unwrap(), 2);

        a.clear();
        assert!(matches!(set.consumed_positions(), Err(Gpt2Error::CacheState(_))));

        set.clear_all();
        assert_eq!(set.consumed_positions().unwrap(), 0);
    }
}
