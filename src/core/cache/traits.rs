use std::sync::Arc;

/// Per-session state owned by a layer that must be dropped between
/// independent generation sessions.
///
/// Implementors use interior mutability so the owning layer can update the
/// cache during `&self` forward passes while the model keeps a second handle
/// for resets.
pub trait ResettableCache: Send + Sync {
    fn label(&self) -> &str;

    /// Number of sequence positions currently held.
    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn clear(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when `len` counts consumed sequence positions. Precomputed
    /// tables (rotary cos/sin) return `false` and are skipped by coherence
    /// checks.
    fn tracks_positions(&self) -> bool {
        true
    }
}

pub type CacheHandle = Arc<dyn ResettableCache>;
