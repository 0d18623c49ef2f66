//! Embedding capability.
//!
//! Everything downstream (index, retriever, duplicate confirmation) depends
//! only on the [`Embedder`] trait. Implementations must return an error rather
//! than a placeholder vector when they cannot embed.

pub mod hashing;
pub mod retry;

use crate::error::Result;

pub use hashing::HashingEmbedder;
pub use retry::RetryingEmbedder;

/// Maps text to a fixed-dimension vector.
pub trait Embedder: Send + Sync {
    /// Embed one text. The vector length must equal [`Embedder::dimension`].
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Name used in logs and service errors.
    fn name(&self) -> &str {
        "embedder"
    }

    /// Embed several texts, stopping at the first failure.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
