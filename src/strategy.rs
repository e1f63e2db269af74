//! Queuing strategies: high-water mark plus chunk size algorithm.

use crate::error::{Error, Reason, Result};
use std::fmt;
use std::sync::Arc;

/// Default configuration values.
pub mod defaults {
    /// High-water mark of a readable stream built without a strategy.
    pub const READABLE_HIGH_WATER_MARK: f64 = 1.0;

    /// High-water mark of a writable stream built without a strategy.
    pub const WRITABLE_HIGH_WATER_MARK: f64 = 1.0;

    /// High-water mark of a transform's writable side.
    pub const TRANSFORM_WRITABLE_HIGH_WATER_MARK: f64 = 1.0;

    /// High-water mark of a transform's readable side.
    ///
    /// Zero means the transform only runs when a consumer is waiting.
    pub const TRANSFORM_READABLE_HIGH_WATER_MARK: f64 = 0.0;
}

/// Size algorithm: computes the queue size of a chunk.
pub type SizeAlgorithm<T> =
    Arc<dyn Fn(&T) -> std::result::Result<f64, Reason> + Send + Sync + 'static>;

/// Configuration of a stream queue.
///
/// # Example
///
/// ```rust
/// use streamflow::strategy::QueuingStrategy;
///
/// // Four chunks before backpressure.
/// let counted = QueuingStrategy::<String>::count(4.0);
///
/// // 64 KiB before backpressure.
/// let bytes = QueuingStrategy::<Vec<u8>>::byte_length(65536.0);
/// # let _ = (counted, bytes);
/// ```
pub struct QueuingStrategy<T> {
    high_water_mark: f64,
    size: Option<SizeAlgorithm<T>>,
}

impl<T> QueuingStrategy<T> {
    /// Every chunk counts as size 1.
    pub fn count(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: None,
        }
    }

    /// Use a custom size function.
    pub fn with_size<F>(high_water_mark: f64, size: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<f64, Reason> + Send + Sync + 'static,
    {
        Self {
            high_water_mark,
            size: Some(Arc::new(size)),
        }
    }

    /// Replace the high-water mark, keeping the size function.
    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Get the configured high-water mark.
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Compute the size of `chunk`.
    pub fn size_of(&self, chunk: &T) -> std::result::Result<f64, Reason> {
        match &self.size {
            Some(size) => size(chunk),
            None => Ok(1.0),
        }
    }

    /// Reject high-water marks that are negative or NaN.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.high_water_mark.is_nan() || self.high_water_mark < 0.0 {
            return Err(Error::InvalidState(
                "high-water mark must be a non-negative number",
            ));
        }
        Ok(())
    }
}

impl<T: AsRef<[u8]> + 'static> QueuingStrategy<T> {
    /// Size each chunk by its byte length.
    pub fn byte_length(high_water_mark: f64) -> Self {
        Self::with_size(high_water_mark, |chunk: &T| Ok(chunk.as_ref().len() as f64))
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self::count(defaults::READABLE_HIGH_WATER_MARK)
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("custom_size", &self.size.is_some())
            .finish()
    }
}
