#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Failed to allocate a sample buffer of {requested} values")]
    OutOfMemory { requested: usize },
}

/// Grow-only sample storage. Capacity is the largest geometry requested so
/// far; contents are undefined after growth.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    data: Vec<f64>,
    reallocations: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a view of exactly `required` values, reallocating only when the
    /// current storage is too small.
    pub fn ensure_capacity(&mut self, required: usize) -> Result<&mut [f64], BufferError> {
        if self.data.len() < required {
            // Release first so a failed allocation leaves nothing behind.
            self.data = Vec::new();

            let mut grown: Vec<f64> = Vec::new();
            grown
                .try_reserve_exact(required)
                .map_err(|_| BufferError::OutOfMemory { requested: required })?;
            grown.resize(required, 0.0);

            log::debug!("Sample buffer grown to {} values", required);
            self.data = grown;
            self.reallocations += 1;
        }

        Ok(&mut self.data[..required])
    }

    /// Number of values the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn reallocations(&self) -> usize {
        self.reallocations
    }
}
