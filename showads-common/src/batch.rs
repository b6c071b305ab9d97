use crate::error::ConfigError;
use crate::record::ValidatedRecord;

/// Largest batch the bulk endpoint accepts.
pub const MAX_BATCH_SIZE: usize = 1000;

/// An ordered group of records delivered in one bulk call.
pub type Batch = Vec<ValidatedRecord>;

/// Clamp a configured batch size to `MAX_BATCH_SIZE`, rejecting zero.
pub fn effective_batch_size(configured: usize) -> Result<usize, ConfigError> {
    if configured == 0 {
        return Err(ConfigError::InvalidBatchSize);
    }

    Ok(configured.min(MAX_BATCH_SIZE))
}

/// Groups an iterator into consecutive `Vec`s of `size` items; only the last may be shorter.
/// Item order is preserved within and across chunks.
pub struct Chunks<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Chunks<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

/// Split `items` into chunks of at most `size` items.
pub fn chunked<I: IntoIterator>(items: I, size: usize) -> Result<Chunks<I::IntoIter>, ConfigError> {
    if size == 0 {
        return Err(ConfigError::InvalidBatchSize);
    }

    Ok(Chunks {
        inner: items.into_iter(),
        size,
    })
}

/// Split records into batches bounded by `min(configured, MAX_BATCH_SIZE)`.
pub fn batches<I>(records: I, configured: usize) -> Result<Chunks<I::IntoIter>, ConfigError>
where
    I: IntoIterator<Item = ValidatedRecord>,
{
    chunked(records, effective_batch_size(configured)?)
}
