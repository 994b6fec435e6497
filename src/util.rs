//! Small numeric and slicing helpers shared by the client and scheduler.

use crate::error::{Result, SyncError};

/// Split `items` into contiguous partitions of `size` (the last may be shorter).
///
/// Fails when `size` is zero or larger than the input.
pub fn chunks<T>(items: &[T], size: usize) -> Result<Vec<&[T]>> {
    if size == 0 || size > items.len() {
        return Err(SyncError::InvalidChunkSize {
            size,
            len: items.len(),
        });
    }
    Ok(items.chunks(size).collect())
}

/// Truncate `x` to `digits` decimal places, rounding toward negative infinity.
pub fn truncate(x: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (x * factor).floor() / factor
}
