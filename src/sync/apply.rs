//! Delta application over a baseline.

use crate::utils::errors::{EngineError, Result};
use fast_rsync::apply_limited;

/// Maximum reconstructed size accepted from a delta (guards against a
/// corrupted delta inflating without bound).
const MAX_OUTPUT_BYTES: usize = 64 * 1024 * 1024 * 1024;

/// Apply `delta` to `baseline`, producing the reconstructed file content.
pub fn apply_delta(baseline: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    apply_limited(baseline, delta, &mut output, MAX_OUTPUT_BYTES)
        .map_err(|e| EngineError::Delta(format!("delta application failed: {e}")))?;
    Ok(output)
}
