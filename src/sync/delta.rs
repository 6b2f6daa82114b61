//! Delta construction against a destination signature.

use crate::utils::errors::{EngineError, Result};
use fast_rsync::{diff, Signature};

/// Compute the delta that transforms the signed baseline into `new_data`.
pub fn compute_delta(baseline_sig: &Signature, new_data: &[u8]) -> Result<Vec<u8>> {
    let mut delta = Vec::new();
    let indexed = baseline_sig.index();
    diff(&indexed, new_data, &mut delta)
        .map_err(|e| EngineError::Delta(format!("delta construction failed: {e}")))?;
    Ok(delta)
}

/// Delta size relative to the new file; below 1.0 the delta saved bytes.
pub fn delta_ratio(delta_size: usize, new_file_size: usize) -> f64 {
    if new_file_size == 0 {
        return 0.0;
    }
    delta_size as f64 / new_file_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::signature::generate_signature_from_bytes;

    #[test]
    fn test_identical_content_gives_tiny_delta() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let sig = generate_signature_from_bytes(&data, None);
        let delta = compute_delta(&sig, &data).unwrap();

        // A matched file reduces to block references plus framing
        assert!(delta.len() < data.len() / 10);
    }

    #[test]
    fn test_small_edit_gives_small_delta() {
        let baseline: Vec<u8> = (0..500_000u32).map(|i| (i % 239) as u8).collect();
        let mut modified = baseline.clone();
        modified[250_000..250_064].fill(0xFF);

        let sig = generate_signature_from_bytes(&baseline, None);
        let delta = compute_delta(&sig, &modified).unwrap();

        assert!(delta.len() < modified.len() / 4);
    }

    #[test]
    fn test_disjoint_content_still_produces_delta() {
        let baseline = vec![b'A'; 50_000];
        let modified = vec![b'B'; 50_000];

        let sig = generate_signature_from_bytes(&baseline, None);
        let delta = compute_delta(&sig, &modified).unwrap();

        // Nothing matches: the delta carries the full literal payload
        assert!(delta.len() >= modified.len());
    }

    #[test]
    fn test_delta_ratio() {
        assert!((delta_ratio(10, 1000) - 0.01).abs() < 1e-9);
        assert!((delta_ratio(1000, 1000) - 1.0).abs() < 1e-9);
        assert_eq!(delta_ratio(100, 0), 0.0);
    }
}
