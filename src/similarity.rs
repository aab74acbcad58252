//! Vector similarity helpers.

use crate::error::Result;
use crate::PipelineError;

/// Cosine similarity of two embeddings, clamped to `[0.0, 1.0]`.
///
/// Negative similarities are treated as "unrelated" and clamp to zero. A
/// zero-magnitude vector has no direction and also scores zero.
///
/// # Errors
///
/// [`PipelineError::InvalidConfig`] when either vector is empty or the
/// lengths differ.
///
/// # Example
///
/// ```
/// use textile::similarity::cosine_similarity;
///
/// let s = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap();
/// assert!((s - 1.0).abs() < 1e-6);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.is_empty() || b.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "cannot compare empty embeddings".into(),
        ));
    }
    if a.len() != b.len() {
        return Err(PipelineError::InvalidConfig(format!(
            "embedding dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(sim.clamp(0.0, 1.0) as f32)
}
