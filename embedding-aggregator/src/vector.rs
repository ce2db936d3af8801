//! Text form of vectors as stored in postgres: `[0.1,-2,3.5e-7]`, the same
//! representation pgvector uses, so the columns can be migrated to `vector(n)`
//! without rewriting rows.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VectorParseError {
    #[error("unbalanced brackets in vector literal")]
    Brackets,
    #[error("invalid component {index}: {value:?}")]
    Component { index: usize, value: String },
}

pub fn format_vector(vector: &[f64]) -> String {
    // Display for f64 is the shortest repr that parses back to the same value
    let components: Vec<String> = vector.iter().map(f64::to_string).collect();
    format!("[{}]", components.join(","))
}

pub fn parse_vector(raw: &str) -> Result<Vec<f64>, VectorParseError> {
    let trimmed = raw.trim();
    let inner = match (trimmed.strip_prefix('['), trimmed.strip_suffix(']')) {
        (Some(_), Some(_)) if trimmed.len() >= 2 => &trimmed[1..trimmed.len() - 1],
        (None, None) => trimmed,
        _ => return Err(VectorParseError::Brackets),
    };

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .enumerate()
        .map(|(index, part)| {
            let part = part.trim();
            match part.parse::<f64>() {
                Ok(x) if x.is_finite() => Ok(x),
                _ => Err(VectorParseError::Component {
                    index,
                    value: part.to_string(),
                }),
            }
        })
        .collect()
}
