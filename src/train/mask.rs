use crate::math::Matrix;

/// Builds a `[batch, max_len]` mask with 1.0 at positions `< lengths[i]`.
pub fn generate_mask(lengths: &[usize], max_len: usize) -> Matrix {
    let mut mask = Matrix::zeros(lengths.len(), max_len);
    for (i, &len) in lengths.iter().enumerate() {
        mask.row_mut(i)[..len.min(max_len)].fill(1.0);
    }
    mask
}

/// Marks every token that is not `padding_idx`.
pub fn padding_mask(tokens: &[Vec<usize>], padding_idx: usize) -> Matrix {
    let cols = tokens.first().map_or(0, Vec::len);
    let data = tokens
        .iter()
        .flat_map(|row| row.iter().map(|&t| if t != padding_idx { 1.0 } else { 0.0 }))
        .collect();
    Matrix::from_vec(tokens.len(), cols, data)
}
