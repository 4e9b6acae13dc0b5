use rand::Rng;

use crate::error::ModelError;
use crate::math::{Matrix, Parameter};

/// Token embedding table, `[vocab_size, dim]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub weight: Parameter,
    tokens: Option<Vec<Vec<usize>>>,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(name: &str, vocab_size: usize, dim: usize, rng: &mut R) -> Embedding {
        Embedding {
            weight: Parameter::new(format!("{name}.weight"), Matrix::uniform(vocab_size, dim, 0.1, rng)),
            tokens: None,
        }
    }

    /// Replaces the table with pretrained vectors of the same shape.
    pub fn from_pretrained(&mut self, vectors: Matrix) -> Result<(), ModelError> {
        if vectors.shape() != self.weight.value.shape() {
            return Err(ModelError::Shape {
                context: "pretrained embedding".to_string(),
                expected: self.weight.value.shape(),
                actual: vectors.shape(),
            });
        }
        self.weight.value = vectors;
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.value.rows
    }

    pub fn dim(&self) -> usize {
        self.weight.value.cols
    }

    /// Looks up each sequence, giving one `[seq_len, dim]` matrix per example.
    pub fn forward(&mut self, tokens: &[Vec<usize>], keep_cache: bool) -> Result<Vec<Matrix>, ModelError> {
        let dim = self.dim();
        let mut out = Vec::with_capacity(tokens.len());
        for seq in tokens {
            let mut x = Matrix::zeros(seq.len(), dim);
            for (p, &token) in seq.iter().enumerate() {
                if token >= self.vocab_size() {
                    return Err(ModelError::UnknownToken { token, vocab_size: self.vocab_size() });
                }
                x.row_mut(p).copy_from_slice(self.weight.value.row(token));
            }
            out.push(x);
        }
        self.tokens = keep_cache.then(|| tokens.to_vec());
        Ok(out)
    }

    /// Scatters per-position gradients back onto the looked-up rows.
    pub fn backward(&mut self, grads: &[Matrix]) -> Result<(), ModelError> {
        let tokens = self.tokens.as_ref().ok_or(ModelError::NoForwardCache)?;
        let mut table_grad = Matrix::zeros(self.vocab_size(), self.dim());
        for (seq, grad) in tokens.iter().zip(grads) {
            for (p, &token) in seq.iter().enumerate() {
                for (g, d) in table_grad.row_mut(token).iter_mut().zip(grad.row(p)) {
                    *g += d;
                }
            }
        }
        self.weight.accumulate_grad(&table_grad);
        Ok(())
    }
}
