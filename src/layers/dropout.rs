use rand::Rng;

use crate::error::ModelError;
use crate::math::Matrix;

/// Inverted dropout: surviving activations are scaled by `1 / (1 - p)` at
/// training time so evaluation is a plain identity.
#[derive(Debug, Clone)]
pub struct Dropout {
    pub p: f64,
    mask: Option<Matrix>,
}

impl Dropout {
    pub fn new(p: f64) -> Dropout {
        Dropout { p: p.clamp(0.0, 1.0), mask: None }
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, input: &Matrix, training: bool, rng: &mut R) -> Matrix {
        if !training || self.p == 0.0 {
            self.mask = training.then(|| Matrix::filled(input.rows, input.cols, 1.0));
            return input.clone();
        }
        let keep = 1.0 - self.p;
        let mut mask = Matrix::zeros(input.rows, input.cols);
        if keep > 0.0 {
            for m in &mut mask.data {
                if rng.gen::<f64>() < keep {
                    *m = 1.0 / keep;
                }
            }
        }
        let out = input.hadamard(&mask);
        self.mask = Some(mask);
        out
    }

    pub fn backward(&mut self, grad_output: &Matrix) -> Result<Matrix, ModelError> {
        let mask = self.mask.take().ok_or(ModelError::NoForwardCache)?;
        Ok(grad_output.hadamard(&mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn evaluation_is_identity() {
        let mut d = Dropout::new(0.5);
        let x = Matrix::filled(2, 3, 1.5);
        assert_eq!(d.forward(&x, false, &mut StdRng::seed_from_u64(0)), x);
    }

    #[test]
    fn training_scales_survivors() {
        let mut d = Dropout::new(0.5);
        let x = Matrix::filled(4, 8, 1.0);
        let y = d.forward(&x, true, &mut StdRng::seed_from_u64(0));
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
        let g = d.backward(&Matrix::filled(4, 8, 1.0)).unwrap();
        assert_eq!(g, y);
    }
}
