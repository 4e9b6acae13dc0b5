use rand::Rng;

use crate::error::ModelError;
use crate::math::{Matrix, Parameter};

/// Fully connected layer: `y = x W + b`.
///
/// `weight` is `[input_size, size]`, `bias` is `[1, size]`. The last input is
/// cached by `forward` so `backward` can form the weight gradient.
#[derive(Debug, Clone)]
pub struct Dense {
    pub size: usize,
    pub weight: Parameter,
    pub bias: Parameter,
    input: Option<Matrix>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(name: &str, input_size: usize, size: usize, rng: &mut R) -> Dense {
        Dense {
            size,
            weight: Parameter::new(format!("{name}.weight"), Matrix::xavier(input_size, size, rng)),
            bias: Parameter::new(format!("{name}.bias"), Matrix::zeros(1, size)),
            input: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weight.value.rows
    }

    /// `input` is `[batch, input_size]`; returns `[batch, size]`.
    pub fn forward(&mut self, input: &Matrix, keep_cache: bool) -> Result<Matrix, ModelError> {
        if input.cols != self.input_size() {
            return Err(ModelError::Shape {
                context: format!("{} input", self.weight.name),
                expected: (input.rows, self.input_size()),
                actual: input.shape(),
            });
        }
        let mut out = input.matmul(&self.weight.value);
        let bias = self.bias.value.row(0);
        for i in 0..out.rows {
            for (o, b) in out.row_mut(i).iter_mut().zip(bias) {
                *o += b;
            }
        }
        self.input = keep_cache.then(|| input.clone());
        Ok(out)
    }

    /// Accumulates parameter gradients for `grad_output` (`dL/dy`) and
    /// returns `dL/dx`.
    pub fn backward(&mut self, grad_output: &Matrix) -> Result<Matrix, ModelError> {
        let input = self.input.as_ref().ok_or(ModelError::NoForwardCache)?;
        // dW = x^T · dy, db = Σ_rows dy, dx = dy · W^T
        self.weight.accumulate_grad(&input.transpose().matmul(grad_output));
        self.bias.accumulate_grad(&grad_output.sum_rows());
        Ok(grad_output.matmul(&self.weight.value.transpose()))
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backward_produces_expected_gradients() {
        let mut layer = Dense::new("fc", 2, 1, &mut StdRng::seed_from_u64(0));
        layer.weight.value = Matrix::from_rows(vec![vec![2.0], vec![-1.0]]);
        let x = Matrix::from_rows(vec![vec![1.0, 3.0], vec![0.5, 0.0]]);
        let y = layer.forward(&x, true).unwrap();
        assert_eq!(y.data, vec![-1.0, 1.0]);

        let dx = layer.backward(&Matrix::from_rows(vec![vec![1.0], vec![2.0]])).unwrap();
        assert_eq!(layer.weight.grad.data, vec![2.0, 3.0]);
        assert_eq!(layer.bias.grad.data, vec![3.0]);
        assert_eq!(dx.data, vec![2.0, -1.0, 4.0, -2.0]);
    }

    #[test]
    fn rejects_wrong_width() {
        let mut layer = Dense::new("fc", 3, 2, &mut StdRng::seed_from_u64(0));
        assert!(layer.forward(&Matrix::zeros(1, 2), false).is_err());
    }
}
