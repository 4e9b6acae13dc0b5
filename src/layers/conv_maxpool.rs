use rand::Rng;

use crate::activation::ActivationFunction;
use crate::error::ModelError;
use crate::math::{Matrix, Parameter};

/// One bank of same-width filters.
#[derive(Debug, Clone)]
struct FilterBank {
    width: usize,
    weight: Parameter,
    bias: Parameter,
}

/// Per-example record of which window won the max-pool for each filter.
#[derive(Debug, Clone)]
struct PoolCache {
    inputs: Vec<Matrix>,
    // [example][bank][filter] -> (window start, pre-activation)
    winners: Vec<Vec<Vec<(usize, f64)>>>,
}

/// 1-D convolution over token positions followed by max-over-time pooling.
///
/// Each bank of width `k` slides a `[k * dim, filters]` kernel over the
/// masked sequence; the pooled outputs of all banks are concatenated into a
/// `[batch, Σ filters]` feature matrix.
#[derive(Debug, Clone)]
pub struct ConvMaxPool {
    dim: usize,
    banks: Vec<FilterBank>,
    activation: ActivationFunction,
    cache: Option<PoolCache>,
}

impl ConvMaxPool {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        dim: usize,
        filter_sizes: &[usize],
        filter_nums: &[usize],
        activation: ActivationFunction,
        rng: &mut R,
    ) -> ConvMaxPool {
        let banks = filter_sizes
            .iter()
            .zip(filter_nums)
            .enumerate()
            .map(|(i, (&width, &num))| FilterBank {
                width,
                weight: Parameter::new(format!("{name}.conv_{i}.weight"), Matrix::he(width * dim, num, rng)),
                bias: Parameter::new(format!("{name}.conv_{i}.bias"), Matrix::zeros(1, num)),
            })
            .collect();
        ConvMaxPool { dim, banks, activation, cache: None }
    }

    pub fn output_dim(&self) -> usize {
        self.banks.iter().map(|b| b.weight.value.cols).sum()
    }

    /// `inputs` holds one `[seq_len, dim]` matrix per example; `mask` is
    /// `[batch, seq_len]` with 1.0 on real tokens.
    pub fn forward(&mut self, inputs: &[Matrix], mask: &Matrix, keep_cache: bool) -> Result<Matrix, ModelError> {
        if mask.rows != inputs.len() {
            return Err(ModelError::Shape {
                context: "encoder mask".to_string(),
                expected: (inputs.len(), mask.cols),
                actual: mask.shape(),
            });
        }
        let mut features = Matrix::zeros(inputs.len(), self.output_dim());
        let mut masked_inputs = Vec::with_capacity(inputs.len());
        let mut winners = Vec::with_capacity(inputs.len());

        for (b, x) in inputs.iter().enumerate() {
            if x.cols != self.dim || x.rows > mask.cols {
                return Err(ModelError::Shape {
                    context: "encoder input".to_string(),
                    expected: (mask.cols, self.dim),
                    actual: x.shape(),
                });
            }
            let mut xm = x.clone();
            let mut valid = 0;
            for p in 0..xm.rows {
                let m = mask.get(b, p);
                if m != 0.0 {
                    valid = p + 1;
                }
                xm.row_mut(p).iter_mut().for_each(|v| *v *= m);
            }

            let mut offset = 0;
            let mut example_winners = Vec::with_capacity(self.banks.len());
            for bank in &self.banks {
                let num = bank.weight.value.cols;
                // At least one window, even for sequences shorter than the filter.
                let positions = valid.max(bank.width) - bank.width + 1;
                let mut best = vec![(0usize, f64::NEG_INFINITY, f64::NEG_INFINITY); num];
                for p in 0..positions {
                    let window = self.window(&xm, p, bank.width);
                    let z = window.matmul(&bank.weight.value);
                    for f in 0..num {
                        let pre = z.get(0, f) + bank.bias.value.get(0, f);
                        let act = self.activation.function(pre);
                        if act > best[f].2 {
                            best[f] = (p, pre, act);
                        }
                    }
                }
                for (f, &(_, _, act)) in best.iter().enumerate() {
                    features.set(b, offset + f, act);
                }
                example_winners.push(best.into_iter().map(|(p, pre, _)| (p, pre)).collect());
                offset += num;
            }
            masked_inputs.push(xm);
            winners.push(example_winners);
        }

        self.cache = keep_cache.then(|| PoolCache { inputs: masked_inputs, winners });
        Ok(features)
    }

    /// Accumulates filter gradients and returns `dL/dx` per example.
    pub fn backward(&mut self, grad_features: &Matrix, mask: &Matrix) -> Result<Vec<Matrix>, ModelError> {
        let cache = self.cache.take().ok_or(ModelError::NoForwardCache)?;
        let mut grads_x: Vec<Matrix> = cache.inputs.iter().map(|x| Matrix::zeros(x.rows, x.cols)).collect();
        let mut bank_grads: Vec<(Matrix, Matrix)> = self
            .banks
            .iter()
            .map(|bank| (
                Matrix::zeros(bank.weight.value.rows, bank.weight.value.cols),
                Matrix::zeros(1, bank.weight.value.cols),
            ))
            .collect();

        for (b, xm) in cache.inputs.iter().enumerate() {
            let mut offset = 0;
            for (k, bank) in self.banks.iter().enumerate() {
                let num = bank.weight.value.cols;
                for f in 0..num {
                    let (p, pre) = cache.winners[b][k][f];
                    let g = grad_features.get(b, offset + f) * self.activation.derivative(pre);
                    if g == 0.0 {
                        continue;
                    }
                    let (w_grad, b_grad) = &mut bank_grads[k];
                    b_grad.add_at(0, f, g);
                    for j in 0..bank.width {
                        let pos = p + j;
                        if pos >= xm.rows {
                            break;
                        }
                        for d in 0..self.dim {
                            let r = j * self.dim + d;
                            w_grad.add_at(r, f, xm.get(pos, d) * g);
                            grads_x[b].add_at(pos, d, bank.weight.value.get(r, f) * g * mask.get(b, pos));
                        }
                    }
                }
                offset += num;
            }
        }

        for (bank, (w_grad, b_grad)) in self.banks.iter_mut().zip(&bank_grads) {
            bank.weight.accumulate_grad(w_grad);
            bank.bias.accumulate_grad(b_grad);
        }
        Ok(grads_x)
    }

    /// Flattens rows `start..start + width` into a `1 x (width * dim)` row,
    /// zero-padding past the end of the sequence.
    fn window(&self, x: &Matrix, start: usize, width: usize) -> Matrix {
        let mut w = Matrix::zeros(1, width * self.dim);
        for j in 0..width {
            let pos = start + j;
            if pos >= x.rows {
                break;
            }
            w.data[j * self.dim..(j + 1) * self.dim].copy_from_slice(x.row(pos));
        }
        w
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.banks.iter().flat_map(|b| [&b.weight, &b.bias]).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.banks.iter_mut().flat_map(|b| [&mut b.weight, &mut b.bias]).collect()
    }
}
