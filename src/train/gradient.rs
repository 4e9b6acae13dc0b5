use crate::math::Parameter;

/// Global-norm rescaling and element-wise clipping of parameter gradients.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientController {
    pub grad_norm: Option<f64>,
    pub grad_clipping: Option<f64>,
}

impl GradientController {
    pub fn new(grad_norm: Option<f64>, grad_clipping: Option<f64>) -> GradientController {
        GradientController { grad_norm, grad_clipping }
    }

    /// Applies [`rescale_gradients`] with the configured `grad_norm`.
    pub fn rescale(&self, params: &mut [&mut Parameter]) -> Option<f64> {
        rescale_gradients(params, self.grad_norm)
    }

    /// Applies [`enable_gradient_clipping`] with the configured `grad_clipping`.
    pub fn install_clipping(&self, params: &mut [&mut Parameter]) {
        enable_gradient_clipping(params, self.grad_clipping);
    }
}

/// Global L2 norm over every parameter's gradient.
pub fn global_grad_norm(params: &[&mut Parameter]) -> f64 {
    params.iter().map(|p| p.grad.sum_squares()).sum::<f64>().sqrt()
}

/// Scales all gradients by `max_norm / norm` when the global norm exceeds
/// `max_norm`.
///
/// Returns the norm observed before scaling, or `None` when `max_norm` is
/// unset (gradients untouched).
pub fn rescale_gradients(params: &mut [&mut Parameter], max_norm: Option<f64>) -> Option<f64> {
    let max_norm = max_norm?;
    let total_norm = global_grad_norm(params);
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for p in params.iter_mut() {
            p.grad.scale(clip_coef);
        }
    }
    Some(total_norm)
}

/// Registers a persistent `[-clip_value, clip_value]` limit on every
/// parameter's gradient, applied to the summed gradient at the end of each
/// backward pass. No-op when `clip_value` is unset.
pub fn enable_gradient_clipping(params: &mut [&mut Parameter], clip_value: Option<f64>) {
    if let Some(clip) = clip_value {
        for p in params.iter_mut() {
            p.register_grad_clamp(clip);
        }
    }
}
