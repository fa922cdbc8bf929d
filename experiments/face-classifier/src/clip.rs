use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};

/// L2 norm over the gradients of every float parameter of `module`, taken as one vector.
pub fn global_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm::<B> {
        grads,
        sum: 0.0,
        backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum.sqrt()
}

/// Rescale all gradients by `max_norm / max(norm, max_norm)`, where `norm` is
/// the global norm. Returns the norm measured before clipping.
pub fn clip_by_global_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm::<B, M>(module, grads);
    if norm > max_norm {
        let mut visitor = Rescale::<B> {
            grads,
            scale: max_norm / norm,
            backend: PhantomData,
        };
        module.visit(&mut visitor);
    }
    norm
}

struct SquaredNorm<'a, B> {
    grads: &'a GradientsParams,
    sum: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct Rescale<'a, B> {
    grads: &'a mut GradientsParams,
    scale: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TrainBackend = Autodiff<NdArray<f32>>;

    fn gradients(scale: f32) -> (Linear<TrainBackend>, GradientsParams) {
        let device = NdArrayDevice::Cpu;
        let linear = LinearConfig::new(3, 2).init::<TrainBackend>(&device);
        let input = Tensor::<TrainBackend, 2>::full([4, 3], scale, &device);
        let loss = linear.forward(input).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &linear);
        (linear, grads)
    }

    #[test]
    fn norm_covers_weight_and_bias() {
        // d(sum(xW + b))/dW = 4 * scale per entry, d/db = 4 per entry.
        let (linear, grads) = gradients(2.0);
        let expected = (6.0f64 * 64.0 + 2.0 * 16.0).sqrt();
        let norm = global_norm::<TrainBackend, _>(&linear, &grads);
        assert!((norm - expected).abs() < 1e-4, "{norm} vs {expected}");
    }

    #[test]
    fn large_gradients_are_scaled_to_the_limit() {
        let (linear, mut grads) = gradients(10.0);
        let before = clip_by_global_norm::<TrainBackend, _>(&linear, &mut grads, 4.0);
        let after = global_norm::<TrainBackend, _>(&linear, &grads);

        assert!(before > 4.0);
        assert!((after - 4.0).abs() < 1e-4, "clipped norm {after}");
    }

    #[test]
    fn small_gradients_are_untouched() {
        let (linear, mut grads) = gradients(0.01);
        let before = clip_by_global_norm::<TrainBackend, _>(&linear, &mut grads, 100.0);
        let after = global_norm::<TrainBackend, _>(&linear, &grads);

        assert!((before - after).abs() < 1e-9);
    }
}
