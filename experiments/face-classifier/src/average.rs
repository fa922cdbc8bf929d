use std::collections::HashMap;

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor},
};

/// Exponential moving average of a module's float parameters.
///
/// The effective decay after `n` updates is `min(decay, (1 + n) / (10 + n))`,
/// so early averages track the live parameters closely.
pub struct ParameterAverage<M> {
    shadow: M,
    decay: f64,
}

impl<M> ParameterAverage<M> {
    pub fn new(initial: M, decay: f64) -> Self {
        Self {
            shadow: initial,
            decay,
        }
    }

    pub fn effective_decay(&self, num_updates: usize) -> f64 {
        let warmup = (1.0 + num_updates as f64) / (10.0 + num_updates as f64);
        self.decay.min(warmup)
    }

    /// Blend `current` into the shadow copy, pairing parameters by id.
    pub fn update<B: Backend>(&mut self, current: &M, num_updates: usize)
    where
        M: Module<B>,
    {
        let mut collector = ParamCollector::<B>::default();
        current.visit(&mut collector);

        let mut blend = ParamBlend {
            current: collector.params,
            decay: self.effective_decay(num_updates),
        };
        self.shadow = self.shadow.clone().map(&mut blend);
    }

    pub fn averaged(&self) -> &M {
        &self.shadow
    }
}

struct ParamCollector<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> Default for ParamCollector<B> {
    fn default() -> Self {
        Self {
            params: HashMap::new(),
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let flat = tensor.clone().reshape([tensor.shape().num_elements()]);
        self.params.insert(id, flat);
    }
}

struct ParamBlend<B: Backend> {
    current: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for ParamBlend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.current.remove(&id) {
            Some(current) => {
                let current = current.reshape(tensor.shape());
                tensor.mul_scalar(self.decay) + current.mul_scalar(1.0 - self.decay)
            }
            None => tensor,
        }
    }
}
