use anyhow::Result;
use burn::{
    module::AutodiffModule,
    optim::{
        adaptor::OptimizerAdaptor, momentum::MomentumConfig, GradientsParams, Optimizer, Sgd,
        SgdConfig,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use burn_dataset::Dataset;
use gilnet_core::{
    logging::{best_line, emit, evaluation_line, step_line},
    stream_rng, AccuracyHistory, BatchIter, BestAccuracy, EvaluationAccumulator,
    EvaluationMetrics, ExponentialDecay, RngStream, StepMetrics,
};
use log::debug;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    args::Hyperparameters,
    average::ParameterAverage,
    clip::clip_by_global_norm,
    dataset::{FaceItem, FaceSplit},
    model::{exact_match_accuracy, predictions, DropoutSampler, FaceBatch, GilNet, GilNetConfig},
};

/// Run constants persisted next to the report, independent of CLI flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConstants {
    pub seed: u64,
    pub momentum: f64,
    pub clip_norm: f32,
    pub decay_steps: usize,
    pub decay_rate: f64,
    pub moving_average_decay: f64,
    pub network: GilNetConfig,
}

impl Default for ExperimentConstants {
    fn default() -> Self {
        Self {
            seed: 1337,
            momentum: 0.9,
            clip_norm: 4.0,
            decay_steps: 100,
            decay_rate: 0.95,
            moving_average_decay: 0.9999,
            network: GilNetConfig::default(),
        }
    }
}

type GilNetOptimizer<B> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, GilNet<B>, B>;

/// Mutable run state owned by the trainer.
#[derive(Clone, Debug, Default)]
pub struct TrainingState {
    pub global_step: usize,
    pub history: AccuracyHistory,
    pub last_step: Option<StepMetrics>,
}

pub struct Trainer<B: AutodiffBackend> {
    model: GilNet<B>,
    optimizer: GilNetOptimizer<B>,
    average: Option<ParameterAverage<GilNet<B::InnerBackend>>>,
    schedule: ExponentialDecay,
    clip_norm: f64,
    dropout: DropoutSampler,
    hyperparameters: Hyperparameters,
    device: B::Device,
    state: TrainingState,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Build the model and optimizer and initialize every parameter.
    pub fn new(
        hyperparameters: &Hyperparameters,
        constants: &ExperimentConstants,
        num_classes: usize,
        channel_means: Vec<f32>,
        device: &B::Device,
    ) -> Result<Self> {
        let mut init_rng = stream_rng(constants.seed, RngStream::Init);
        let model: GilNet<B> = constants.network.init(
            num_classes,
            hyperparameters.image_size,
            channel_means,
            hyperparameters.l2_reg_lambda,
            &mut init_rng,
            device,
        )?;

        let optimizer = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(constants.momentum)
                    .with_dampening(0.0),
            ))
            .init::<B, GilNet<B>>();

        let average = hyperparameters
            .enable_moving_average
            .then(|| ParameterAverage::new(model.valid(), constants.moving_average_decay));

        Ok(Self {
            model,
            optimizer,
            average,
            schedule: ExponentialDecay {
                initial: hyperparameters.learning_rate,
                decay_steps: constants.decay_steps,
                decay_rate: constants.decay_rate,
                staircase: true,
            },
            clip_norm: f64::from(constants.clip_norm),
            dropout: DropoutSampler::new(
                hyperparameters.dropout_keep_prob,
                stream_rng(constants.seed, RngStream::Dropout),
            ),
            hyperparameters: hyperparameters.clone(),
            device: device.clone(),
            state: TrainingState::default(),
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// One forward/backward/update cycle on a training batch.
    pub fn train_step(&mut self, items: &[&FaceItem]) -> Result<StepMetrics> {
        let learning_rate = self.schedule.rate_at(self.state.global_step);
        let batch =
            FaceBatch::<B>::from_items(items, self.hyperparameters.image_size, &self.device);

        let logits = self.model.forward(batch.images, Some(&mut self.dropout));
        let loss = self.model.loss(logits.clone(), batch.targets);
        let accuracy = exact_match_accuracy(&predictions(logits)?, &batch.classes);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let mut grads = GradientsParams::from_grads(loss.backward(), &self.model);
        let grad_norm = clip_by_global_norm::<B, _>(&self.model, &mut grads, self.clip_norm);
        debug!("step {} gradient norm {:.4}", self.state.global_step + 1, grad_norm);
        self.model = self
            .optimizer
            .step(learning_rate, self.model.clone(), grads);
        self.state.global_step += 1;

        if let Some(average) = self.average.as_mut() {
            average.update::<B::InnerBackend>(&self.model.valid(), self.state.global_step);
        }

        let metrics = StepMetrics {
            step: self.state.global_step,
            loss: loss_value,
            accuracy,
            learning_rate,
        };
        emit(step_line(&metrics));
        self.state.last_step = Some(metrics.clone());
        Ok(metrics)
    }

    /// Parameters used for evaluation: the moving average when enabled.
    pub fn evaluation_model(&self) -> GilNet<B::InnerBackend> {
        match &self.average {
            Some(average) => average.averaged().clone(),
            None => self.model.valid(),
        }
    }

    /// Full pass over `split` without recording it in the history.
    pub fn measure(&self, split: &FaceSplit) -> Result<EvaluationMetrics> {
        evaluation_pass(
            &self.evaluation_model(),
            split,
            self.hyperparameters.batch_size,
            self.hyperparameters.image_size,
        )
    }

    /// Evaluate `split`, record the result at the current step and report the best so far.
    pub fn evaluate(&mut self, split: &FaceSplit) -> Result<BestAccuracy> {
        println!("\nEvaluation:");
        let metrics = self.measure(split)?;
        let best = self.state.history.record(self.state.global_step, metrics);

        emit(evaluation_line(&metrics));
        emit(best_line(&best));
        println!();
        Ok(best)
    }

    /// Train over every batch of every epoch, evaluating on `test` every
    /// `evaluate_every` global steps.
    pub fn fit(&mut self, train: &FaceSplit, test: &FaceSplit, shuffle_rng: StdRng) -> Result<()> {
        let batches = BatchIter::shuffled(
            train.items(),
            self.hyperparameters.batch_size,
            self.hyperparameters.num_epochs,
            shuffle_rng,
        )?;
        debug!(
            "training for {} batches ({} per epoch)",
            batches.len(),
            batches.batches_per_epoch()
        );

        for batch in batches {
            self.train_step(&batch.items)?;
            if self.state.global_step % self.hyperparameters.evaluate_every == 0 {
                self.evaluate(test)?;
            }
        }

        Ok(())
    }
}

/// Loss and per-sample predicted classes for one batch, dropout disabled.
pub fn evaluation_step<E: Backend>(
    model: &GilNet<E>,
    items: &[&FaceItem],
    image_size: usize,
) -> Result<(Vec<usize>, f32)> {
    let batch = FaceBatch::<E>::from_items(items, image_size, &model.device());
    let logits = model.forward(batch.images, None);
    let loss = model
        .loss(logits.clone(), batch.targets)
        .into_scalar()
        .elem::<f32>();
    Ok((predictions(logits)?, loss))
}

pub fn evaluation_pass<E: Backend>(
    model: &GilNet<E>,
    split: &FaceSplit,
    batch_size: usize,
    image_size: usize,
) -> Result<EvaluationMetrics> {
    let mut accumulator = EvaluationAccumulator::new(split.len());
    for batch in BatchIter::single_pass(split.items(), batch_size)? {
        let (predicted, loss) = evaluation_step(model, &batch.items, image_size)?;
        let targets: Vec<usize> = batch.items.iter().map(|item| item.class_index()).collect();
        accumulator.push_batch(loss, &predicted, &targets)?;
    }
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{solid_item, tiny_config, TEST_IMAGE_SIZE};
    use burn::module::{Module, ModuleVisitor, ParamId};
    use burn::tensor::Tensor;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use gilnet_core::seeded_rng;

    type TrainBackend = Autodiff<NdArray<f32>>;

    #[derive(Default)]
    struct Flatten(Vec<f32>);

    impl<E: Backend> ModuleVisitor<E> for Flatten {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<E, D>) {
            let values = tensor.to_data().convert::<f32>().to_vec::<f32>().unwrap();
            self.0.extend(values);
        }
    }

    fn flat_params<E: Backend>(model: &GilNet<E>) -> Vec<f32> {
        let mut flatten = Flatten::default();
        model.visit(&mut flatten);
        flatten.0
    }

    fn hyperparameters() -> Hyperparameters {
        Hyperparameters {
            folder_to_test: 1,
            dropout_keep_prob: 0.5,
            l2_reg_lambda: 0.001,
            learning_rate: 0.01,
            batch_size: 4,
            num_epochs: 2,
            evaluate_every: 2,
            enable_moving_average: false,
            image_size: TEST_IMAGE_SIZE,
        }
    }

    fn constants() -> ExperimentConstants {
        ExperimentConstants {
            seed: 21,
            network: tiny_config(),
            ..ExperimentConstants::default()
        }
    }

    fn split(count: usize) -> FaceSplit {
        FaceSplit::new(
            (0..count)
                .map(|i| {
                    let class = i % 2;
                    solid_item(if class == 0 { 20 } else { 220 }, class, 2)
                })
                .collect(),
        )
    }

    fn trainer(params: &Hyperparameters) -> Trainer<TrainBackend> {
        Trainer::new(
            params,
            &constants(),
            2,
            vec![120.0, 120.0, 120.0],
            &NdArrayDevice::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn train_step_is_deterministic_for_a_seed() {
        let data = split(4);
        let batch: Vec<&FaceItem> = data.items().iter().collect();

        let first = trainer(&hyperparameters()).train_step(&batch).unwrap();
        let second = trainer(&hyperparameters()).train_step(&batch).unwrap();

        assert_eq!(first.step, 1);
        assert!(first.loss.is_finite());
        assert_eq!(first.loss, second.loss);
        assert_eq!(first.accuracy, second.accuracy);
    }

    #[test]
    fn train_step_advances_schedule() {
        let data = split(4);
        let batch: Vec<&FaceItem> = data.items().iter().collect();
        let mut trainer = trainer(&hyperparameters());

        let first = trainer.train_step(&batch).unwrap();
        let second = trainer.train_step(&batch).unwrap();

        assert_eq!(trainer.state().global_step, 2);
        assert_eq!(first.learning_rate, 0.01);
        assert_eq!(second.learning_rate, 0.01);
        assert_eq!(trainer.state().last_step.as_ref(), Some(&second));
    }

    #[test]
    fn fit_evaluates_on_interval() {
        let params = hyperparameters();
        let mut trainer = trainer(&params);

        trainer
            .fit(&split(8), &split(4), seeded_rng(3))
            .unwrap();

        let state = trainer.state();
        assert_eq!(state.global_step, 4);
        let steps: Vec<usize> = state.history.records().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![2, 4]);
        let best = state.history.best().unwrap();
        assert!((0.0..=1.0).contains(&best.accuracy));
    }

    #[test]
    fn evaluation_pass_matches_predictions() {
        let trainer = trainer(&hyperparameters());
        let model = trainer.evaluation_model();
        let test = split(5);

        let metrics = evaluation_pass(&model, &test, 2, TEST_IMAGE_SIZE).unwrap();

        let all: Vec<&FaceItem> = test.items().iter().collect();
        let (predicted, _) = evaluation_step(&model, &all, TEST_IMAGE_SIZE).unwrap();
        let expected = exact_match_accuracy(&predicted, &test.targets());
        assert!((metrics.accuracy - expected).abs() < 1e-6);
        assert!(metrics.loss.is_finite());
    }

    #[test]
    fn evaluation_has_no_side_effects() {
        let mut trainer = trainer(&hyperparameters());
        let test = split(3);

        let before = trainer.measure(&test).unwrap();
        trainer.evaluate(&test).unwrap();
        let after = trainer.measure(&test).unwrap();

        assert_eq!(before, after);
        assert_eq!(trainer.state().global_step, 0);
        assert_eq!(trainer.state().history.len(), 1);
    }

    #[test]
    fn update_is_clipped_by_global_norm() {
        // With lr 1 and no momentum history the first update equals the clipped gradient.
        let params = Hyperparameters {
            dropout_keep_prob: 1.0,
            l2_reg_lambda: 0.0,
            learning_rate: 1.0,
            ..hyperparameters()
        };
        let mut trainer = trainer(&params);
        let data = FaceSplit::new(vec![solid_item(255, 0, 2), solid_item(0, 1, 2)]);
        let batch: Vec<&FaceItem> = data.items().iter().collect();

        let before = flat_params(&trainer.model.valid());
        trainer.train_step(&batch).unwrap();
        let after = flat_params(&trainer.model.valid());

        let update_norm = before
            .iter()
            .zip(&after)
            .map(|(b, a)| f64::from(b - a).powi(2))
            .sum::<f64>()
            .sqrt();
        assert!(update_norm > 0.0);
        assert!(update_norm <= 4.0 + 1e-3, "update norm {update_norm}");
    }

    #[test]
    fn evaluation_uses_averaged_parameters() {
        let params = Hyperparameters {
            enable_moving_average: true,
            learning_rate: 0.1,
            ..hyperparameters()
        };
        let mut trainer = trainer(&params);
        let data = split(4);
        let batch: Vec<&FaceItem> = data.items().iter().collect();
        for _ in 0..3 {
            trainer.train_step(&batch).unwrap();
        }

        let average = trainer.average.as_ref().unwrap().averaged().clone();
        let live = trainer.model.valid();
        let evaluated = flat_params(&trainer.evaluation_model());
        assert_eq!(evaluated, flat_params(&average));
        assert_ne!(evaluated, flat_params(&live));

        let test = split(4);
        let measured = trainer.measure(&test).unwrap();
        let on_average = evaluation_pass(&average, &test, params.batch_size, TEST_IMAGE_SIZE).unwrap();
        let on_live = evaluation_pass(&live, &test, params.batch_size, TEST_IMAGE_SIZE).unwrap();
        assert_eq!(measured, on_average);
        assert_ne!(measured.loss, on_live.loss);
    }

    #[test]
    fn moving_average_trains_and_evaluates() {
        let params = Hyperparameters {
            enable_moving_average: true,
            num_epochs: 1,
            ..hyperparameters()
        };
        let mut trainer = trainer(&params);
        trainer.fit(&split(8), &split(2), seeded_rng(5)).unwrap();

        assert_eq!(trainer.state().history.len(), 1);
        assert!(trainer.measure(&split(2)).unwrap().loss.is_finite());
    }
}
