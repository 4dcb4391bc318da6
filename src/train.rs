//! Training orchestration: epoch loop, combined weighted loss, clipped Adam steps,
//! EMA shadow, per-epoch validation, early stopping.
//!
//! Batches are row-aligned: one permutation per epoch drives both modalities, so a
//! batch always carries matching continuous and discrete rows of the same records.

use crate::layout::FeatureLayout;
use crate::loss::{
    categorical_loss_with_grad, categorical_noise_estimation_loss, continuous_loss_with_grad,
    continuous_noise_estimation_loss,
};
use crate::model::ConditionalTabularModel;
use crate::optim::{clip_grad_norm, Adam, EarlyStopper, Ema};
use crate::schedule::NoiseSchedule;
use crate::{Error, Result};
use ndarray::{ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Hyperparameters for [`fit`].
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub optim_lr: f32,
    pub continuous_weight: f32,
    pub discrete_weight: f32,
    pub grad_clip: f32,
    pub ema_decay: f32,
    pub es_patience: usize,
    pub es_min_delta: f32,
    pub hidden_size: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 128,
            optim_lr: 1e-3,
            continuous_weight: 1.0,
            discrete_weight: 1.0,
            grad_clip: 1.0,
            ema_decay: 0.9,
            es_patience: 500,
            es_min_delta: 0.3,
            hidden_size: 128,
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.hidden_size == 0 {
            return Err(Error::Domain(
                "epochs, batch_size, and hidden_size must be >= 1",
            ));
        }
        if !(self.optim_lr > 0.0) || !self.optim_lr.is_finite() {
            return Err(Error::Domain("optim_lr must be positive and finite"));
        }
        if !(self.grad_clip > 0.0) || !self.grad_clip.is_finite() {
            return Err(Error::Domain("grad_clip must be positive and finite"));
        }
        if self.continuous_weight < 0.0 || self.discrete_weight < 0.0 {
            return Err(Error::Domain("loss weights must be nonnegative"));
        }
        if !(self.ema_decay >= 0.0 && self.ema_decay < 1.0) {
            return Err(Error::Domain("ema_decay must lie in [0, 1)"));
        }
        Ok(())
    }
}

/// Trained model plus its EMA twin and the per-epoch loss history.
#[derive(Debug)]
pub struct TrainOutcome {
    pub model: ConditionalTabularModel,
    /// Same architecture with the EMA shadow weights loaded; prefer for generation.
    pub ema_model: ConditionalTabularModel,
    pub training_loss: Vec<f32>,
    pub validation_loss: Vec<f32>,
    pub stopped_early: bool,
}

/// One optimization step on a row-aligned batch.
///
/// Computes both losses with gradients, combines them with the configured weights,
/// clips the combined gradient, applies Adam, and refreshes the EMA shadow.
/// Returns the weighted `(continuous, discrete)` batch losses.
pub fn train_step(
    model: &mut ConditionalTabularModel,
    x0_continuous: &ArrayView2<f32>,
    x0_discrete: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    cfg: &TrainConfig,
    adam: &mut Adam,
    ema: &mut Ema,
    rng: &mut impl Rng,
) -> Result<(f32, f32)> {
    let (discrete_loss, discrete_grad) =
        categorical_loss_with_grad(model, x0_continuous, x0_discrete, layout, schedule, rng)?;
    let (continuous_loss, continuous_grad) =
        continuous_loss_with_grad(model, x0_continuous, layout, schedule, rng)?;

    let mut grad =
        &discrete_grad * cfg.discrete_weight + &continuous_grad * cfg.continuous_weight;
    clip_grad_norm(&mut grad, cfg.grad_clip);

    let mut params = model.flatten();
    adam.step(&mut params, &grad.view())?;
    model.unflatten_into(&params.view())?;
    ema.update(&params.view())?;

    Ok((
        continuous_loss * cfg.continuous_weight,
        discrete_loss * cfg.discrete_weight,
    ))
}

/// Weighted validation loss: both estimators in eval form, no parameter updates.
pub fn validation_loss(
    model: &ConditionalTabularModel,
    continuous: &ArrayView2<f32>,
    discrete: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    cfg: &TrainConfig,
    rng: &mut impl Rng,
) -> Result<f32> {
    let lc = continuous_noise_estimation_loss(model, continuous, layout, schedule, rng)?;
    let ld =
        categorical_noise_estimation_loss(model, continuous, discrete, layout, schedule, rng)?;
    Ok(lc * cfg.continuous_weight + ld * cfg.discrete_weight)
}

/// Train a fresh [`ConditionalTabularModel`] on row-aligned tabular data.
///
/// `discrete_tr` / `discrete_vl` are one-hot blocks laid out per `layout`. All
/// randomness flows from `cfg.seed`, so two calls with identical inputs produce
/// identical outcomes.
pub fn fit(
    continuous_tr: &ArrayView2<f32>,
    discrete_tr: &ArrayView2<f32>,
    continuous_vl: &ArrayView2<f32>,
    discrete_vl: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    cfg: &TrainConfig,
) -> Result<TrainOutcome> {
    cfg.validate()?;
    if continuous_tr.nrows() == 0 || continuous_tr.ncols() == 0 {
        return Err(Error::Domain("training data must be non-empty"));
    }
    if continuous_tr.nrows() != discrete_tr.nrows()
        || continuous_vl.nrows() != discrete_vl.nrows()
    {
        return Err(Error::Shape("continuous and discrete rows must align"));
    }
    if discrete_tr.ncols() != layout.total_width() || discrete_vl.ncols() != layout.total_width()
    {
        return Err(Error::Shape("discrete width must match the layout"));
    }
    if continuous_vl.ncols() != continuous_tr.ncols() {
        return Err(Error::Shape(
            "validation continuous width must match training",
        ));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let mut model = ConditionalTabularModel::new(
        &mut rng,
        schedule.num_steps,
        cfg.hidden_size,
        continuous_tr.ncols(),
        layout.total_width(),
    )?;
    let mut adam = Adam::new(model.num_params(), cfg.optim_lr)?;
    let mut ema = Ema::new(cfg.ema_decay, &model.flatten().view())?;
    let mut stopper = EarlyStopper::new(cfg.es_patience, cfg.es_min_delta);

    let mut training_loss = Vec::with_capacity(cfg.epochs);
    let mut val_loss = Vec::with_capacity(cfg.epochs);
    let mut stopped_early = false;

    let mut indices: Vec<usize> = (0..continuous_tr.nrows()).collect();
    let report_every = (cfg.epochs / 10).max(1);

    for epoch in 0..cfg.epochs {
        // One permutation for both modalities keeps batches row-aligned.
        indices.shuffle(&mut rng);

        let mut epoch_loss = 0.0f64;
        let mut batches = 0usize;
        for chunk in indices.chunks(cfg.batch_size) {
            let batch_c = continuous_tr.select(Axis(0), chunk);
            let batch_d = discrete_tr.select(Axis(0), chunk);
            let (lc, ld) = train_step(
                &mut model,
                &batch_c.view(),
                &batch_d.view(),
                layout,
                schedule,
                cfg,
                &mut adam,
                &mut ema,
                &mut rng,
            )?;
            epoch_loss += (lc + ld) as f64;
            batches += 1;
        }
        let epoch_loss = (epoch_loss / batches as f64) as f32;

        let vl = validation_loss(
            &model,
            continuous_vl,
            discrete_vl,
            layout,
            schedule,
            cfg,
            &mut rng,
        )?;

        training_loss.push(epoch_loss);
        val_loss.push(vl);

        log::debug!(
            "epoch {epoch}: training loss {epoch_loss:.6}, validation loss {vl:.6}"
        );
        if epoch % report_every == 0 {
            log::info!(
                "epoch {epoch}/{}: training loss {epoch_loss:.6}, validation loss {vl:.6}",
                cfg.epochs
            );
        }

        if stopper.should_stop(vl) {
            log::info!("early stop at epoch {epoch}: validation loss {vl:.6}");
            stopped_early = true;
            break;
        }
    }

    let mut ema_model = model.clone();
    ema_model.unflatten_into(&ema.shadow().view())?;

    Ok(TrainOutcome {
        model,
        ema_model,
        training_loss,
        validation_loss: val_loss,
        stopped_early,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::randn;
    use crate::loss::random_one_hot;
    use crate::schedule::{NoiseSchedule, ScheduleKind};

    fn tiny_setup() -> (FeatureLayout, NoiseSchedule, TrainConfig) {
        let layout = FeatureLayout::from_cardinalities(&[3]).unwrap();
        let schedule = NoiseSchedule::new(ScheduleKind::Linear, 10, 1e-5, 5e-3).unwrap();
        let cfg = TrainConfig {
            epochs: 3,
            batch_size: 8,
            hidden_size: 8,
            seed: 7,
            ..TrainConfig::default()
        };
        (layout, schedule, cfg)
    }

    fn tiny_data(seed: u64, n: usize) -> (ndarray::Array2<f32>, ndarray::Array2<f32>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (randn(&mut rng, n, 2), random_one_hot(&mut rng, n, 3))
    }

    #[test]
    fn fit_records_one_loss_per_epoch() {
        let (layout, schedule, cfg) = tiny_setup();
        let (tr_c, tr_d) = tiny_data(1, 24);
        let (vl_c, vl_d) = tiny_data(2, 8);
        let out = fit(
            &tr_c.view(),
            &tr_d.view(),
            &vl_c.view(),
            &vl_d.view(),
            &layout,
            &schedule,
            &cfg,
        )
        .unwrap();
        assert_eq!(out.training_loss.len(), cfg.epochs);
        assert_eq!(out.validation_loss.len(), cfg.epochs);
        assert!(!out.stopped_early);
        assert!(out.training_loss.iter().all(|l| l.is_finite() && *l >= 0.0));
        assert!(out.validation_loss.iter().all(|l| l.is_finite() && *l >= 0.0));
    }

    #[test]
    fn fit_is_deterministic_in_the_seed() {
        let (layout, schedule, cfg) = tiny_setup();
        let (tr_c, tr_d) = tiny_data(1, 24);
        let (vl_c, vl_d) = tiny_data(2, 8);
        let run = || {
            fit(
                &tr_c.view(),
                &tr_d.view(),
                &vl_c.view(),
                &vl_d.view(),
                &layout,
                &schedule,
                &cfg,
            )
            .unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a.training_loss, b.training_loss);
        assert_eq!(a.validation_loss, b.validation_loss);
        assert_eq!(a.model.flatten(), b.model.flatten());
        assert_eq!(a.ema_model.flatten(), b.ema_model.flatten());
    }

    #[test]
    fn early_stopping_with_zero_patience_halts_after_one_epoch() {
        let (layout, schedule, mut cfg) = tiny_setup();
        cfg.epochs = 10;
        cfg.es_patience = 1;
        cfg.es_min_delta = f32::INFINITY; // nothing ever counts as improvement
        let (tr_c, tr_d) = tiny_data(3, 24);
        let (vl_c, vl_d) = tiny_data(4, 8);
        let out = fit(
            &tr_c.view(),
            &tr_d.view(),
            &vl_c.view(),
            &vl_d.view(),
            &layout,
            &schedule,
            &cfg,
        )
        .unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.validation_loss.len(), 1);
    }

    #[test]
    fn misaligned_rows_are_rejected() {
        let (layout, schedule, cfg) = tiny_setup();
        let (tr_c, _) = tiny_data(1, 24);
        let (_, tr_d) = tiny_data(1, 20);
        let (vl_c, vl_d) = tiny_data(2, 8);
        let err = fit(
            &tr_c.view(),
            &tr_d.view(),
            &vl_c.view(),
            &vl_d.view(),
            &layout,
            &schedule,
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn config_validation_rejects_degenerate_values() {
        let cfg = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TrainConfig {
            ema_decay: 1.0,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TrainConfig {
            optim_lr: 0.0,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
