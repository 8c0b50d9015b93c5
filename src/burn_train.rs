//! Burn-backed (opt-in) training and evaluation epochs over the structural loss.
//!
//! The driver owns no model architecture, data pipeline or checkpoint format. It consumes:
//! - a model through [`AnglePredictor`],
//! - batches as [`AngleBatch`] slices,
//! - an optimizer + learning-rate schedule (Adam with a Noam schedule by default),
//! - a [`CheckpointSink`].
//!
//! Per epoch it trains, evaluates, applies early stopping, checkpoints, and appends to the
//! `<prefix>.train.log` / `<prefix>.valid.log` CSV files when a log prefix is configured.

use burn_core as burn;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::{AutodiffModule, Module};
use burn::record::{CompactRecorder, FileRecorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Embedding, EmbeddingConfig, Linear, LinearConfig, Relu};
use burn_optim::lr_scheduler::noam::{NoamLrScheduler, NoamLrSchedulerConfig};
use burn_optim::lr_scheduler::LrScheduler;
use burn_optim::{AdamConfig, GradientsParams, Optimizer};
use ndarray::{Array2, Array3};

use crate::burn_structure::{angle_mse_loss, ndarray_to_burn_3, scalar, structural_loss_per_example};
use crate::codec::ENCODED_WIDTH;
use crate::geometry::BackboneGeometry;
use crate::mask::SequenceLengths;
use crate::{Error, Result};

/// Default burn backend for training: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// One collated batch.
///
/// `src_seq`/`src_pos` are `[batch, len]` token and position ids (0 = padding);
/// `tgt_angles` is the `[batch, len, 22]` zero-padded reference.
#[derive(Debug, Clone)]
pub struct AngleBatch<B: Backend> {
    pub src_seq: Tensor<B, 2, Int>,
    pub src_pos: Tensor<B, 2, Int>,
    pub tgt_angles: Tensor<B, 3>,
    pub tgt_pos: Tensor<B, 2, Int>,
    /// When present, replaces the zero-fill padding sentinel.
    pub lengths: Option<SequenceLengths>,
}

impl<B: Backend> AngleBatch<B> {
    pub fn new(
        src_seq: Tensor<B, 2, Int>,
        src_pos: Tensor<B, 2, Int>,
        tgt_angles: Tensor<B, 3>,
        tgt_pos: Tensor<B, 2, Int>,
    ) -> Result<Self> {
        let [b, l, w] = tgt_angles.dims();
        if w != ENCODED_WIDTH {
            return Err(Error::Shape("target angles must have 22 channels"));
        }
        if b == 0 {
            return Err(Error::Domain("batch must contain at least one example"));
        }
        if src_seq.dims() != [b, l] || src_pos.dims() != [b, l] || tgt_pos.dims() != [b, l] {
            return Err(Error::Shape("sequence and position ids must be [batch, len]"));
        }
        Ok(Self {
            src_seq,
            src_pos,
            tgt_angles,
            tgt_pos,
            lengths: None,
        })
    }

    pub fn with_lengths(mut self, lengths: SequenceLengths) -> Result<Self> {
        let [b, l, _] = self.tgt_angles.dims();
        if lengths.len() != b {
            return Err(Error::Shape("one length per example is required"));
        }
        if lengths.0.iter().any(|&n| n > l) {
            return Err(Error::Domain("sequence length exceeds padded length"));
        }
        self.lengths = Some(lengths);
        Ok(self)
    }

    /// Build a batch from host arrays; target positions reuse `src_pos`.
    pub fn from_arrays(
        device: &B::Device,
        src_seq: &Array2<i64>,
        src_pos: &Array2<i64>,
        tgt_angles: &Array3<f32>,
    ) -> Result<Self> {
        let ids = |x: &Array2<i64>| -> Tensor<B, 2, Int> {
            let (b, l) = x.dim();
            Tensor::from_data(
                TensorData::new(x.iter().copied().collect::<Vec<i64>>(), [b, l]),
                device,
            )
        };
        let pos = ids(src_pos);
        Self::new(ids(src_seq), pos.clone(), ndarray_to_burn_3(device, tgt_angles), pos)
    }

    pub fn batch_size(&self) -> usize {
        self.tgt_angles.dims()[0]
    }
}

impl<B: AutodiffBackend> AngleBatch<B> {
    /// The same batch on the inner backend, so evaluation builds no gradient graph.
    pub fn inner(&self) -> AngleBatch<B::InnerBackend> {
        AngleBatch {
            src_seq: self.src_seq.clone().inner(),
            src_pos: self.src_pos.clone().inner(),
            tgt_angles: self.tgt_angles.clone().inner(),
            tgt_pos: self.tgt_pos.clone().inner(),
            lengths: self.lengths.clone(),
        }
    }
}

/// The external sequence model: encoded `[batch, len, 22]` angle predictions for a batch.
pub trait AnglePredictor<B: Backend> {
    fn predict(&self, batch: &AngleBatch<B>) -> Tensor<B, 3>;
}

/// Residue-wise baseline: token + position embeddings, then a two-layer MLP per residue.
///
/// No attention, so each residue only sees its own token and position.
#[derive(Module, Debug)]
pub struct ResidueMlpPredictor<B: Backend> {
    residue_embed: Embedding<B>,
    position_embed: Embedding<B>,
    hidden: Linear<B>,
    out: Linear<B>,
    activation: Relu,
}

/// Sizes for [`ResidueMlpPredictor`].
#[derive(Debug, Clone)]
pub struct ResidueMlpConfig {
    /// Token vocabulary size, padding id 0 included.
    pub n_tokens: usize,
    /// Largest position id + 1.
    pub max_positions: usize,
    pub d_model: usize,
    pub hidden: usize,
}

impl Default for ResidueMlpConfig {
    fn default() -> Self {
        Self {
            n_tokens: 22,
            max_positions: 513,
            d_model: 64,
            hidden: 128,
        }
    }
}

impl ResidueMlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidueMlpPredictor<B> {
        ResidueMlpPredictor {
            residue_embed: EmbeddingConfig::new(self.n_tokens, self.d_model).init(device),
            position_embed: EmbeddingConfig::new(self.max_positions, self.d_model).init(device),
            hidden: LinearConfig::new(self.d_model, self.hidden)
                .with_bias(true)
                .init(device),
            out: LinearConfig::new(self.hidden, ENCODED_WIDTH)
                .with_bias(true)
                .init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> AnglePredictor<B> for ResidueMlpPredictor<B> {
    fn predict(&self, batch: &AngleBatch<B>) -> Tensor<B, 3> {
        let x = self.residue_embed.forward(batch.src_seq.clone())
            + self.position_embed.forward(batch.src_pos.clone());
        let h = self.activation.forward(self.hidden.forward(x));
        self.out.forward(h)
    }
}

/// Which batch loss drives training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
    /// Mean dRMSD of the reconstructed backbones.
    #[default]
    Structural,
    /// Masked MSE on decoded angles.
    AngleMse,
}

/// What to do with a batch whose loss is NaN or infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonFinitePolicy {
    /// Log, drop the batch from the epoch mean, skip the optimizer step.
    #[default]
    Skip,
    /// Stop with [`Error::NonFinite`].
    Abort,
}

/// Checkpoint policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Every epoch, under a name carrying the epoch and validation loss.
    All,
    /// Only when the validation loss is no worse than every earlier one, under a fixed name.
    #[default]
    Best,
}

/// Configuration for [`train`].
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Early-stopping patience: stop once more than this many epochs have passed since the
    /// last new best validation loss. `None` disables early stopping.
    pub step_when: Option<usize>,
    pub loss: LossKind,
    pub geometry: BackboneGeometry,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    /// Noam schedule: `lr = factor * d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`.
    pub lr_factor: f64,
    pub d_model: usize,
    pub warmup_steps: usize,
    pub non_finite: NonFinitePolicy,
    pub save_mode: SaveMode,
    /// Write `<prefix>.train.log` and `<prefix>.valid.log`.
    pub log_prefix: Option<PathBuf>,
    /// Log the running average of the last 32 batch losses every this many batches.
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            step_when: None,
            loss: LossKind::Structural,
            geometry: BackboneGeometry::default(),
            beta_1: 0.9,
            beta_2: 0.98,
            epsilon: 1e-9,
            lr_factor: 1.0,
            d_model: 512,
            warmup_steps: 4000,
            non_finite: NonFinitePolicy::Skip,
            save_mode: SaveMode::Best,
            log_prefix: None,
            log_every: 5,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Domain("epochs must be >= 1"));
        }
        if self.d_model == 0 || self.warmup_steps == 0 {
            return Err(Error::Domain("d_model and warmup_steps must be >= 1"));
        }
        if !(self.lr_factor.is_finite() && self.lr_factor > 0.0) {
            return Err(Error::Domain("lr_factor must be finite and > 0"));
        }
        if self.log_every == 0 {
            return Err(Error::Domain("log_every must be >= 1"));
        }
        self.geometry.validate()
    }

    pub fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
    }

    pub fn scheduler(&self) -> Result<NoamLrScheduler> {
        NoamLrSchedulerConfig::new(self.lr_factor)
            .with_model_size(self.d_model)
            .with_warmup_steps(self.warmup_steps)
            .init()
            .map_err(|_| Error::Domain("invalid noam schedule"))
    }
}

/// Persists model snapshots. `name` is unique per snapshot under [`SaveMode::All`] and fixed
/// under [`SaveMode::Best`].
pub trait CheckpointSink<B: Backend, M: Module<B>> {
    fn save(&mut self, model: &M, epoch: usize, valid_loss: f32, name: &str) -> Result<()>;
}

/// Writes `<prefix>_<name>.mpk` files with burn's `CompactRecorder`.
#[derive(Debug, Clone)]
pub struct RecorderCheckpointSink {
    prefix: PathBuf,
    recorder: CompactRecorder,
}

impl RecorderCheckpointSink {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            recorder: CompactRecorder::new(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        let mut s = self.prefix.clone().into_os_string();
        s.push("_");
        s.push(name);
        PathBuf::from(s)
    }
}

impl<B: Backend, M: Module<B>> CheckpointSink<B, M> for RecorderCheckpointSink {
    fn save(&mut self, model: &M, epoch: usize, valid_loss: f32, name: &str) -> Result<()> {
        // Explicit extension: the recorder would otherwise replace a `.` inside `name`.
        let mut path = self.path_for(name).into_os_string();
        path.push(".");
        path.push(<CompactRecorder as FileRecorder<B>>::file_extension());
        let path = PathBuf::from(path);
        model
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;
        tracing::info!(epoch, valid_loss, path = %path.display(), "checkpoint written");
        Ok(())
    }
}

/// One epoch's losses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
}

/// Outcome of [`train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs: Vec<EpochRecord>,
    /// Epoch with the lowest validation loss.
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

/// Batch loss `[1]` for `pred` against the batch's target.
pub fn batch_loss<B: Backend>(
    pred: Tensor<B, 3>,
    batch: &AngleBatch<B>,
    kind: LossKind,
    geometry: &BackboneGeometry,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    let gold = batch.tgt_angles.clone();
    match kind {
        LossKind::Structural => Ok(structural_loss_per_example(
            pred,
            gold,
            batch.lengths.as_ref(),
            geometry,
            device,
        )?
        .mean()),
        LossKind::AngleMse => angle_mse_loss(pred, gold, batch.lengths.as_ref()),
    }
}

fn tail_mean(losses: &[f32], n: usize) -> f32 {
    let tail = &losses[losses.len().saturating_sub(n)..];
    (tail.iter().map(|&v| v as f64).sum::<f64>() / tail.len().max(1) as f64) as f32
}

fn epoch_mean(losses: &[f32]) -> Result<f32> {
    if losses.is_empty() {
        return Err(Error::Domain("epoch produced no finite batch losses"));
    }
    Ok((losses.iter().map(|&v| v as f64).sum::<f64>() / losses.len() as f64) as f32)
}

/// One training epoch. Returns the updated model and the mean batch loss.
///
/// Per batch: predict, loss, backward, one schedule step, one optimizer step.
pub fn train_epoch<B, M, O, S>(
    mut model: M,
    batches: &[AngleBatch<B>],
    optimizer: &mut O,
    scheduler: &mut S,
    cfg: &TrainConfig,
    epoch: usize,
    device: &B::Device,
) -> Result<(M, f32)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + AnglePredictor<B>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    let mut losses = Vec::with_capacity(batches.len());
    for (batch_idx, batch) in batches.iter().enumerate() {
        let pred = model.predict(batch);
        let loss = batch_loss(pred, batch, cfg.loss, &cfg.geometry, device)?;
        let value = scalar(loss.clone());
        if !value.is_finite() {
            match cfg.non_finite {
                NonFinitePolicy::Skip => {
                    tracing::warn!(epoch, batch = batch_idx, loss = value, "skipping non-finite batch");
                    continue;
                }
                NonFinitePolicy::Abort => {
                    return Err(Error::NonFinite {
                        epoch,
                        batch: batch_idx,
                    })
                }
            }
        }
        losses.push(value);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let lr = scheduler.step();
        model = optimizer.step(lr, model, grads);

        if batch_idx % cfg.log_every == 0 && losses.len() > cfg.log_every {
            tracing::info!(
                epoch,
                batch = batch_idx,
                lr,
                last_32_avg = tail_mean(&losses, 32),
                "training"
            );
        }
    }
    let mean = epoch_mean(&losses)?;
    Ok((model, mean))
}

/// One evaluation epoch: mean batch loss, no parameter updates.
///
/// [`train`] calls this with `model.valid()` and [`AngleBatch::inner`] batches.
pub fn eval_epoch<B, M>(
    model: &M,
    batches: &[AngleBatch<B>],
    cfg: &TrainConfig,
    epoch: usize,
    device: &B::Device,
) -> Result<f32>
where
    B: Backend,
    M: AnglePredictor<B>,
{
    let mut losses = Vec::with_capacity(batches.len());
    for (batch_idx, batch) in batches.iter().enumerate() {
        let loss = batch_loss(model.predict(batch), batch, cfg.loss, &cfg.geometry, device)?;
        let value = scalar(loss);
        if !value.is_finite() {
            match cfg.non_finite {
                NonFinitePolicy::Skip => {
                    tracing::warn!(epoch, batch = batch_idx, loss = value, "skipping non-finite validation batch");
                    continue;
                }
                NonFinitePolicy::Abort => {
                    return Err(Error::NonFinite {
                        epoch,
                        batch: batch_idx,
                    })
                }
            }
        }
        losses.push(value);
    }
    epoch_mean(&losses)
}

/// CSV loss logs, `epoch,loss` per line.
struct LossLogs {
    train: PathBuf,
    valid: PathBuf,
}

impl LossLogs {
    fn create(prefix: &Path) -> Result<Self> {
        let with_suffix = |suffix: &str| {
            let mut s = prefix.as_os_str().to_owned();
            s.push(suffix);
            PathBuf::from(s)
        };
        let logs = Self {
            train: with_suffix(".train.log"),
            valid: with_suffix(".valid.log"),
        };
        for path in [&logs.train, &logs.valid] {
            let mut f = File::create(path)?;
            writeln!(f, "epoch,loss")?;
        }
        tracing::info!(
            train = %logs.train.display(),
            valid = %logs.valid.display(),
            "writing loss logs"
        );
        Ok(logs)
    }

    fn append(&self, record: &EpochRecord) -> Result<()> {
        for (path, loss) in [(&self.train, record.train_loss), (&self.valid, record.valid_loss)] {
            let mut f = OpenOptions::new().append(true).open(path)?;
            writeln!(f, "{},{:8.5}", record.epoch, loss)?;
        }
        Ok(())
    }
}

/// Train for up to `cfg.epochs` epochs with Adam and a Noam schedule.
///
/// After each epoch: early-stopping check, then checkpoint, then CSV logs. An epoch that
/// triggers early stopping is reported but neither checkpointed nor logged.
pub fn train<B, M>(
    model: M,
    train_batches: &[AngleBatch<B>],
    valid_batches: &[AngleBatch<B>],
    cfg: &TrainConfig,
    device: &B::Device,
    checkpoints: Option<&mut dyn CheckpointSink<B, M>>,
) -> Result<(M, TrainReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + AnglePredictor<B>,
    M::InnerModule: AnglePredictor<B::InnerBackend>,
{
    let mut optimizer = cfg.adam().init::<B, M>();
    let mut scheduler = cfg.scheduler()?;
    train_with(
        model,
        train_batches,
        valid_batches,
        cfg,
        device,
        &mut optimizer,
        &mut scheduler,
        checkpoints,
    )
}

/// [`train`] with a caller-provided optimizer and schedule.
#[allow(clippy::too_many_arguments)]
pub fn train_with<B, M, O, S>(
    mut model: M,
    train_batches: &[AngleBatch<B>],
    valid_batches: &[AngleBatch<B>],
    cfg: &TrainConfig,
    device: &B::Device,
    optimizer: &mut O,
    scheduler: &mut S,
    mut checkpoints: Option<&mut dyn CheckpointSink<B, M>>,
) -> Result<(M, TrainReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + AnglePredictor<B>,
    M::InnerModule: AnglePredictor<B::InnerBackend>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    cfg.validate()?;
    if train_batches.is_empty() || valid_batches.is_empty() {
        return Err(Error::Domain("training and validation data must be non-empty"));
    }
    let logs = cfg
        .log_prefix
        .as_deref()
        .map(LossLogs::create)
        .transpose()?;
    let valid_batches: Vec<AngleBatch<B::InnerBackend>> =
        valid_batches.iter().map(AngleBatch::inner).collect();

    let mut report = TrainReport {
        epochs: Vec::with_capacity(cfg.epochs),
        best_epoch: None,
        stopped_early: false,
    };
    let mut best_valid = f32::INFINITY;
    let mut min_valid = f32::INFINITY;
    let mut last_improved: Option<usize> = None;

    for epoch in 0..cfg.epochs {
        let start = Instant::now();
        let (next, train_loss) =
            train_epoch(model, train_batches, optimizer, scheduler, cfg, epoch, device)?;
        model = next;
        let train_secs = start.elapsed().as_secs_f32();

        let start = Instant::now();
        let valid_loss = eval_epoch(&model.valid(), &valid_batches, cfg, epoch, device)?;
        tracing::info!(
            epoch,
            train_loss,
            valid_loss,
            train_secs,
            valid_secs = start.elapsed().as_secs_f32(),
            "epoch finished"
        );

        let record = EpochRecord {
            epoch,
            train_loss,
            valid_loss,
        };
        report.epochs.push(record);
        if valid_loss < min_valid {
            report.best_epoch = Some(epoch);
        }
        let is_best = valid_loss <= min_valid;
        min_valid = min_valid.min(valid_loss);

        if let Some(patience) = cfg.step_when {
            if valid_loss < best_valid {
                best_valid = valid_loss;
                last_improved = Some(epoch);
            } else {
                let since = last_improved.map_or(epoch + 1, |e| epoch - e);
                if since > patience {
                    tracing::info!(epoch, patience, "no improvement, stopping early");
                    report.stopped_early = true;
                    break;
                }
            }
        }

        if let Some(sink) = checkpoints.as_deref_mut() {
            match cfg.save_mode {
                SaveMode::All => {
                    let name = format!("epoch{epoch:03}_loss_{valid_loss:.3}");
                    sink.save(&model, epoch, valid_loss, &name)?;
                }
                SaveMode::Best => {
                    if is_best {
                        sink.save(&model, epoch, valid_loss, "best")?;
                        tracing::info!(epoch, valid_loss, "best checkpoint updated");
                    }
                }
            }
        }

        if let Some(logs) = &logs {
            logs.append(&record)?;
        }
    }
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{basin_tokens, position_ids, random_angle_batch};
    use burn_optim::LearningRate;

    type AD = BurnBackend;

    /// Wraps the baseline and returns NaN for batches padded to `nan_len`.
    #[derive(Module, Debug)]
    struct NanOnLength<B: Backend> {
        inner: ResidueMlpPredictor<B>,
        nan_len: usize,
    }

    impl<B: Backend> AnglePredictor<B> for NanOnLength<B> {
        fn predict(&self, batch: &AngleBatch<B>) -> Tensor<B, 3> {
            let pred = self.inner.predict(batch);
            if batch.tgt_angles.dims()[1] == self.nan_len {
                pred.add_scalar(f32::NAN)
            } else {
                pred
            }
        }
    }

    /// Fixed learning rate, counts its steps.
    #[derive(Debug, Clone)]
    struct CountingScheduler {
        lr: LearningRate,
        steps: usize,
    }

    impl LrScheduler for CountingScheduler {
        type Record<B: Backend> = usize;

        fn step(&mut self) -> LearningRate {
            self.steps += 1;
            self.lr
        }

        fn to_record<B: Backend>(&self) -> Self::Record<B> {
            self.steps
        }

        fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
            self.steps = record;
            self
        }
    }

    struct MemorySink {
        saved: Vec<(usize, String)>,
    }

    impl<B: Backend, M: Module<B>> CheckpointSink<B, M> for MemorySink {
        fn save(&mut self, _model: &M, epoch: usize, _valid_loss: f32, name: &str) -> Result<()> {
            self.saved.push((epoch, name.to_string()));
            Ok(())
        }
    }

    fn synthetic_batches(n: usize, seed: u64) -> Vec<AngleBatch<AD>> {
        let device = Default::default();
        (0..n)
            .map(|i| {
                let (tgt, lens) = random_angle_batch(4, 8, 3, seed + i as u64).unwrap();
                let seq = basin_tokens(&tgt, &lens).unwrap();
                let pos = position_ids(&lens, 8).unwrap();
                AngleBatch::from_arrays(&device, &seq, &pos, &tgt).unwrap()
            })
            .collect()
    }

    fn small_model() -> ResidueMlpPredictor<AD> {
        ResidueMlpConfig {
            n_tokens: 3,
            max_positions: 9,
            d_model: 16,
            hidden: 32,
        }
        .init(&Default::default())
    }

    /// Two regular batches around one padded to length 6, which [`NanOnLength`] poisons.
    fn batches_with_nan_in_middle() -> Vec<AngleBatch<AD>> {
        let device = Default::default();
        let mut batches = synthetic_batches(2, 40);
        let (tgt, lens) = random_angle_batch(4, 6, 3, 50).unwrap();
        let seq = basin_tokens(&tgt, &lens).unwrap();
        let pos = position_ids(&lens, 6).unwrap();
        batches.insert(1, AngleBatch::from_arrays(&device, &seq, &pos, &tgt).unwrap());
        batches
    }

    fn nan_model() -> NanOnLength<AD> {
        NanOnLength {
            inner: small_model(),
            nan_len: 6,
        }
    }

    fn fast_config() -> TrainConfig {
        TrainConfig {
            epochs: 3,
            lr_factor: 2.0,
            d_model: 16,
            warmup_steps: 4,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn batch_shapes_are_validated() {
        let device = Default::default();
        let (tgt, lens) = random_angle_batch(2, 5, 5, 0).unwrap();
        let seq = basin_tokens(&tgt, &lens).unwrap();
        let short = Array2::<i64>::zeros((2, 4));
        assert!(AngleBatch::<AD>::from_arrays(&device, &short, &short, &tgt).is_err());
        let batch = AngleBatch::<AD>::from_arrays(&device, &seq, &seq, &tgt).unwrap();
        assert!(batch.clone().with_lengths(SequenceLengths(vec![5])).is_err());
        assert!(batch.with_lengths(SequenceLengths(vec![5, 6])).is_err());
    }

    #[test]
    fn predictor_emits_encoded_width() {
        let batches = synthetic_batches(1, 3);
        let pred = small_model().predict(&batches[0]);
        assert_eq!(pred.dims(), [4, 8, ENCODED_WIDTH]);
    }

    #[test]
    fn save_best_only_on_non_worsening_validation() {
        let batches = synthetic_batches(2, 10);
        let cfg = TrainConfig {
            epochs: 4,
            ..fast_config()
        };
        let mut sink = MemorySink { saved: Vec::new() };
        let (_, report) = train(
            small_model(),
            &batches,
            &batches,
            &cfg,
            &Default::default(),
            Some(&mut sink),
        )
        .unwrap();

        let mut min = f32::INFINITY;
        let expected: Vec<usize> = report
            .epochs
            .iter()
            .filter(|r| {
                let keep = r.valid_loss <= min;
                min = min.min(r.valid_loss);
                keep
            })
            .map(|r| r.epoch)
            .collect();
        let saved: Vec<usize> = sink.saved.iter().map(|(e, _)| *e).collect();
        assert_eq!(saved, expected);
        assert!(sink.saved.iter().all(|(_, name)| name == "best"));
        assert_eq!(saved.first(), Some(&0));
    }

    #[test]
    fn save_all_names_every_epoch() {
        let batches = synthetic_batches(1, 20);
        let cfg = TrainConfig {
            save_mode: SaveMode::All,
            ..fast_config()
        };
        let mut sink = MemorySink { saved: Vec::new() };
        train(
            small_model(),
            &batches,
            &batches,
            &cfg,
            &Default::default(),
            Some(&mut sink),
        )
        .unwrap();
        assert_eq!(sink.saved.len(), 3);
        assert!(sink.saved[1].1.starts_with("epoch001_loss_"));
    }

    #[test]
    fn empty_data_is_rejected() {
        let batches = synthetic_batches(1, 30);
        let r = train(
            small_model(),
            &batches,
            &[],
            &fast_config(),
            &Default::default(),
            None,
        );
        assert!(matches!(r, Err(Error::Domain(_))));
    }

    #[test]
    fn tail_mean_uses_last_entries() {
        let v: Vec<f32> = (0..40).map(|i| i as f32).collect();
        // Mean of 8..=39.
        assert!((tail_mean(&v, 32) - 23.5).abs() < 1e-6);
        assert!((tail_mean(&v[..3], 32) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn recorder_sink_appends_name_to_prefix() {
        let sink = RecorderCheckpointSink::new("/tmp/run/model");
        assert_eq!(sink.path_for("best"), PathBuf::from("/tmp/run/model_best"));
    }

    #[test]
    fn skip_policy_drops_non_finite_batch_from_mean_and_updates() {
        let device: <AD as Backend>::Device = Default::default();
        let batches = batches_with_nan_in_middle();
        let model = nan_model();
        let cfg = TrainConfig {
            non_finite: NonFinitePolicy::Skip,
            ..fast_config()
        };
        // Zero learning rate keeps the parameters fixed, so batch losses can be recomputed.
        let finite_loss = |i: usize| -> f64 {
            let pred = model.predict(&batches[i]);
            let loss = batch_loss(pred, &batches[i], cfg.loss, &cfg.geometry, &device).unwrap();
            scalar(loss) as f64
        };
        let expected = ((finite_loss(0) + finite_loss(2)) / 2.0) as f32;

        let mut optimizer = cfg.adam().init::<AD, NanOnLength<AD>>();
        let mut scheduler = CountingScheduler { lr: 0.0, steps: 0 };
        let (model, mean) =
            train_epoch(model, &batches, &mut optimizer, &mut scheduler, &cfg, 0, &device).unwrap();
        assert_eq!(scheduler.steps, 2);
        assert!(mean.is_finite());
        let tol = 1e-5 * (1.0 + expected.abs());
        assert!((mean - expected).abs() <= tol, "mean={mean} expected={expected}");

        let valid: Vec<AngleBatch<_>> = batches.iter().map(AngleBatch::inner).collect();
        let v = eval_epoch(&model.valid(), &valid, &cfg, 0, &device).unwrap();
        assert!((v - expected).abs() <= tol, "valid={v} expected={expected}");
    }

    #[test]
    fn abort_policy_reports_epoch_and_batch() {
        let device: <AD as Backend>::Device = Default::default();
        let batches = batches_with_nan_in_middle();
        let cfg = TrainConfig {
            non_finite: NonFinitePolicy::Abort,
            ..fast_config()
        };
        let mut optimizer = cfg.adam().init::<AD, NanOnLength<AD>>();
        let mut scheduler = CountingScheduler { lr: 0.0, steps: 0 };
        let r = train_epoch(
            nan_model(),
            &batches,
            &mut optimizer,
            &mut scheduler,
            &cfg,
            7,
            &device,
        );
        assert!(matches!(r, Err(Error::NonFinite { epoch: 7, batch: 1 })));
        assert_eq!(scheduler.steps, 1);

        let valid: Vec<AngleBatch<_>> = batches.iter().map(AngleBatch::inner).collect();
        let r = eval_epoch(&nan_model().valid(), &valid, &cfg, 3, &device);
        assert!(matches!(r, Err(Error::NonFinite { epoch: 3, batch: 1 })));
    }

    #[test]
    fn inner_backend_validation_matches_autodiff_forward() {
        let device: <AD as Backend>::Device = Default::default();
        let batches = synthetic_batches(2, 60);
        let model = small_model();
        let cfg = fast_config();
        let tracked = eval_epoch(&model, &batches, &cfg, 0, &device).unwrap();
        let inner: Vec<AngleBatch<_>> = batches.iter().map(AngleBatch::inner).collect();
        let plain = eval_epoch(&model.valid(), &inner, &cfg, 0, &device).unwrap();
        assert!((tracked - plain).abs() <= 1e-6 * (1.0 + tracked.abs()), "{tracked} vs {plain}");
    }
}
