//! The update loop: sample a bucket, assemble a batch, take an Adam step,
//! append a progress row, checkpoint on schedule. Interrupted runs pick up
//! where the progress log says they stopped.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::configs::TrainConfig;
use crate::datasets::{make_batch, Dataset};
use crate::model::Model;
use crate::nn::Adam;

pub const PROGRESS_FILE: &str = "data.csv";
pub const FINAL_PARAMS_FILE: &str = "final_params.ron";

/// Append-only CSV of completed iterations. Rows are only written after the
/// parameter update they describe, so the last row is always a safe resume
/// point.
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn open(dir: &Path) -> Result<ProgressLog> {
        let path = dir.join(PROGRESS_FILE);
        if !path.exists() {
            fs::write(&path, "iteration,loss,accuracy\n")
                .with_context(|| format!("failed to create {}", path.display()))?;
        }
        Ok(ProgressLog { path })
    }

    pub fn append(&self, iteration: usize, loss: f32, accuracy: f32) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(f, "{iteration},{loss},{accuracy}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Iteration count of the last completed row, if any row exists.
    pub fn last_iteration(path: &Path) -> Result<Option<usize>> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut lines = text.lines();
        match lines.next() {
            Some(header) if header.trim() == "iteration,loss,accuracy" => {}
            _ => bail!("{} is not a progress log", path.display()),
        }
        let mut last = None;
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let field = line.split(',').next().unwrap_or("");
            let iter: usize = field
                .parse()
                .with_context(|| format!("corrupt progress row {line:?} in {}", path.display()))?;
            last = Some(iter);
        }
        Ok(last)
    }
}

pub struct Trainer {
    pub model: Model,
    pub cfg: TrainConfig,
    opt: Adam,
    start_iteration: usize,
}

impl Trainer {
    pub fn new(model: Model, cfg: TrainConfig) -> Trainer {
        let opt = Adam::new(cfg.learning_rate);
        Trainer { model, cfg, opt, start_iteration: 0 }
    }

    pub fn start_iteration(&self) -> usize {
        self.start_iteration
    }

    /// Resumes from explicit parameters, continuing after `iteration`.
    pub fn resume_from(&mut self, iteration: usize, params: &Path) -> Result<()> {
        self.model.params.load(params)?;
        self.start_iteration = iteration;
        info!(iteration, params = %params.display(), "resumed from checkpoint");
        Ok(())
    }

    /// Resumes from the output directory's own progress log and final
    /// parameter snapshot. A directory without a log starts fresh; a log
    /// without matching parameters is an error.
    pub fn resume_auto(&mut self) -> Result<bool> {
        let csv = self.cfg.outputdir.join(PROGRESS_FILE);
        if !csv.exists() {
            return Ok(false);
        }
        let last = ProgressLog::last_iteration(&csv)?
            .with_context(|| format!("{} holds no completed iterations", csv.display()))?;
        let params = self.cfg.outputdir.join(FINAL_PARAMS_FILE);
        self.model
            .params
            .load(&params)
            .with_context(|| format!("progress log ends at iteration {last} but parameters failed to load"))?;
        self.start_iteration = last;
        info!(iteration = last, "auto-resumed");
        Ok(true)
    }

    /// Runs updates `start+1 ..= num_updates`, validating on `valid` when
    /// given (otherwise on held-in training batches).
    pub fn run(&mut self, ds: &Dataset, valid: Option<&Dataset>) -> Result<()> {
        fs::create_dir_all(&self.cfg.outputdir)
            .with_context(|| format!("failed to create {}", self.cfg.outputdir.display()))?;
        let log = ProgressLog::open(&self.cfg.outputdir)?;
        // offset the stream so a resumed run does not replay old batches
        let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(self.start_iteration as u64));

        let mut last_accuracy = 0.0;
        for iteration in self.start_iteration + 1..=self.cfg.num_updates {
            self.run_update(ds, valid, &log, &mut rng, iteration, &mut last_accuracy)?;
        }
        Ok(())
    }

    /// One complete update: train, validate on schedule, snapshot the
    /// parameters, and only then log the row. The snapshot-before-row order
    /// is what makes the last row a safe resume point after a crash.
    fn run_update(
        &mut self,
        ds: &Dataset,
        valid: Option<&Dataset>,
        log: &ProgressLog,
        rng: &mut StdRng,
        iteration: usize,
        last_accuracy: &mut f32,
    ) -> Result<()> {
        let batch = sample_batch(ds, rng, self.cfg.batch_size, &self.model.cfg)?;
        let loss = self.model.train_step(&batch, &mut self.opt, self.cfg.grad_clip)?;

        if self.cfg.validate_every > 0 && iteration % self.cfg.validate_every == 0 {
            let source = valid.unwrap_or(ds);
            let vbatch = sample_batch(source, rng, self.cfg.batch_size, &self.model.cfg)?;
            let eval = self.model.eval_step(&vbatch)?;
            *last_accuracy = eval.accuracy;
            info!(iteration, loss, val_loss = eval.loss, accuracy = eval.accuracy, "validated");
        } else {
            info!(iteration, loss, "step");
        }

        self.model.params.save(&self.cfg.outputdir.join(FINAL_PARAMS_FILE))?;
        log.append(iteration, loss, *last_accuracy)?;

        if self.cfg.checkpoint_every > 0 && iteration % self.cfg.checkpoint_every == 0 {
            let snap = self.cfg.outputdir.join(format!("params-{iteration}.ron"));
            self.model.params.save(&snap)?;
            info!(iteration, path = %snap.display(), "checkpointed");
        }
        Ok(())
    }
}

fn sample_batch(
    ds: &Dataset,
    rng: &mut StdRng,
    batch_size: usize,
    cfg: &crate::configs::ModelConfig,
) -> Result<crate::datasets::Batch> {
    if ds.buckets.is_empty() {
        bail!("dataset has no buckets");
    }
    let bucket = &ds.buckets[rng.gen_range(0..ds.buckets.len())];
    if bucket.stories.is_empty() {
        bail!("sampled an empty bucket");
    }
    let picks: Vec<usize> =
        (0..batch_size).map(|_| rng.gen_range(0..bucket.stories.len())).collect();
    make_batch(ds, bucket, &picks, cfg)
}
