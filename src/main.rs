use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use ggtnn_lib::configs::{CheckMode, ModelConfig, OutputFormat, TrainConfig};
use ggtnn_lib::datasets::{make_batch, Dataset};
use ggtnn_lib::model::Model;
use ggtnn_lib::train::{Trainer, FINAL_PARAMS_FILE};
use ggtnn_lib::visualize::write_story_dumps;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Word,
    Sequence,
    Node,
}

impl From<FormatArg> for OutputFormat {
    fn from(f: FormatArg) -> OutputFormat {
        match f {
            FormatArg::Word => OutputFormat::SingleWord,
            FormatArg::Sequence => OutputFormat::Sequence,
            FormatArg::Node => OutputFormat::NodeSelection,
        }
    }
}

/// Trains a graph-building reasoning model on a bucketed story dataset.
#[derive(Debug, Parser)]
#[command(name = "ggtnn", version)]
struct Cli {
    /// Dataset file (RON)
    task: PathBuf,

    /// How answers are decoded
    #[arg(value_enum)]
    output_format: FormatArg,

    /// Width of each node's mutable state vector
    #[arg(long, default_value_t = 50)]
    state_width: usize,

    /// Let sentences rewrite existing node states
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    mutable_nodes: bool,

    /// Zero all node states after the story, before the query
    #[arg(long)]
    wipe_node_state: bool,

    /// Materialize nodes on demand instead of one slot per identity
    #[arg(long)]
    dynamic_nodes: bool,

    /// Propagation steps after each sentence (0 disables)
    #[arg(long, default_value_t = 0)]
    propagate_intermediate: usize,

    #[arg(long, default_value = "output")]
    outputdir: PathBuf,

    #[arg(long, default_value_t = 10000)]
    num_updates: usize,

    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    #[arg(long, default_value_t = 0.002)]
    learning_rate: f32,

    /// Held-out dataset to validate against
    #[arg(long)]
    validation: Option<PathBuf>,

    /// Abort on the first non-finite value, naming the offending op
    #[arg(long)]
    check_nan: bool,

    /// check-nan plus per-op value-range traces
    #[arg(long)]
    check_debug: bool,

    /// Dump story visualizations instead of training. Bare flag dumps every
    /// story; BUCKET STORY narrows it to one.
    #[arg(long, num_args = 0..=2, value_names = ["BUCKET", "STORY"])]
    visualize: Option<Vec<usize>>,

    /// Continue from an explicit checkpoint: ITERATION FILE
    #[arg(long, num_args = 2, value_names = ["ITERATION", "FILE"])]
    resume: Option<Vec<String>>,

    /// Continue from the output directory's own progress log
    #[arg(long)]
    resume_auto: bool,
}

fn model_config(cli: &Cli, ds: &Dataset) -> ModelConfig {
    ModelConfig {
        num_input_words: ds.words.len(),
        num_output_words: ds.answers.len(),
        num_node_ids: ds.node_names.len(),
        num_edge_types: ds.edge_names.len(),
        node_state_size: cli.state_width,
        new_nodes_per_iter: ds.new_nodes_per_iter,
        output_format: cli.output_format.into(),
        answer_seq_len: ds.answer_seq_len,
        dynamic_nodes: cli.dynamic_nodes,
        nodes_mutable: cli.mutable_nodes,
        wipe_node_state: cli.wipe_node_state,
        intermediate_propagate: cli.propagate_intermediate,
        check_mode: if cli.check_debug {
            CheckMode::Debug
        } else if cli.check_nan {
            CheckMode::NanCheck
        } else {
            CheckMode::Off
        },
        ..Default::default()
    }
}

fn run(cli: Cli) -> Result<()> {
    let ds = Dataset::load(&cli.task)?;
    let cfg = model_config(&cli, &ds);
    let mut model = Model::new(cfg.clone())?;
    info!(params = model.params.len(), "model built");

    if let Some(spec) = &cli.visualize {
        let targets: Vec<(usize, usize)> = match spec.as_slice() {
            [] => ds
                .buckets
                .iter()
                .enumerate()
                .flat_map(|(bi, b)| (0..b.stories.len()).map(move |s| (bi, s)))
                .collect(),
            [bucket, story] => vec![(*bucket, *story)],
            _ => bail!("--visualize takes no value or BUCKET STORY"),
        };
        let params = cli.outputdir.join(FINAL_PARAMS_FILE);
        if params.exists() {
            model.params.load(&params)?;
            info!(path = %params.display(), "loaded trained parameters");
        } else {
            info!("no trained parameters found, visualizing the initial model");
        }
        for (bucket, story) in targets {
            let picks = [story];
            let bucket_ref = ds.buckets.get(bucket).context("bucket index out of range")?;
            let batch = make_batch(&ds, bucket_ref, &picks, &cfg)?;
            let vis = model.visualize_step(&batch)?;
            write_story_dumps(&cli.outputdir, &ds, bucket, &picks, &vis)?;
        }
        return Ok(());
    }

    let train_cfg = TrainConfig {
        num_updates: cli.num_updates,
        batch_size: cli.batch_size,
        learning_rate: cli.learning_rate,
        outputdir: cli.outputdir.clone(),
        ..Default::default()
    };
    let mut trainer = Trainer::new(model, train_cfg);

    match (&cli.resume, cli.resume_auto) {
        (Some(_), true) => bail!("--resume and --resume-auto are mutually exclusive"),
        (Some(spec), false) => {
            let iteration: usize =
                spec[0].parse().with_context(|| format!("bad resume iteration {:?}", spec[0]))?;
            trainer.resume_from(iteration, &PathBuf::from(&spec[1]))?;
        }
        (None, true) => {
            trainer.resume_auto()?;
        }
        (None, false) => {}
    }

    let validation = cli.validation.as_ref().map(|p| Dataset::load(p)).transpose()?;
    trainer.run(&ds, validation.as_ref())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    run(Cli::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn visualize_accepts_bare_and_targeted_forms() {
        let cli = Cli::try_parse_from(["ggtnn", "task.ron", "word", "--visualize"]).unwrap();
        assert_eq!(cli.visualize, Some(vec![]));
        let cli =
            Cli::try_parse_from(["ggtnn", "task.ron", "word", "--visualize", "1", "3"]).unwrap();
        assert_eq!(cli.visualize, Some(vec![1, 3]));
        let cli = Cli::try_parse_from(["ggtnn", "task.ron", "word"]).unwrap();
        assert_eq!(cli.visualize, None);
    }
}
