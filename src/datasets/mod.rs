//! Story/bucket containers and batch assembly. Stories arrive pre-encoded
//! and pre-bucketed (the bAbI text grammar is an external collaborator);
//! this module turns a sampled bucket slice into the dense one-hot tensors
//! the model consumes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::prelude::*;
use ndarray::IxDyn;
use serde::{Deserialize, Serialize};

use crate::configs::{ModelConfig, OutputFormat};

pub mod synthetic;

/// Fixed integer-indexed word mapping, immutable for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocab {
    words: Vec<String>,
}

impl Vocab {
    pub fn from_words<I, S>(words: I) -> Vocab
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Vocab { words: words.into_iter().map(Into::into).collect() }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.words.iter().position(|w| w == word)
    }

    pub fn word(&self, idx: usize) -> &str {
        &self.words[idx]
    }
}

/// Ground-truth answer in the configured output format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    Word(usize),
    Sequence(Vec<usize>),
    Node(usize),
}

/// Ground-truth graph after one sentence, for graph-supervised training.
/// Slot counts must match what the model has materialized at that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceGraph {
    /// Target existence per node slot.
    pub exists: Vec<f32>,
    /// Node id per slot.
    pub ids: Vec<usize>,
    /// (source slot, destination slot, 1-based edge category).
    pub edges: Vec<(usize, usize, usize)>,
    /// Id of the node the sentence is about.
    pub focus: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub sentences: Vec<Vec<usize>>,
    pub query: Vec<usize>,
    pub answer: Answer,
    pub graphs: Option<Vec<SentenceGraph>>,
}

/// Same-shape stories batched together; stories never move between buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub node_count: usize,
    pub stories: Vec<Story>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub words: Vocab,
    pub answers: Vocab,
    pub node_names: Vocab,
    /// Real relation types; "no relation" is implicit.
    pub edge_names: Vocab,
    pub new_nodes_per_iter: usize,
    pub answer_seq_len: usize,
    pub buckets: Vec<Bucket>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Dataset> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        ron::from_str(&text).with_context(|| format!("malformed dataset {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = ron::to_string(self).context("failed to serialize dataset")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write dataset {}", path.display()))?;
        Ok(())
    }
}

/// Answer targets as dense tensors.
pub enum Target {
    Word(Array2<f32>),
    Sequence(Array3<f32>),
    Node(Array2<f32>),
}

/// Per-sentence supervision tensors for one batch.
pub struct GraphTargets {
    pub exists: Array2<f32>,  // [B, N]
    pub ids: Array3<f32>,     // [B, N, I]
    pub edges: ArrayD<f32>,   // [B, N, N, E+1]
    pub focus: Array2<f32>,   // [B, I]
}

/// One sampled minibatch, fully materialized.
pub struct Batch {
    pub size: usize,
    pub node_count: usize,
    /// sentences[t][pos] is the [B, vocab] one-hot for that word position.
    pub sentences: Vec<Vec<Array2<f32>>>,
    pub query: Vec<Array2<f32>>,
    pub target: Target,
    pub graphs: Option<Vec<GraphTargets>>,
}

fn one_hot_block(indices: &[usize], width: usize) -> Result<Array2<f32>> {
    let mut a = Array2::zeros((indices.len(), width));
    for (b, &idx) in indices.iter().enumerate() {
        if idx >= width {
            bail!("index {idx} out of range for width {width}");
        }
        a[[b, idx]] = 1.0;
    }
    Ok(a)
}

/// Builds the dense batch for `picks` out of one bucket.
pub fn make_batch(
    ds: &Dataset,
    bucket: &Bucket,
    picks: &[usize],
    cfg: &ModelConfig,
) -> Result<Batch> {
    if picks.is_empty() {
        bail!("cannot build an empty batch");
    }
    let stories: Vec<&Story> = picks.iter().map(|&i| &bucket.stories[i]).collect();
    let b = stories.len();
    let t_count = stories[0].sentences.len();
    let s_len = stories[0].sentences.first().map_or(0, |s| s.len());
    let q_len = stories[0].query.len();
    for s in &stories {
        if s.sentences.len() != t_count
            || s.sentences.iter().any(|sent| sent.len() != s_len)
            || s.query.len() != q_len
        {
            bail!("bucket contains stories of mismatched shape");
        }
    }

    let vocab = ds.words.len();
    let mut sentences = Vec::with_capacity(t_count);
    for t in 0..t_count {
        let mut positions = Vec::with_capacity(s_len);
        for pos in 0..s_len {
            let idx: Vec<usize> = stories.iter().map(|s| s.sentences[t][pos]).collect();
            positions.push(one_hot_block(&idx, vocab)?);
        }
        sentences.push(positions);
    }
    let mut query = Vec::with_capacity(q_len);
    for pos in 0..q_len {
        let idx: Vec<usize> = stories.iter().map(|s| s.query[pos]).collect();
        query.push(one_hot_block(&idx, vocab)?);
    }

    let target = match cfg.output_format {
        OutputFormat::SingleWord => {
            let idx: Vec<usize> = stories
                .iter()
                .map(|s| match &s.answer {
                    Answer::Word(w) => Ok(*w),
                    other => bail!("expected Word answer, found {other:?}"),
                })
                .collect::<Result<_>>()?;
            Target::Word(one_hot_block(&idx, ds.answers.len())?)
        }
        OutputFormat::Sequence => {
            let mut a = Array3::zeros((b, cfg.answer_seq_len, ds.answers.len()));
            for (bi, s) in stories.iter().enumerate() {
                let words = match &s.answer {
                    Answer::Sequence(ws) => ws,
                    other => bail!("expected Sequence answer, found {other:?}"),
                };
                if words.len() != cfg.answer_seq_len {
                    bail!(
                        "answer sequence length {} != configured {}",
                        words.len(),
                        cfg.answer_seq_len
                    );
                }
                for (step, &w) in words.iter().enumerate() {
                    if w >= ds.answers.len() {
                        bail!("answer word {w} out of range for {} answers", ds.answers.len());
                    }
                    a[[bi, step, w]] = 1.0;
                }
            }
            Target::Sequence(a)
        }
        OutputFormat::NodeSelection => {
            let idx: Vec<usize> = stories
                .iter()
                .map(|s| match &s.answer {
                    Answer::Node(n) => Ok(*n),
                    other => bail!("expected Node answer, found {other:?}"),
                })
                .collect::<Result<_>>()?;
            Target::Node(one_hot_block(&idx, bucket.node_count)?)
        }
    };

    let graphs = if stories.iter().all(|s| s.graphs.is_some()) {
        let num_ids = ds.node_names.len();
        let cats = ds.edge_names.len() + 1;
        let mut per_sentence = Vec::with_capacity(t_count);
        for t in 0..t_count {
            let first = &stories[0].graphs.as_ref().unwrap()[t];
            let n = first.exists.len();
            let mut exists = Array2::zeros((b, n));
            let mut ids = Array3::zeros((b, n, num_ids));
            let mut edges = ArrayD::zeros(IxDyn(&[b, n, n, cats]));
            let mut focus = Array2::zeros((b, num_ids));
            edges.index_axis_mut(Axis(3), 0).fill(1.0);
            for (bi, s) in stories.iter().enumerate() {
                let g = &s.graphs.as_ref().unwrap()[t];
                if g.exists.len() != n || g.ids.len() != n {
                    bail!("bucket contains graphs of mismatched node count");
                }
                for (slot, &e) in g.exists.iter().enumerate() {
                    exists[[bi, slot]] = e;
                    let id = g.ids[slot];
                    if id >= num_ids {
                        bail!("node id {id} out of range for {num_ids} ids");
                    }
                    ids[[bi, slot, id]] = 1.0;
                }
                for &(i, j, cat) in &g.edges {
                    if i >= n || j >= n {
                        bail!("edge endpoint ({i}, {j}) out of range for {n} node slots");
                    }
                    if cat == 0 || cat >= cats {
                        bail!("edge category {cat} out of range 1..{cats}");
                    }
                    edges[[bi, i, j, 0]] = 0.0;
                    edges[[bi, i, j, cat]] = 1.0;
                }
                if g.focus >= num_ids {
                    bail!("focus id {} out of range for {num_ids} ids", g.focus);
                }
                focus[[bi, g.focus]] = 1.0;
            }
            per_sentence.push(GraphTargets { exists, ids, edges, focus });
        }
        Some(per_sentence)
    } else {
        None
    };

    Ok(Batch { size: b, node_count: bucket.node_count, sentences, query, target, graphs })
}
