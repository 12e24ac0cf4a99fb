//! Dumps per-story graph evolution to disk: one RON file per story holding
//! the graph after every sentence, the post-query graph, and the predicted
//! versus expected answer.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::datasets::{Answer, Dataset};
use crate::model::{output::Snapped, GraphSnapshot, Visualization};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDump {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorDump {
    fn from_view(a: ArrayViewD<f32>) -> TensorDump {
        TensorDump { shape: a.shape().to_vec(), data: a.iter().copied().collect() }
    }
}

/// One graph state, for a single story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDump {
    pub strength: TensorDump,
    pub ids: TensorDump,
    pub state: TensorDump,
    pub edges: TensorDump,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryDump {
    pub bucket: usize,
    pub story: usize,
    /// Graph after each sentence, then after query injection and final
    /// propagation.
    pub steps: Vec<GraphDump>,
    pub answer: TensorDump,
    pub predicted: Vec<usize>,
    pub expected: Vec<usize>,
}

fn slice_story(snap: &GraphSnapshot, b: usize) -> GraphDump {
    GraphDump {
        strength: TensorDump::from_view(snap.strength.index_axis(Axis(0), b)),
        ids: TensorDump::from_view(snap.ids.index_axis(Axis(0), b)),
        state: TensorDump::from_view(snap.state.index_axis(Axis(0), b)),
        edges: TensorDump::from_view(snap.edges.index_axis(Axis(0), b)),
    }
}

fn predicted_for(snapped: &Snapped, b: usize) -> Vec<usize> {
    match snapped {
        Snapped::Word(picks) | Snapped::Node(picks) => vec![picks[b]],
        Snapped::Sequence(seqs) => seqs[b].clone(),
    }
}

fn expected_for(answer: &Answer) -> Vec<usize> {
    match answer {
        Answer::Word(w) => vec![*w],
        Answer::Node(n) => vec![*n],
        Answer::Sequence(ws) => ws.clone(),
    }
}

/// Writes one `story_<bucket>_<index>.ron` per visualized story and returns
/// the written paths.
pub fn write_story_dumps(
    dir: &Path,
    ds: &Dataset,
    bucket: usize,
    picks: &[usize],
    vis: &Visualization,
) -> Result<Vec<PathBuf>> {
    let stories = &ds.buckets.get(bucket).context("bucket index out of range")?.stories;
    if vis.answer.shape().first() != Some(&picks.len()) {
        bail!("visualization batch does not match the requested stories");
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut written = Vec::with_capacity(picks.len());
    for (b, &pick) in picks.iter().enumerate() {
        let story = stories.get(pick).context("story index out of range")?;
        let dump = StoryDump {
            bucket,
            story: pick,
            steps: vis.snapshots.iter().map(|s| slice_story(s, b)).collect(),
            answer: TensorDump::from_view(vis.answer.index_axis(Axis(0), b)),
            predicted: predicted_for(&vis.snapped, b),
            expected: expected_for(&story.answer),
        };
        let path = dir.join(format!("story_{bucket}_{pick}.ron"));
        let text = ron::to_string(&dump).context("failed to serialize story dump")?;
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "wrote story dump");
        written.push(path);
    }
    Ok(written)
}
