//! The full reasoning model: sentence-by-sentence graph construction,
//! query injection, final propagation and decoding, with the combined
//! graph-supervision and answer losses built on the same tape.

use anyhow::{bail, Result};
use ndarray::prelude::*;

use crate::configs::ModelConfig;
use crate::datasets::{Batch, GraphTargets, Target};
use crate::graph::{GraphReadout, GraphState, GraphStateSpec};
use crate::nn::ops;
use crate::nn::{Adam, GruCell, ParamSet, Tape, Var};

pub mod edges;
pub mod input;
pub mod output;
pub mod propagate;
pub mod propose;

use edges::EdgeProposal;
use input::SequenceEncoder;
use output::{Decoder, Snapped};
use propagate::Propagation;
use propose::NodeProposal;

/// Host-side copy of one graph state, taken after a sentence was absorbed.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub strength: ArrayD<f32>,
    pub ids: ArrayD<f32>,
    pub state: ArrayD<f32>,
    pub edges: ArrayD<f32>,
}

/// Everything one forward pass produces.
pub struct Forward {
    pub loss: Var,
    pub answer: Var,
    pub snapshots: Vec<GraphSnapshot>,
}

pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
    pub answer: ArrayD<f32>,
}

pub struct Visualization {
    pub loss: f32,
    pub snapshots: Vec<GraphSnapshot>,
    pub answer: ArrayD<f32>,
    pub snapped: Snapped,
}

pub struct Model {
    pub cfg: ModelConfig,
    pub spec: GraphStateSpec,
    pub params: ParamSet,
    sentence_enc: SequenceEncoder,
    query_enc: SequenceEncoder,
    propose: NodeProposal,
    edges: EdgeProposal,
    propagate: Propagation,
    readout_propose: GraphReadout,
    readout_output: GraphReadout,
    query_gru: GruCell,
    decoder: Decoder,
}

impl Model {
    pub fn new(cfg: ModelConfig) -> Result<Model> {
        cfg.validate()?;
        let spec = GraphStateSpec {
            num_node_ids: cfg.num_node_ids,
            node_state_width: cfg.node_state_size,
            num_edge_types: cfg.num_edge_types,
        };
        let mut ps = ParamSet::new();
        let sentence_enc =
            SequenceEncoder::new(&mut ps, "input.sentence", cfg.num_input_words, cfg.input_repr_size);
        let query_enc =
            SequenceEncoder::new(&mut ps, "input.query", cfg.num_input_words, cfg.input_repr_size);
        let propose = NodeProposal::new(&mut ps, &cfg, &spec);
        let edges = EdgeProposal::new(&mut ps, &cfg, &spec);
        let propagate = Propagation::new(&mut ps, &cfg, &spec);
        let readout_propose =
            GraphReadout::new(&mut ps, "readout.propose", &spec, cfg.propose_repr_size);
        let readout_output =
            GraphReadout::new(&mut ps, "readout.output", &spec, cfg.output_repr_size);
        let query_gru =
            GruCell::new(&mut ps, "query.gru", cfg.input_repr_size, cfg.node_state_size);
        let decoder = Decoder::new(&mut ps, &cfg, &spec);
        Ok(Model {
            cfg,
            spec,
            params: ps,
            sentence_enc,
            query_enc,
            propose,
            edges,
            propagate,
            readout_propose,
            readout_output,
            query_gru,
            decoder,
        })
    }

    /// Writes the query representation into every node's state through a
    /// shared GRU step, so the final propagation runs query-conditioned.
    fn inject_query(&self, tape: &mut Tape, graph: GraphState, query: Var) -> Result<GraphState> {
        let (b, n) = (graph.batch, graph.nodes);
        if n == 0 {
            return Ok(graph);
        }
        let q = ops::tile_new(tape, query, 1, n)?;
        let q = ops::reshape(tape, q, &[b * n, self.cfg.input_repr_size])?;
        let h = ops::reshape(tape, graph.state, &[b * n, self.cfg.node_state_size])?;
        let h = self.query_gru.step(tape, &self.params, q, h)?;
        let h = ops::reshape(tape, h, &[b, n, self.cfg.node_state_size])?;
        let gate = tape.ones(&[b, n]);
        graph.update_states(tape, h, gate)
    }

    /// Supervision terms for one sentence's resulting graph, all scalar.
    fn graph_loss(
        &self,
        tape: &mut Tape,
        graph: &GraphState,
        gt: &GraphTargets,
        sentence: usize,
    ) -> Result<Var> {
        let b = graph.batch;
        if gt.exists.shape()[1] != graph.nodes {
            bail!(
                "sentence {sentence}: ground truth names {} node slots but the graph holds {}",
                gt.exists.shape()[1],
                graph.nodes
            );
        }
        let exists = tape.constant(gt.exists.clone().into_dyn());
        let strength_loss = ops::binary_cross_entropy(tape, graph.strength, exists)?;

        // id cross-entropy, counted only where the node should exist
        let gt_ids = tape.constant(gt.ids.clone().into_dyn());
        let lp = ops::log_eps(tape, graph.ids, ops::LOG_EPS)?;
        let m = ops::mul(tape, lp, gt_ids)?;
        let per_node = ops::sum_axis(tape, m, 2)?;
        let masked = ops::mul(tape, per_node, exists)?;
        let s = ops::sum_all(tape, masked)?;
        let id_loss = ops::scale(tape, s, -1.0 / b as f32)?;

        // edge cross-entropy, masked by pairwise target existence
        let gt_edges = tape.constant(gt.edges.clone());
        let lp = ops::log_eps(tape, graph.edges, ops::LOG_EPS)?;
        let m = ops::mul(tape, lp, gt_edges)?;
        let per_pair = ops::sum_axis(tape, m, 3)?;
        let n = graph.nodes;
        let mut pair = Array3::<f32>::zeros((b, n, n));
        for bi in 0..b {
            for i in 0..n {
                for j in 0..n {
                    pair[[bi, i, j]] = gt.exists[[bi, i]] * gt.exists[[bi, j]];
                }
            }
        }
        let pair = tape.constant(pair.into_dyn());
        let masked = ops::mul(tape, per_pair, pair)?;
        let s = ops::sum_all(tape, masked)?;
        let edge_loss = ops::scale(tape, s, -1.0 / b as f32)?;

        // the focus node must be findable by identity
        let focus = tape.constant(gt.focus.clone().into_dyn());
        let found = graph.best_match(tape, focus, self.cfg.best_node_match_only)?;
        let lm = ops::log_eps(tape, found, ops::LOG_EPS)?;
        let s = ops::sum_all(tape, lm)?;
        let focus_loss = ops::scale(tape, s, -1.0 / b as f32)?;

        let mut total = ops::add(tape, strength_loss, id_loss)?;
        total = ops::add(tape, total, edge_loss)?;
        ops::add(tape, total, focus_loss)
    }

    pub fn forward(&self, tape: &mut Tape, batch: &Batch, snapshots: bool) -> Result<Forward> {
        let ps = &self.params;
        let b = batch.size;

        let mut graph = if self.cfg.dynamic_nodes {
            GraphState::empty(tape, &self.spec, b)
        } else {
            GraphState::with_static_nodes(tape, &self.spec, b)
        };

        let mut loss_terms: Vec<Var> = Vec::new();
        let mut snaps = Vec::new();
        for (t, sentence) in batch.sentences.iter().enumerate() {
            let sent = self.sentence_enc.encode(tape, ps, sentence, b)?;
            let pooled = self.readout_propose.forward(tape, ps, &graph)?;
            graph = self.propose.apply(tape, ps, &self.spec, graph, sent, pooled)?;
            graph = self.edges.apply(tape, ps, graph, sent)?;
            if self.cfg.intermediate_propagate > 0 {
                graph = self.propagate.run(tape, ps, graph, self.cfg.intermediate_propagate)?;
            }
            if self.cfg.train_with_graph {
                if let Some(gts) = &batch.graphs {
                    loss_terms.push(self.graph_loss(tape, &graph, &gts[t], t)?);
                }
            }
            if snapshots {
                snaps.push(self.snapshot(tape, &graph));
            }
        }

        if self.cfg.wipe_node_state {
            graph = graph.wipe_state(tape, &self.spec);
        }

        let query = self.query_enc.encode(tape, ps, &batch.query, b)?;
        graph = self.inject_query(tape, graph, query)?;
        graph = self.propagate.run(tape, ps, graph, self.cfg.final_propagate)?;
        if snapshots {
            snaps.push(self.snapshot(tape, &graph));
        }

        let pooled = self.readout_output.forward(tape, ps, &graph)?;
        let answer = self.decoder.decode(tape, ps, &graph, pooled)?;

        if self.cfg.train_with_query {
            let target = match &batch.target {
                Target::Word(t) => tape.constant(t.clone().into_dyn()),
                Target::Sequence(t) => tape.constant(t.clone().into_dyn()),
                Target::Node(t) => {
                    // the decoded distribution runs over whatever nodes the
                    // graph materialized, which under dynamic growth need not
                    // line up with the bucket's slot count
                    if t.shape()[1] != graph.nodes {
                        bail!(
                            "node answer target names {} slots but the graph holds {}",
                            t.shape()[1],
                            graph.nodes
                        );
                    }
                    tape.constant(t.clone().into_dyn())
                }
            };
            loss_terms.push(ops::cross_entropy(tape, answer, target)?);
        }

        let mut loss = match loss_terms.first() {
            Some(&first) => first,
            None => bail!("graph-supervised training requires ground-truth graphs in the batch"),
        };
        for &term in &loss_terms[1..] {
            loss = ops::add(tape, loss, term)?;
        }
        Ok(Forward { loss, answer, snapshots: snaps })
    }

    fn snapshot(&self, tape: &Tape, graph: &GraphState) -> GraphSnapshot {
        GraphSnapshot {
            strength: tape.value(graph.strength).clone(),
            ids: tape.value(graph.ids).clone(),
            state: tape.value(graph.state).clone(),
            edges: tape.value(graph.edges).clone(),
        }
    }

    /// One optimization step; returns the batch loss.
    pub fn train_step(&mut self, batch: &Batch, opt: &mut Adam, grad_clip: f32) -> Result<f32> {
        let mut tape = Tape::new(self.cfg.check_mode);
        let fwd = self.forward(&mut tape, batch, false)?;
        let loss = scalar(tape.value(fwd.loss));
        self.params.zero_grads();
        tape.backward(fwd.loss)?;
        tape.grads_into(&mut self.params);
        if grad_clip > 0.0 {
            let norm = self.params.grad_norm();
            if norm > grad_clip {
                self.params.scale_grads(grad_clip / norm);
            }
        }
        opt.step(&mut self.params);
        Ok(loss)
    }

    /// Loss and exact-answer accuracy without touching the parameters.
    pub fn eval_step(&self, batch: &Batch) -> Result<Evaluation> {
        let mut tape = Tape::new(self.cfg.check_mode);
        let fwd = self.forward(&mut tape, batch, false)?;
        let answer = tape.value(fwd.answer).clone();
        let accuracy = self.accuracy(&answer, batch);
        Ok(Evaluation { loss: scalar(tape.value(fwd.loss)), accuracy, answer })
    }

    /// Forward pass that keeps per-sentence graph snapshots.
    pub fn visualize_step(&self, batch: &Batch) -> Result<Visualization> {
        let mut tape = Tape::new(self.cfg.check_mode);
        let fwd = self.forward(&mut tape, batch, true)?;
        let answer = tape.value(fwd.answer).clone();
        let snapped = self.decoder.snap_to_best(&answer);
        Ok(Visualization {
            loss: scalar(tape.value(fwd.loss)),
            snapshots: fwd.snapshots,
            answer,
            snapped,
        })
    }

    pub fn snap(&self, answer: &ArrayD<f32>) -> Snapped {
        self.decoder.snap_to_best(answer)
    }

    fn accuracy(&self, answer: &ArrayD<f32>, batch: &Batch) -> f32 {
        let correct = match (self.decoder.snap_to_best(answer), &batch.target) {
            (Snapped::Word(picks), Target::Word(t)) => {
                picks.iter().enumerate().filter(|&(b, &p)| t[[b, p]] > 0.5).count()
            }
            (Snapped::Node(picks), Target::Node(t)) => {
                picks.iter().enumerate().filter(|&(b, &p)| t[[b, p]] > 0.5).count()
            }
            (Snapped::Sequence(seqs), Target::Sequence(t)) => seqs
                .iter()
                .enumerate()
                .filter(|(b, seq)| {
                    seq.iter().enumerate().all(|(step, &p)| t[[*b, step, p]] > 0.5)
                })
                .count(),
            _ => 0,
        };
        correct as f32 / batch.size as f32
    }
}

fn scalar(v: &ArrayD<f32>) -> f32 {
    v.iter().copied().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::OutputFormat;
    use crate::datasets::{make_batch, synthetic};
    use crate::nn::Adam;

    fn small_cfg(ds: &crate::datasets::Dataset) -> ModelConfig {
        ModelConfig {
            num_input_words: ds.words.len(),
            num_output_words: ds.answers.len(),
            num_node_ids: ds.node_names.len(),
            num_edge_types: ds.edge_names.len(),
            node_state_size: 10,
            input_repr_size: 12,
            output_repr_size: 12,
            propose_repr_size: 8,
            propagate_repr_size: 8,
            final_propagate: 2,
            ..Default::default()
        }
    }

    #[test]
    fn forward_produces_finite_scalar_loss() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let cfg = small_cfg(&ds);
        let model = Model::new(cfg.clone()).unwrap();
        let batch = make_batch(&ds, &ds.buckets[0], &[0, 3], &cfg).unwrap();
        let mut tape = Tape::new(cfg.check_mode);
        let fwd = model.forward(&mut tape, &batch, false).unwrap();
        let loss = scalar(tape.value(fwd.loss));
        assert!(loss.is_finite());
        assert!(loss > 0.0);
        assert_eq!(tape.value(fwd.answer).shape(), &[2, ds.answers.len()]);
    }

    #[test]
    fn train_step_changes_parameters() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let cfg = small_cfg(&ds);
        let mut model = Model::new(cfg.clone()).unwrap();
        let before: Vec<_> = model.params.iter().map(|p| p.w.clone()).collect();
        let batch = make_batch(&ds, &ds.buckets[0], &[0, 1, 2], &cfg).unwrap();
        let mut opt = Adam::new(0.01);
        let loss = model.train_step(&batch, &mut opt, 5.0).unwrap();
        assert!(loss.is_finite());
        let changed = model
            .params
            .iter()
            .zip(before.iter())
            .any(|(p, w)| p.w.iter().zip(w.iter()).any(|(a, b)| (a - b).abs() > 1e-8));
        assert!(changed, "optimizer step left every parameter untouched");
    }

    #[test]
    fn eval_step_reports_accuracy_in_range() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let cfg = small_cfg(&ds);
        let model = Model::new(cfg.clone()).unwrap();
        let batch = make_batch(&ds, &ds.buckets[0], &[0, 1, 2, 3], &cfg).unwrap();
        let eval = model.eval_step(&batch).unwrap();
        assert!(eval.loss.is_finite());
        assert!((0.0..=1.0).contains(&eval.accuracy));
        assert_eq!(eval.answer.shape(), &[4, ds.answers.len()]);
    }

    #[test]
    fn visualize_step_snapshots_every_sentence_plus_final() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let cfg = small_cfg(&ds);
        let model = Model::new(cfg.clone()).unwrap();
        let batch = make_batch(&ds, &ds.buckets[0], &[0], &cfg).unwrap();
        let vis = model.visualize_step(&batch).unwrap();
        // one sentence, so one mid-story snapshot and the post-query one
        assert_eq!(vis.snapshots.len(), 2);
        let snap = &vis.snapshots[0];
        assert_eq!(snap.strength.shape(), &[1, 5]);
        assert_eq!(snap.edges.shape(), &[1, 5, 5, 2]);
    }

    #[test]
    fn graph_loss_rejects_mismatched_slot_counts() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let mut cfg = small_cfg(&ds);
        // dynamic regime appends 2 slots per sentence; the static ground
        // truth names 5, which cannot line up
        cfg.dynamic_nodes = true;
        cfg.new_nodes_per_iter = 2;
        let model = Model::new(cfg.clone()).unwrap();
        let batch = make_batch(&ds, &ds.buckets[0], &[0], &cfg).unwrap();
        let mut tape = Tape::new(cfg.check_mode);
        assert!(model.forward(&mut tape, &batch, false).is_err());
    }

    #[test]
    fn node_answer_rejects_mismatched_slot_counts() {
        let ds = synthetic::where_is_task(OutputFormat::NodeSelection);
        let mut cfg = small_cfg(&ds);
        cfg.output_format = OutputFormat::NodeSelection;
        cfg.dynamic_nodes = true;
        cfg.new_nodes_per_iter = 2;
        // answer supervision only, so the mismatch reaches the decoder
        cfg.train_with_graph = false;
        let model = Model::new(cfg.clone()).unwrap();
        // one sentence appends 2 nodes; the target spans the bucket's 5 slots
        let batch = make_batch(&ds, &ds.buckets[0], &[0], &cfg).unwrap();
        let mut tape = Tape::new(cfg.check_mode);
        let err = model.forward(&mut tape, &batch, false);
        assert!(err.is_err());
    }

    #[test]
    fn query_only_training_works_without_graphs() {
        let ds = synthetic::where_is_task(OutputFormat::SingleWord);
        let mut cfg = small_cfg(&ds);
        cfg.train_with_graph = false;
        let model = Model::new(cfg.clone()).unwrap();
        let batch = make_batch(&ds, &ds.buckets[0], &[0, 1], &cfg).unwrap();
        let mut tape = Tape::new(cfg.check_mode);
        let fwd = model.forward(&mut tape, &batch, false).unwrap();
        assert!(scalar(tape.value(fwd.loss)).is_finite());
    }
}
