// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Concept graph for one dream cycle.
//!
//! An arena of [`ConceptNode`]s with index-based adjacency, rebuilt from the
//! store at the start of every cycle and dropped at its end. Nodes are
//! patterns; an edge joins two patterns that were associated with the same
//! experience, weighted by co-occurrence count normalized to the strongest
//! edge. Merged nodes stay in the arena marked dead so indices never shift.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::experience::{Experience, TaskOutcome};
use super::pattern::{cosine_similarity, ActionBinding, Pattern, PatternId, Polarity};
use super::qe_domain::QeDomain;

#[derive(Debug, Clone)]
pub struct ConceptNode {
    pub pattern_id: PatternId,
    pub domain: QeDomain,
    pub embedding: Vec<f32>,
    pub confidence: f64,
    pub polarity: Polarity,
    pub binding: Option<ActionBinding>,
    /// Clamped to [0, 1]
    pub activation: f64,
    pub successes: u32,
    pub failures: u32,
    /// Patterns folded into this node, itself first
    pub members: Vec<PatternId>,
    alive: bool,
}

impl ConceptNode {
    fn from_pattern(pattern: Pattern) -> Self {
        Self {
            pattern_id: pattern.id,
            domain: pattern.domain,
            confidence: pattern.confidence,
            polarity: pattern.polarity,
            binding: pattern.binding,
            members: vec![pattern.id],
            embedding: pattern.embedding,
            activation: 0.0,
            successes: 0,
            failures: 0,
            alive: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn observations(&self) -> u32 {
        self.successes + self.failures
    }

    pub fn failure_ratio(&self) -> f64 {
        match self.observations() {
            0 => 0.0,
            n => self.failures as f64 / n as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConceptEdge {
    pub co_occurrences: u32,
    /// `co_occurrences / max co_occurrences`, in (0, 1]
    pub weight: f64,
}

/// One near-duplicate fold performed by [`ConceptGraph::merge_near_duplicates`]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMerge {
    pub representative: PatternId,
    pub absorbed: PatternId,
    pub domain: QeDomain,
    pub similarity: f64,
}

/// A pair of co-activated nodes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoActivation {
    pub a: usize,
    pub b: usize,
    pub co_activation: f64,
    pub edge: Option<ConceptEdge>,
}

#[derive(Debug, Default)]
pub struct ConceptGraph {
    nodes: Vec<ConceptNode>,
    adjacency: Vec<BTreeMap<usize, ConceptEdge>>,
    by_pattern: HashMap<PatternId, usize>,
    by_binding: HashMap<(QeDomain, ActionBinding), Vec<usize>>,
}

impl ConceptGraph {
    /// Build nodes from `patterns` and co-occurrence edges from `experiences`
    pub fn build(patterns: impl IntoIterator<Item = Pattern>, experiences: &[Experience]) -> Self {
        let mut graph = ConceptGraph::default();
        for pattern in patterns {
            graph.add_node(pattern);
        }

        for experience in experiences {
            let associated = graph.associated(experience);
            for (i, &a) in associated.iter().enumerate() {
                for &b in &associated[i + 1..] {
                    graph.bump_edge(a, b);
                }
            }
        }
        graph.normalize_weights();
        graph
    }

    fn add_node(&mut self, pattern: Pattern) {
        if self.by_pattern.contains_key(&pattern.id) {
            return;
        }
        let ix = self.nodes.len();
        if let Some(binding) = &pattern.binding {
            self.by_binding
                .entry((pattern.domain, binding.clone()))
                .or_default()
                .push(ix);
        }
        self.by_pattern.insert(pattern.id, ix);
        self.nodes.push(ConceptNode::from_pattern(pattern));
        self.adjacency.push(BTreeMap::new());
    }

    fn bump_edge(&mut self, a: usize, b: usize) {
        for (from, to) in [(a, b), (b, a)] {
            let edge = self.adjacency[from].entry(to).or_insert(ConceptEdge {
                co_occurrences: 0,
                weight: 0.0,
            });
            edge.co_occurrences += 1;
        }
    }

    fn normalize_weights(&mut self) {
        let max = self
            .adjacency
            .iter()
            .flat_map(|edges| edges.values())
            .map(|e| e.co_occurrences)
            .max()
            .unwrap_or(0);
        if max == 0 {
            return;
        }
        for edges in &mut self.adjacency {
            for edge in edges.values_mut() {
                edge.weight = edge.co_occurrences as f64 / max as f64;
            }
        }
    }

    /// Live node indices associated with an experience, sorted and unique
    pub fn associated(&self, experience: &Experience) -> Vec<usize> {
        let mut found = BTreeSet::new();
        for id in &experience.used_patterns {
            if let Some(&ix) = self.by_pattern.get(id) {
                found.insert(ix);
            }
        }
        for step in &experience.trajectory {
            let key = (
                experience.domain,
                ActionBinding::new(step.state_key.clone(), step.action_key.clone()),
            );
            if let Some(ixs) = self.by_binding.get(&key) {
                found.extend(ixs.iter().copied());
            }
        }
        found.into_iter().filter(|&ix| self.nodes[ix].alive).collect()
    }

    /// Re-apply one experience: activate its nodes and tally the outcome.
    /// Returns the number of nodes touched.
    pub fn replay(&mut self, experience: &Experience, boost: f64) -> usize {
        if !experience.is_learnable() {
            return 0;
        }
        let success = matches!(experience.outcome, Some(TaskOutcome::Success));
        let touched = self.associated(experience);
        for &ix in &touched {
            let node = &mut self.nodes[ix];
            node.activation = (node.activation + boost).clamp(0.0, 1.0);
            if success {
                node.successes += 1;
            } else {
                node.failures += 1;
            }
        }
        touched.len()
    }

    /// Fold same-domain, same-polarity nodes at or above `threshold` cosine
    /// similarity into the more confident one.
    pub fn merge_near_duplicates(&mut self, threshold: f64) -> Vec<NodeMerge> {
        let mut merges = Vec::new();
        for i in 0..self.nodes.len() {
            for j in (i + 1)..self.nodes.len() {
                if !self.nodes[i].alive {
                    break;
                }
                if !self.nodes[j].alive
                    || self.nodes[i].domain != self.nodes[j].domain
                    || self.nodes[i].polarity != self.nodes[j].polarity
                {
                    continue;
                }
                let similarity = cosine_similarity(&self.nodes[i].embedding, &self.nodes[j].embedding);
                if similarity < threshold {
                    continue;
                }
                let (keep, drop) = if self.outranks(j, i) { (j, i) } else { (i, j) };
                merges.push(NodeMerge {
                    representative: self.nodes[keep].pattern_id,
                    absorbed: self.nodes[drop].pattern_id,
                    domain: self.nodes[keep].domain,
                    similarity,
                });
                self.fold(keep, drop);
            }
        }
        merges
    }

    fn outranks(&self, a: usize, b: usize) -> bool {
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        na.confidence > nb.confidence || (na.confidence == nb.confidence && na.pattern_id < nb.pattern_id)
    }

    fn fold(&mut self, keep: usize, drop: usize) {
        let dropped_edges = std::mem::take(&mut self.adjacency[drop]);
        self.adjacency[keep].remove(&drop);
        for (other, edge) in dropped_edges {
            self.adjacency[other].remove(&drop);
            if other == keep {
                continue;
            }
            for (from, to) in [(keep, other), (other, keep)] {
                let merged = self.adjacency[from].entry(to).or_insert(ConceptEdge {
                    co_occurrences: 0,
                    weight: 0.0,
                });
                merged.co_occurrences += edge.co_occurrences;
                merged.weight = merged.weight.max(edge.weight);
            }
        }

        let absorbed = std::mem::take(&mut self.nodes[drop].members);
        let (activation, successes, failures, confidence) = {
            let d = &self.nodes[drop];
            (d.activation, d.successes, d.failures, d.confidence)
        };
        for id in &absorbed {
            self.by_pattern.insert(*id, keep);
        }
        for ixs in self.by_binding.values_mut() {
            for ix in ixs.iter_mut() {
                if *ix == drop {
                    *ix = keep;
                }
            }
            ixs.sort_unstable();
            ixs.dedup();
        }

        let node = &mut self.nodes[keep];
        node.members.extend(absorbed);
        node.activation = node.activation.max(activation);
        node.successes += successes;
        node.failures += failures;
        node.confidence = node.confidence.max(confidence);
        self.nodes[drop].alive = false;
    }

    /// Spreading activation: each iteration every node passes
    /// `activation × spread_factor × weight` to its neighbours, then all
    /// activations decay by `decay` and are clamped to [0, 1].
    pub fn spread(&mut self, iterations: usize, spread_factor: f64, decay: f64) {
        for _ in 0..iterations {
            let current: Vec<f64> = self.nodes.iter().map(|n| n.activation).collect();
            let mut next = current.clone();
            for (from, edges) in self.adjacency.iter().enumerate() {
                if !self.nodes[from].alive || current[from] == 0.0 {
                    continue;
                }
                for (&to, edge) in edges {
                    next[to] += current[from] * spread_factor * edge.weight;
                }
            }
            for (node, value) in self.nodes.iter_mut().zip(next) {
                if node.alive {
                    node.activation = (value * (1.0 - decay)).clamp(0.0, 1.0);
                }
            }
        }
    }

    /// Co-activated pairs without a direct edge that share a neighbour
    pub fn novel_pairs(&self, threshold: f64) -> Vec<CoActivation> {
        let mut pairs = BTreeSet::new();
        for (a, node) in self.live_nodes() {
            if node.activation < threshold {
                continue;
            }
            for &middle in self.adjacency[a].keys() {
                for &b in self.adjacency[middle].keys() {
                    if b <= a || self.adjacency[a].contains_key(&b) {
                        continue;
                    }
                    let other = &self.nodes[b];
                    if other.alive && other.activation >= threshold {
                        pairs.insert((a, b));
                    }
                }
            }
        }
        pairs
            .into_iter()
            .map(|(a, b)| CoActivation {
                a,
                b,
                co_activation: self.nodes[a].activation.min(self.nodes[b].activation),
                edge: None,
            })
            .collect()
    }

    /// Co-activated pairs joined by an edge of at least `min_weight`
    pub fn correlated_pairs(&self, threshold: f64, min_weight: f64) -> Vec<CoActivation> {
        let mut pairs = Vec::new();
        for (a, node) in self.live_nodes() {
            if node.activation < threshold {
                continue;
            }
            for (&b, edge) in self.adjacency[a].range((a + 1)..) {
                let other = &self.nodes[b];
                if other.alive && other.activation >= threshold && edge.weight >= min_weight {
                    pairs.push(CoActivation {
                        a,
                        b,
                        co_activation: node.activation.min(other.activation),
                        edge: Some(*edge),
                    });
                }
            }
        }
        pairs
    }

    /// Nodes whose activation z-score exceeds `z_threshold`, as `(index, z)`
    pub fn anomalies(&self, z_threshold: f64) -> Vec<(usize, f64)> {
        let values: Vec<(usize, f64)> = self.live_nodes().map(|(ix, n)| (ix, n.activation)).collect();
        if values.len() < 3 {
            return Vec::new();
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|(_, a)| a).sum::<f64>() / n;
        let variance = values.iter().map(|(_, a)| (a - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        if std_dev <= f64::EPSILON {
            return Vec::new();
        }
        values
            .into_iter()
            .map(|(ix, a)| (ix, (a - mean) / std_dev))
            .filter(|&(_, z)| z > z_threshold)
            .collect()
    }

    /// Positive nodes whose replayed experiences mostly failed
    pub fn anti_patterns(&self, min_failure_ratio: f64, min_observations: u32) -> Vec<usize> {
        self.live_nodes()
            .filter(|(_, n)| {
                n.polarity == Polarity::Positive
                    && n.observations() >= min_observations
                    && n.failure_ratio() >= min_failure_ratio
            })
            .map(|(ix, _)| ix)
            .collect()
    }

    pub fn node(&self, ix: usize) -> &ConceptNode {
        &self.nodes[ix]
    }

    pub fn node_for(&self, pattern_id: PatternId) -> Option<&ConceptNode> {
        self.by_pattern.get(&pattern_id).map(|&ix| &self.nodes[ix])
    }

    pub fn edge(&self, a: usize, b: usize) -> Option<ConceptEdge> {
        self.adjacency.get(a).and_then(|edges| edges.get(&b)).copied()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (usize, &ConceptNode)> {
        self.nodes.iter().enumerate().filter(|(_, n)| n.alive)
    }

    /// Live node count
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(BTreeMap::len).sum::<usize>() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::experience::{TrajectoryId, TrajectoryStep};

    fn pattern(v: Vec<f32>, confidence: f64) -> Pattern {
        Pattern::new(QeDomain::TestGeneration, v, Vec::new(), confidence)
    }

    fn experience(used: &[PatternId], outcome: TaskOutcome) -> Experience {
        let mut exp = Experience::open(TrajectoryId::new(), "t", QeDomain::TestGeneration);
        for id in used {
            exp.mark_pattern_used(*id).unwrap();
        }
        exp.seal(outcome).unwrap();
        exp
    }

    #[test]
    fn test_edges_normalized_by_max_co_occurrence() {
        let a = pattern(vec![1.0, 0.0, 0.0], 0.6);
        let b = pattern(vec![0.0, 1.0, 0.0], 0.6);
        let c = pattern(vec![0.0, 0.0, 1.0], 0.6);
        let exps = vec![
            experience(&[a.id, b.id], TaskOutcome::Success),
            experience(&[a.id, b.id], TaskOutcome::Success),
            experience(&[b.id, c.id], TaskOutcome::Success),
        ];
        let graph = ConceptGraph::build([a, b, c], &exps);

        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.edge(0, 1).unwrap().weight, 1.0);
        assert_eq!(graph.edge(1, 2).unwrap().weight, 0.5);
        assert!(graph.edge(0, 2).is_none());
    }

    #[test]
    fn test_binding_associates_pattern_with_experience() {
        let bound = pattern(vec![1.0, 0.0], 0.6).with_binding(ActionBinding::new("s", "a"));
        let mut exp = Experience::open(TrajectoryId::new(), "t", QeDomain::TestGeneration);
        exp.push_step(TrajectoryStep {
            state_key: "s".into(),
            action_key: "a".into(),
            reward: 1.0,
        })
        .unwrap();
        exp.seal(TaskOutcome::Success).unwrap();

        let mut graph = ConceptGraph::build([bound], &[]);
        assert_eq!(graph.replay(&exp, 0.2), 1);
        assert_eq!(graph.node(0).successes, 1);
    }

    #[test]
    fn test_near_duplicates_merge_into_one_node() {
        // cosine([1, 0.29], [1, 0]) ~= 0.96
        let a = pattern(vec![1.0, 0.0], 0.7);
        let b = pattern(vec![1.0, 0.29], 0.6);
        let (a_id, b_id) = (a.id, b.id);
        let exps = vec![experience(&[a_id, b_id], TaskOutcome::Success)];
        let mut graph = ConceptGraph::build([a, b], &exps);
        assert_eq!(graph.len(), 2);

        let merges = graph.merge_near_duplicates(0.95);
        assert_eq!(graph.len(), 1);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].representative, a_id);
        assert_eq!(merges[0].absorbed, b_id);
        assert!(merges[0].similarity >= 0.95);
        assert_eq!(graph.node_for(b_id).unwrap().pattern_id, a_id);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_spreading_activation_surfaces_novel_pair() {
        // a - m - b chain: a and b never co-occur directly
        let a = pattern(vec![1.0, 0.0, 0.0], 0.8);
        let m = pattern(vec![0.0, 1.0, 0.0], 0.8);
        let b = pattern(vec![0.0, 0.0, 1.0], 0.8);
        let exps = vec![
            experience(&[a.id, m.id], TaskOutcome::Success),
            experience(&[m.id, b.id], TaskOutcome::Success),
        ];
        let mut graph = ConceptGraph::build([a, m, b], &exps);
        for exp in &exps {
            graph.replay(exp, 0.2);
        }
        graph.spread(20, 0.5, 0.1);

        assert!(graph.live_nodes().all(|(_, n)| (0.0..=1.0).contains(&n.activation)));
        let novel = graph.novel_pairs(0.5);
        assert_eq!(novel.len(), 1);
        assert_eq!((novel[0].a, novel[0].b), (0, 2));
        assert_eq!(graph.correlated_pairs(0.5, 0.5).len(), 2);
    }

    #[test]
    fn test_anti_pattern_needs_enough_failures() {
        let p = pattern(vec![1.0], 0.6);
        let id = p.id;
        let mut graph = ConceptGraph::build([p], &[]);
        graph.replay(&experience(&[id], TaskOutcome::failure("x")), 0.1);
        graph.replay(&experience(&[id], TaskOutcome::failure("x")), 0.1);
        assert!(graph.anti_patterns(0.7, 3).is_empty());

        graph.replay(&experience(&[id], TaskOutcome::failure("x")), 0.1);
        graph.replay(&experience(&[id], TaskOutcome::Success), 0.1);
        assert_eq!(graph.anti_patterns(0.7, 3), vec![0]);
    }

    #[test]
    fn test_infra_error_is_not_replayed() {
        let p = pattern(vec![1.0], 0.6);
        let id = p.id;
        let mut graph = ConceptGraph::build([p], &[]);
        assert_eq!(graph.replay(&experience(&[id], TaskOutcome::infra_error("oom")), 0.2), 0);
        assert_eq!(graph.node(0).activation, 0.0);
    }

    #[test]
    fn test_anomaly_detection() {
        let patterns: Vec<Pattern> = (0..10).map(|i| pattern(vec![i as f32, 1.0], 0.5)).collect();
        let hot = patterns[0].id;
        let mut graph = ConceptGraph::build(patterns, &[]);
        graph.replay(&experience(&[hot], TaskOutcome::Success), 1.0);

        let anomalies = graph.anomalies(2.0);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(graph.node(anomalies[0].0).pattern_id, hot);
    }
}
