// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HNSW (Hierarchical Navigable Small World) graph over pattern embeddings.
//!
//! Nodes live in an arena indexed by slot; per-layer neighbor lists hold
//! slot indices. Vectors are L2-normalized on insert so cosine similarity
//! is a dot product and distance is `1 - similarity`.
//!
//! Removal only sets a tombstone: the node keeps routing searches but is
//! never returned. Tombstones are dropped by rebuilding the graph from
//! [`HnswGraph::live_entries`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::domain::pattern::PatternId;

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Max neighbors per node on layers above 0
    pub m: usize,
    /// Max neighbors on layer 0
    pub m0: usize,
    pub ef_construction: usize,
}

impl HnswParams {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
        }
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::new(16, 200)
    }
}

#[derive(Debug, Clone)]
struct Node {
    key: PatternId,
    vector: Vec<f32>,
    /// `links[l]` are the neighbors on layer `l`; `links.len()` is level + 1
    links: Vec<Vec<u32>>,
    deleted: bool,
}

/// Slot with its distance to the current query
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    dist: f32,
    slot: u32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct HnswGraph {
    params: HnswParams,
    /// Level normalization factor: 1 / ln(M)
    ml: f64,
    nodes: Vec<Node>,
    slots: HashMap<PatternId, u32>,
    entry_point: Option<u32>,
    max_layer: usize,
    tombstones: usize,
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            ml: 1.0 / (params.m as f64).ln(),
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            tombstones: 0,
        }
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Live (non-tombstoned) entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn contains(&self, key: PatternId) -> bool {
        self.slots.contains_key(&key)
    }

    /// Level = floor(-ln(u) * ml) for a uniform draw `u` in (0, 1]
    fn random_level(&self, draw: f64) -> usize {
        let u = if draw <= 0.0 { 1e-10 } else { draw.min(1.0) };
        (-u.ln() * self.ml).floor() as usize
    }

    fn distance(&self, query: &[f32], slot: u32) -> f32 {
        let v = &self.nodes[slot as usize].vector;
        let dot: f32 = query.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
        1.0 - dot
    }

    /// Insert or replace `key`. `level_draw` is a uniform value in (0, 1].
    pub fn insert(&mut self, key: PatternId, vector: &[f32], level_draw: f64) {
        if self.slots.contains_key(&key) {
            self.remove(key);
        }

        let level = self.random_level(level_draw);
        let slot = self.nodes.len() as u32;
        let query = normalize(vector);
        self.nodes.push(Node {
            key,
            vector: query.clone(),
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.slots.insert(key, slot);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = level;
            return;
        };

        // Greedy descent through the layers above the new node's level
        let mut current = entry;
        let top = self.max_layer;
        if top > level {
            for layer in (level + 1..=top).rev() {
                current = self.greedy_closest(&query, current, layer);
            }
        }

        let mut entry_points = vec![current];
        for layer in (0..=level.min(top)).rev() {
            let max_neighbors = if layer == 0 { self.params.m0 } else { self.params.m };
            let candidates = self.search_layer(&query, &entry_points, self.params.ef_construction, layer);

            let selected: Vec<u32> = candidates
                .iter()
                .filter(|s| s.slot != slot)
                .take(max_neighbors)
                .map(|s| s.slot)
                .collect();
            self.nodes[slot as usize].links[layer] = selected.clone();

            for &neighbor in &selected {
                let links = &mut self.nodes[neighbor as usize].links[layer];
                if !links.contains(&slot) {
                    links.push(slot);
                }
                if links.len() > max_neighbors {
                    self.prune(neighbor, layer, max_neighbors);
                }
            }

            entry_points = candidates.iter().map(|s| s.slot).collect();
        }

        if level > self.max_layer {
            self.entry_point = Some(slot);
            self.max_layer = level;
        }
    }

    /// Tombstone `key`; returns whether it was live
    pub fn remove(&mut self, key: PatternId) -> bool {
        match self.slots.remove(&key) {
            Some(slot) => {
                self.nodes[slot as usize].deleted = true;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// The `k` live entries closest to `query`, similarity descending
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(PatternId, f64)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let query = normalize(query);
        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        // Tombstones occupy beam slots, so widen the beam by up to their count
        let ef = ef_search.max(k) + self.tombstones.min(ef_search.max(k));
        self.search_layer(&query, &[current], ef, 0)
            .into_iter()
            .filter(|s| !self.nodes[s.slot as usize].deleted)
            .take(k)
            .map(|s| (self.nodes[s.slot as usize].key, 1.0 - s.dist as f64))
            .collect()
    }

    /// Live keys with their normalized vectors, in insertion order
    pub fn live_entries(&self) -> Vec<(PatternId, Vec<f32>)> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.key, n.vector.clone()))
            .collect()
    }

    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance(query, start);
        loop {
            let mut changed = false;
            if let Some(links) = self.nodes[current as usize].links.get(layer) {
                for &neighbor in links {
                    let d = self.distance(query, neighbor);
                    if d < current_dist {
                        current = neighbor;
                        current_dist = d;
                        changed = true;
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Beam search on one layer; results sorted by distance ascending
    fn search_layer(&self, query: &[f32], entry_points: &[u32], ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::new();
        // Min-heap of candidates to expand
        let mut candidates: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();
        // Max-heap of the best `ef` found so far
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let scored = Scored { dist: self.distance(query, ep), slot: ep };
                candidates.push(std::cmp::Reverse(scored));
                results.push(scored);
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(std::cmp::Reverse(candidate)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && candidate.dist > worst.dist {
                    break;
                }
            }

            let Some(links) = self.nodes[candidate.slot as usize].links.get(layer) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let scored = Scored { dist: self.distance(query, neighbor), slot: neighbor };
                let admit = results.len() < ef || results.peek().is_some_and(|w| scored.dist < w.dist);
                if admit {
                    candidates.push(std::cmp::Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn prune(&mut self, slot: u32, layer: usize, max_neighbors: usize) {
        let base = self.nodes[slot as usize].vector.clone();
        let mut scored: Vec<Scored> = self.nodes[slot as usize].links[layer]
            .iter()
            .map(|&n| Scored { dist: self.distance(&base, n), slot: n })
            .collect();
        scored.sort();
        scored.truncate(max_neighbors);
        self.nodes[slot as usize].links[layer] = scored.into_iter().map(|s| s.slot).collect();
    }
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|v| v / norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect()
    }

    fn build(n: usize, dim: usize) -> (HnswGraph, Vec<(PatternId, Vec<f32>)>) {
        let mut rng = StdRng::seed_from_u64(7);
        let mut graph = HnswGraph::new(HnswParams::default());
        let mut entries = Vec::new();
        for _ in 0..n {
            let id = PatternId::new();
            let v = random_vector(&mut rng, dim);
            graph.insert(id, &v, rng.random::<f64>());
            entries.push((id, v));
        }
        (graph, entries)
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let graph = HnswGraph::new(HnswParams::default());
        assert!(graph.search(&[1.0, 0.0], 5, 64).is_empty());
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let (graph, entries) = build(300, 16);
        for (id, v) in entries.iter().take(20) {
            let results = graph.search(v, 5, 64);
            assert_eq!(results[0].0, *id);
            assert!((results[0].1 - 1.0).abs() < 1e-4);
            assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
        }
    }

    #[test]
    fn test_recall_against_brute_force() {
        let (graph, entries) = build(500, 24);
        let mut rng = StdRng::seed_from_u64(99);
        let mut hits = 0;
        let queries = 30;
        for _ in 0..queries {
            let q = random_vector(&mut rng, 24);
            let mut exact: Vec<(PatternId, f64)> = entries
                .iter()
                .map(|(id, v)| (*id, crate::domain::pattern::cosine_similarity(&q, v)))
                .collect();
            exact.sort_by(|a, b| b.1.total_cmp(&a.1));
            let truth: HashSet<PatternId> = exact.iter().take(10).map(|e| e.0).collect();

            let found = graph.search(&q, 10, 64);
            hits += found.iter().filter(|(id, _)| truth.contains(id)).count();
        }
        let recall = hits as f64 / (queries * 10) as f64;
        assert!(recall > 0.9, "recall {recall}");
    }

    #[test]
    fn test_tombstones_are_never_returned() {
        let (mut graph, entries) = build(100, 8);
        let (removed, v) = entries[3].clone();
        assert!(graph.remove(removed));
        assert!(!graph.remove(removed));
        assert_eq!(graph.tombstones(), 1);
        assert_eq!(graph.len(), 99);

        let results = graph.search(&v, 10, 64);
        assert!(results.iter().all(|(id, _)| *id != removed));
        assert_eq!(graph.live_entries().len(), 99);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut graph = HnswGraph::new(HnswParams::default());
        let id = PatternId::new();
        graph.insert(id, &[1.0, 0.0], 0.5);
        graph.insert(id, &[0.0, 1.0], 0.5);

        assert_eq!(graph.len(), 1);
        let results = graph.search(&[0.0, 1.0], 1, 16);
        assert_eq!(results[0].0, id);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }
}
