//! Built-in HDBSCAN.
//!
//! Steps: core distances → mutual reachability → minimum spanning tree (Prim)
//! → single-linkage hierarchy → condensed tree → cluster selection (EOM/leaf).
//!
//! Distances are computed on the fly, so memory stays linear in the number of
//! rows. Points that leave a selected cluster before it dies keep its label.

use std::collections::VecDeque;

use rayon::prelude::*;

use crate::clusterer::{DensityClusterer, HdbscanParams, SelectionMethod, NOISE_LABEL};
use crate::error::{ClusteringError, Result};
use crate::job::resolve_n_jobs;
use crate::projection::FeatureMatrix;

/// Density assigned to zero-length edges.
const MAX_LAMBDA: f64 = 1e12;

/// HDBSCAN with Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdbscan;

impl DensityClusterer for Hdbscan {
    fn name(&self) -> &str {
        "hdbscan"
    }

    fn cluster(&self, features: &FeatureMatrix, params: &HdbscanParams) -> Result<Vec<i64>> {
        params.validate()?;
        hdbscan(features, params)
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn lambda_of(distance: f64) -> f64 {
    (1.0 / distance).min(MAX_LAMBDA)
}

/// Distance from each row to its `k`-th nearest row, the row itself counted.
fn core_distances(features: &FeatureMatrix, k: usize, n_jobs: i64) -> Result<Vec<f64>> {
    let n = features.num_rows();
    let k = k.clamp(1, n);
    let core_of = |i: usize| {
        let row = features.row(i);
        let mut d: Vec<f64> = (0..n).map(|j| euclidean(row, features.row(j))).collect();
        let (_, kth, _) = d.select_nth_unstable_by(k - 1, f64::total_cmp);
        *kth
    };

    let workers = resolve_n_jobs(n_jobs);
    if workers == 1 {
        return Ok((0..n).map(core_of).collect());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| ClusteringError::config(format!("cannot start worker pool: {e}")))?;
    Ok(pool.install(|| (0..n).into_par_iter().map(core_of).collect()))
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    a: usize,
    b: usize,
    weight: f64,
}

/// Prim's algorithm on the mutual reachability graph.
fn mutual_reachability_mst(features: &FeatureMatrix, core: &[f64]) -> Vec<Edge> {
    let n = features.num_rows();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        let row = features.row(current);
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let d = euclidean(row, features.row(j)).max(core[current]).max(core[j]);
            if d < best[j] {
                best[j] = d;
                from[j] = current;
            }
        }
        let Some(next) = (0..n)
            .filter(|&j| !in_tree[j])
            .min_by(|&a, &b| best[a].total_cmp(&best[b]))
        else {
            break;
        };
        in_tree[next] = true;
        edges.push(Edge {
            a: from[next],
            b: next,
            weight: best[next],
        });
        current = next;
    }
    edges
}

/// One merge of the single-linkage dendrogram; merge `k` creates node `n + k`.
#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

fn find(parent: &mut [usize], x: usize) -> usize {
    let mut root = x;
    while parent[root] != root {
        root = parent[root];
    }
    let mut cur = x;
    while parent[cur] != root {
        let next = parent[cur];
        parent[cur] = root;
        cur = next;
    }
    root
}

fn single_linkage(n: usize, mut edges: Vec<Edge>) -> Vec<Merge> {
    edges.sort_by(|a, b| a.weight.total_cmp(&b.weight));
    let total = 2 * n - 1;
    let mut parent: Vec<usize> = (0..total).collect();
    let mut size = vec![1usize; total];
    let mut merges = Vec::with_capacity(n - 1);

    for (k, e) in edges.iter().enumerate() {
        let a = find(&mut parent, e.a);
        let b = find(&mut parent, e.b);
        let node = n + k;
        parent[a] = node;
        parent[b] = node;
        size[node] = size[a] + size[b];
        merges.push(Merge {
            left: a,
            right: b,
            distance: e.weight,
            size: size[node],
        });
    }
    merges
}

/// Row of the condensed tree. Cluster ids start at `n` (the root).
#[derive(Debug, Clone, Copy, PartialEq)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

fn descendants(merges: &[Merge], n: usize, root: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        out.push(node);
        if node >= n {
            let m = &merges[node - n];
            queue.push_back(m.left);
            queue.push_back(m.right);
        }
    }
    out
}

/// Collapse the dendrogram so that a cluster only splits into children that
/// are both at least `min_cluster_size`; smaller sides fall out as points.
fn condense_tree(merges: &[Merge], n: usize, min_cluster_size: usize) -> Vec<CondensedEdge> {
    let root = 2 * n - 2;
    let node_size = |node: usize| if node < n { 1 } else { merges[node - n].size };
    let mut relabel = vec![0usize; 2 * n - 1];
    let mut ignore = vec![false; 2 * n - 1];
    relabel[root] = n;
    let mut next_label = n + 1;
    let mut tree = Vec::new();

    for node in descendants(merges, n, root) {
        if node < n || ignore[node] {
            continue;
        }
        let m = merges[node - n];
        let lambda = lambda_of(m.distance);
        let label = relabel[node];
        let (ls, rs) = (node_size(m.left), node_size(m.right));

        let mut fall_out = |side: usize, tree: &mut Vec<CondensedEdge>| {
            for sub in descendants(merges, n, side) {
                if sub < n {
                    tree.push(CondensedEdge {
                        parent: label,
                        child: sub,
                        lambda,
                        size: 1,
                    });
                }
                ignore[sub] = true;
            }
        };

        match (ls >= min_cluster_size, rs >= min_cluster_size) {
            (true, true) => {
                for (side, size) in [(m.left, ls), (m.right, rs)] {
                    relabel[side] = next_label;
                    tree.push(CondensedEdge {
                        parent: label,
                        child: next_label,
                        lambda,
                        size,
                    });
                    next_label += 1;
                }
            }
            (false, false) => {
                fall_out(m.left, &mut tree);
                fall_out(m.right, &mut tree);
            }
            (true, false) => {
                fall_out(m.right, &mut tree);
                relabel[m.left] = label;
            }
            (false, true) => {
                fall_out(m.left, &mut tree);
                relabel[m.right] = label;
            }
        }
    }
    tree
}

/// Per-cluster stability and cluster-children lists, indexed by `id - n`.
fn stabilities(tree: &[CondensedEdge], n: usize) -> (Vec<f64>, Vec<Vec<usize>>, Vec<Option<usize>>) {
    let num_clusters = tree
        .iter()
        .map(|e| e.parent.max(if e.child >= n { e.child } else { n }))
        .max()
        .map_or(1, |m| m - n + 1);

    let mut birth = vec![0.0f64; num_clusters];
    let mut children = vec![Vec::new(); num_clusters];
    let mut parent_of = vec![None; num_clusters];
    for e in tree.iter().filter(|e| e.child >= n) {
        birth[e.child - n] = e.lambda;
        children[e.parent - n].push(e.child - n);
        parent_of[e.child - n] = Some(e.parent - n);
    }

    let mut stability = vec![0.0f64; num_clusters];
    for e in tree {
        let p = e.parent - n;
        stability[p] += (e.lambda - birth[p]) * e.size as f64;
    }
    (stability, children, parent_of)
}

fn select_clusters(
    stability: &[f64],
    children: &[Vec<usize>],
    method: SelectionMethod,
    root_eligible: bool,
) -> Vec<bool> {
    let k = stability.len();
    let mut selected = vec![false; k];

    match method {
        SelectionMethod::Eom => {
            let mut stab = stability.to_vec();
            let mut is_cluster = vec![true; k];
            is_cluster[0] = root_eligible;
            // children always carry larger ids than their parent
            for c in (0..k).rev() {
                if c == 0 && !root_eligible {
                    continue;
                }
                if children[c].is_empty() {
                    continue;
                }
                let subtree: f64 = children[c].iter().map(|&ch| stab[ch]).sum();
                if subtree > stab[c] {
                    is_cluster[c] = false;
                    stab[c] = subtree;
                } else {
                    let mut stack = children[c].clone();
                    while let Some(d) = stack.pop() {
                        is_cluster[d] = false;
                        stack.extend_from_slice(&children[d]);
                    }
                }
            }
            for c in 0..k {
                selected[c] = is_cluster[c] && stability[c] > 0.0;
            }
        }
        SelectionMethod::Leaf => {
            // clusters born and dead at the same density carry no information
            let real: Vec<bool> = stability.iter().map(|&s| s > 0.0).collect();
            let mut real_below = vec![false; k];
            for c in (0..k).rev() {
                real_below[c] = children[c].iter().any(|&ch| real[ch] || real_below[ch]);
            }
            let mut any = false;
            for c in 1..k {
                if real[c] && !real_below[c] {
                    selected[c] = true;
                    any = true;
                }
            }
            if !any && root_eligible && real[0] {
                selected[0] = true;
            }
        }
    }
    selected
}

/// Cluster `features`, returning compact labels `0..K` and [`NOISE_LABEL`].
pub fn hdbscan(features: &FeatureMatrix, params: &HdbscanParams) -> Result<Vec<i64>> {
    let n = features.num_rows();
    if n < 2 {
        return Ok(vec![NOISE_LABEL; n]);
    }
    let mcs = params.min_cluster_size;

    let core = core_distances(features, params.min_samples(), params.core_dist_n_jobs)?;
    let mst = mutual_reachability_mst(features, &core);
    let merges = single_linkage(n, mst);
    let tree = condense_tree(&merges, n, mcs);
    let (stability, children, parent_of) = stabilities(&tree, n);

    let root_eligible = params.allow_single_cluster && n >= mcs;
    let selected = select_clusters(
        &stability,
        &children,
        params.cluster_selection_method,
        root_eligible,
    );

    let mut compact = vec![NOISE_LABEL; selected.len()];
    let mut next = 0;
    for (c, &s) in selected.iter().enumerate() {
        if s {
            compact[c] = next;
            next += 1;
        }
    }

    let mut labels = vec![NOISE_LABEL; n];
    for e in tree.iter().filter(|e| e.child < n) {
        let mut cluster = Some(e.parent - n);
        while let Some(c) = cluster {
            if selected[c] {
                labels[e.child] = compact[c];
                break;
            }
            cluster = parent_of[c];
        }
    }

    log::debug!(
        "hdbscan: {n} rows, {} condensed clusters, {next} selected",
        selected.len()
    );
    Ok(labels)
}
