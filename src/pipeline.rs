//! Chunked node pipeline.
//!
//! A pipeline is a DAG of nodes, each declaring the parents whose outputs it
//! consumes. The recording is streamed chunk by chunk; inside a chunk nodes run
//! in a topological order fixed once at build time, and every node sees only
//! the chunk's traces and its parents' outputs for that same chunk.
//!
//! ```text
//!  PeakRetriever ──► ExtractSparseWaveforms ──► SavGolDenoiser ──► RandomProjectionFeatures
//!        │                                             ▲                   ▲
//!        └─────────────────────────────────────────────┴───────────────────┘
//! ```
//!
//! Outputs of nodes flagged `return_output` are concatenated across chunks in
//! chunk order, which is peak order since peaks are sorted.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dedup::MatchBatch;
use crate::error::{ClusteringError, Result};
use crate::job::{divide_into_chunks, map_chunks, ChunkRange, JobConfig};
use crate::peaks::PeakBatch;
use crate::projection::FeatureBatch;
use crate::recording::{get_chunk_with_margin, Recording, Traces};
use crate::waveforms::WaveformBatch;

/// Index of a node inside its pipeline.
pub type NodeId = usize;

/// Everything a node may read while processing one chunk.
pub struct ChunkContext<'a> {
    pub chunk: ChunkRange,
    /// Traces for `[chunk.start - margin, chunk.end + margin)`, zero outside the segment.
    pub traces: &'a Traces,
    pub margin: usize,
    /// Length of the chunk's segment, for boundary checks.
    pub segment_len: usize,
}

impl ChunkContext<'_> {
    /// Row of `traces` holding absolute `sample`, if the margin covers it.
    pub fn row_of(&self, sample: isize) -> Option<usize> {
        let row = sample - self.chunk.start as isize + self.margin as isize;
        (row >= 0 && (row as usize) < self.traces.num_samples()).then_some(row as usize)
    }
}

/// Data flowing along pipeline edges.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    Peaks(PeakBatch),
    Waveforms(WaveformBatch),
    Features(FeatureBatch),
    Matches(MatchBatch),
}

impl NodeOutput {
    fn kind(&self) -> &'static str {
        match self {
            NodeOutput::Peaks(_) => "peaks",
            NodeOutput::Waveforms(_) => "waveforms",
            NodeOutput::Features(_) => "features",
            NodeOutput::Matches(_) => "matches",
        }
    }

    pub fn as_peaks(&self) -> Option<&PeakBatch> {
        match self {
            NodeOutput::Peaks(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_waveforms(&self) -> Option<&WaveformBatch> {
        match self {
            NodeOutput::Waveforms(w) => Some(w),
            _ => None,
        }
    }

    pub fn into_features(self) -> Option<FeatureBatch> {
        match self {
            NodeOutput::Features(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_matches(self) -> Option<MatchBatch> {
        match self {
            NodeOutput::Matches(m) => Some(m),
            _ => None,
        }
    }

    /// Append the next chunk's output of the same node.
    fn extend(&mut self, next: NodeOutput) -> Result<()> {
        match (self, next) {
            (NodeOutput::Peaks(a), NodeOutput::Peaks(b)) => a.extend(b),
            (NodeOutput::Waveforms(a), NodeOutput::Waveforms(b)) => a.extend(b),
            (NodeOutput::Features(a), NodeOutput::Features(b)) => a.extend(b)?,
            (NodeOutput::Matches(a), NodeOutput::Matches(b)) => a.extend(b),
            (a, b) => {
                return Err(ClusteringError::Graph(format!(
                    "cannot concatenate {} with {}",
                    a.kind(),
                    b.kind()
                )))
            }
        }
        Ok(())
    }
}

/// A processing stage of the pipeline.
pub trait PipelineNode: Send + Sync {
    fn name(&self) -> &str;

    /// Samples needed on each side of the chunk.
    fn margin(&self) -> usize {
        0
    }

    /// Process one chunk. `parents` holds the parents' outputs for this chunk,
    /// in declared order.
    fn compute(&self, ctx: &ChunkContext, parents: &[&NodeOutput]) -> Result<NodeOutput>;
}

/// Fetch a parent's output of the expected kind or fail with a graph error.
pub fn parent<'a, T>(
    node: &str,
    parents: &[&'a NodeOutput],
    index: usize,
    view: impl Fn(&'a NodeOutput) -> Option<&'a T>,
) -> Result<&'a T> {
    parents
        .get(index)
        .and_then(|p| view(*p))
        .ok_or_else(|| {
            ClusteringError::Graph(format!(
                "node '{node}' expects a different output kind for parent #{index}"
            ))
        })
}

struct NodeEntry {
    node: Box<dyn PipelineNode>,
    parents: Vec<NodeId>,
    return_output: bool,
}

/// Collects nodes and their parent links.
#[derive(Default)]
pub struct PipelineBuilder {
    entries: Vec<NodeEntry>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; the returned id is what children list as a parent.
    pub fn add(
        &mut self,
        node: impl PipelineNode + 'static,
        parents: &[NodeId],
        return_output: bool,
    ) -> NodeId {
        self.entries.push(NodeEntry {
            node: Box::new(node),
            parents: parents.to_vec(),
            return_output,
        });
        self.entries.len() - 1
    }

    /// Check the graph and fix the execution order.
    pub fn build(self) -> Result<Pipeline> {
        if self.entries.is_empty() {
            return Err(ClusteringError::Graph("pipeline has no nodes".into()));
        }
        if !self.entries.iter().any(|e| e.return_output) {
            return Err(ClusteringError::Graph(
                "no node is flagged to return output".into(),
            ));
        }

        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.entries.len()).map(|i| graph.add_node(i)).collect();
        for (child, entry) in self.entries.iter().enumerate() {
            for &p in &entry.parents {
                let parent = indices.get(p).ok_or_else(|| {
                    ClusteringError::Graph(format!(
                        "node '{}' lists unknown parent #{p}",
                        entry.node.name()
                    ))
                })?;
                graph.add_edge(*parent, indices[child], ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                let id = graph[cycle.node_id()];
                ClusteringError::Graph(format!(
                    "dependency cycle through node '{}'",
                    self.entries[id].node.name()
                ))
            })?
            .into_iter()
            .map(|ix| graph[ix])
            .collect();

        Ok(Pipeline {
            entries: self.entries,
            order,
        })
    }
}

/// A validated node graph with its execution order.
pub struct Pipeline {
    entries: Vec<NodeEntry>,
    order: Vec<NodeId>,
}

impl Pipeline {
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn margin(&self) -> usize {
        self.entries.iter().map(|e| e.node.margin()).max().unwrap_or(0)
    }

    /// Run every node on one chunk and hand back the outputs flagged for return.
    fn process_chunk(&self, ctx: &ChunkContext) -> Result<Vec<(NodeId, NodeOutput)>> {
        let mut outputs: Vec<Option<NodeOutput>> = (0..self.entries.len()).map(|_| None).collect();

        for &id in &self.order {
            let entry = &self.entries[id];
            let parent_outputs = entry
                .parents
                .iter()
                .map(|&p| {
                    outputs[p].as_ref().ok_or_else(|| {
                        ClusteringError::Graph(format!("parent #{p} has not run"))
                    })
                })
                .collect::<Result<Vec<&NodeOutput>>>()?;

            let out = entry
                .node
                .compute(ctx, &parent_outputs)
                .map_err(|e| match e {
                    ClusteringError::Node { .. } => e,
                    other => ClusteringError::node(entry.node.name(), ctx.chunk.index, other.to_string()),
                })?;
            outputs[id] = Some(out);
        }

        Ok(outputs
            .into_iter()
            .enumerate()
            .filter(|(id, _)| self.entries[*id].return_output)
            .filter_map(|(id, out)| out.map(|o| (id, o)))
            .collect())
    }
}

/// Concatenated outputs of the returning nodes.
#[derive(Debug)]
pub struct PipelineOutput {
    outputs: Vec<(NodeId, NodeOutput)>,
}

impl PipelineOutput {
    pub fn take(&mut self, id: NodeId) -> Option<NodeOutput> {
        let pos = self.outputs.iter().position(|(i, _)| *i == id)?;
        Some(self.outputs.swap_remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Stream `recording` through `pipeline` in chunks sized by `job`.
pub fn run_node_pipeline(
    recording: &dyn Recording,
    pipeline: &Pipeline,
    job: &JobConfig,
    job_name: &str,
) -> Result<PipelineOutput> {
    job.validate()?;
    let chunk_size = job.chunk_size_for(recording)?;
    let chunks = divide_into_chunks(recording, chunk_size);
    let margin = pipeline.margin();

    log::debug!(
        "{job_name}: {} chunks of {chunk_size} samples, margin {margin}",
        chunks.len()
    );

    let per_chunk = map_chunks(&chunks, job, job_name, |chunk| {
        let traces = get_chunk_with_margin(recording, chunk.segment, chunk.start, chunk.end, margin)?;
        let ctx = ChunkContext {
            chunk: *chunk,
            traces: &traces,
            margin,
            segment_len: recording.num_samples(chunk.segment),
        };
        pipeline.process_chunk(&ctx)
    })?;

    let mut merged: Vec<(NodeId, NodeOutput)> = Vec::new();
    for chunk_outputs in per_chunk {
        for (id, out) in chunk_outputs {
            match merged.iter_mut().find(|(i, _)| *i == id) {
                Some((_, acc)) => acc.extend(out)?,
                None => merged.push((id, out)),
            }
        }
    }

    Ok(PipelineOutput { outputs: merged })
}
