//! Fusion graph of a single BiFPN block, described as data.
//!
//! ```text
//!     P7_in -------------------------- P7_out -------->
//!       |                           ^
//!       v                           |
//!     P6_in ---------- P6_up --------- P6_out -------->
//!                        |          ^
//!                        v          |
//!     P5_in ---------- P5_up --------- P5_out -------->
//!                        |          ^
//!                        v          |
//!     P4_in ---------- P4_up --------- P4_out -------->
//!                        |          ^
//!                        v          |
//!     P3_in -------------------------- P3_out -------->
//! ```
//!
//! The top-down pass walks from the coarsest level to the finest, fusing each input with
//! the upsampled result of the level above. The bottom-up pass then walks back up, fusing
//! the input, the top-down intermediate and the downsampled *output* of the level below.
//! The finest and coarsest levels have no intermediate, so their nodes take two inputs.

use std::fmt;

/// A tensor a fusion node can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The block's input at a level.
    Input(usize),
    /// A top-down intermediate (`Pn_up`).
    Intermediate(usize),
    /// A finished output (`Pn_out`).
    Output(usize),
}

/// How a source is brought to the resolution of the node that reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    Identity,
    /// Nearest neighbour 2x, from the next coarser level.
    Upsample,
    /// 2x2 max pooling, from the next finer level.
    Downsample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub source: Source,
    pub resample: Resample,
}

impl Edge {
    pub fn identity(source: Source) -> Self {
        Self {
            source,
            resample: Resample::Identity,
        }
    }

    pub fn upsample(source: Source) -> Self {
        Self {
            source,
            resample: Resample::Upsample,
        }
    }

    pub fn downsample(source: Source) -> Self {
        Self {
            source,
            resample: Resample::Downsample,
        }
    }
}

/// One weighted fusion node: the level it writes, what it writes, and the edges it sums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionNodeSpec {
    pub level: usize,
    pub produces: Source,
    pub edges: Vec<Edge>,
}

impl FusionNodeSpec {
    /// Number of learned fusion weights, one per incoming edge.
    pub fn arity(&self) -> usize {
        self.edges.len()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Level indices are offset so index 0 prints as P3
        match self {
            Source::Input(l) => write!(f, "P{}_in", l + 3),
            Source::Intermediate(l) => write!(f, "P{}_up", l + 3),
            Source::Output(l) => write!(f, "P{}_out", l + 3),
        }
    }
}

/// Operations a fusion graph needs from the values flowing through it.
///
/// The BiFPN block implements this over feature map tensors; tests implement it over
/// plain labels to observe the evaluation order.
pub trait FusionGraph {
    type Feature: Clone;

    /// Bring a coarser `feature` up to the resolution of `target`.
    fn upsample(&self, feature: Self::Feature, target: &Self::Feature) -> Self::Feature;

    /// Bring a finer `feature` down to the resolution of `target`.
    fn downsample(&self, feature: Self::Feature, target: &Self::Feature) -> Self::Feature;

    /// Combine the resampled `sources` of node number `node`.
    fn fuse(&self, node: usize, spec: &FusionNodeSpec, sources: Vec<Self::Feature>)
    -> Self::Feature;
}

/// Ordered list of fusion nodes for a pyramid of `levels` maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    levels: usize,
    nodes: Vec<FusionNodeSpec>,
}

impl Topology {
    pub fn new(levels: usize) -> Self {
        assert!(levels >= 2, "a fusion pyramid needs at least 2 levels, got {levels}");

        let coarsest = levels - 1;
        let mut nodes = Vec::with_capacity(2 * coarsest);

        // Top-down: coarsest-1 .. 0. The finest level writes its output directly.
        for level in (0..coarsest).rev() {
            let above = if level + 1 == coarsest {
                Source::Input(coarsest)
            } else {
                Source::Intermediate(level + 1)
            };

            let produces = if level == 0 {
                Source::Output(0)
            } else {
                Source::Intermediate(level)
            };

            nodes.push(FusionNodeSpec {
                level,
                produces,
                edges: vec![Edge::identity(Source::Input(level)), Edge::upsample(above)],
            });
        }

        // Bottom-up: 1 .. coarsest. The coarsest level has no intermediate.
        for level in 1..levels {
            let mut edges = vec![Edge::identity(Source::Input(level))];
            if level != coarsest {
                edges.push(Edge::identity(Source::Intermediate(level)));
            }
            edges.push(Edge::downsample(Source::Output(level - 1)));

            nodes.push(FusionNodeSpec {
                level,
                produces: Source::Output(level),
                edges,
            });
        }

        Self { levels, nodes }
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn nodes(&self) -> &[FusionNodeSpec] {
        &self.nodes
    }

    /// Runs every node in order and returns the outputs, finest level first.
    ///
    /// Panics if `inputs` does not hold one feature per level.
    pub fn evaluate<G: FusionGraph>(&self, graph: &G, inputs: Vec<G::Feature>) -> Vec<G::Feature> {
        assert_eq!(
            inputs.len(),
            self.levels,
            "expected a pyramid of {} levels, got {}",
            self.levels,
            inputs.len()
        );

        let mut intermediates: Vec<Option<G::Feature>> = vec![None; self.levels];
        let mut outputs: Vec<Option<G::Feature>> = vec![None; self.levels];

        for (index, node) in self.nodes.iter().enumerate() {
            let target = &inputs[node.level];

            let sources = node
                .edges
                .iter()
                .map(|edge| {
                    let feature = match edge.source {
                        Source::Input(l) => Some(inputs[l].clone()),
                        Source::Intermediate(l) => intermediates[l].clone(),
                        Source::Output(l) => outputs[l].clone(),
                    }
                    .unwrap_or_else(|| {
                        panic!("{} read before it was produced by node {}", edge.source, index)
                    });

                    match edge.resample {
                        Resample::Identity => feature,
                        Resample::Upsample => graph.upsample(feature, target),
                        Resample::Downsample => graph.downsample(feature, target),
                    }
                })
                .collect();

            let fused = graph.fuse(index, node, sources);

            match node.produces {
                Source::Intermediate(l) => intermediates[l] = Some(fused),
                Source::Output(l) => outputs[l] = Some(fused),
                Source::Input(_) => unreachable!("fusion nodes never overwrite inputs"),
            }
        }

        outputs
            .into_iter()
            .enumerate()
            .map(|(level, out)| {
                out.unwrap_or_else(|| panic!("{} was never produced", Source::Output(level)))
            })
            .collect()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(crate::layers::PyramidLevel::count())
    }
}
