//! Evaluation of a structured forest on every patch of a feature tensor.

use super::model::{Forest, PatchFeatures};
use super::options::RandomForestOptions;
use crate::errors::*;
use crate::imgops;
use crate::types::Tensor;
use rayon::prelude::*;
use std::sync::Arc;

/// Position of a feature relative to the top left corner of a patch
/// (in the shrunk feature tensor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureOffset {
    pub row: usize,
    pub col: usize,
    pub channel: usize,
}

/// Maps the feature ids used by the trees to positions within a patch.
///
/// * `regular[id]` is the position of regular feature `id`
/// * the self-similarity feature `n` is the difference of the values at
///   `self_sim_a[n]` and `self_sim_b[n]`. The ids enumerate the first cell,
///   then the channel, then the second cell (always after the first one).
#[derive(Debug, Clone)]
pub struct OffsetTables {
    pub regular: Vec<FeatureOffset>,
    pub self_sim_a: Vec<FeatureOffset>,
    pub self_sim_b: Vec<FeatureOffset>,
}

impl OffsetTables {
    /// # Arguments
    /// * `patch_size` - width of a patch in full resolution
    /// * `shrink` - downsampling factor of the feature tensor
    /// * `grid_size` - number of self-similarity cells per patch side
    /// * `channels` - channels of the feature tensor
    pub fn new(patch_size: usize, shrink: usize, grid_size: usize, channels: usize) -> OffsetTables {
        let p = patch_size / shrink;
        let regular = (0..p * p * channels)
            .map(|i| {
                FeatureOffset {
                    row: i / channels / p,
                    col: i / channels % p,
                    channel: i % channels,
                }
            })
            .collect();

        // center of a cell (along one axis)
        let center = |cell: usize| ((cell as f32 + 0.5) * p as f32 / grid_size as f32).round() as usize;
        let cells = grid_size * grid_size;
        let pairs = cells * cells.saturating_sub(1) / 2;
        let mut self_sim_a = Vec::with_capacity(pairs * channels);
        let mut self_sim_b = Vec::with_capacity(pairs * channels);
        for a in 0..cells {
            for ch in 0..channels {
                for b in a + 1..cells {
                    self_sim_a.push(FeatureOffset {
                        row: center(a / grid_size),
                        col: center(a % grid_size),
                        channel: ch,
                    });
                    self_sim_b.push(FeatureOffset {
                        row: center(b / grid_size),
                        col: center(b % grid_size),
                        channel: ch,
                    });
                }
            }
        }
        OffsetTables {
            regular: regular,
            self_sim_a: self_sim_a,
            self_sim_b: self_sim_b,
        }
    }

    pub fn from_options(opts: &RandomForestOptions) -> OffsetTables {
        OffsetTables::new(opts.patch_size,
                          opts.shrink_number,
                          opts.selfsimilarity_grid_size,
                          opts.number_of_output_channels())
    }
}

/// Number of patches (rows, cols) which fit into an image of the size
/// `rows` x `cols` (full resolution): `ceil((n - patch_size) / stride)`.
pub fn patch_grid_size(rows: usize, cols: usize, patch_size: usize, stride: usize) -> (usize, usize) {
    let count = |n: usize| (n.saturating_sub(patch_size) + stride - 1) / stride;
    (count(rows), count(cols))
}

/// The leaf reached by every tree slot of every patch.
/// The leaf of tree slot `k` of patch (`i`, `j`) is at
/// `(i * width + j) * trees_per_patch + k`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafGrid {
    pub height: usize,
    pub width: usize,
    pub trees_per_patch: usize,
    pub leaves: Vec<u32>,
}

/// The two smoothed copies of a feature tensor
struct SmoothedFeatures<'a> {
    regular: &'a Tensor,
    self_similarity: &'a Tensor,
    height: usize,
    width: usize,
}

/// The features of a single patch
struct PatchView<'a> {
    regular: &'a [f32],
    self_similarity: &'a [f32],
    tables: &'a OffsetTables,
    regular_count: usize,
    /// number of values within a row of the feature tensor
    pitch: usize,
    channels: usize,
    /// position of the first value of the patch
    origin: usize,
}

impl<'a> PatchView<'a> {
    #[inline]
    fn lookup(&self, values: &[f32], offset: &FeatureOffset) -> f32 {
        let idx = self.origin + offset.row * self.pitch + offset.col * self.channels + offset.channel;
        #[cfg(feature="reduce_bound_checks")]
        {
            debug_assert!(idx < values.len());
            unsafe { *values.get_unchecked(idx) }
        }
        #[cfg(not(feature="reduce_bound_checks"))]
        {
            values[idx]
        }
    }
}

impl<'a> PatchFeatures for PatchView<'a> {
    #[inline]
    fn feature(&self, id: usize) -> f32 {
        if id < self.regular_count {
            self.lookup(self.regular, &self.tables.regular[id])
        } else {
            let n = id - self.regular_count;
            self.lookup(self.self_similarity, &self.tables.self_sim_a[n]) -
            self.lookup(self.self_similarity, &self.tables.self_sim_b[n])
        }
    }
}

/// Evaluates a forest on feature tensors and turns the reached
/// leaves into edge probabilities.
pub struct ForestEvaluator {
    forest: Arc<Forest>,
    tables: OffsetTables,
}

impl ForestEvaluator {
    /// The lookup tables are computed once here and used for every evaluation.
    pub fn new(forest: Arc<Forest>) -> ForestEvaluator {
        let tables = OffsetTables::from_options(forest.options());
        ForestEvaluator {
            forest: forest,
            tables: tables,
        }
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn tables(&self) -> &OffsetTables {
        &self.tables
    }

    /// Computes the edge probabilities of the feature tensor using a single core.
    /// The result has `number_of_output_channels` channels and the full
    /// (not shrunk) resolution of the features.
    pub fn detect_edges(&self, features: &Tensor) -> Result<Tensor> {
        let grid = self.leaf_ids(features)?;
        Ok(self.accumulate(features, &grid))
    }

    /// Like `detect_edges`, but the patches are evaluated on multiple cores.
    pub fn detect_edges_parallel(&self, features: &Tensor) -> Result<Tensor> {
        let grid = self.leaf_ids_parallel(features)?;
        Ok(self.accumulate(features, &grid))
    }

    /// Descends the trees of every patch using a single core.
    pub fn leaf_ids(&self, features: &Tensor) -> Result<LeafGrid> {
        self.leaf_ids_generic(features, |eval, smoothed, leaves| {
            let row_len = smoothed.width * eval.trees_per_patch();
            for (i, row) in leaves.chunks_mut(row_len).enumerate() {
                eval.leaves_of_row(smoothed, i, row);
            }
        })
    }

    /// Descends the trees of every patch. Rows of patches are
    /// distributed over multiple cores.
    pub fn leaf_ids_parallel(&self, features: &Tensor) -> Result<LeafGrid> {
        self.leaf_ids_generic(features, |eval, smoothed, leaves| {
            let row_len = smoothed.width * eval.trees_per_patch();
            leaves.par_chunks_mut(row_len)
                .enumerate()
                .for_each(|(i, row)| eval.leaves_of_row(smoothed, i, row));
        })
    }

    fn trees_per_patch(&self) -> usize {
        self.forest.options().number_of_trees_to_evaluate
    }

    /// Smooths the features, computes the patch grid and lets `fill` compute the leaves.
    fn leaf_ids_generic<F>(&self, features: &Tensor, fill: F) -> Result<LeafGrid>
        where F: Fn(&ForestEvaluator, &SmoothedFeatures, &mut [u32])
    {
        let opts = self.forest.options();
        let channels = opts.number_of_output_channels();
        if features.channels() != channels {
            bail!(ErrorKind::ChannelMismatch(channels, features.channels()));
        }
        let shrink = opts.shrink_number;
        let (height, width) = patch_grid_size(features.rows() * shrink,
                                              features.cols() * shrink,
                                              opts.patch_size,
                                              opts.stride);
        if height == 0 || width == 0 {
            bail!(ErrorKind::InvalidInput(format!("features of size {}x{} are too small for a \
                                                   single patch of size {}",
                                                  features.rows(),
                                                  features.cols(),
                                                  opts.patch_size)));
        }
        debug!("Evaluating {}x{} patches with {} trees each",
               height,
               width,
               self.trees_per_patch());

        let regular = imgops::box_smooth(features, opts.reg_smoothing_radius());
        let self_similarity = imgops::box_smooth(features, opts.ss_smoothing_radius());
        let smoothed = SmoothedFeatures {
            regular: &regular,
            self_similarity: &self_similarity,
            height: height,
            width: width,
        };

        let mut leaves = vec![0u32; height * width * self.trees_per_patch()];
        fill(self, &smoothed, &mut leaves);
        Ok(LeafGrid {
            height: height,
            width: width,
            trees_per_patch: self.trees_per_patch(),
            leaves: leaves,
        })
    }

    /// Computes the leaves of the patch row `i`.
    fn leaves_of_row(&self, smoothed: &SmoothedFeatures, i: usize, row: &mut [u32]) {
        let opts = self.forest.options();
        let shrink = opts.shrink_number;
        let trees = opts.number_of_trees;
        let per_patch = self.trees_per_patch();
        let features = smoothed.regular;
        let channels = features.channels();

        for j in 0..smoothed.width {
            let view = PatchView {
                regular: smoothed.regular.as_slice(),
                self_similarity: smoothed.self_similarity.as_slice(),
                tables: &self.tables,
                regular_count: self.tables.regular.len(),
                pitch: features.cols() * channels,
                channels: channels,
                origin: features.index(i * opts.stride / shrink, j * opts.stride / shrink, 0),
            };
            for k in 0..per_patch {
                // neighbouring patches use different trees
                let tree = ((i + j) % (2 * per_patch) + k) % trees;
                row[j * per_patch + k] = self.forest.descend(tree, &view) as u32;
            }
        }
    }

    /// Adds the votes of every reached leaf to the center of its patch.
    fn accumulate(&self, features: &Tensor, grid: &LeafGrid) -> Tensor {
        let opts = self.forest.options();
        let channels = opts.number_of_output_channels();
        let inner = opts.patch_inner_size;
        let border = (opts.patch_size - inner) / 2;
        let mut edges = Tensor::new(features.rows() * opts.shrink_number,
                                    features.cols() * opts.shrink_number,
                                    channels);
        for i in 0..grid.height {
            for j in 0..grid.width {
                let first = (i * grid.width + j) * grid.trees_per_patch;
                for &leaf in &grid.leaves[first..first + grid.trees_per_patch] {
                    for &bin in self.forest.edge_bins(leaf as usize) {
                        let bin = bin as usize;
                        let pixel = bin / channels;
                        let row = i * opts.stride + border + pixel / inner;
                        let col = j * opts.stride + border + pixel % inner;
                        let idx = edges.index(row, col, bin % channels);
                        edges.as_mut_slice()[idx] += 1.0;
                    }
                }
            }
        }

        let stride = opts.stride as f32;
        edges.scale(2.0 * stride * stride / (inner * inner) as f32 / grid.trees_per_patch as f32);
        if edges.as_slice().iter().all(|&v| v == 0.0) {
            debug!("No leaf voted for an edge");
        }
        edges
    }
}
