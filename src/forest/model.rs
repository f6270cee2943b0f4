//! The flattened structured forest and the tree descent.

use super::options::{OptionsRecord, RandomForestOptions};
use crate::errors::*;
use serde_json;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A node of a tree asks for the value of a feature.
/// This trait abstracts where these values come from.
pub trait PatchFeatures {
    fn feature(&self, id: usize) -> f32;
}

/// A plain feature vector
impl PatchFeatures for [f32] {
    fn feature(&self, id: usize) -> f32 {
        self[id]
    }
}

/// Layout of the model file: one sequence per tree for every array.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelFile {
    options: OptionsRecord,
    childs: Vec<Vec<i64>>,
    feature_ids: Vec<Vec<u32>>,
    thresholds: Vec<Vec<f32>>,
    edge_boundaries: Vec<Vec<u32>>,
    edge_bins: Vec<Vec<u32>>,
}

/// A forest of binary trees, stored in flat arrays.
///
/// Every tree has the same number of node slots (`number_of_tree_nodes`),
/// tree `t` occupies the slots `t * number_of_tree_nodes ..`.
/// For a node `k` the value `childs[k]` is 0 if `k` is a leaf. Otherwise the
/// children are at the tree-local positions `childs[k] - 1` (left) and `childs[k]` (right).
/// A leaf `k` votes for the edge bins `edge_bins[edge_boundaries[k]..edge_boundaries[k+1]]`.
#[derive(Debug, Clone)]
pub struct Forest {
    options: RandomForestOptions,
    childs: Vec<u32>,
    feature_ids: Vec<u32>,
    thresholds: Vec<f32>,
    edge_boundaries: Vec<u32>,
    edge_bins: Vec<u32>,
    number_of_tree_nodes: usize,
}

macro_rules! malformed {
    ($($msg: tt)*) => {
        bail!(ErrorKind::MalformedForest(format!($($msg)*)))
    }
}

impl Forest {
    /// Loads a forest from a json model file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Forest> {
        let path = path.as_ref();
        info!("Loading forest from {:?}", path);
        let file = File::open(path).chain_err(|| format!("Unable to open model file {:?}", path))?;
        Forest::from_reader(BufReader::new(file))
    }

    /// Reads a forest in the json model format.
    pub fn from_reader<R: Read>(reader: R) -> Result<Forest> {
        let model: ModelFile = serde_json::from_reader(reader)?;
        Forest::from_model_file(model)
    }

    fn from_model_file(model: ModelFile) -> Result<Forest> {
        let options = RandomForestOptions::from_record(&model.options)?;
        let trees = options.number_of_trees;
        {
            let counts = [("childs", model.childs.len()),
                          ("featureIds", model.feature_ids.len()),
                          ("thresholds", model.thresholds.len()),
                          ("edgeBoundaries", model.edge_boundaries.len()),
                          ("edgeBins", model.edge_bins.len())];
            for &(name, count) in counts.iter() {
                if count != trees {
                    malformed!("{} contains {} trees, but numberOfTrees is {}", name, count, trees);
                }
            }
        }

        // every tree has the same number of node slots
        let nodes = model.childs.first().map_or(0, |c| c.len());
        for t in 0..trees {
            if model.childs[t].len() != nodes || model.feature_ids[t].len() != nodes ||
               model.thresholds[t].len() != nodes ||
               model.edge_boundaries[t].len() != nodes + 1 {
                malformed!("tree {} has {} childs, {} featureIds, {} thresholds and {} \
                            edgeBoundaries, expected {} nodes like tree 0",
                           t,
                           model.childs[t].len(),
                           model.feature_ids[t].len(),
                           model.thresholds[t].len(),
                           model.edge_boundaries[t].len(),
                           nodes);
            }
        }

        let mut childs = Vec::new();
        for (t, tree) in model.childs.iter().enumerate() {
            for &c in tree.iter() {
                if c < 0 || c > u32::max_value() as i64 {
                    malformed!("invalid child pointer {} in tree {} (leaves are marked with 0)",
                               c,
                               t);
                }
                childs.push(c as u32);
            }
        }
        let feature_ids = model.feature_ids.concat();
        let thresholds = model.thresholds.concat();

        // The boundaries of every tree refer to the edge bins of this tree.
        // Move them so they refer to the concatenated edge bins.
        let mut edge_boundaries = vec![0u32];
        let mut offset = 0u32;
        for (t, (bounds, bins)) in model.edge_boundaries
            .iter()
            .zip(model.edge_bins.iter())
            .enumerate() {
            if bounds.first() != Some(&0) {
                malformed!("edgeBoundaries of tree {} must start with 0", t);
            }
            if bounds.last().map(|&b| b as usize) != Some(bins.len()) {
                malformed!("edgeBoundaries of tree {} must end with the number of its edge bins ({})",
                           t,
                           bins.len());
            }
            if bounds.windows(2).any(|w| w[0] > w[1]) {
                malformed!("edgeBoundaries of tree {} are decreasing", t);
            }
            for &b in bounds[1..].iter() {
                match b.checked_add(offset) {
                    Some(rebased) => edge_boundaries.push(rebased),
                    None => malformed!("too many edge bins (tree {})", t),
                }
            }
            offset = match offset.checked_add(bins.len() as u32) {
                Some(o) if bins.len() <= u32::max_value() as usize => o,
                _ => malformed!("too many edge bins (tree {})", t),
            };
        }
        let edge_bins = model.edge_bins.concat();

        Forest::from_flat(options, childs, feature_ids, thresholds, edge_boundaries, edge_bins)
    }

    /// Creates a forest from arrays in which the trees are already concatenated.
    /// `edge_boundaries` needs one entry more than there are nodes.
    ///
    /// Every array is checked, so a forest which has been created
    /// successfully can be evaluated without any further checks.
    pub fn from_flat(options: RandomForestOptions,
                     childs: Vec<u32>,
                     feature_ids: Vec<u32>,
                     thresholds: Vec<f32>,
                     edge_boundaries: Vec<u32>,
                     edge_bins: Vec<u32>)
                     -> Result<Forest> {
        let trees = options.number_of_trees;
        if childs.is_empty() || childs.len() % trees != 0 {
            malformed!("{} nodes cannot be divided into {} trees", childs.len(), trees);
        }
        if childs.len() >= u32::max_value() as usize {
            malformed!("too many nodes ({})", childs.len());
        }
        if feature_ids.len() != childs.len() || thresholds.len() != childs.len() {
            malformed!("childs ({}), featureIds ({}) and thresholds ({}) differ in length",
                       childs.len(),
                       feature_ids.len(),
                       thresholds.len());
        }
        if edge_boundaries.len() != childs.len() + 1 {
            malformed!("expected {} edge boundaries, found {}",
                       childs.len() + 1,
                       edge_boundaries.len());
        }
        if edge_boundaries[0] != 0 || edge_boundaries.windows(2).any(|w| w[0] > w[1]) ||
           edge_boundaries[childs.len()] as usize != edge_bins.len() {
            malformed!("edge boundaries are not increasing from 0 to {}", edge_bins.len());
        }

        let nodes = childs.len() / trees;
        let feature_count = options.feature_count();
        for (k, &c) in childs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let local = k % nodes;
            let c = c as usize;
            // children have to come after their parent, so there are no cycles
            if c - 1 <= local || c >= nodes {
                malformed!("node {} of tree {} points to the children {} and {} (tree has {} nodes)",
                           local,
                           k / nodes,
                           c as isize - 1,
                           c,
                           nodes);
            }
            if feature_ids[k] as usize >= feature_count {
                malformed!("node {} uses feature {}, but there are only {} features",
                           k,
                           feature_ids[k],
                           feature_count);
            }
        }

        let inner = options.patch_inner_size;
        let bin_count = inner * inner * options.number_of_output_channels();
        if let Some(bin) = edge_bins.iter().find(|&&b| b as usize >= bin_count) {
            malformed!("edge bin {} exceeds the {} bins of an inner patch", bin, bin_count);
        }

        if edge_bins.is_empty() {
            warn!("No leaf of the forest votes for an edge");
        }
        info!("Loaded forest with {} trees of {} nodes", trees, nodes);
        Ok(Forest {
            options: options,
            childs: childs,
            feature_ids: feature_ids,
            thresholds: thresholds,
            edge_boundaries: edge_boundaries,
            edge_bins: edge_bins,
            number_of_tree_nodes: nodes,
        })
    }

    /// Writes the forest in the json model format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .chain_err(|| format!("Unable to create model file {:?}", path.as_ref()))?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let n = self.number_of_tree_nodes;
        let trees = self.options.number_of_trees;
        let split_u32 = |v: &[u32]| v.chunks(n).map(|c| c.to_vec()).collect::<Vec<_>>();
        let mut edge_boundaries = Vec::with_capacity(trees);
        let mut edge_bins = Vec::with_capacity(trees);
        for t in 0..trees {
            let bounds = &self.edge_boundaries[t * n..(t + 1) * n + 1];
            let first = bounds[0];
            edge_boundaries.push(bounds.iter().map(|&b| b - first).collect());
            edge_bins.push(self.edge_bins[first as usize..bounds[n] as usize].to_vec());
        }
        let model = ModelFile {
            options: self.options.to_record(),
            childs: self.childs.chunks(n).map(|c| c.iter().map(|&v| v as i64).collect()).collect(),
            feature_ids: split_u32(&self.feature_ids),
            thresholds: self.thresholds.chunks(n).map(|c| c.to_vec()).collect(),
            edge_boundaries: edge_boundaries,
            edge_bins: edge_bins,
        };
        serde_json::to_writer(writer, &model)?;
        Ok(())
    }

    pub fn options(&self) -> &RandomForestOptions {
        &self.options
    }

    /// Number of node slots of every tree
    pub fn number_of_tree_nodes(&self) -> usize {
        self.number_of_tree_nodes
    }

    pub fn number_of_trees(&self) -> usize {
        self.options.number_of_trees
    }

    /// Position of the root node of tree `tree`.
    #[inline]
    pub fn root(&self, tree: usize) -> usize {
        tree * self.number_of_tree_nodes
    }

    #[inline]
    pub fn is_leaf(&self, node: usize) -> bool {
        self.childs[node] == 0
    }

    /// The edge bins a leaf votes for.
    #[inline]
    pub fn edge_bins(&self, node: usize) -> &[u32] {
        let start = self.edge_boundaries[node] as usize;
        let end = self.edge_boundaries[node + 1] as usize;
        &self.edge_bins[start..end]
    }

    /// Descends tree `tree` from its root and returns the reached leaf.
    ///
    /// The left child is taken if the node's feature is lower than its threshold.
    /// Ends after at most `number_of_tree_nodes` steps, because children
    /// always have a larger position than their parent.
    #[inline]
    pub fn descend<F: PatchFeatures + ?Sized>(&self, tree: usize, features: &F) -> usize {
        let base = self.root(tree);
        let mut node = base;
        loop {
            let child = self.childs[node] as usize;
            if child == 0 {
                return node;
            }
            let value = features.feature(self.feature_ids[node] as usize);
            node = if value < self.thresholds[node] {
                base + child - 1
            } else {
                base + child
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(trees: usize) -> RandomForestOptions {
        RandomForestOptions::from_record(&OptionsRecord {
                number_of_trees: trees,
                number_of_trees_to_evaluate: 1,
                ..Default::default()
            })
            .unwrap()
    }

    /// A tree of depth 3: root 0, inner nodes 1 and 2, leaves 3 to 6.
    /// Leaf `l` votes for the edge bin `l`.
    fn depth3_forest(trees: usize) -> Forest {
        let mut childs = vec![];
        let mut feature_ids = vec![];
        let mut thresholds = vec![];
        let mut bounds = vec![0];
        let mut bins = vec![];
        for _ in 0..trees {
            childs.extend_from_slice(&[2, 4, 6, 0, 0, 0, 0]);
            feature_ids.extend_from_slice(&[0, 1, 2, 0, 0, 0, 0]);
            thresholds.extend_from_slice(&[0.5, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
            for node in 0..7u32 {
                if node >= 3 {
                    bins.push(node);
                }
                bounds.push(bins.len() as u32);
            }
        }
        Forest::from_flat(options(trees), childs, feature_ids, thresholds, bounds, bins).unwrap()
    }

    #[test]
    fn test_descend_reaches_leaf() {
        let forest = depth3_forest(2);
        assert_eq!(forest.number_of_tree_nodes(), 7);
        // root: 0.7 >= 0.5 => right (2); node 2: 0.5 < 1.0 => left (5)
        let features = [0.7f32, -3.0, 0.5];
        assert_eq!(forest.descend(0, &features[..]), 5);
        assert_eq!(forest.edge_bins(5), &[5]);
        // root: left (1); node 1: -1.0 < 0.0 => left (3)
        let features = [0.1f32, -1.0, 7.0];
        assert_eq!(forest.descend(0, &features[..]), 3);
        // the second tree uses its own node slots
        assert_eq!(forest.descend(1, &features[..]), 7 + 3);
        assert!(forest.is_leaf(10));
        assert!(!forest.is_leaf(7));
        assert!(forest.edge_bins(7).is_empty());
    }

    #[test]
    fn test_backward_pointer_is_rejected() {
        let childs = vec![2, 1, 0];
        let res = Forest::from_flat(options(1),
                                    childs,
                                    vec![0; 3],
                                    vec![0.0; 3],
                                    vec![0; 4],
                                    vec![]);
        match res {
            Err(Error(ErrorKind::MalformedForest(_), _)) => (),
            _ => panic!("a cycle has to be rejected"),
        }
        // right child outside of the tree
        let res = Forest::from_flat(options(1),
                                    vec![3, 0, 0],
                                    vec![0; 3],
                                    vec![0.0; 3],
                                    vec![0; 4],
                                    vec![]);
        assert!(res.is_err());
    }

    #[test]
    fn test_invalid_arrays_are_rejected() {
        let opts = options(2);
        // 5 nodes cannot be split into 2 trees
        assert!(Forest::from_flat(opts, vec![0; 5], vec![0; 5], vec![0.0; 5], vec![0; 6], vec![])
            .is_err());
        // feature id out of range
        let id = opts.feature_count() as u32;
        match Forest::from_flat(options(1),
                                vec![2, 0, 0],
                                vec![id, 0, 0],
                                vec![0.0; 3],
                                vec![0; 4],
                                vec![]) {
            Err(Error(ErrorKind::MalformedForest(msg), _)) => assert!(msg.contains("feature")),
            _ => panic!("feature id out of range has to be rejected"),
        }
        // edge boundaries do not match the bins
        assert!(Forest::from_flat(opts, vec![0; 4], vec![0; 4], vec![0.0; 4], vec![0; 5], vec![1])
            .is_err());
        // edge bin out of range
        let bin = (16 * 16 * 13) as u32;
        assert!(Forest::from_flat(opts,
                                  vec![0; 4],
                                  vec![0; 4],
                                  vec![0.0; 4],
                                  vec![0, 1, 1, 1, 1],
                                  vec![bin])
            .is_err());
    }

    #[test]
    fn test_json_round_trip_rebases_edge_bins() {
        let forest = depth3_forest(3);
        let mut buffer = Vec::new();
        forest.to_writer(&mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.contains("\"edgeBoundaries\":[[0,0,0,0,1,2,3,4],"));
        let loaded = Forest::from_reader(&buffer[..]).unwrap();
        assert_eq!(loaded.number_of_tree_nodes(), 7);
        for node in 0..21 {
            assert_eq!(loaded.edge_bins(node), forest.edge_bins(node));
        }
        assert_eq!(loaded.edge_bins(2 * 7 + 6), &[6]);
    }

    #[test]
    fn test_negative_child_and_tree_count() {
        let json = r#"{"options": {"shrinkNumber": 2, "numberOfGradientOrientations": 4,
                       "gradientNormalizationRadius": 4, "regFeatureSmoothingRadius": 2,
                       "ssFeatureSmoothingRadius": 8, "selfsimilarityGridSize": 5,
                       "patchSize": 32, "patchInnerSize": 16, "stride": 2,
                       "numberOfTrees": 1, "numberOfTreesToEvaluate": 1},
                       "childs": [[-1]], "featureIds": [[0]], "thresholds": [[0.0]],
                       "edgeBoundaries": [[0, 0]], "edgeBins": [[]]}"#;
        assert!(Forest::from_reader(json.as_bytes()).is_err());
        let fixed = json.replace("[[-1]]", "[[0]]");
        assert!(Forest::from_reader(fixed.as_bytes()).is_ok());
        let two_trees = fixed.replace("\"numberOfTrees\": 1", "\"numberOfTrees\": 2");
        assert!(Forest::from_reader(two_trees.as_bytes()).is_err());
        assert!(Forest::load("/nonexistent/model.json").is_err());
    }

    fn two_tree_json(childs: &str, feature_ids: &str, thresholds: &str, bounds: &str, bins: &str) -> String {
        format!(r#"{{"options": {{"shrinkNumber": 2, "numberOfGradientOrientations": 4,
                   "gradientNormalizationRadius": 4, "regFeatureSmoothingRadius": 2,
                   "ssFeatureSmoothingRadius": 8, "selfsimilarityGridSize": 5,
                   "patchSize": 32, "patchInnerSize": 16, "stride": 2,
                   "numberOfTrees": 2, "numberOfTreesToEvaluate": 1}},
                   "childs": {}, "featureIds": {}, "thresholds": {},
                   "edgeBoundaries": {}, "edgeBins": {}}}"#,
                childs,
                feature_ids,
                thresholds,
                bounds,
                bins)
    }

    fn assert_malformed(json: &str) {
        match Forest::from_reader(json.as_bytes()) {
            Err(Error(ErrorKind::MalformedForest(_), _)) => (),
            Err(e) => panic!("expected a malformed forest, got {}", e),
            Ok(_) => panic!("expected a malformed forest"),
        }
    }

    #[test]
    fn test_trees_of_different_size_are_rejected() {
        let valid = two_tree_json("[[2, 0, 0], [2, 0, 0]]",
                                  "[[0, 0, 0], [0, 0, 0]]",
                                  "[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]",
                                  "[[0, 0, 1, 1], [0, 0, 0, 0]]",
                                  "[[5], []]");
        let forest = Forest::from_reader(valid.as_bytes()).unwrap();
        assert_eq!(forest.number_of_tree_nodes(), 3);
        assert!(!forest.is_leaf(forest.root(1)));

        // 1 + 7 nodes would divide into 2 trees of 4 nodes
        assert_malformed(&two_tree_json("[[0], [3, 0, 0, 0, 0, 0, 0]]",
                                        "[[0], [0, 0, 0, 0, 0, 0, 0]]",
                                        "[[0.0], [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]]",
                                        "[[0, 0], [0, 0, 0, 0, 0, 0, 0, 0]]",
                                        "[[], []]"));
        // thresholds of the second tree are too short
        assert_malformed(&two_tree_json("[[2, 0, 0], [2, 0, 0]]",
                                        "[[0, 0, 0], [0, 0, 0]]",
                                        "[[0.0, 0.0, 0.0], [0.0, 0.0]]",
                                        "[[0, 0, 0, 0], [0, 0, 0, 0]]",
                                        "[[], []]"));
        // boundaries of the first tree are too long
        assert_malformed(&two_tree_json("[[2, 0, 0], [2, 0, 0]]",
                                        "[[0, 0, 0], [0, 0, 0]]",
                                        "[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]",
                                        "[[0, 0, 0, 0, 0], [0, 0, 0, 0]]",
                                        "[[], []]"));
    }

    #[test]
    fn test_decreasing_edge_boundaries_are_rejected() {
        assert_malformed(&two_tree_json("[[0, 0], [0, 0]]",
                                        "[[0, 0], [0, 0]]",
                                        "[[0.0, 0.0], [0.0, 0.0]]",
                                        "[[0, 1, 1], [0, 4294967295, 0]]",
                                        "[[7], []]"));
        assert_malformed(&two_tree_json("[[0, 0], [0, 0]]",
                                        "[[0, 0], [0, 0]]",
                                        "[[0.0, 0.0], [0.0, 0.0]]",
                                        "[[0, 2, 1], [0, 0, 0]]",
                                        "[[7], []]"));
    }
}
