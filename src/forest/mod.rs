//! A structured random forest: its options, the trees and their evaluation.
//! For literature see
//! * https://arxiv.org/abs/1406.5549 (Fast Edge Detection Using Structured Forests)

pub mod options;
pub mod model;
pub mod evaluate;

pub use self::evaluate::{ForestEvaluator, LeafGrid, OffsetTables};
pub use self::model::{Forest, PatchFeatures};
pub use self::options::{OptionsRecord, RandomForestOptions};
