#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate rayon;

#[macro_use]
extern crate error_chain;
extern crate image;

#[macro_use]
extern crate log;

pub mod errors;
pub mod types;
pub mod imgops;
pub mod forest;
pub mod features;
pub mod detector;

pub use detector::{MultiScaleDetector, StructuredEdgeDetector};
pub use forest::{Forest, ForestEvaluator, RandomForestOptions};
pub use types::Tensor;
