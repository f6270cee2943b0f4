//! Edge detection on RGB images: a single scale pipeline made of
//! feature extraction and forest evaluation, and averaging over several scales.

use crate::errors::*;
use crate::features::FeatureExtractor;
use crate::forest::{Forest, ForestEvaluator};
use crate::imgops;
use crate::types::Tensor;
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;

/// Scales at which `detect_multiple_scales` runs by default
pub const DEFAULT_SCALES: [f32; 3] = [0.5, 1.0, 2.0];

/// A detector which computes edge probabilities at the resolution of its
/// input and gets multi scale detection for free.
pub trait MultiScaleDetector {
    /// Returns the edge probabilities of an RGB image
    /// (same size as the image).
    fn detect_single_scale(&self, image: &Tensor) -> Result<Tensor>;

    /// Scales used by `detect_multiple_scales`
    fn scales(&self) -> &[f32] {
        &DEFAULT_SCALES
    }

    /// Runs `detect_single_scale` on the image resized by every scale,
    /// resizes the results back and returns their mean.
    fn detect_multiple_scales(&self, image: &Tensor) -> Result<Tensor> {
        check_scales(self.scales())?;
        let results = self.scales()
            .iter()
            .map(|&scale| detect_at_scale(self, image, scale))
            .collect::<Result<Vec<_>>>()?;
        average(results)
    }

    /// Like `detect_multiple_scales`, but the scales are processed on multiple cores.
    /// The result is identical.
    fn detect_multiple_scales_parallel(&self, image: &Tensor) -> Result<Tensor>
        where Self: Sync
    {
        check_scales(self.scales())?;
        let results = self.scales()
            .par_iter()
            .map(|&scale| detect_at_scale(self, image, scale))
            .collect::<Result<Vec<_>>>()?;
        average(results)
    }
}

fn check_scales(scales: &[f32]) -> Result<()> {
    if scales.is_empty() {
        bail!(ErrorKind::InvalidInput("no scales given".to_string()));
    }
    if let Some(s) = scales.iter().find(|&&s| !(s > 0.0) || !s.is_finite()) {
        bail!(ErrorKind::InvalidInput(format!("invalid scale {}", s)));
    }
    Ok(())
}

fn detect_at_scale<D>(detector: &D, image: &Tensor, scale: f32) -> Result<Tensor>
    where D: MultiScaleDetector + ?Sized
{
    debug!("Detecting edges at scale {}", scale);
    let resized = imgops::resize_by(image, scale)?;
    let edges = detector.detect_single_scale(&resized)?;
    imgops::resize(&edges, image.rows(), image.cols())
}

/// Sums the results in the given order and divides by their number.
fn average(results: Vec<Tensor>) -> Result<Tensor> {
    let n = results.len() as f32;
    let mut iter = results.into_iter();
    let mut sum = match iter.next() {
        Some(first) => first,
        None => bail!(ErrorKind::InvalidInput("nothing to average".to_string())),
    };
    for res in iter {
        sum.accumulate(&res)?;
    }
    for v in sum.as_mut_slice() {
        *v /= n;
    }
    Ok(sum)
}

/// Edge detection with a structured forest.
///
/// The forest is shared, so several detectors (or threads) can use the same model.
pub struct StructuredEdgeDetector {
    extractor: FeatureExtractor,
    evaluator: ForestEvaluator,
    scales: Vec<f32>,
}

impl StructuredEdgeDetector {
    pub fn new(forest: Arc<Forest>) -> StructuredEdgeDetector {
        StructuredEdgeDetector {
            extractor: FeatureExtractor::new(*forest.options()),
            evaluator: ForestEvaluator::new(forest),
            scales: DEFAULT_SCALES.to_vec(),
        }
    }

    /// Loads the model file and creates a detector using it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StructuredEdgeDetector> {
        let forest = Forest::load(path)?;
        Ok(StructuredEdgeDetector::new(Arc::new(forest)))
    }

    /// Sets the scales used for multi scale detection.
    pub fn with_scales(mut self, scales: &[f32]) -> Self {
        self.scales = scales.to_vec();
        self
    }

    pub fn forest(&self) -> &Forest {
        self.evaluator.forest()
    }

    /// Like `detect_single_scale`, but the patches are evaluated on multiple cores.
    pub fn detect_single_scale_parallel(&self, image: &Tensor) -> Result<Tensor> {
        self.detect_generic(image, |eval, features| eval.detect_edges_parallel(features))
    }

    /// Pads the image so every pixel lies within the same number of patches,
    /// computes the features, lets `evaluate` compute the edges and removes the padding.
    fn detect_generic<F>(&self, image: &Tensor, evaluate: F) -> Result<Tensor>
        where F: Fn(&ForestEvaluator, &Tensor) -> Result<Tensor>
    {
        if image.channels() != 3 {
            bail!(ErrorKind::InvalidInput(format!("expected an RGB image, got {} channels",
                                                  image.channels())));
        }
        if image.is_empty() {
            bail!(ErrorKind::InvalidInput("empty image".to_string()));
        }
        let opts = self.extractor.options();
        let (rows, cols) = image.size();
        info!("Detecting edges of a {}x{} image", rows, cols);

        let pad = (opts.patch_size + opts.patch_inner_size) / 2;
        let shrink = opts.shrink_number;
        let extra = |n: usize| (shrink - (n + 2 * pad) % shrink) % shrink;
        let padded = imgops::pad_reflect(image, pad, pad + extra(rows), pad, pad + extra(cols));

        let features = self.extractor.extract(&padded)?;
        debug!("Features: {}x{}x{}",
               features.rows(),
               features.cols(),
               features.channels());
        let edges = evaluate(&self.evaluator, &features)?;
        imgops::crop(&edges, pad, pad, rows, cols)
    }
}

impl MultiScaleDetector for StructuredEdgeDetector {
    /// Computes the edges of an RGB image using a single core.
    fn detect_single_scale(&self, image: &Tensor) -> Result<Tensor> {
        self.detect_generic(image, |eval, features| eval.detect_edges(features))
    }

    fn scales(&self) -> &[f32] {
        &self.scales
    }
}
