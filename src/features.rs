//! Computation of the feature channels the forest is evaluated on:
//! three color channels and, for two scales, the normalized gradient
//! magnitude and a histogram of oriented gradients.

use crate::errors::*;
use crate::forest::RandomForestOptions;
use crate::imgops;
use crate::types::Tensor;
use std::borrow::Cow;
use std::f32::consts::PI;

/// Scales (relative to the input) at which gradients are computed
const GRADIENT_SCALES: [f32; 2] = [1.0, 0.5];

/// Added to the smoothed magnitude before normalizing,
/// so weak gradients stay weak.
const NORMALIZATION_EPSILON: f32 = 0.1;

/// Two scales are the same if they differ less than this
const SCALE_TOLERANCE: f32 = 1e-2;

pub struct FeatureExtractor {
    options: RandomForestOptions,
}

impl FeatureExtractor {
    pub fn new(options: RandomForestOptions) -> FeatureExtractor {
        FeatureExtractor { options: options }
    }

    pub fn options(&self) -> &RandomForestOptions {
        &self.options
    }

    /// Turns an RGB image into the feature tensor.
    ///
    /// The result has `number_of_output_channels` channels and the size of
    /// the input divided by `shrink_number`.
    pub fn extract(&self, image: &Tensor) -> Result<Tensor> {
        if image.channels() != 3 {
            bail!(ErrorKind::ChannelMismatch(3, image.channels()));
        }
        let opts = &self.options;
        let shrink = opts.shrink_number as f32;
        let luv = imgops::rgb_to_luv(image)?;
        let rows = imgops::scaled_len(image.rows(), 1.0 / shrink);
        let cols = imgops::scaled_len(image.cols(), 1.0 / shrink);
        let shrunk = imgops::resize(&luv, rows, cols)?;

        let mut channels = shrunk.split();
        for &scale in GRADIENT_SCALES.iter() {
            let resampled = if (scale - 1.0 / shrink).abs() < SCALE_TOLERANCE {
                Cow::Borrowed(&shrunk)
            } else {
                Cow::Owned(imgops::resize_by(&luv, scale)?)
            };
            let smoothed = imgops::box_smooth(&resampled, opts.gradient_smoothing_radius);
            let cell = ((shrink * scale) as usize).max(1);
            let (magnitude, histogram) = gradient_histogram(&smoothed,
                                                            opts.number_of_gradient_orientations,
                                                            cell,
                                                            opts.gradient_normalization_radius)?;
            debug!("Gradient scale {}: {}x{} image, {}x{} histogram",
                   scale,
                   smoothed.rows(),
                   smoothed.cols(),
                   histogram.rows(),
                   histogram.cols());
            channels.push(imgops::resize(&magnitude, rows, cols)?);
            channels.extend(imgops::resize(&histogram, rows, cols)?.split());
        }

        mix_channels(&channels, opts.number_of_output_channels())
    }
}

/// Merges the collected channels (in order) into one tensor of `out_channels` channels.
/// The 2:1 pairing of source channels maps source channel `c` to output channel `c`,
/// so this is a plain merge once the channel count matches.
fn mix_channels(parts: &[Tensor], out_channels: usize) -> Result<Tensor> {
    let collected: usize = parts.iter().map(|p| p.channels()).sum();
    if collected != out_channels {
        bail!(ErrorKind::ChannelMismatch(out_channels, collected));
    }
    Tensor::merge(parts)
}

/// Computes the normalized gradient magnitude and a histogram
/// of gradient orientations.
///
/// For every pixel the channel with the strongest gradient is used.
/// The histogram has one cell per `cell` x `cell` pixels and
/// `orientations` channels (one per orientation bin over [0, 2π)).
///
/// # Arguments
/// * `img` - the image to compute gradients on
/// * `orientations` - number of orientation bins
/// * `cell` - width of a histogram cell in pixels
/// * `norm_radius` - smoothing radius of the magnitude used for normalization
pub fn gradient_histogram(img: &Tensor,
                          orientations: usize,
                          cell: usize,
                          norm_radius: usize)
                          -> Result<(Tensor, Tensor)> {
    let (rows, cols) = img.size();
    let hist_rows = (rows as f32 / cell as f32).round() as usize;
    let hist_cols = (cols as f32 / cell as f32).round() as usize;
    if hist_rows == 0 || hist_cols == 0 {
        bail!(ErrorKind::InvalidInput(format!("a {}x{} image has no histogram cell of size {}",
                                              rows,
                                              cols,
                                              cell)));
    }

    let (dx, dy) = imgops::gradient(img);
    let mut magnitude = Tensor::new(rows, cols, 1);
    let mut orientation = vec![0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let (gx, gy) = dx.pixel(r, c)
                .iter()
                .zip(dy.pixel(r, c).iter())
                .fold((0.0f32, 0.0f32), |best, (&gx, &gy)| {
                    if gx * gx + gy * gy > best.0 * best.0 + best.1 * best.1 {
                        (gx, gy)
                    } else {
                        best
                    }
                });
            magnitude.set(r, c, 0, (gx * gx + gy * gy).sqrt());
            let angle = gy.atan2(gx);
            orientation[r * cols + c] = if angle < 0.0 { angle + 2.0 * PI } else { angle };
        }
    }

    let normalized: Vec<f32> = {
        let smoothed = imgops::box_smooth(&magnitude, norm_radius);
        magnitude.as_slice()
            .iter()
            .zip(smoothed.as_slice().iter())
            .map(|(m, s)| m / (s + NORMALIZATION_EPSILON))
            .collect()
    };
    let magnitude = Tensor::from_vec(rows, cols, 1, normalized)?;

    let mut histogram = Tensor::new(hist_rows, hist_cols, orientations);
    for r in 0..rows {
        let hr = (r / cell).min(hist_rows - 1);
        for c in 0..cols {
            let hc = (c / cell).min(hist_cols - 1);
            let angle = orientation[r * cols + c];
            let bin = ((angle * orientations as f32 / (2.0 * PI)).floor() as usize).min(orientations - 1);
            let idx = histogram.index(hr, hc, bin);
            histogram.as_mut_slice()[idx] += magnitude.get(r, c, 0);
        }
    }
    Ok((magnitude, histogram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::options::OptionsRecord;

    fn options() -> RandomForestOptions {
        RandomForestOptions::from_record(&OptionsRecord::default()).unwrap()
    }

    #[test]
    fn test_feature_shape() {
        let extractor = FeatureExtractor::new(options());
        let img = Tensor::filled(40, 30, 3, 0.5);
        let features = extractor.extract(&img).unwrap();
        assert_eq!(features.size(), (20, 15));
        assert_eq!(features.channels(), 13);
        // a gray image has no gradients
        let first = features.pixel(0, 0).to_vec();
        assert!(first[3..].iter().all(|&v| v == 0.0));
        for r in 0..20 {
            for c in 0..15 {
                assert_eq!(features.pixel(r, c), &first[..]);
            }
        }
        assert!(extractor.extract(&Tensor::new(40, 30, 1)).is_err());
    }

    #[test]
    fn test_vertical_edge_votes_for_horizontal_gradient() {
        // left half dark, right half bright
        let mut img = Tensor::new(8, 8, 1);
        for r in 0..8 {
            for c in 4..8 {
                img.set(r, c, 0, 1.0);
            }
        }
        let (magnitude, histogram) = gradient_histogram(&img, 4, 2, 0).unwrap();
        assert_eq!(histogram.size(), (4, 4));
        assert_eq!(magnitude.get(0, 0, 0), 0.0);
        // gradient points to +x => orientation 0 => bin 0
        assert!(histogram.get(1, 1, 0) > 0.0);
        assert!(histogram.get(1, 2, 0) > 0.0);
        for bin in 1..4 {
            assert_eq!(histogram.get(1, 1, bin), 0.0);
        }
        assert_eq!(histogram.get(1, 0, 0), 0.0);
        // without smoothing: 4 / (4 + 0.1)
        assert!((magnitude.get(3, 3, 0) - 4.0 / 4.1).abs() < 1e-5);
    }

    #[test]
    fn test_negative_angles_are_wrapped() {
        // bright on top => gradient points to -y => angle -π/2 => 3π/2 => bin 2 of 3
        let mut img = Tensor::new(4, 4, 1);
        for c in 0..4 {
            img.set(0, c, 0, 1.0);
            img.set(1, c, 0, 1.0);
        }
        let (_, histogram) = gradient_histogram(&img, 3, 4, 0).unwrap();
        assert_eq!(histogram.size(), (1, 1));
        assert!(histogram.get(0, 0, 2) > 0.0);
        assert_eq!(histogram.get(0, 0, 1), 0.0);
        assert!(gradient_histogram(&img, 3, 9, 0).is_err());
    }

    #[test]
    fn test_mix_channels_keeps_order() {
        let parts = vec![Tensor::filled(2, 2, 2, 1.0), Tensor::filled(2, 2, 1, 3.0)];
        let mixed = mix_channels(&parts, 3).unwrap();
        assert_eq!(mixed.pixel(1, 1), &[1.0, 1.0, 3.0]);
        let ramp = Tensor::from_vec(1, 1, 4, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let mixed = mix_channels(&ramp.split(), 4).unwrap();
        assert_eq!(mixed, ramp);
        assert!(mix_channels(&parts, 4).is_err());
    }
}
