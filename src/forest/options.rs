//! Parameters of a structured forest as they are stored in the model file.

use crate::errors::*;

/// The options as they are written in the model file.
/// Use `RandomForestOptions::from_record` to validate them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRecord {
    /// Downsampling factor of the feature channels
    pub shrink_number: usize,
    pub number_of_gradient_orientations: usize,
    /// Radius of the smoothing used to normalize the gradient magnitude
    pub gradient_normalization_radius: usize,
    /// Radius of the smoothing applied before computing gradients
    #[serde(default)]
    pub gradient_smoothing_radius: usize,
    pub reg_feature_smoothing_radius: usize,
    pub ss_feature_smoothing_radius: usize,
    /// The patch is divided into `size x size` cells for the
    /// self-similarity features.
    pub selfsimilarity_grid_size: usize,
    /// Width (and height) of a patch in pixels of the full resolution
    pub patch_size: usize,
    /// Width (and height) of the center part of a patch receiving votes
    pub patch_inner_size: usize,
    /// Distance between two neighbouring patches
    pub stride: usize,
    pub number_of_trees: usize,
    pub number_of_trees_to_evaluate: usize,
    /// Optional, but if it is given it has to be the derived value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_output_channels: Option<usize>,
}

impl Default for OptionsRecord {
    fn default() -> OptionsRecord {
        OptionsRecord {
            shrink_number: 2,
            number_of_gradient_orientations: 4,
            gradient_normalization_radius: 4,
            gradient_smoothing_radius: 0,
            reg_feature_smoothing_radius: 2,
            ss_feature_smoothing_radius: 8,
            selfsimilarity_grid_size: 5,
            patch_size: 32,
            patch_inner_size: 16,
            stride: 2,
            number_of_trees: 8,
            number_of_trees_to_evaluate: 4,
            number_of_output_channels: None,
        }
    }
}

/// Validated options of a structured forest.
///
/// The number of output channels is always derived from the number of
/// gradient orientations and cannot be set independently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomForestOptions {
    pub shrink_number: usize,
    pub number_of_gradient_orientations: usize,
    pub gradient_normalization_radius: usize,
    pub gradient_smoothing_radius: usize,
    pub reg_feature_smoothing_radius: usize,
    pub ss_feature_smoothing_radius: usize,
    pub selfsimilarity_grid_size: usize,
    pub patch_size: usize,
    pub patch_inner_size: usize,
    pub stride: usize,
    pub number_of_trees: usize,
    pub number_of_trees_to_evaluate: usize,
    number_of_output_channels: usize,
}

macro_rules! ensure_option {
    ($cond: expr, $($msg: tt)*) => {
        if !$cond {
            bail!(ErrorKind::InvalidOptions(format!($($msg)*)));
        }
    }
}

impl RandomForestOptions {
    /// Checks the options of a model file and derives
    /// the number of output channels.
    pub fn from_record(rec: &OptionsRecord) -> Result<RandomForestOptions> {
        ensure_option!(rec.shrink_number > 0, "shrinkNumber must be positive");
        ensure_option!(rec.number_of_gradient_orientations > 0,
                       "numberOfGradientOrientations must be positive");
        ensure_option!(rec.selfsimilarity_grid_size > 0,
                       "selfsimilarityGridSize must be positive");
        ensure_option!(rec.stride > 0, "stride must be positive");
        ensure_option!(rec.patch_inner_size > 0, "patchInnerSize must be positive");
        ensure_option!(rec.number_of_trees > 0, "numberOfTrees must be positive");
        ensure_option!(rec.number_of_trees_to_evaluate > 0 &&
                       rec.number_of_trees_to_evaluate <= rec.number_of_trees,
                       "numberOfTreesToEvaluate ({}) must be in 1..={}",
                       rec.number_of_trees_to_evaluate,
                       rec.number_of_trees);
        ensure_option!(rec.patch_size % rec.shrink_number == 0 && rec.patch_size > 0,
                       "patchSize ({}) must be a positive multiple of shrinkNumber ({})",
                       rec.patch_size,
                       rec.shrink_number);
        ensure_option!(rec.stride % rec.shrink_number == 0,
                       "stride ({}) must be a multiple of shrinkNumber ({})",
                       rec.stride,
                       rec.shrink_number);
        ensure_option!(rec.patch_inner_size <= rec.patch_size &&
                       (rec.patch_size - rec.patch_inner_size) % 2 == 0,
                       "patchInnerSize ({}) must fit centered into patchSize ({})",
                       rec.patch_inner_size,
                       rec.patch_size);
        ensure_option!(rec.selfsimilarity_grid_size <= rec.patch_size / rec.shrink_number,
                       "selfsimilarityGridSize ({}) is larger than a shrunk patch ({})",
                       rec.selfsimilarity_grid_size,
                       rec.patch_size / rec.shrink_number);

        let derived = 2 * (rec.number_of_gradient_orientations + 1) + 3;
        if let Some(given) = rec.number_of_output_channels {
            ensure_option!(given == derived,
                           "numberOfOutputChannels is {} but {} orientations require {}",
                           given,
                           rec.number_of_gradient_orientations,
                           derived);
        }

        Ok(RandomForestOptions {
            shrink_number: rec.shrink_number,
            number_of_gradient_orientations: rec.number_of_gradient_orientations,
            gradient_normalization_radius: rec.gradient_normalization_radius,
            gradient_smoothing_radius: rec.gradient_smoothing_radius,
            reg_feature_smoothing_radius: rec.reg_feature_smoothing_radius,
            ss_feature_smoothing_radius: rec.ss_feature_smoothing_radius,
            selfsimilarity_grid_size: rec.selfsimilarity_grid_size,
            patch_size: rec.patch_size,
            patch_inner_size: rec.patch_inner_size,
            stride: rec.stride,
            number_of_trees: rec.number_of_trees,
            number_of_trees_to_evaluate: rec.number_of_trees_to_evaluate,
            number_of_output_channels: derived,
        })
    }

    /// Returns the options in the form they are written to a model file.
    pub fn to_record(&self) -> OptionsRecord {
        OptionsRecord {
            shrink_number: self.shrink_number,
            number_of_gradient_orientations: self.number_of_gradient_orientations,
            gradient_normalization_radius: self.gradient_normalization_radius,
            gradient_smoothing_radius: self.gradient_smoothing_radius,
            reg_feature_smoothing_radius: self.reg_feature_smoothing_radius,
            ss_feature_smoothing_radius: self.ss_feature_smoothing_radius,
            selfsimilarity_grid_size: self.selfsimilarity_grid_size,
            patch_size: self.patch_size,
            patch_inner_size: self.patch_inner_size,
            stride: self.stride,
            number_of_trees: self.number_of_trees,
            number_of_trees_to_evaluate: self.number_of_trees_to_evaluate,
            number_of_output_channels: Some(self.number_of_output_channels),
        }
    }

    /// Number of feature and output channels:
    /// `2 * (number_of_gradient_orientations + 1) + 3`
    pub fn number_of_output_channels(&self) -> usize {
        self.number_of_output_channels
    }

    /// Width of a patch within the shrunk feature channels
    pub fn shrunk_patch_size(&self) -> usize {
        self.patch_size / self.shrink_number
    }

    /// Number of features which are read directly from the channels
    pub fn regular_feature_count(&self) -> usize {
        let p = self.shrunk_patch_size();
        p * p * self.number_of_output_channels
    }

    /// Number of features which are differences of two grid cells
    pub fn self_similarity_feature_count(&self) -> usize {
        let cells = self.selfsimilarity_grid_size * self.selfsimilarity_grid_size;
        cells * (cells - 1) / 2 * self.number_of_output_channels
    }

    pub fn feature_count(&self) -> usize {
        self.regular_feature_count() + self.self_similarity_feature_count()
    }

    /// Smoothing radius of the channels used for regular features
    /// (relative to the shrunk channels).
    pub fn reg_smoothing_radius(&self) -> usize {
        (self.reg_feature_smoothing_radius as f32 / self.shrink_number as f32).round() as usize
    }

    /// Smoothing radius of the channels used for self-similarity features
    /// (relative to the shrunk channels).
    pub fn ss_smoothing_radius(&self) -> usize {
        (self.ss_feature_smoothing_radius as f32 / self.shrink_number as f32).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values() {
        let opts = RandomForestOptions::from_record(&OptionsRecord::default()).unwrap();
        assert_eq!(opts.number_of_output_channels(), 13);
        assert_eq!(opts.shrunk_patch_size(), 16);
        assert_eq!(opts.regular_feature_count(), 16 * 16 * 13);
        assert_eq!(opts.self_similarity_feature_count(), 300 * 13);
        assert_eq!(opts.reg_smoothing_radius(), 1);
        assert_eq!(opts.ss_smoothing_radius(), 4);
        let rec = opts.to_record();
        assert_eq!(rec.number_of_output_channels, Some(13));
        assert_eq!(RandomForestOptions::from_record(&rec).unwrap(), opts);
    }

    #[test]
    fn test_output_channel_mismatch() {
        let rec = OptionsRecord { number_of_output_channels: Some(12), ..Default::default() };
        match RandomForestOptions::from_record(&rec) {
            Err(Error(ErrorKind::InvalidOptions(_), _)) => (),
            _ => panic!("mismatching output channels must be rejected"),
        }
    }

    #[test]
    fn test_inconsistent_sizes() {
        let bad = vec![OptionsRecord { shrink_number: 0, ..Default::default() },
                       OptionsRecord { patch_size: 31, ..Default::default() },
                       OptionsRecord { stride: 3, ..Default::default() },
                       OptionsRecord { patch_inner_size: 33, ..Default::default() },
                       OptionsRecord { patch_inner_size: 15, ..Default::default() },
                       OptionsRecord { number_of_trees_to_evaluate: 9, ..Default::default() },
                       OptionsRecord { selfsimilarity_grid_size: 17, ..Default::default() }];
        for rec in bad.iter() {
            assert!(RandomForestOptions::from_record(rec).is_err(), "{:?}", rec);
        }
    }

    #[test]
    fn test_parse_camel_case() {
        let json = r#"{"shrinkNumber": 2, "numberOfGradientOrientations": 4,
                       "gradientNormalizationRadius": 4, "regFeatureSmoothingRadius": 2,
                       "ssFeatureSmoothingRadius": 8, "selfsimilarityGridSize": 5,
                       "patchSize": 32, "patchInnerSize": 16, "stride": 2,
                       "numberOfTrees": 8, "numberOfTreesToEvaluate": 4}"#;
        let rec: OptionsRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec, OptionsRecord::default());
    }
}
