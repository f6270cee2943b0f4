use crate::errors::*;
use image::{GrayImage, ImageBuffer, Luma, Rgb32FImage, RgbImage};

/// Dense image of `f32` values with a fixed number of channels per pixel.
///
/// The values are stored row by row, the channels of a pixel
/// are interleaved: `(row * cols + col) * channels + channel`.
/// The same type is used for RGB images, feature tensors and
/// edge probability maps.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor whose values are all zero.
    pub fn new(rows: usize, cols: usize, channels: usize) -> Tensor {
        Tensor::filled(rows, cols, channels, 0.0)
    }

    /// Creates a tensor and uses `value` for every entry.
    pub fn filled(rows: usize, cols: usize, channels: usize, value: f32) -> Tensor {
        Tensor {
            rows: rows,
            cols: cols,
            channels: channels,
            data: vec![value; rows * cols * channels],
        }
    }

    /// Wraps already interleaved values.
    /// Fails if the length of `data` does not fit the given dimensions.
    pub fn from_vec(rows: usize, cols: usize, channels: usize, data: Vec<f32>) -> Result<Tensor> {
        if data.len() != rows * cols * channels {
            bail!(ErrorKind::InvalidInput(format!("{} values do not fit a {}x{}x{} tensor",
                                                  data.len(),
                                                  rows,
                                                  cols,
                                                  channels)));
        }
        Ok(Tensor {
            rows: rows,
            cols: cols,
            channels: channels,
            data: data,
        })
    }

    /// Converts an 8 bit RGB image into a 3 channel tensor with values in [0,1].
    pub fn from_rgb_image(img: &RgbImage) -> Tensor {
        let (w, h) = img.dimensions();
        Tensor {
            rows: h as usize,
            cols: w as usize,
            channels: 3,
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    /// Converts a floating point RGB image into a 3 channel tensor.
    pub fn from_rgb32f(img: &Rgb32FImage) -> Tensor {
        let (w, h) = img.dimensions();
        Tensor {
            rows: h as usize,
            cols: w as usize,
            channels: 3,
            data: img.as_raw().clone(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }
    pub fn channels(&self) -> usize {
        self.channels
    }
    /// Returns (rows, cols)
    pub fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Position of the entry (row, col, ch) within the slice.
    #[inline]
    pub fn index(&self, row: usize, col: usize, ch: usize) -> usize {
        (row * self.cols + col) * self.channels + ch
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize, ch: usize) -> f32 {
        self.data[self.index(row, col, ch)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, ch: usize, value: f32) {
        let i = self.index(row, col, ch);
        self.data[i] = value;
    }

    /// All channels of one pixel
    #[inline]
    pub fn pixel(&self, row: usize, col: usize) -> &[f32] {
        let start = self.index(row, col, 0);
        &self.data[start..start + self.channels]
    }

    #[inline]
    pub fn pixel_mut(&mut self, row: usize, col: usize) -> &mut [f32] {
        let start = self.index(row, col, 0);
        let channels = self.channels;
        &mut self.data[start..start + channels]
    }

    /// Copies a single channel into a new one-channel tensor.
    pub fn channel(&self, ch: usize) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            channels: 1,
            data: self.data.iter().skip(ch).step_by(self.channels.max(1)).cloned().collect(),
        }
    }

    /// Splits the tensor into one tensor per channel.
    pub fn split(&self) -> Vec<Tensor> {
        (0..self.channels).map(|ch| self.channel(ch)).collect()
    }

    /// Merges the channels of all `parts` (in order) into one tensor.
    /// Every part must have the same spatial size.
    pub fn merge(parts: &[Tensor]) -> Result<Tensor> {
        let (rows, cols) = match parts.first() {
            Some(first) => first.size(),
            None => bail!(ErrorKind::InvalidInput("nothing to merge".to_string())),
        };
        if let Some(p) = parts.iter().find(|p| p.size() != (rows, cols)) {
            bail!(ErrorKind::InvalidInput(format!("cannot merge a {}x{} tensor into {}x{}",
                                                  p.rows,
                                                  p.cols,
                                                  rows,
                                                  cols)));
        }
        let channels = parts.iter().map(|p| p.channels).sum();
        let mut data = Vec::with_capacity(rows * cols * channels);
        for px in 0..rows * cols {
            for p in parts {
                data.extend_from_slice(&p.data[px * p.channels..(px + 1) * p.channels]);
            }
        }
        Ok(Tensor {
            rows: rows,
            cols: cols,
            channels: channels,
            data: data,
        })
    }

    /// Multiplies every value with `factor`.
    pub fn scale(&mut self, factor: f32) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    /// Adds `other` entry-wise. Both tensors must have the same shape.
    pub fn accumulate(&mut self, other: &Tensor) -> Result<()> {
        if self.size() != other.size() || self.channels != other.channels {
            bail!(ErrorKind::InvalidInput(format!("cannot add a {}x{}x{} tensor to a {}x{}x{} one",
                                                  other.rows,
                                                  other.cols,
                                                  other.channels,
                                                  self.rows,
                                                  self.cols,
                                                  self.channels)));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }

    /// Per pixel maximum over all channels.
    pub fn channel_max(&self) -> Tensor {
        let data = self.data
            .chunks(self.channels.max(1))
            .map(|px| px.iter().cloned().fold(std::f32::NEG_INFINITY, f32::max))
            .collect();
        Tensor {
            rows: self.rows,
            cols: self.cols,
            channels: 1,
            data: data,
        }
    }

    /// Converts a single channel tensor into a gray image.
    /// Values are clamped to [0,1] and mapped to 0..255.
    pub fn to_gray_image(&self) -> Result<GrayImage> {
        if self.channels != 1 {
            bail!(ErrorKind::ChannelMismatch(1, self.channels));
        }
        let raw = self.data.iter().map(|v| (v.max(0.0).min(1.0) * 255.0).round() as u8).collect();
        let img: Option<ImageBuffer<Luma<u8>, Vec<u8>>> =
            ImageBuffer::from_raw(self.cols as u32, self.rows as u32, raw);
        img.ok_or_else(|| ErrorKind::InvalidInput("tensor too large for an image".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_layout() {
        let mut t = Tensor::new(2, 3, 4);
        t.set(1, 2, 3, 5.0);
        assert_eq!(t.index(1, 2, 3), 23);
        assert_eq!(t.as_slice()[23], 5.0);
        assert_eq!(t.pixel(1, 2), &[0.0, 0.0, 0.0, 5.0]);
        assert!(Tensor::from_vec(2, 2, 2, vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_split_and_merge() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let t = Tensor::from_vec(2, 2, 3, data).unwrap();
        let parts = t.split();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].as_slice(), &[1.0, 4.0, 7.0, 10.0]);
        let merged = Tensor::merge(&parts).unwrap();
        assert_eq!(merged, t);
        let other = Tensor::new(3, 2, 1);
        assert!(Tensor::merge(&[t, other]).is_err());
    }

    #[test]
    fn test_channel_max_and_gray() {
        let t = Tensor::from_vec(1, 2, 2, vec![0.2, 0.5, 2.0, -1.0]).unwrap();
        let m = t.channel_max();
        assert_eq!(m.as_slice(), &[0.5, 2.0]);
        let gray = m.to_gray_image().unwrap();
        assert_eq!(gray.as_raw(), &vec![128u8, 255u8]);
        assert!(t.to_gray_image().is_err());
    }

    #[test]
    fn test_from_rgb_image() {
        let img = RgbImage::from_raw(2, 1, vec![0, 255, 51, 255, 0, 0]).unwrap();
        let t = Tensor::from_rgb_image(&img);
        assert_eq!(t.size(), (1, 2));
        assert_eq!(t.channels(), 3);
        assert!((t.get(0, 0, 2) - 0.2).abs() < 1e-6);
        assert_eq!(t.get(0, 1, 0), 1.0);
    }
}
