//! Basic image operations on `Tensor`s which are needed to
//! compute the features and to resample the results.
//!
//! All functions return new tensors and leave their input untouched.
//! Borders are handled like `fedcba|abcdef|fedcba` (reflection which
//! repeats the outermost pixel).

use crate::errors::*;
use crate::types::Tensor;
use std::borrow::Cow;

/// Maps the (possibly out of range) position `i` into `0..n`
/// by reflecting at the borders.
#[inline]
pub fn reflect(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period) as usize;
    if m < n { m } else { 2 * n - 1 - m }
}

/// Returns `round(n * scale)` but at least 1.
pub fn scaled_len(n: usize, scale: f32) -> usize {
    let len = (n as f32 * scale).round() as usize;
    if len == 0 { 1 } else { len }
}

/// Source taps of every destination position along one axis.
enum Taps {
    /// Weighted sum over all overlapping source pixels
    Area(Vec<Vec<(usize, f32)>>),
    /// Two neighbouring source pixels and the fraction between them
    Linear(Vec<(usize, usize, f32)>),
}

impl Taps {
    fn area(src: usize, dst: usize) -> Taps {
        let scale = src as f64 / dst as f64;
        let taps = (0..dst)
            .map(|d| {
                let start = d as f64 * scale;
                let end = ((d + 1) as f64 * scale).min(src as f64);
                let first = start.floor() as usize;
                let last = (end.ceil() as usize).min(src);
                (first..last)
                    .filter_map(|s| {
                        let overlap = end.min((s + 1) as f64) - start.max(s as f64);
                        if overlap > 0.0 {
                            Some((s, (overlap / scale) as f32))
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .collect();
        Taps::Area(taps)
    }

    fn linear(src: usize, dst: usize) -> Taps {
        let scale = src as f64 / dst as f64;
        let last = (src - 1) as f64;
        let taps = (0..dst)
            .map(|d| {
                let pos = ((d as f64 + 0.5) * scale - 0.5).max(0.0).min(last);
                let s0 = pos.floor() as usize;
                let s1 = (s0 + 1).min(src - 1);
                (s0, s1, (pos - s0 as f64) as f32)
            })
            .collect();
        Taps::Linear(taps)
    }

    #[inline]
    fn sample<F: Fn(usize) -> f32>(&self, d: usize, at: F) -> f32 {
        match *self {
            Taps::Area(ref taps) => taps[d].iter().map(|&(s, w)| at(s) * w).sum(),
            Taps::Linear(ref taps) => {
                let (s0, s1, f) = taps[d];
                let a = at(s0);
                a + (at(s1) - a) * f
            }
        }
    }
}

/// Resizes `img` to `rows` x `cols`.
///
/// Area averaging is used if the image gets smaller (or keeps its size)
/// in both dimensions, linear interpolation otherwise.
pub fn resize(img: &Tensor, rows: usize, cols: usize) -> Result<Tensor> {
    if rows == 0 || cols == 0 || img.is_empty() {
        bail!(ErrorKind::InvalidInput(format!("cannot resize a {}x{} image to {}x{}",
                                              img.rows(),
                                              img.cols(),
                                              rows,
                                              cols)));
    }
    if (rows, cols) == img.size() {
        return Ok(img.clone());
    }
    let shrinking = rows <= img.rows() && cols <= img.cols();
    let (row_taps, col_taps) = if shrinking {
        (Taps::area(img.rows(), rows), Taps::area(img.cols(), cols))
    } else {
        (Taps::linear(img.rows(), rows), Taps::linear(img.cols(), cols))
    };
    let ch = img.channels();

    // horizontal pass
    let mut tmp = Tensor::new(img.rows(), cols, ch);
    for r in 0..img.rows() {
        for c in 0..cols {
            for k in 0..ch {
                let v = col_taps.sample(c, |s| img.get(r, s, k));
                tmp.set(r, c, k, v);
            }
        }
    }

    // vertical pass
    let mut out = Tensor::new(rows, cols, ch);
    for r in 0..rows {
        for c in 0..cols {
            for k in 0..ch {
                let v = row_taps.sample(r, |s| tmp.get(s, c, k));
                out.set(r, c, k, v);
            }
        }
    }
    Ok(out)
}

/// Resizes `img` by `scale` in both dimensions (see `resize`).
pub fn resize_by(img: &Tensor, scale: f32) -> Result<Tensor> {
    resize(img,
           scaled_len(img.rows(), scale),
           scaled_len(img.cols(), scale))
}

/// Normalized box filter of size `window` (odd) in both directions.
fn box_filter(img: &Tensor, window: usize) -> Tensor {
    let half = (window / 2) as isize;
    let norm = 1.0 / window as f32;
    let (rows, cols, ch) = (img.rows(), img.cols(), img.channels());

    let mut tmp = Tensor::new(rows, cols, ch);
    for r in 0..rows {
        for c in 0..cols {
            for k in 0..ch {
                let sum: f32 = (-half..half + 1)
                    .map(|d| img.get(r, reflect(c as isize + d, cols), k))
                    .sum();
                tmp.set(r, c, k, sum * norm);
            }
        }
    }

    let mut out = Tensor::new(rows, cols, ch);
    for r in 0..rows {
        for c in 0..cols {
            for k in 0..ch {
                let sum: f32 = (-half..half + 1)
                    .map(|d| tmp.get(reflect(r as isize + d, rows), c, k))
                    .sum();
                out.set(r, c, k, sum * norm);
            }
        }
    }
    out
}

/// Window size of the box filter used by `box_smooth` for `radius`.
pub fn smoothing_window(radius: usize) -> usize {
    let w = 2 * radius / 3;
    if w % 2 == 0 { w + 1 } else { w }
}

/// Approximates a triangle filter of the given `radius` by applying a
/// box filter twice.
///
/// If the box window collapses to a single pixel (always the case for
/// `radius < 1`) the input is returned as it is, without copying.
pub fn box_smooth(img: &Tensor, radius: usize) -> Cow<Tensor> {
    let window = smoothing_window(radius);
    if radius < 1 || window < 3 {
        return Cow::Borrowed(img);
    }
    Cow::Owned(box_filter(&box_filter(img, window), window))
}

/// First derivatives in x and y direction of every channel (3x3 Sobel).
pub fn gradient(img: &Tensor) -> (Tensor, Tensor) {
    let (rows, cols, ch) = (img.rows(), img.cols(), img.channels());
    let mut dx = Tensor::new(rows, cols, ch);
    let mut dy = Tensor::new(rows, cols, ch);
    for r in 0..rows {
        let up = reflect(r as isize - 1, rows);
        let down = reflect(r as isize + 1, rows);
        for c in 0..cols {
            let left = reflect(c as isize - 1, cols);
            let right = reflect(c as isize + 1, cols);
            for k in 0..ch {
                let gx = (img.get(up, right, k) - img.get(up, left, k)) +
                         2.0 * (img.get(r, right, k) - img.get(r, left, k)) +
                         (img.get(down, right, k) - img.get(down, left, k));
                let gy = (img.get(down, left, k) - img.get(up, left, k)) +
                         2.0 * (img.get(down, c, k) - img.get(up, c, k)) +
                         (img.get(down, right, k) - img.get(up, right, k));
                dx.set(r, c, k, gx);
                dy.set(r, c, k, gy);
            }
        }
    }
    (dx, dy)
}

// CIE Luv constants (D65 white point), L scaled by 1/270
const MAX_LUV: f32 = 1.0 / 270.0;
const MIN_U: f32 = -88.0 * MAX_LUV;
const MIN_V: f32 = -134.0 * MAX_LUV;
const WHITE_U: f32 = 0.197833;
const WHITE_V: f32 = 0.468331;
const RGB_TO_XYZ: [[f32; 3]; 3] = [[0.430574, 0.341550, 0.178325],
                                   [0.222015, 0.706655, 0.071330],
                                   [0.020183, 0.129553, 0.939180]];

/// Converts a linear RGB image (values in [0,1]) into normalized Luv.
/// All three output channels lie roughly in [0,1].
pub fn rgb_to_luv(img: &Tensor) -> Result<Tensor> {
    if img.channels() != 3 {
        bail!(ErrorKind::ChannelMismatch(3, img.channels()));
    }
    let y0 = (6.0f32 / 29.0).powi(3);
    let a = (29.0f32 / 3.0).powi(3);
    let mut out = Tensor::new(img.rows(), img.cols(), 3);
    for r in 0..img.rows() {
        for c in 0..img.cols() {
            let rgb = img.pixel(r, c);
            let m = &RGB_TO_XYZ;
            let x = m[0][0] * rgb[0] + m[0][1] * rgb[1] + m[0][2] * rgb[2];
            let y = m[1][0] * rgb[0] + m[1][1] * rgb[1] + m[1][2] * rgb[2];
            let z = m[2][0] * rgb[0] + m[2][1] * rgb[1] + m[2][2] * rgb[2];
            let l = (if y > y0 { 116.0 * y.cbrt() - 16.0 } else { y * a }) * MAX_LUV;
            let d = 1.0 / (x + 15.0 * y + 3.0 * z + 1e-35);
            let u = l * (13.0 * 4.0 * x * d - 13.0 * WHITE_U) - MIN_U;
            let v = l * (13.0 * 9.0 * y * d - 13.0 * WHITE_V) - MIN_V;
            let px = out.pixel_mut(r, c);
            px[0] = l;
            px[1] = u;
            px[2] = v;
        }
    }
    Ok(out)
}

/// Extends the image by reflecting it at its borders.
pub fn pad_reflect(img: &Tensor, top: usize, bottom: usize, left: usize, right: usize) -> Tensor {
    let rows = img.rows() + top + bottom;
    let cols = img.cols() + left + right;
    let mut out = Tensor::new(rows, cols, img.channels());
    for r in 0..rows {
        let sr = reflect(r as isize - top as isize, img.rows());
        for c in 0..cols {
            let sc = reflect(c as isize - left as isize, img.cols());
            out.pixel_mut(r, c).copy_from_slice(img.pixel(sr, sc));
        }
    }
    out
}

/// Copies the region starting at (`row`, `col`) of size `rows` x `cols`.
pub fn crop(img: &Tensor, row: usize, col: usize, rows: usize, cols: usize) -> Result<Tensor> {
    if row + rows > img.rows() || col + cols > img.cols() {
        bail!(ErrorKind::InvalidInput(format!("region {}x{} at ({}, {}) exceeds a {}x{} image",
                                              rows,
                                              cols,
                                              row,
                                              col,
                                              img.rows(),
                                              img.cols())));
    }
    let mut out = Tensor::new(rows, cols, img.channels());
    for r in 0..rows {
        for c in 0..cols {
            out.pixel_mut(r, c).copy_from_slice(img.pixel(row + r, col + c));
        }
    }
    Ok(out)
}
