// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Separable spatial resampling of [`FeatureMap`]s with exact adjoints.
//!
//! Every mode is expressed as a per-axis list of `(source index, weight)` taps,
//! so the forward pass gathers and the backward pass scatters with the same
//! weights. Sampling uses half-pixel centres (`align_corners = false`).

use crate::{FeatureMap, PureResult, Tensor, TensorError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CUBIC_A: f32 = -0.75;

/// Interpolation kernel used when resizing feature maps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
}

impl Interpolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
            Interpolation::Bicubic => "bicubic",
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interpolation {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Interpolation::Nearest),
            "bilinear" => Ok(Interpolation::Bilinear),
            "bicubic" => Ok(Interpolation::Bicubic),
            _ => Err(TensorError::InvalidValue {
                label: "interpolation",
            }),
        }
    }
}

type Taps = Vec<Vec<(usize, f32)>>;

fn axis_taps(input: usize, output: usize, mode: Interpolation) -> Taps {
    let scale = input as f32 / output as f32;
    let last = input - 1;
    (0..output)
        .map(|dst| match mode {
            Interpolation::Nearest => {
                let src = ((dst as f32 * scale).floor() as usize).min(last);
                vec![(src, 1.0)]
            }
            Interpolation::Bilinear => {
                let src = (scale * (dst as f32 + 0.5) - 0.5).max(0.0);
                let i0 = (src.floor() as usize).min(last);
                let i1 = (i0 + 1).min(last);
                let t = src - i0 as f32;
                vec![(i0, 1.0 - t), (i1, t)]
            }
            Interpolation::Bicubic => {
                let src = scale * (dst as f32 + 0.5) - 0.5;
                let base = src.floor();
                let t = src - base;
                let base = base as isize;
                let weights = [
                    cubic_outer(t + 1.0),
                    cubic_inner(t),
                    cubic_inner(1.0 - t),
                    cubic_outer(2.0 - t),
                ];
                weights
                    .iter()
                    .enumerate()
                    .map(|(k, &weight)| {
                        let idx = (base - 1 + k as isize).clamp(0, last as isize) as usize;
                        (idx, weight)
                    })
                    .collect()
            }
        })
        .collect()
}

fn cubic_inner(x: f32) -> f32 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_outer(x: f32) -> f32 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

/// Resizes every plane of `map` to `target`.
pub fn resize(map: &FeatureMap, target: (usize, usize), mode: Interpolation) -> PureResult<FeatureMap> {
    if target.0 == 0 || target.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: target.0,
            cols: target.1,
        });
    }
    if map.hw() == target {
        return Ok(map.clone());
    }
    let (h, w) = map.hw();
    let (th, tw) = target;
    let rows_taps = axis_taps(h, th, mode);
    let cols_taps = axis_taps(w, tw, mode);
    let channels = map.channels();
    let in_cols = channels * h * w;
    let out_cols = channels * th * tw;
    let input = map.tensor().data();
    let mut out = vec![0.0f32; map.batch() * out_cols];
    out.par_chunks_mut(out_cols)
        .enumerate()
        .for_each(|(b, out_row)| {
            let in_row = &input[b * in_cols..(b + 1) * in_cols];
            for c in 0..channels {
                let plane = &in_row[c * h * w..(c + 1) * h * w];
                let dst = &mut out_row[c * th * tw..(c + 1) * th * tw];
                for (oy, y_taps) in rows_taps.iter().enumerate() {
                    for (ox, x_taps) in cols_taps.iter().enumerate() {
                        let mut acc = 0.0f32;
                        for &(iy, wy) in y_taps {
                            for &(ix, wx) in x_taps {
                                acc += wy * wx * plane[iy * w + ix];
                            }
                        }
                        dst[oy * tw + ox] = acc;
                    }
                }
            }
        });
    FeatureMap::new(Tensor::from_vec(map.batch(), out_cols, out)?, channels, target)
}

/// Gradient of [`resize`] with respect to its input, given the gradient of
/// the resized output and the original spatial extent.
pub fn resize_backward(
    grad_output: &FeatureMap,
    source: (usize, usize),
    mode: Interpolation,
) -> PureResult<FeatureMap> {
    if source.0 == 0 || source.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: source.0,
            cols: source.1,
        });
    }
    if grad_output.hw() == source {
        return Ok(grad_output.clone());
    }
    let (h, w) = source;
    let (th, tw) = grad_output.hw();
    let rows_taps = axis_taps(h, th, mode);
    let cols_taps = axis_taps(w, tw, mode);
    let channels = grad_output.channels();
    let in_cols = channels * h * w;
    let out_cols = channels * th * tw;
    let grad = grad_output.tensor().data();
    let mut grad_input = vec![0.0f32; grad_output.batch() * in_cols];
    grad_input
        .par_chunks_mut(in_cols)
        .enumerate()
        .for_each(|(b, grad_row)| {
            let out_row = &grad[b * out_cols..(b + 1) * out_cols];
            for c in 0..channels {
                let upstream = &out_row[c * th * tw..(c + 1) * th * tw];
                let plane = &mut grad_row[c * h * w..(c + 1) * h * w];
                for (oy, y_taps) in rows_taps.iter().enumerate() {
                    for (ox, x_taps) in cols_taps.iter().enumerate() {
                        let g = upstream[oy * tw + ox];
                        if g == 0.0 {
                            continue;
                        }
                        for &(iy, wy) in y_taps {
                            for &(ix, wx) in x_taps {
                                plane[iy * w + ix] += wy * wx * g;
                            }
                        }
                    }
                }
            }
        });
    FeatureMap::new(
        Tensor::from_vec(grad_output.batch(), in_cols, grad_input)?,
        channels,
        source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(hw: (usize, usize)) -> FeatureMap {
        FeatureMap::from_fn(2, 2, hw, |b, c, y, x| {
            b as f32 + 0.5 * c as f32 + 0.25 * y as f32 - 0.125 * x as f32
        })
        .unwrap()
    }

    #[test]
    fn taps_partition_unity() {
        for mode in [
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
        ] {
            for (input, output) in [(16, 32), (32, 16), (7, 32), (28, 32)] {
                for taps in axis_taps(input, output, mode) {
                    let total: f32 = taps.iter().map(|(_, w)| w).sum();
                    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn nearest_doubling_repeats_pixels() {
        let map = ramp((2, 2));
        let up = resize(&map, (4, 4), Interpolation::Nearest).unwrap();
        assert_eq!(up.dims(), [2, 2, 4, 4]);
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(up.at(1, 1, y, x), map.at(1, 1, y / 2, x / 2));
            }
        }
    }

    #[test]
    fn bicubic_preserves_constant_planes() {
        let map = FeatureMap::from_fn(1, 3, (12, 12), |_, c, _, _| c as f32 - 1.0).unwrap();
        let resized = resize(&map, (32, 32), Interpolation::Bicubic).unwrap();
        for c in 0..3 {
            for y in 0..32 {
                for x in 0..32 {
                    assert_abs_diff_eq!(resized.at(0, c, y, x), c as f32 - 1.0, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn equal_sizes_are_identity() {
        let map = ramp((5, 5));
        assert_eq!(resize(&map, (5, 5), Interpolation::Bicubic).unwrap(), map);
    }

    #[test]
    fn backward_is_the_adjoint_of_forward() {
        for mode in [
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
        ] {
            let x = ramp((6, 5));
            let y = FeatureMap::from_fn(2, 2, (9, 8), |b, c, i, j| {
                ((b + 2 * c + 3 * i + 5 * j) % 7) as f32 - 3.0
            })
            .unwrap();
            let ax = resize(&x, (9, 8), mode).unwrap();
            let aty = resize_backward(&y, (6, 5), mode).unwrap();
            let lhs: f32 = ax
                .tensor()
                .data()
                .iter()
                .zip(y.tensor().data())
                .map(|(a, b)| a * b)
                .sum();
            let rhs: f32 = x
                .tensor()
                .data()
                .iter()
                .zip(aty.tensor().data())
                .map(|(a, b)| a * b)
                .sum();
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-2);
        }
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!("Bicubic".parse::<Interpolation>().unwrap(), Interpolation::Bicubic);
        assert!("lanczos".parse::<Interpolation>().is_err());
    }
}
