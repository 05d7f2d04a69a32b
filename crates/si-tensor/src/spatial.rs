// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! `[batch, channels, height, width]` views over row-major tensors together with
//! the channel and spatial surgery used by skip connections.

use crate::{PureResult, Tensor, TensorError};

/// Batch of channel-major planes stored as a `(batch, channels·height·width)` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    tensor: Tensor,
    channels: usize,
    hw: (usize, usize),
}

impl FeatureMap {
    /// Wraps `tensor` after checking that its columns hold `channels` planes of `hw`.
    pub fn new(tensor: Tensor, channels: usize, hw: (usize, usize)) -> PureResult<Self> {
        if channels == 0 || hw.0 == 0 || hw.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: hw.0 * hw.1,
            });
        }
        let expected = channels * hw.0 * hw.1;
        let cols = tensor.shape().1;
        if cols != expected {
            return Err(TensorError::DataLength {
                expected,
                got: cols,
            });
        }
        Ok(Self {
            tensor,
            channels,
            hw,
        })
    }

    pub fn zeros(batch: usize, channels: usize, hw: (usize, usize)) -> PureResult<Self> {
        Self::new(Tensor::zeros(batch, channels * hw.0 * hw.1)?, channels, hw)
    }

    /// Builds a map by evaluating `f(b, c, y, x)` at every coordinate.
    pub fn from_fn<F>(batch: usize, channels: usize, hw: (usize, usize), mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize, usize, usize) -> f32,
    {
        let (h, w) = hw;
        let plane = h * w;
        let tensor = Tensor::from_fn(batch, channels * plane, |b, col| {
            let c = col / plane;
            let rem = col % plane;
            f(b, c, rem / w, rem % w)
        })?;
        Self::new(tensor, channels, hw)
    }

    pub fn batch(&self) -> usize {
        self.tensor.shape().0
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn hw(&self) -> (usize, usize) {
        self.hw
    }

    /// `[batch, channels, height, width]`.
    pub fn dims(&self) -> [usize; 4] {
        [self.batch(), self.channels, self.hw.0, self.hw.1]
    }

    pub fn plane_len(&self) -> usize {
        self.hw.0 * self.hw.1
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// Reads a single element.
    pub fn at(&self, b: usize, c: usize, y: usize, x: usize) -> f32 {
        let (h, w) = self.hw;
        self.tensor.row(b)[c * h * w + y * w + x]
    }

    /// Re-wraps `tensor` with this map's channel count and spatial extent.
    pub fn with_tensor(&self, tensor: Tensor) -> PureResult<Self> {
        if tensor.shape().0 != self.batch() {
            return Err(TensorError::ShapeMismatch {
                left: tensor.shape(),
                right: self.tensor.shape(),
            });
        }
        Self::new(tensor, self.channels, self.hw)
    }

    /// Fails unless the map has exactly `channels` planes of `hw`.
    pub fn expect_geometry(&self, channels: usize, hw: (usize, usize)) -> PureResult<()> {
        if self.channels != channels {
            return Err(TensorError::ChannelMismatch {
                expected: channels,
                got: self.channels,
            });
        }
        if self.hw != hw {
            return Err(TensorError::SpatialMismatch {
                expected: hw,
                got: self.hw,
            });
        }
        Ok(())
    }

    /// Extracts the centred `target` window of every plane.
    ///
    /// Cropping only ever shrinks: a target larger than the source on either
    /// axis fails with [`TensorError::CropExceedsSource`]. Equal sizes return a
    /// copy of the input.
    pub fn center_crop(&self, target: (usize, usize)) -> PureResult<FeatureMap> {
        let (top, left) = crop_offsets(self.hw, target)?;
        if self.hw == target {
            return Ok(self.clone());
        }
        let (h, w) = self.hw;
        let (th, tw) = target;
        let batch = self.batch();
        let mut data = Vec::with_capacity(batch * self.channels * th * tw);
        for b in 0..batch {
            let row = self.tensor.row(b);
            for c in 0..self.channels {
                let plane = &row[c * h * w..(c + 1) * h * w];
                for y in top..top + th {
                    data.extend_from_slice(&plane[y * w + left..y * w + left + tw]);
                }
            }
        }
        FeatureMap::new(
            Tensor::from_vec(batch, self.channels * th * tw, data)?,
            self.channels,
            target,
        )
    }

    /// Adjoint of [`FeatureMap::center_crop`]: scatters this map back into a zero
    /// canvas of `source` extent at the same offsets the crop used.
    pub fn uncrop(&self, source: (usize, usize)) -> PureResult<FeatureMap> {
        let (top, left) = crop_offsets(source, self.hw)?;
        if self.hw == source {
            return Ok(self.clone());
        }
        let (h, w) = source;
        let (th, tw) = self.hw;
        let mut out = FeatureMap::zeros(self.batch(), self.channels, source)?;
        let cols = self.channels * h * w;
        let out_data = out.tensor.data_mut();
        for b in 0..self.batch() {
            let row = self.tensor.row(b);
            let dst = &mut out_data[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                for y in 0..th {
                    let src = &row[c * th * tw + y * tw..c * th * tw + (y + 1) * tw];
                    let offset = c * h * w + (top + y) * w + left;
                    dst[offset..offset + tw].copy_from_slice(src);
                }
            }
        }
        Ok(out)
    }

    /// Stacks `self` and `other` along the channel axis, `self` first.
    pub fn concat_channels(&self, other: &FeatureMap) -> PureResult<FeatureMap> {
        if self.batch() != other.batch() {
            return Err(TensorError::ShapeMismatch {
                left: self.tensor.shape(),
                right: other.tensor.shape(),
            });
        }
        if self.hw != other.hw {
            return Err(TensorError::SpatialMismatch {
                expected: self.hw,
                got: other.hw,
            });
        }
        let channels = self.channels + other.channels;
        let cols = channels * self.plane_len();
        let mut data = Vec::with_capacity(self.batch() * cols);
        for b in 0..self.batch() {
            data.extend_from_slice(self.tensor.row(b));
            data.extend_from_slice(other.tensor.row(b));
        }
        FeatureMap::new(Tensor::from_vec(self.batch(), cols, data)?, channels, self.hw)
    }

    /// Splits the channel axis after `leading` channels.
    pub fn split_channels(&self, leading: usize) -> PureResult<(FeatureMap, FeatureMap)> {
        if leading == 0 || leading >= self.channels {
            return Err(TensorError::ChannelMismatch {
                expected: self.channels,
                got: leading,
            });
        }
        let plane = self.plane_len();
        let split = leading * plane;
        let cols = self.channels * plane;
        let batch = self.batch();
        let mut head = Vec::with_capacity(batch * split);
        let mut tail = Vec::with_capacity(batch * (cols - split));
        for b in 0..batch {
            let row = self.tensor.row(b);
            head.extend_from_slice(&row[..split]);
            tail.extend_from_slice(&row[split..]);
        }
        Ok((
            FeatureMap::new(Tensor::from_vec(batch, split, head)?, leading, self.hw)?,
            FeatureMap::new(
                Tensor::from_vec(batch, cols - split, tail)?,
                self.channels - leading,
                self.hw,
            )?,
        ))
    }

    /// Element-wise sum of two maps with identical geometry.
    pub fn add(&self, other: &FeatureMap) -> PureResult<FeatureMap> {
        other.expect_geometry(self.channels, self.hw)?;
        self.with_tensor(self.tensor.add(&other.tensor)?)
    }
}

/// Top/left offsets of a centred `target` window inside `source`.
///
/// Half the margin is rounded half-to-even, so a margin of 3 starts the window
/// at offset 2 and a margin of 1 at offset 0.
pub fn crop_offsets(source: (usize, usize), target: (usize, usize)) -> PureResult<(usize, usize)> {
    if target.0 == 0 || target.1 == 0 || target.0 > source.0 || target.1 > source.1 {
        return Err(TensorError::CropExceedsSource {
            source_hw: source,
            target_hw: target,
        });
    }
    Ok((
        half_margin(source.0 - target.0),
        half_margin(source.1 - target.1),
    ))
}

fn half_margin(margin: usize) -> usize {
    let half = margin / 2;
    if margin % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(batch: usize, channels: usize, hw: (usize, usize)) -> FeatureMap {
        FeatureMap::from_fn(batch, channels, hw, |b, c, y, x| {
            (b * 1000 + c * 100 + y * 10 + x) as f32
        })
        .unwrap()
    }

    #[test]
    fn center_crop_takes_the_middle_window() {
        let map = ramp(2, 3, (6, 6));
        let cropped = map.center_crop((4, 4)).unwrap();
        assert_eq!(cropped.dims(), [2, 3, 4, 4]);
        for b in 0..2 {
            for c in 0..3 {
                for y in 0..4 {
                    for x in 0..4 {
                        assert_eq!(cropped.at(b, c, y, x), map.at(b, c, y + 1, x + 1));
                    }
                }
            }
        }
    }

    #[test]
    fn center_crop_is_identity_for_equal_sizes() {
        let map = ramp(1, 2, (5, 3));
        assert_eq!(map.center_crop((5, 3)).unwrap(), map);
    }

    #[test]
    fn center_crop_rejects_growth() {
        let map = ramp(1, 1, (4, 4));
        let err = map.center_crop((5, 4)).unwrap_err();
        assert_eq!(
            err,
            TensorError::CropExceedsSource {
                source_hw: (4, 4),
                target_hw: (5, 4),
            }
        );
    }

    #[test]
    fn odd_margins_round_half_to_even() {
        assert_eq!(crop_offsets((5, 5), (4, 4)).unwrap(), (0, 0));
        assert_eq!(crop_offsets((7, 9), (4, 4)).unwrap(), (2, 2));
        assert_eq!(crop_offsets((9, 8), (4, 4)).unwrap(), (2, 2));
    }

    #[test]
    fn uncrop_is_the_adjoint_of_crop() {
        let map = ramp(1, 2, (7, 6));
        let cropped = map.center_crop((4, 4)).unwrap();
        let restored = cropped.uncrop((7, 6)).unwrap();
        assert_eq!(restored.hw(), (7, 6));
        let (top, left) = crop_offsets((7, 6), (4, 4)).unwrap();
        for c in 0..2 {
            for y in 0..7 {
                for x in 0..6 {
                    let inside = y >= top && y < top + 4 && x >= left && x < left + 4;
                    let expected = if inside { map.at(0, c, y, x) } else { 0.0 };
                    assert_eq!(restored.at(0, c, y, x), expected);
                }
            }
        }
    }

    #[test]
    fn concat_then_split_recovers_both_halves() {
        let a = ramp(2, 2, (3, 3));
        let b = ramp(2, 5, (3, 3));
        let joined = a.concat_channels(&b).unwrap();
        assert_eq!(joined.dims(), [2, 7, 3, 3]);
        assert_eq!(joined.at(1, 0, 2, 2), a.at(1, 0, 2, 2));
        assert_eq!(joined.at(1, 2, 0, 1), b.at(1, 0, 0, 1));
        let (head, tail) = joined.split_channels(2).unwrap();
        assert_eq!(head, a);
        assert_eq!(tail, b);
    }

    #[test]
    fn concat_requires_matching_spatial_extent() {
        let a = ramp(1, 1, (3, 3));
        let b = ramp(1, 1, (2, 3));
        assert!(matches!(
            a.concat_channels(&b),
            Err(TensorError::SpatialMismatch { .. })
        ));
    }
}
