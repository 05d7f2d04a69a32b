// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use si_tensor::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

fn expect_cols(input: &Tensor, expected: usize) -> PureResult<()> {
    let cols = input.shape().1;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (1, cols),
            right: (1, expected),
        });
    }
    Ok(())
}

/// Reorders `(batch, channels·spatial)` planes into a `(batch·spatial, channels)`
/// matrix with one row per pixel.
fn planes_to_matrix(input: &Tensor, channels: usize, spatial: usize) -> PureResult<Tensor> {
    let (batch, cols) = input.shape();
    let mut matrix = Tensor::zeros(batch * spatial, channels)?;
    {
        let data = input.data();
        let matrix_data = matrix.data_mut();
        for b in 0..batch {
            let row = &data[b * cols..(b + 1) * cols];
            for s in 0..spatial {
                let offset = (b * spatial + s) * channels;
                for c in 0..channels {
                    matrix_data[offset + c] = row[c * spatial + s];
                }
            }
        }
    }
    Ok(matrix)
}

/// Inverse of [`planes_to_matrix`].
fn matrix_to_planes(
    matrix: &Tensor,
    batch: usize,
    channels: usize,
    spatial: usize,
) -> PureResult<Tensor> {
    let mut planes = Tensor::zeros(batch, channels * spatial)?;
    let cols = channels * spatial;
    {
        let data = matrix.data();
        let planes_data = planes.data_mut();
        for b in 0..batch {
            let row = &mut planes_data[b * cols..(b + 1) * cols];
            for s in 0..spatial {
                let offset = (b * spatial + s) * channels;
                for c in 0..channels {
                    row[c * spatial + s] = data[offset + c];
                }
            }
        }
    }
    Ok(planes)
}

/// Uniform initialisation bound `1/sqrt(fan_in)`.
fn fan_in_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in as f32).sqrt()
}

/// Two dimensional convolution over channel-major planes, lowered to im2col and
/// a single matrix product.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    /// Builds a convolution for inputs of `input_hw`. Weights and bias are drawn
    /// from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` using `seed`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let bound = fan_in_bound(span);
        let weight = Tensor::random_uniform(out_channels, span, -bound, bound, seed)?;
        let bias = Tensor::random_uniform(
            1,
            out_channels,
            -bound,
            bound,
            seed.map(|value| value.wrapping_add(1)),
        )?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Validate configuration by computing the output size once during construction.
        conv.output_hw()?;
        Ok(conv)
    }

    /// 3×3 convolution with stride 1 and padding 1, which keeps `input_hw`.
    pub fn same_3x3(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Self::new(
            name,
            in_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (1, 1),
            input_hw,
            seed,
        )
    }

    /// 1×1 convolution acting as a per-pixel channel projection.
    pub fn pointwise(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Self::new(
            name,
            in_channels,
            out_channels,
            (1, 1),
            (1, 1),
            (0, 0),
            input_hw,
            seed,
        )
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let offset = row_index * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h = (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w = (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        column_data[offset + col_idx] =
                                            row[channel_offset + idx_h as usize * w + idx_w as usize];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let expected_rows = batch * oh * ow;
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        if cols.shape() != (expected_rows, kernel_elems) {
            return Err(TensorError::ShapeMismatch {
                left: cols.shape(),
                right: (expected_rows, kernel_elems),
            });
        }
        let (h, w) = self.input_hw;
        let mut output = Tensor::zeros(batch, self.in_channels * h * w)?;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let spatial = oh * ow;
        let output_cols = output.shape().1;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * spatial + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h = (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w = (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        let index =
                                            channel_offset + idx_h as usize * w + idx_w as usize;
                                        grad_in_row[index] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        expect_cols(input, self.in_channels * self.input_hw.0 * self.input_hw.1)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        let mut contracted = patches.matmul(&self.weight.value().transpose())?;
        contracted.add_row_inplace(self.bias.value().data())?;
        matrix_to_planes(&contracted, batch, self.out_channels, oh * ow)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        expect_cols(input, self.in_channels * self.input_hw.0 * self.input_hw.1)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = planes_to_matrix(grad_output, self.out_channels, oh * ow)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        let grad_bias = Tensor::from_vec(1, self.out_channels, grad_matrix.sum_axis0())?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        let grad_input = self.col2im(&grad_patches, batch, oh, ow)?;
        self.weight.accumulate(&grad_weight)?;
        self.bias.accumulate(&grad_bias)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

/// Transposed ("fractionally strided") convolution. Every input pixel scatters a
/// `kernel`-sized stamp per output channel into the upsampled canvas.
///
/// The weight is stored as `(in_channels, out_channels·kh·kw)`.
#[derive(Debug)]
pub struct ConvTranspose2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl ConvTranspose2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = out_channels * kernel.0 * kernel.1;
        let bound = fan_in_bound(span);
        let weight = Tensor::random_uniform(in_channels, span, -bound, bound, seed)?;
        let bias = Tensor::random_uniform(
            1,
            out_channels,
            -bound,
            bound,
            seed.map(|value| value.wrapping_add(1)),
        )?;
        let layer = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        layer.output_hw()?;
        Ok(layer)
    }

    /// Kernel 2, stride 2: doubles both spatial axes.
    pub fn upsample_2x(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Self::new(
            name,
            in_channels,
            out_channels,
            (2, 2),
            (2, 2),
            (0, 0),
            input_hw,
            seed,
        )
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// `(in - 1)·stride - 2·padding + kernel` on each axis.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let full_h = (h - 1) * self.stride.0 + self.kernel.0;
        let full_w = (w - 1) * self.stride.1 + self.kernel.1;
        if full_h <= 2 * self.padding.0 || full_w <= 2 * self.padding.1 {
            return Err(TensorError::InvalidDimensions {
                rows: full_h,
                cols: 2 * self.padding.0.max(self.padding.1),
            });
        }
        Ok((full_h - 2 * self.padding.0, full_w - 2 * self.padding.1))
    }

    fn kernel_elems(&self) -> usize {
        self.kernel.0 * self.kernel.1
    }

    /// Output coordinate hit by `(ih, iw)` with kernel tap `(kh, kw)`.
    fn target(
        &self,
        ih: usize,
        iw: usize,
        kh: usize,
        kw: usize,
        out_hw: (usize, usize),
    ) -> Option<usize> {
        let y = (ih * self.stride.0 + kh) as isize - self.padding.0 as isize;
        let x = (iw * self.stride.1 + kw) as isize - self.padding.1 as isize;
        if y < 0 || x < 0 || y >= out_hw.0 as isize || x >= out_hw.1 as isize {
            return None;
        }
        Some(y as usize * out_hw.1 + x as usize)
    }

    /// Scatters per-pixel stamps `(batch·h·w, out_channels·kh·kw)` into planes.
    fn col2im(&self, stamps: &Tensor, batch: usize) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let out_hw = self.output_hw()?;
        let out_spatial = out_hw.0 * out_hw.1;
        let out_cols = self.out_channels * out_spatial;
        let kk = self.kernel_elems();
        let stamp_cols = self.out_channels * kk;
        let mut output = Tensor::zeros(batch, out_cols)?;
        {
            let stamp_data = stamps.data();
            let out_data = output.data_mut();
            for b in 0..batch {
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for ih in 0..h {
                    for iw in 0..w {
                        let row_index = (b * h + ih) * w + iw;
                        let stamp = &stamp_data[row_index * stamp_cols..(row_index + 1) * stamp_cols];
                        for oc in 0..self.out_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(pos) = self.target(ih, iw, kh, kw, out_hw) {
                                        out_row[oc * out_spatial + pos] +=
                                            stamp[oc * kk + kh * self.kernel.1 + kw];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// Adjoint of [`ConvTranspose2d::col2im`]: gathers upstream gradients back
    /// into per-pixel stamps.
    fn im2col(&self, grad_output: &Tensor, batch: usize) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let out_hw = self.output_hw()?;
        let out_spatial = out_hw.0 * out_hw.1;
        let out_cols = self.out_channels * out_spatial;
        let kk = self.kernel_elems();
        let stamp_cols = self.out_channels * kk;
        let mut stamps = Tensor::zeros(batch * h * w, stamp_cols)?;
        {
            let grad_data = grad_output.data();
            let stamp_data = stamps.data_mut();
            for b in 0..batch {
                let grad_row = &grad_data[b * out_cols..(b + 1) * out_cols];
                for ih in 0..h {
                    for iw in 0..w {
                        let row_index = (b * h + ih) * w + iw;
                        let stamp =
                            &mut stamp_data[row_index * stamp_cols..(row_index + 1) * stamp_cols];
                        for oc in 0..self.out_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(pos) = self.target(ih, iw, kh, kw, out_hw) {
                                        stamp[oc * kk + kh * self.kernel.1 + kw] =
                                            grad_row[oc * out_spatial + pos];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(stamps)
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        expect_cols(input, self.in_channels * h * w)?;
        let batch = input.shape().0;
        let pixels = planes_to_matrix(input, self.in_channels, h * w)?;
        let stamps = pixels.matmul(self.weight.value())?;
        let mut output = self.col2im(&stamps, batch)?;
        let (oh, ow) = self.output_hw()?;
        let spatial = oh * ow;
        let cols = self.out_channels * spatial;
        let bias = self.bias.value().data();
        for row in output.data_mut().chunks_mut(cols) {
            for (oc, plane) in row.chunks_mut(spatial).enumerate() {
                for value in plane.iter_mut() {
                    *value += bias[oc];
                }
            }
        }
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        expect_cols(input, self.in_channels * h * w)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let spatial = oh * ow;
        if grad_output.shape() != (batch, self.out_channels * spatial) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * spatial),
            });
        }
        let pixels = planes_to_matrix(input, self.in_channels, h * w)?;
        let grad_stamps = self.im2col(grad_output, batch)?;
        let grad_weight = pixels.transpose().matmul(&grad_stamps)?;
        let mut bias_sums = vec![0.0f32; self.out_channels];
        for row in grad_output.data().chunks(self.out_channels * spatial) {
            for (oc, plane) in row.chunks(spatial).enumerate() {
                bias_sums[oc] += plane.iter().sum::<f32>();
            }
        }
        let grad_bias = Tensor::from_vec(1, self.out_channels, bias_sums)?;
        let grad_pixels = grad_stamps.matmul(&self.weight.value().transpose())?;
        let grad_input = matrix_to_planes(&grad_pixels, batch, self.in_channels, h * w)?;
        self.weight.accumulate(&grad_weight)?;
        self.bias.accumulate(&grad_bias)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

/// Max pooling over 2D feature maps. Windows that run past the border are
/// dropped (floor semantics).
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            input_hw,
        };
        pool.output_hw()?;
        Ok(pool)
    }

    /// 2×2 window, stride 2: halves both axes.
    pub fn halving(channels: usize, input_hw: (usize, usize)) -> PureResult<Self> {
        Self::new(channels, (2, 2), (2, 2), input_hw)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        if h < kh || w < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h.min(w),
                cols: kh.max(kw),
            });
        }
        Ok(((h - kh) / self.stride.0 + 1, (w - kw) / self.stride.1 + 1))
    }

    /// Visits `(output index, argmax input index, max value)` for every window of
    /// one sample row. Ties resolve to the first element in scan order.
    fn scan_row(&self, row: &[f32], mut visit: impl FnMut(usize, usize, f32)) -> PureResult<()> {
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw()?;
        for c in 0..self.channels {
            let channel_offset = c * h * w;
            for oh_idx in 0..oh {
                for ow_idx in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = channel_offset + oh_idx * self.stride.0 * w + ow_idx * self.stride.1;
                    for kh in 0..self.kernel.0 {
                        for kw in 0..self.kernel.1 {
                            let index = channel_offset
                                + (oh_idx * self.stride.0 + kh) * w
                                + ow_idx * self.stride.1
                                + kw;
                            let value = row[index];
                            if value > best {
                                best = value;
                                best_idx = index;
                            }
                        }
                    }
                    visit(c * oh * ow + oh_idx * ow + ow_idx, best_idx, best);
                }
            }
        }
        Ok(())
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        expect_cols(input, self.channels * h * w)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let out_cols = self.channels * oh * ow;
        let mut out = Tensor::zeros(batch, out_cols)?;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                self.scan_row(input.row(b), |out_index, _, best| {
                    out_row[out_index] = best;
                })?;
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        expect_cols(input, self.channels * h * w)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let out_cols = self.channels * oh * ow;
        if grad_output.shape() != (batch, out_cols) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, out_cols),
            });
        }
        let in_cols = self.channels * h * w;
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = grad_output.row(b);
                let grad_in_row = &mut grad_input_data[b * in_cols..(b + 1) * in_cols];
                self.scan_row(input.row(b), |out_index, input_index, _| {
                    grad_in_row[input_index] += grad_row[out_index];
                })?;
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
