// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! CelebA reader: aligned face crops decoded with `image`, centre-cropped to a
//! square and resized to 32×32.

use super::{io_error, normalise_pixel, resolve_dir, DatasetOptions, ImageGeometry, LoadedDataset};
use image::imageops::{self, FilterType};
use image::RgbImage;
use si_nn::Dataset;
use si_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_DIR: &str = "img_align_celeba";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Split {
    Train,
    Val,
    Test,
}

/// Parses `list_eval_partition.txt` (`name 0|1|2`) or its CSV variant
/// (`image_id,partition` with a header row).
fn parse_partition(text: &str, path: &Path) -> PureResult<HashMap<String, Split>> {
    let mut splits = HashMap::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("image_id") {
            continue;
        }
        let mut fields = line.split(|c: char| c == ',' || c.is_whitespace()).filter(|f| !f.is_empty());
        let (Some(name), Some(tag)) = (fields.next(), fields.next()) else {
            return Err(TensorError::SerializationError {
                message: format!("{}:{}: expected `<image> <partition>`", path.display(), line_no + 1),
            });
        };
        let split = match tag {
            "0" => Split::Train,
            "1" => Split::Val,
            "2" => Split::Test,
            other => {
                return Err(TensorError::SerializationError {
                    message: format!("{}:{}: unknown partition `{other}`", path.display(), line_no + 1),
                })
            }
        };
        splits.insert(name.to_string(), split);
    }
    Ok(splits)
}

/// Without a partition file the sorted images split 80/10/10.
fn fallback_split(index: usize, total: usize) -> Split {
    let train_end = total * 8 / 10;
    let val_end = total * 9 / 10;
    if index < train_end {
        Split::Train
    } else if index < val_end {
        Split::Val
    } else {
        Split::Test
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("jpg") | Some("jpeg") | Some("png")
    )
}

fn list_images(dir: &Path) -> PureResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| io_error(dir, err))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| io_error(dir, err))?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Decodes one image into a normalised `(1, 3·32·32)` row, channel-major.
fn load_image(path: &Path, geometry: ImageGeometry) -> PureResult<Tensor> {
    let decoded = image::open(path).map_err(|err| io_error(path, err))?.to_rgb8();
    let side = decoded.width().min(decoded.height());
    let left = (decoded.width() - side) / 2;
    let top = (decoded.height() - side) / 2;
    let square = imageops::crop_imm(&decoded, left, top, side, side).to_image();
    let (h, w) = geometry.hw;
    let resized: RgbImage = imageops::resize(&square, w as u32, h as u32, FilterType::Triangle);
    let plane = h * w;
    let mut data = vec![0.0f32; geometry.features()];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for (channel, value) in pixel.0.iter().enumerate() {
            data[channel * plane + offset] = normalise_pixel(*value);
        }
    }
    Tensor::from_vec(1, geometry.features(), data)
}

/// CelebA from `img_align_celeba/` (under the root or `celeba/`). Splits come
/// from `list_eval_partition.txt`/`.csv` when present. Labels are all zero;
/// the attack only needs the images.
pub fn load_celeba(options: &DatasetOptions) -> PureResult<LoadedDataset> {
    options.validate()?;
    let base = resolve_dir(&options.root, "celeba")?;
    let image_dir = base.join(IMAGE_DIR);
    let images = list_images(&image_dir)?;
    if images.is_empty() {
        return Err(io_error(&image_dir, "no images found"));
    }
    let partition = ["list_eval_partition.txt", "list_eval_partition.csv"]
        .iter()
        .map(|name| base.join(name))
        .find(|path| path.is_file());
    let partition = match partition {
        Some(path) => {
            let text = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
            Some(parse_partition(&text, &path)?)
        }
        None => {
            tracing::warn!(dir = %base.display(), "no CelebA partition file, splitting 80/10/10");
            None
        }
    };

    let cap = options.max_samples.unwrap_or(usize::MAX);
    let mut train = Dataset::new();
    let mut val = Dataset::new();
    let mut test = Dataset::new();
    let total = images.len();
    for (index, path) in images.iter().enumerate() {
        let split = match &partition {
            Some(splits) => {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                match splits.get(name) {
                    Some(split) => *split,
                    None => continue,
                }
            }
            None => fallback_split(index, total),
        };
        let target = match split {
            Split::Train => &mut train,
            Split::Val => &mut val,
            Split::Test => &mut test,
        };
        if target.len() >= cap {
            continue;
        }
        target.push(
            load_image(path, ImageGeometry::RGB_32)?,
            Tensor::from_vec(1, 1, vec![0.0])?,
        );
    }
    if val.is_empty() {
        (train, val) = options.holdout(train);
    }
    Ok(options.assemble("CelebA", Vec::new(), train, val, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_face(dir: &Path, name: &str, shade: u8) {
        let img = RgbImage::from_fn(40, 48, |x, _| Rgb([shade, x as u8, 255 - shade]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn partition_file_assigns_splits() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(IMAGE_DIR);
        fs::create_dir(&images).unwrap();
        for (idx, name) in ["000001.png", "000002.png", "000003.png", "000004.png"].iter().enumerate() {
            write_face(&images, name, idx as u8 * 60);
        }
        fs::write(
            dir.path().join("list_eval_partition.txt"),
            "000001.png 0\n000002.png 0\n000003.png 1\n000004.png 2\n",
        )
        .unwrap();
        let data = load_celeba(&DatasetOptions::default().with_root(dir.path())).unwrap();
        assert_eq!((data.train.len(), data.val.len(), data.test.len()), (2, 1, 1));
        let (image, _) = data.test.iter().next().unwrap().unwrap();
        assert_eq!(image.shape(), (1, 3 * 32 * 32));
        // red channel is constant at 180 for the fourth face
        let red = normalise_pixel(180);
        assert!(image.data()[..1024].iter().all(|v| (v - red).abs() < 1e-5));
    }

    #[test]
    fn missing_partition_falls_back_to_ratio_split() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(IMAGE_DIR);
        fs::create_dir(&images).unwrap();
        for idx in 0..10 {
            write_face(&images, &format!("{idx:06}.png"), idx as u8);
        }
        let data = load_celeba(&DatasetOptions::default().with_root(dir.path())).unwrap();
        assert_eq!((data.train.len(), data.val.len(), data.test.len()), (8, 1, 1));
    }

    #[test]
    fn empty_image_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(IMAGE_DIR)).unwrap();
        let err = load_celeba(&DatasetOptions::default().with_root(dir.path())).unwrap_err();
        assert!(err.to_string().contains(IMAGE_DIR));
    }

    #[test]
    fn csv_partition_with_header_parses() {
        let splits = parse_partition("image_id,partition\na.jpg,0\nb.jpg,2\n", Path::new("p.csv")).unwrap();
        assert_eq!(splits["a.jpg"], Split::Train);
        assert_eq!(splits["b.jpg"], Split::Test);
        assert!(parse_partition("a.jpg 7\n", Path::new("p.txt")).is_err());
    }
}
