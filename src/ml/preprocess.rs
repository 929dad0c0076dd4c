//! 推論・学習共通の画像前処理
//!
//! エンコード済み画像 → RGB → 224x224 → f32 → バッチ次元追加 → ネットワーク別スケーリング。
//! 出力は NHWC `(1, 224, 224, 3)` です。

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, RgbImage};

use crate::types::{Backbone, CHANNELS, IMAGE_SIZE};

/// 前処理済み画像（NHWC, バッチサイズ1）
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    data: Vec<f32>,
    backbone: Backbone,
}

impl PreprocessedImage {
    /// `(1, 224, 224, 3)`
    pub const SHAPE: [usize; 4] = [1, IMAGE_SIZE, IMAGE_SIZE, CHANNELS];

    /// 全画素が 0 の画像（読み込み失敗時の埋め草）
    pub fn zeros(backbone: Backbone) -> Self {
        Self {
            data: vec![0.0; Self::SHAPE.iter().product()],
            backbone,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        Self::SHAPE
    }

    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    /// 平坦化された画素値（NHWC順）
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// `(1, 224, 224, 3)` のテンソルに変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 4>::from_data(
            TensorData::new(self.data.clone(), Self::SHAPE).convert::<B::FloatElem>(),
            device,
        )
    }
}

/// エンコード済みバイト列をRGB画像として読み込む
///
/// アルファチャネルは破棄し、グレースケールは3チャネルに展開します。
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        anyhow::bail!("Empty image payload");
    }
    let img = image::load_from_memory(bytes).context("Failed to decode image")?;
    Ok(img.to_rgb8())
}

/// RGB画像をモデル入力に変換
pub fn preprocess_rgb(img: &RgbImage, backbone: Backbone) -> PreprocessedImage {
    let size = IMAGE_SIZE as u32;
    let resized = if img.dimensions() == (size, size) {
        img.clone()
    } else {
        image::imageops::resize(img, size, size, FilterType::CatmullRom)
    };

    // RgbImage の生バッファは HWC 順なのでそのまま NHWC になる
    let data = resized
        .as_raw()
        .iter()
        .map(|&v| backbone.scale_pixel(v))
        .collect();

    PreprocessedImage { data, backbone }
}

/// エンコード済み画像をモデル入力に変換
pub fn preprocess_image(bytes: &[u8], backbone: Backbone) -> Result<PreprocessedImage> {
    let img = decode_rgb(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        anyhow::bail!("Image has zero size");
    }
    Ok(preprocess_rgb(&img, backbone))
}

/// 複数画像を `(N, 224, 224, 3)` のテンソルにまとめる
pub fn stack_to_tensor<B: Backend>(images: Vec<PreprocessedImage>, device: &B::Device) -> Tensor<B, 4> {
    let batch_size = images.len();
    let mut all_pixels = Vec::with_capacity(batch_size * IMAGE_SIZE * IMAGE_SIZE * CHANNELS);
    for image in images {
        all_pixels.extend(image.into_vec());
    }

    Tensor::<B, 4>::from_data(
        TensorData::new(all_pixels, [batch_size, IMAGE_SIZE, IMAGE_SIZE, CHANNELS])
            .convert::<B::FloatElem>(),
        device,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
        })
    }

    fn assert_in_range(image: &PreprocessedImage) {
        let (min, max) = image.backbone().value_range();
        assert!(image.as_slice().iter().all(|v| *v >= min && *v <= max));
    }

    #[test]
    fn test_shape_and_range_mobilenet() {
        let bytes = encode(DynamicImage::ImageRgb8(gradient(640, 480)), ImageFormat::Png);
        let image = preprocess_image(&bytes, Backbone::MobileNetV2).unwrap();

        assert_eq!(image.shape(), [1, 224, 224, 3]);
        assert_eq!(image.as_slice().len(), 224 * 224 * 3);
        assert_in_range(&image);
    }

    #[test]
    fn test_efficientnet_keeps_raw_values() {
        let img = RgbImage::from_pixel(224, 224, Rgb([255, 0, 17]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        let image = preprocess_image(&bytes, Backbone::EfficientNetB1).unwrap();

        assert_eq!(&image.as_slice()[..3], &[255.0, 0.0, 17.0]);
        assert_in_range(&image);
    }

    #[test]
    fn test_mobilenet_maps_extremes() {
        let img = RgbImage::from_pixel(224, 224, Rgb([0, 255, 0]));
        let image = preprocess_rgb(&img, Backbone::MobileNetV2);

        assert_eq!(&image.as_slice()[..3], &[-1.0, 1.0, -1.0]);
    }

    #[test]
    fn test_alpha_and_grayscale_inputs() {
        let rgba = RgbaImage::from_pixel(224, 224, Rgba([10, 20, 30, 0]));
        let bytes = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png);
        let image = preprocess_image(&bytes, Backbone::EfficientNetB1).unwrap();
        assert_eq!(image.shape(), PreprocessedImage::SHAPE);
        assert_eq!(&image.as_slice()[..3], &[10.0, 20.0, 30.0]);

        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(224, 224, image::Luma([200])));
        let bytes = encode(gray, ImageFormat::Png);
        let image = preprocess_image(&bytes, Backbone::EfficientNetB1).unwrap();
        assert_eq!(&image.as_slice()[..3], &[200.0, 200.0, 200.0]);
    }

    #[test]
    fn test_jpeg_input() {
        let bytes = encode(DynamicImage::ImageRgb8(gradient(300, 200)), ImageFormat::Jpeg);
        let image = preprocess_image(&bytes, Backbone::MobileNetV2).unwrap();
        assert_in_range(&image);
    }

    #[test]
    fn test_malformed_input_is_error() {
        assert!(preprocess_image(b"", Backbone::MobileNetV2).is_err());
        assert!(preprocess_image(b"definitely not an image", Backbone::MobileNetV2).is_err());

        let mut truncated = encode(DynamicImage::ImageRgb8(gradient(64, 64)), ImageFormat::Png);
        truncated.truncate(truncated.len() / 3);
        assert!(preprocess_image(&truncated, Backbone::EfficientNetB1).is_err());
    }

    #[test]
    fn test_tensor_shape() {
        type B = burn::backend::NdArray<f32>;
        let device = Default::default();

        let img = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let image = preprocess_rgb(&img, Backbone::EfficientNetB1);
        assert_eq!(image.to_tensor::<B>(&device).dims(), [1, 224, 224, 3]);

        let batch = stack_to_tensor::<B>(vec![image.clone(), PreprocessedImage::zeros(image.backbone())], &device);
        assert_eq!(batch.dims(), [2, 224, 224, 3]);
    }
}
