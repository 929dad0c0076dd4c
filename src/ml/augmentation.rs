//! 学習時のデータ拡張
//!
//! 回転（±rotation_range 度）、ズーム（1 ± zoom_range 倍）、左右反転を確率的に適用します。
//! 回転とズームは画像中心まわりの1回のアフィン変換で行い、画像外になった領域は
//! 最も近い端の画素で埋めます。出力サイズは入力と同じです。

use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use rand::Rng;

use crate::model::AugmentationSettings;

#[derive(Clone, Debug)]
pub struct ImageAugmenter {
    config: AugmentationSettings,
}

/// 座標を画像内に収める（バイリニア補間が右・下の画素も参照できる範囲）
fn clamp_coord(v: f32, len: u32) -> f32 {
    v.clamp(0.0, (len as f32 - 1.001).max(0.0))
}

impl ImageAugmenter {
    pub fn new(config: AugmentationSettings) -> Self {
        ImageAugmenter { config }
    }

    pub fn augment(&self, img: &RgbImage) -> RgbImage {
        let mut rng = rand::thread_rng();
        self.augment_with(img, &mut rng)
    }

    /// 乱数生成器を指定して拡張（テスト・再現用）
    pub fn augment_with<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let degrees = self.sample_rotation(rng);
        let zoom = self.sample_zoom(rng);
        let out = transform(img, degrees, zoom);
        self.flip_image(out, rng)
    }

    fn sample_rotation<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let range = self.config.rotation_range.abs();
        if range == 0.0 {
            return 0.0;
        }
        rng.gen_range(-range..=range)
    }

    /// 倍率 < 1 は拡大（中央付近を切り出す）、倍率 > 1 は縮小
    fn sample_zoom<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let range = self.config.zoom_range.abs().min(0.9);
        if range == 0.0 {
            return 1.0;
        }
        rng.gen_range((1.0 - range)..=(1.0 + range))
    }

    fn flip_image<R: Rng + ?Sized>(&self, img: RgbImage, rng: &mut R) -> RgbImage {
        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            imageops::flip_horizontal(&img)
        } else {
            img
        }
    }
}

/// 中心まわりの回転・ズーム（出力画素ごとに入力座標を逆算し、範囲外は端の画素で埋める）
fn transform(img: &RgbImage, degrees: f32, zoom: f32) -> RgbImage {
    if degrees == 0.0 && zoom == 1.0 {
        return img.clone();
    }

    let (width, height) = img.dimensions();
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let (sin, cos) = degrees.to_radians().sin_cos();

    let interpolation = if width < 2 || height < 2 {
        Interpolation::Nearest
    } else {
        Interpolation::Bilinear
    };

    warp_with(
        img,
        move |x, y| {
            let (dx, dy) = (x - cx, y - cy);
            let sx = (cos * dx + sin * dy) * zoom + cx;
            let sy = (-sin * dx + cos * dy) * zoom + cy;
            (clamp_coord(sx, width), clamp_coord(sy, height))
        },
        interpolation,
        Rgb([0, 0, 0]),
    )
}
