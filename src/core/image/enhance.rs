use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use palette::{FromColor, Lab, Srgb};
use std::path::Path;

use super::clahe::{equalize_plane, ClaheParams};

/// Outcome of enhancing one image file
pub enum Enhancement {
    Enhanced(DynamicImage),
    /// The file could not be decoded; callers copy the original bytes instead
    Undecodable(String),
}

/// Decode `path` and equalize its luminance.
pub fn enhance_file(path: &Path, params: &ClaheParams) -> Enhancement {
    match image::open(path) {
        Ok(img) => Enhancement::Enhanced(enhance_image(&img, params)),
        Err(e) => Enhancement::Undecodable(e.to_string()),
    }
}

/// Apply CLAHE to the luminance of `img`, keeping its dimensions and channel layout.
pub fn enhance_image(img: &DynamicImage, params: &ClaheParams) -> DynamicImage {
    let color = img.color();
    match (color.has_color(), color.has_alpha()) {
        (false, false) => DynamicImage::ImageLuma8(enhance_gray(img.to_luma8(), params)),
        (false, true) => DynamicImage::ImageLumaA8(enhance_gray_alpha(img.to_luma_alpha8(), params)),
        (true, false) => DynamicImage::ImageRgb8(enhance_rgb(&img.to_rgb8(), params)),
        (true, true) => DynamicImage::ImageRgba8(enhance_rgba(img.to_rgba8(), params)),
    }
}

fn enhance_gray(mut gray: GrayImage, params: &ClaheParams) -> GrayImage {
    let (width, height) = gray.dimensions();
    let equalized = equalize_plane(gray.as_raw(), width, height, params);
    gray.copy_from_slice(&equalized);
    gray
}

fn enhance_gray_alpha(mut img: GrayAlphaImage, params: &ClaheParams) -> GrayAlphaImage {
    let (width, height) = img.dimensions();
    let plane: Vec<u8> = img.pixels().map(|p| p[0]).collect();
    let equalized = equalize_plane(&plane, width, height, params);
    for (pixel, value) in img.pixels_mut().zip(equalized) {
        pixel[0] = value;
    }
    img
}

/// Lab representation of an RGB buffer with the lightness quantised to 8 bits
struct LabPlanes {
    lightness: Vec<u8>,
    chroma: Vec<(f32, f32)>,
}

fn to_lab_planes(pixels: impl Iterator<Item = [u8; 3]>, capacity: usize) -> LabPlanes {
    let mut lightness = Vec::with_capacity(capacity);
    let mut chroma = Vec::with_capacity(capacity);
    for [r, g, b] in pixels {
        let rgb = Srgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
        let lab: Lab = Lab::from_color(rgb);
        lightness.push((lab.l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8);
        chroma.push((lab.a, lab.b));
    }
    LabPlanes { lightness, chroma }
}

fn lab_to_rgb(l: u8, (a, b): (f32, f32)) -> [u8; 3] {
    let lab: Lab = Lab::new(l as f32 * 100.0 / 255.0, a, b);
    let rgb: Srgb = Srgb::from_color(lab);
    let channel = |c: f32| (c * 255.0).round().clamp(0.0, 255.0) as u8;
    [channel(rgb.red), channel(rgb.green), channel(rgb.blue)]
}

fn enhance_rgb(img: &RgbImage, params: &ClaheParams) -> RgbImage {
    let (width, height) = img.dimensions();
    let planes = to_lab_planes(img.pixels().map(|p| p.0), (width * height) as usize);
    let equalized = equalize_plane(&planes.lightness, width, height, params);

    let mut out = RgbImage::new(width, height);
    for ((pixel, l), ab) in out.pixels_mut().zip(equalized).zip(planes.chroma) {
        pixel.0 = lab_to_rgb(l, ab);
    }
    out
}

fn enhance_rgba(mut img: RgbaImage, params: &ClaheParams) -> RgbaImage {
    let (width, height) = img.dimensions();
    let planes = to_lab_planes(
        img.pixels().map(|p| [p[0], p[1], p[2]]),
        (width * height) as usize,
    );
    let equalized = equalize_plane(&planes.lightness, width, height, params);

    for ((pixel, l), ab) in img.pixels_mut().zip(equalized).zip(planes.chroma) {
        let [r, g, b] = lab_to_rgb(l, ab);
        pixel[0] = r;
        pixel[1] = g;
        pixel[2] = b;
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};
    use std::fs;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([90 + (x % 20) as u8, 80 + (y % 10) as u8, 120])
        })
    }

    #[test]
    fn test_rgb_keeps_dimensions_and_channels() {
        let img = DynamicImage::ImageRgb8(gradient(40, 30));
        let out = enhance_image(&img, &ClaheParams::default());
        assert_eq!((out.width(), out.height()), (40, 30));
        assert_eq!(out.color(), img.color());
    }

    #[test]
    fn test_rgba_keeps_alpha() {
        let rgba = RgbaImage::from_fn(16, 16, |x, _| Rgba([100, 110, 120, (x * 10) as u8]));
        let out = enhance_image(&DynamicImage::ImageRgba8(rgba.clone()), &ClaheParams::default());
        let out = out.as_rgba8().unwrap();
        for (a, b) in out.pixels().zip(rgba.pixels()) {
            assert_eq!(a[3], b[3]);
        }
    }

    #[test]
    fn test_gray_stays_gray() {
        let gray = GrayImage::from_fn(20, 10, |x, _| image::Luma([50 + x as u8]));
        let out = enhance_image(&DynamicImage::ImageLuma8(gray), &ClaheParams::default());
        assert!(out.as_luma8().is_some());
        assert_eq!((out.width(), out.height()), (20, 10));
    }

    #[test]
    fn test_lab_roundtrip_is_close() {
        for rgb in [[0u8, 0, 0], [255, 255, 255], [200, 30, 60], [12, 140, 220]] {
            let planes = to_lab_planes(std::iter::once(rgb), 1);
            let back = lab_to_rgb(planes.lightness[0], planes.chroma[0]);
            for (a, b) in back.iter().zip(rgb.iter()) {
                assert!((*a as i32 - *b as i32).abs() <= 3, "{:?} -> {:?}", rgb, back);
            }
        }
    }

    #[test]
    fn test_undecodable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();
        assert!(matches!(
            enhance_file(&path, &ClaheParams::default()),
            Enhancement::Undecodable(_)
        ));
    }

    #[test]
    fn test_enhance_png_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cells.png");
        gradient(24, 24).save(&path).unwrap();
        match enhance_file(&path, &ClaheParams::default()) {
            Enhancement::Enhanced(img) => assert_eq!((img.width(), img.height()), (24, 24)),
            Enhancement::Undecodable(e) => panic!("decode failed: {}", e),
        }
    }
}
