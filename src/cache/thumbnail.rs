//! Thumbnail generation

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::sync::Arc;

use crate::textures::TextureInfo;

/// Scale every face of `info` to fit a `size`x`size` square.
///
/// Aspect ratio is preserved and the scaled face is centred on a white
/// background. Missing faces stay missing, so a stub in gives a stub out.
pub fn make_thumbnail(info: &TextureInfo, size: u32) -> TextureInfo {
    let size = size.max(1);
    let images = info
        .images
        .iter()
        .map(|face| face.as_ref().map(|img| Arc::new(fit_to_square(img, size))))
        .collect();

    TextureInfo {
        images,
        data_size: size as u64 * size as u64 * 4 * info.face_count() as u64,
        file_size: info.file_size,
        dimensions: (size, size),
        source_modified: info.source_modified,
    }
}

fn fit_to_square(img: &RgbaImage, size: u32) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(size, size, Rgba([255, 255, 255, 255]));
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return canvas;
    }

    let (scaled_w, scaled_h) = if width >= height {
        (size, ((height as u64 * size as u64) / width as u64).max(1) as u32)
    } else {
        (((width as u64 * size as u64) / height as u64).max(1) as u32, size)
    };

    let scaled = imageops::resize(img, scaled_w, scaled_h, FilterType::Triangle);
    let x = (size - scaled_w) / 2;
    let y = (size - scaled_h) / 2;
    imageops::overlay(&mut canvas, &scaled, x as i64, y as i64);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_image_is_letterboxed() {
        let red = Rgba([255, 0, 0, 255]);
        let info = TextureInfo::from_faces(vec![Some(RgbaImage::from_pixel(128, 64, red))]);

        let thumb = make_thumbnail(&info, 64);
        assert_eq!(thumb.dimensions, (64, 64));
        assert!(!thumb.is_stub());

        let img = thumb.first_image().unwrap();
        assert_eq!(img.dimensions(), (64, 64));
        // 64x32 content centred vertically: rows 16..48
        assert_eq!(img.get_pixel(32, 2), &Rgba([255, 255, 255, 255]));
        assert_eq!(img.get_pixel(32, 32), &red);
        assert_eq!(img.get_pixel(32, 61), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_tall_image_is_pillarboxed() {
        let blue = Rgba([0, 0, 255, 255]);
        let info = TextureInfo::from_faces(vec![Some(RgbaImage::from_pixel(10, 40, blue))]);

        let img = make_thumbnail(&info, 20).first_image().cloned().unwrap();
        // 5x20 content centred horizontally: columns 7..12
        assert_eq!(img.get_pixel(1, 10), &Rgba([255, 255, 255, 255]));
        assert_eq!(img.get_pixel(9, 10), &blue);
        assert_eq!(img.get_pixel(18, 10), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_stub_faces_stay_missing() {
        let info = TextureInfo::stub(6);
        let thumb = make_thumbnail(&info, 32);
        assert!(thumb.is_stub());
        assert_eq!(thumb.face_count(), 6);
    }
}
