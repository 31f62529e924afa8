//! Raw pictures decoded from captured stills

use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};

use crate::surface::StillFormat;
use crate::{Error, Result};

/// Packed RGB8 picture handed to video encoders
#[derive(Clone, PartialEq, Eq)]
pub struct RawPicture {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

impl RawPicture {
    /// Wrap packed RGB8 pixels
    pub fn from_rgb(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(Error::EncodingError(format!(
                "RGB buffer of {} bytes does not match {}x{}",
                rgb.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, rgb })
    }

    /// Decode a compressed still
    pub fn decode_still(data: &[u8], format: StillFormat) -> Result<Self> {
        let image_format = match format {
            StillFormat::Jpeg => ImageFormat::Jpeg,
            StillFormat::Png => ImageFormat::Png,
        };
        let image = image::load_from_memory_with_format(data, image_format)
            .map_err(|e| Error::EncodingError(format!("failed to decode {:?} still: {}", format, e)))?
            .into_rgb8();
        Ok(Self::from_image(image))
    }

    fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            rgb: image.into_raw(),
        }
    }

    /// Scale to `width`x`height` unless already that size
    pub fn fit_to(self, width: u32, height: u32) -> Self {
        if self.width == width && self.height == height {
            return self;
        }
        let (src_w, src_h) = (self.width, self.height);
        match RgbImage::from_raw(src_w, src_h, self.rgb) {
            Some(image) => Self::from_image(image::imageops::resize(
                &image,
                width,
                height,
                FilterType::Triangle,
            )),
            // from_raw only fails on a short buffer, which from_rgb rules out
            None => Self {
                width,
                height,
                rgb: vec![0; width as usize * height as usize * 3],
            },
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB8 pixels
    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// View as an `image` buffer
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.rgb.clone())
    }
}

impl std::fmt::Debug for RawPicture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPicture")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::codecs::png::PngEncoder;
    use image::ImageEncoder;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]))
    }

    #[test]
    fn test_decode_jpeg() {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&gradient(64, 48))
            .unwrap();

        let picture = RawPicture::decode_still(&jpeg, StillFormat::Jpeg).unwrap();
        assert_eq!((picture.width(), picture.height()), (64, 48));
        assert_eq!(picture.rgb().len(), 64 * 48 * 3);
    }

    #[test]
    fn test_decode_png() {
        let image = gradient(10, 6);
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(image.as_raw(), 10, 6, image::ExtendedColorType::Rgb8)
            .unwrap();

        let picture = RawPicture::decode_still(&png, StillFormat::Png).unwrap();
        assert_eq!(picture.rgb(), image.as_raw().as_slice());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(
            RawPicture::decode_still(b"definitely not a jpeg", StillFormat::Jpeg),
            Err(Error::EncodingError(_))
        ));
    }

    #[test]
    fn test_fit_to_resizes_only_on_mismatch() {
        let picture = RawPicture::from_rgb(4, 4, vec![7; 48]).unwrap();
        let same = picture.clone().fit_to(4, 4);
        assert_eq!(same, picture);

        let resized = picture.fit_to(8, 2);
        assert_eq!((resized.width(), resized.height()), (8, 2));
        assert_eq!(resized.rgb().len(), 8 * 2 * 3);
    }

    #[test]
    fn test_from_rgb_checks_length() {
        assert!(RawPicture::from_rgb(2, 2, vec![0; 11]).is_err());
    }
}
