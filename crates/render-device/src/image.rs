//! Decoded images and their mip chains.
//!
//! Decoding is delegated to an [`ImageDecoder`]. The device layer only needs
//! tightly packed RGBA8 texels for every mip level; the row padding that
//! texture uploads require is added later, when the levels are copied into a
//! staging buffer.

use std::{fs, path::Path};

use image::{
    imageops::{self, FilterType},
    ImageError, Rgba, Rgba32FImage,
};
use log::debug;

use crate::{resource::Format, upload::TextureMetadata, Error, Result};

/// Describes how the color values of an image are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    Linear,
}

const BYTES_PER_PIXEL: usize = 4;

/// One level of a mip chain: tightly packed RGBA8 rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MipLevel {
    width: u32,
    height: u32,
    bytes: Box<[u8]>,
}

impl MipLevel {
    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    #[inline]
    #[must_use]
    pub fn rows(&self) -> RowIter {
        RowIter {
            row_pitch: self.row_bytes(),
            cursor: 0,
            bytes: &self.bytes,
        }
    }

    fn texel(&self, x: u32, y: u32) -> &[u8] {
        let start = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        &self.bytes[start..start + BYTES_PER_PIXEL]
    }
}

pub struct RowIter<'a> {
    row_pitch: usize,
    cursor: usize,
    bytes: &'a [u8],
}

impl<'a> Iterator for RowIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.row_pitch == 0 || self.cursor >= self.bytes.len() {
            return None;
        }

        let row = &self.bytes[self.cursor..self.cursor + self.row_pitch];
        self.cursor += self.row_pitch;
        Some(row)
    }
}

/// An RGBA8 image and zero or more successively halved copies of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MipChain {
    color_space: ColorSpace,
    levels: Vec<MipLevel>,
}

impl MipChain {
    /// Wraps tightly packed RGBA8 pixels as a single-level chain.
    pub fn from_rgba8(
        width: u32,
        height: u32,
        bytes: impl Into<Box<[u8]>>,
        color_space: ColorSpace,
    ) -> Result<Self> {
        let bytes = bytes.into();
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;

        if width == 0 || height == 0 || bytes.len() != expected {
            return Err(Error::AssetLoad {
                path: "<memory>".into(),
                reason: format!(
                    "{} bytes do not describe a {}x{} RGBA8 image",
                    bytes.len(),
                    width,
                    height
                ),
            });
        }

        Ok(Self {
            color_space,
            levels: vec![MipLevel {
                width,
                height,
                bytes,
            }],
        })
    }

    /// A `size`x`size` checkerboard of `cell`-pixel squares alternating
    /// between `a` and `b`, starting with `a` in the top left.
    #[must_use]
    pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let size = size.max(1);
        let mut bytes = Vec::with_capacity(size as usize * size as usize * BYTES_PER_PIXEL);
        for y in 0..size {
            for x in 0..size {
                let texel = if (x / cell + y / cell) % 2 == 0 { a } else { b };
                bytes.extend_from_slice(&texel);
            }
        }

        Self {
            color_space: ColorSpace::Srgb,
            levels: vec![MipLevel {
                width: size,
                height: size,
                bytes: bytes.into(),
            }],
        }
    }

    /// Replaces every level below the first with a full chain down to 1x1,
    /// filtering in linear space when the image is sRGB encoded.
    #[must_use]
    pub fn with_generated_mips(mut self) -> Self {
        self.levels.truncate(1);
        let (width, height) = (self.width(), self.height());

        let mut linear = to_linear(&self.levels[0], self.color_space);
        for level in 1..u32::from(full_mip_count(width, height)) {
            let (width, height) = mip_extent(width, height, level);
            linear = imageops::resize(&linear, width, height, FilterType::Triangle);
            self.levels.push(from_linear(&linear, self.color_space));
        }

        self
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.levels[0].width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.levels[0].height
    }

    #[must_use]
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// sRGB images are sampled through an sRGB view so that shaders see
    /// linear values.
    #[must_use]
    pub fn format(&self) -> Format {
        match self.color_space {
            ColorSpace::Srgb => Format::Rgba8UnormSrgb,
            ColorSpace::Linear => Format::Rgba8Unorm,
        }
    }

    #[must_use]
    pub fn levels(&self) -> &[MipLevel] {
        &self.levels
    }

    #[must_use]
    pub fn mip_levels(&self) -> u16 {
        self.levels.len() as u16
    }

    #[must_use]
    pub fn metadata(&self) -> TextureMetadata {
        TextureMetadata {
            width: self.width(),
            height: self.height(),
            mip_levels: self.mip_levels(),
            format: self.format(),
        }
    }
}

/// The size of mip `level` of a `width`x`height` image.
#[must_use]
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    (
        width.checked_shr(level).unwrap_or(0).max(1),
        height.checked_shr(level).unwrap_or(0).max(1),
    )
}

/// The number of levels in a full chain, down to and including 1x1.
#[must_use]
pub fn full_mip_count(width: u32, height: u32) -> u16 {
    let largest = width.max(height).max(1);
    (u32::BITS - largest.leading_zeros()) as u16
}

#[must_use]
pub fn srgb_to_linear(value: f32) -> f32 {
    if value <= 0.040_45 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

#[must_use]
pub fn linear_to_srgb(value: f32) -> f32 {
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

/// Alpha is always stored linearly.
fn is_color(channel: usize, color_space: ColorSpace) -> bool {
    color_space == ColorSpace::Srgb && channel < 3
}

fn to_linear(level: &MipLevel, color_space: ColorSpace) -> Rgba32FImage {
    Rgba32FImage::from_fn(level.width, level.height, |x, y| {
        let mut texel = [0.0; BYTES_PER_PIXEL];
        for (channel, (value, byte)) in texel.iter_mut().zip(level.texel(x, y)).enumerate() {
            let unorm = f32::from(*byte) / 255.0;
            *value = if is_color(channel, color_space) {
                srgb_to_linear(unorm)
            } else {
                unorm
            };
        }
        Rgba(texel)
    })
}

fn from_linear(image: &Rgba32FImage, color_space: ColorSpace) -> MipLevel {
    let bytes = image
        .as_raw()
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let value = if is_color(i % BYTES_PER_PIXEL, color_space) {
                linear_to_srgb(*value)
            } else {
                *value
            };

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let byte = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            byte
        })
        .collect::<Vec<_>>();

    MipLevel {
        width: image.width(),
        height: image.height(),
        bytes: bytes.into(),
    }
}

/// The image-codec collaborator: turns a file into texels and a mip chain.
pub trait ImageDecoder {
    fn decode(&self, path: &Path) -> Result<MipChain>;
}

/// Decodes PNG files as sRGB RGBA8, regardless of how they are stored.
#[derive(Clone, Copy, Debug)]
pub struct PngDecoder {
    pub generate_mips: bool,
}

impl Default for PngDecoder {
    fn default() -> Self {
        Self {
            generate_mips: true,
        }
    }
}

impl ImageDecoder for PngDecoder {
    fn decode(&self, path: &Path) -> Result<MipChain> {
        let asset_error = |reason: String| Error::AssetLoad {
            path: path.to_owned(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| asset_error(e.to_string()))?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| match e {
            ImageError::Unsupported(e) => Error::UnsupportedFormat {
                path: path.to_owned(),
                format: e.to_string(),
            },
            e => asset_error(e.to_string()),
        })?;

        debug!(
            "decoded '{}': {}x{} {:?}",
            path.display(),
            decoded.width(),
            decoded.height(),
            decoded.color()
        );

        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let image = MipChain::from_rgba8(width, height, rgba.into_raw(), ColorSpace::Srgb)
            .map_err(|e| asset_error(e.to_string()))?;

        Ok(if self.generate_mips {
            image.with_generated_mips()
        } else {
            image
        })
    }
}

#[cfg(test)]
mod tests {
    use image::ColorType;

    use super::*;

    const WHITE: [u8; 4] = [255, 255, 255, 255];
    const BLACK: [u8; 4] = [0, 0, 0, 255];

    fn write_png(path: &Path, width: u32, height: u32, color: ColorType, data: &[u8]) {
        image::save_buffer(path, data, width, height, color).unwrap();
    }

    #[test]
    fn mip_counts() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(2, 2), 2);
        assert_eq!(full_mip_count(256, 64), 9);
        assert_eq!(full_mip_count(5, 3), 3);
        assert_eq!(mip_extent(5, 3, 1), (2, 1));
        assert_eq!(mip_extent(5, 3, 2), (1, 1));
        assert_eq!(mip_extent(5, 3, 40), (1, 1));
    }

    #[test]
    fn checkerboard_rows() {
        let image = MipChain::checkerboard(2, 1, WHITE, BLACK);
        let mut rows = image.levels()[0].rows();
        assert_eq!(rows.next(), Some([WHITE, BLACK].concat().as_slice()));
        assert_eq!(rows.next(), Some([BLACK, WHITE].concat().as_slice()));
        assert_eq!(rows.next(), None);
    }

    #[test]
    fn rejects_mismatched_pixels() {
        assert!(MipChain::from_rgba8(2, 2, vec![0; 15], ColorSpace::Srgb).is_err());
        assert!(MipChain::from_rgba8(0, 2, Vec::new(), ColorSpace::Srgb).is_err());
    }

    #[test]
    fn srgb_mips_filter_in_linear_space() {
        let srgb = MipChain::checkerboard(2, 1, WHITE, BLACK).with_generated_mips();
        assert_eq!(srgb.mip_levels(), 2);

        let texel = srgb.levels()[1].bytes();
        assert_eq!(texel.len(), 4);
        assert!((187..=188).contains(&texel[0]), "{texel:?}");
        assert_eq!(texel[3], 255);

        let linear = MipChain::from_rgba8(
            2,
            2,
            [WHITE, BLACK, BLACK, WHITE].concat(),
            ColorSpace::Linear,
        )
        .unwrap()
        .with_generated_mips();
        assert_eq!(linear.levels()[1].bytes(), &[128, 128, 128, 255]);
    }

    #[test]
    fn odd_sizes_reach_one_by_one() {
        let image = MipChain::from_rgba8(5, 3, vec![200; 5 * 3 * 4], ColorSpace::Srgb)
            .unwrap()
            .with_generated_mips();

        let sizes = image
            .levels()
            .iter()
            .map(|l| (l.width(), l.height()))
            .collect::<Vec<_>>();
        assert_eq!(sizes, [(5, 3), (2, 1), (1, 1)]);
        assert!(image.levels()[2].bytes().iter().all(|b| *b == 200));
    }

    #[test]
    fn decodes_rgb_png_as_srgb_rgba() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        write_png(
            &path,
            2,
            1,
            ColorType::Rgb8,
            &[255, 0, 0, 0, 0, 255],
        );

        let image = PngDecoder {
            generate_mips: false,
        }
        .decode(&path)
        .unwrap();

        assert_eq!(image.format(), Format::Rgba8UnormSrgb);
        assert_eq!((image.width(), image.height()), (2, 1));
        assert_eq!(image.levels()[0].bytes(), &[255, 0, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn decodes_with_full_mip_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.png");
        let board = MipChain::checkerboard(4, 2, WHITE, BLACK);
        write_png(&path, 4, 4, ColorType::Rgba8, board.levels()[0].bytes());

        let image = PngDecoder::default().decode(&path).unwrap();
        assert_eq!(image.mip_levels(), 3);
        assert_eq!(image.levels()[0], board.levels()[0]);
    }

    #[test]
    fn gray_pngs_expand_to_rgba() {
        let dir = tempfile::tempdir().unwrap();
        let gray = dir.path().join("gray.png");
        let gray_alpha = dir.path().join("gray_alpha.png");
        write_png(&gray, 2, 1, ColorType::L8, &[0, 64]);
        write_png(&gray_alpha, 1, 1, ColorType::La8, &[200, 100]);

        let decoder = PngDecoder {
            generate_mips: false,
        };
        assert_eq!(
            decoder.decode(&gray).unwrap().levels()[0].bytes(),
            &[0, 0, 0, 255, 64, 64, 64, 255]
        );
        assert_eq!(
            decoder.decode(&gray_alpha).unwrap().levels()[0].bytes(),
            &[200, 200, 200, 100]
        );
    }

    #[test]
    fn unknown_contents_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.png");
        fs::write(&path, b"not an image at all").unwrap();

        let error = PngDecoder::default().decode(&path).unwrap_err();
        assert!(matches!(error, Error::UnsupportedFormat { .. }), "{error}");
        assert!(error.is_recoverable());
    }

    #[test]
    fn missing_file_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let error = PngDecoder::default()
            .decode(&dir.path().join("missing.png"))
            .unwrap_err();
        assert!(matches!(error, Error::AssetLoad { .. }));
        assert!(error.is_recoverable());
    }
}
