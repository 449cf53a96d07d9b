//! Frame-based wrapper over the `image` crate
//!
//! A [`Raster`] holds one RGBA buffer per page (frame). Static formats
//! always decode to a single page; GIF and animated WebP decode to as many
//! pages as the caller's page-count hint allows. Geometry operations apply
//! to every page so animations survive the pipeline.
//!
//! `thumbnail_from` is the single decode-with-hints entry point the
//! decision engine talks to. The `image` crate has no codec-level DCT
//! scaling, so the fast path is decode-then-scale here; a backend with
//! native shrink-on-load can slot in behind the same call.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::bmp::BmpEncoder;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::{WebPDecoder, WebPEncoder};
use image::imageops::{self, FilterType};
use image::{
    AnimationDecoder, Delay, DynamicImage, ExtendedColorType, Frame, ImageEncoder, ImageFormat,
    Rgba, RgbaImage,
};

use super::{Interest, SizeMode};
use crate::blob::{Blob, Meta};
use crate::error::{Error, Result};

/// Decoded image: one RGBA page per frame, plus per-frame delays
#[derive(Debug)]
pub struct Raster {
    frames: Vec<RgbaImage>,
    delays: Vec<Delay>,
    format: ImageFormat,
}

impl Raster {
    /// Full decode. `pages` caps animated frames: −1 means unbounded,
    /// 1 collapses to the first frame.
    pub fn decode(blob: &Blob, pages: i32) -> Result<Raster> {
        if blob.is_empty() {
            return Err(Error::NotFound);
        }
        let bytes = blob.bytes().as_ref();
        let format = image::guess_format(bytes)?;
        let cap = if pages > 0 { pages as usize } else { usize::MAX };

        if pages != 1 && pages != 0 {
            match format {
                ImageFormat::Gif => {
                    let decoder = GifDecoder::new(Cursor::new(bytes))?;
                    return Self::from_frames(decoder.into_frames(), cap, format);
                }
                ImageFormat::WebP => {
                    let decoder = WebPDecoder::new(Cursor::new(bytes))?;
                    if decoder.has_animation() {
                        return Self::from_frames(decoder.into_frames(), cap, format);
                    }
                }
                _ => {}
            }
        }

        let decoded = image::load_from_memory_with_format(bytes, format)?;
        Ok(Raster {
            frames: vec![decoded.to_rgba8()],
            delays: vec![Delay::from_numer_denom_ms(0, 1)],
            format,
        })
    }

    fn from_frames<'a>(
        frames: image::Frames<'a>,
        cap: usize,
        format: ImageFormat,
    ) -> Result<Raster> {
        let mut buffers = Vec::new();
        let mut delays = Vec::new();
        for frame in frames {
            let frame = frame?;
            delays.push(frame.delay());
            buffers.push(frame.into_buffer());
            if buffers.len() >= cap {
                break;
            }
        }
        if buffers.is_empty() {
            return Err(Error::UnsupportedFormat);
        }
        Ok(Raster {
            frames: buffers,
            delays,
            format,
        })
    }

    /// Decode with thumbnail hints. Animated sources keep their pages; an
    /// animated source cropped with a region of interest takes the
    /// two-step thumbnail-then-extract path, because a plain thumbnail
    /// cannot preserve frames while cropping.
    pub fn thumbnail_from(
        blob: &Blob,
        width: u32,
        height: u32,
        interest: Interest,
        size: SizeMode,
        pages: i32,
        max_width: u32,
        max_height: u32,
    ) -> Result<Raster> {
        if blob.is_empty() {
            return Err(Error::NotFound);
        }
        let animated = blob.supports_animation() && pages != 1 && pages != 0;
        let mut raster = Self::decode(blob, if animated { pages } else { 1 })?;
        if animated && interest != Interest::None && size != SizeMode::Force {
            raster.animated_thumbnail_with_crop(width, height, interest, size, max_width, max_height)?;
        } else {
            raster.thumbnail_pages(width, height, interest, size)?;
        }
        Ok(raster)
    }

    pub fn width(&self) -> u32 {
        self.frames.first().map(|f| f.width()).unwrap_or(0)
    }

    /// Height of one page (frame)
    pub fn page_height(&self) -> u32 {
        self.frames.first().map(|f| f.height()).unwrap_or(0)
    }

    pub fn pages(&self) -> usize {
        self.frames.len()
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn frames(&self) -> &[RgbaImage] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [RgbaImage] {
        &mut self.frames
    }

    /// Replace every page through `op`
    pub fn map_pages(&mut self, op: impl Fn(&RgbaImage) -> RgbaImage) {
        for frame in &mut self.frames {
            *frame = op(frame);
        }
    }

    /// In-memory thumbnail honoring interest and size semantics. Animated
    /// rasters with a region of interest go through the two-step path.
    pub fn thumbnail(
        &mut self,
        width: u32,
        height: u32,
        interest: Interest,
        size: SizeMode,
        max_width: u32,
        max_height: u32,
    ) -> Result<()> {
        if interest == Interest::None || size == SizeMode::Force || self.pages() == 1 {
            self.thumbnail_pages(width, height, interest, size)
        } else {
            self.animated_thumbnail_with_crop(width, height, interest, size, max_width, max_height)
        }
    }

    /// Scale (and for a region of interest, crop) every page to the target
    /// box
    fn thumbnail_pages(
        &mut self,
        width: u32,
        height: u32,
        interest: Interest,
        size: SizeMode,
    ) -> Result<()> {
        let width = width.max(1);
        let height = height.max(1);
        let (src_w, src_h) = (self.width(), self.page_height());
        if src_w == 0 || src_h == 0 {
            return Err(Error::UnsupportedFormat);
        }
        if size == SizeMode::Force {
            self.map_pages(|f| imageops::resize(f, width, height, FilterType::Lanczos3));
            return Ok(());
        }
        let wr = width as f64 / src_w as f64;
        let hr = height as f64 / src_h as f64;
        let mut scale = if interest == Interest::None {
            wr.min(hr)
        } else {
            // fill the box, then crop to it
            wr.max(hr)
        };
        if size == SizeMode::Down {
            scale = scale.min(1.0);
        }
        if (scale - 1.0).abs() > f64::EPSILON {
            let new_w = ((src_w as f64 * scale).round() as u32).max(1);
            let new_h = ((src_h as f64 * scale).round() as u32).max(1);
            self.map_pages(|f| imageops::resize(f, new_w, new_h, FilterType::Lanczos3));
        }
        if interest != Interest::None {
            let crop_w = width.min(self.width());
            let crop_h = height.min(self.page_height());
            let (left, top) = self.gravity(interest, crop_w, crop_h);
            self.extract(left, top, crop_w, crop_h)?;
        }
        Ok(())
    }

    /// Two-step animated crop: scale the binding dimension with no crop,
    /// then extract the target region with gravity offsets
    fn animated_thumbnail_with_crop(
        &mut self,
        width: u32,
        height: u32,
        interest: Interest,
        size: SizeMode,
        max_width: u32,
        max_height: u32,
    ) -> Result<()> {
        if size == SizeMode::Down && self.width() < width && self.page_height() < height {
            return Ok(());
        }
        let target_ratio = width as f64 / height.max(1) as f64;
        let source_ratio = self.width() as f64 / self.page_height().max(1) as f64;
        if target_ratio > source_ratio {
            // width is the binding dimension
            self.thumbnail_pages(width, max_height, Interest::None, size)?;
        } else {
            self.thumbnail_pages(max_width, height, Interest::None, size)?;
        }
        let crop_w = width.min(self.width());
        let crop_h = height.min(self.page_height());
        let (left, top) = match interest {
            Interest::High => (self.width() - crop_w, self.page_height() - crop_h),
            Interest::Centre | Interest::Attention => (
                (self.width() - crop_w) / 2,
                (self.page_height() - crop_h) / 2,
            ),
            _ => (0, 0),
        };
        self.extract(left, top, crop_w, crop_h)
    }

    /// Crop offsets for a region of interest within the current pages
    fn gravity(&self, interest: Interest, crop_w: u32, crop_h: u32) -> (u32, u32) {
        let spare_w = self.width().saturating_sub(crop_w);
        let spare_h = self.page_height().saturating_sub(crop_h);
        match interest {
            Interest::Low => (0, 0),
            Interest::High => (spare_w, spare_h),
            Interest::Attention => {
                attention_window(&self.frames[0], crop_w, crop_h)
            }
            _ => (spare_w / 2, spare_h / 2),
        }
    }

    /// Extract a region from every page, clamped to the page bounds
    pub fn extract(&mut self, left: u32, top: u32, width: u32, height: u32) -> Result<()> {
        let left = left.min(self.width().saturating_sub(1));
        let top = top.min(self.page_height().saturating_sub(1));
        let width = width.min(self.width() - left).max(1);
        let height = height.min(self.page_height() - top).max(1);
        self.map_pages(|f| imageops::crop_imm(f, left, top, width, height).to_image());
        Ok(())
    }

    pub fn resize_exact(&mut self, width: u32, height: u32) {
        self.map_pages(|f| imageops::resize(f, width.max(1), height.max(1), FilterType::Lanczos3));
    }

    pub fn flip_horizontal(&mut self) {
        for frame in &mut self.frames {
            imageops::flip_horizontal_in_place(frame);
        }
    }

    pub fn flip_vertical(&mut self) {
        for frame in &mut self.frames {
            imageops::flip_vertical_in_place(frame);
        }
    }

    /// Rotate counter-clockwise by 90, 180 or 270 degrees; other angles
    /// are ignored
    pub fn rotate(&mut self, degrees: i64) {
        match degrees.rem_euclid(360) {
            90 => self.map_pages(imageops::rotate270),
            180 => self.map_pages(imageops::rotate180),
            270 => self.map_pages(imageops::rotate90),
            _ => {}
        }
    }

    /// Pad every page onto a `width` x `height` canvas of `color`,
    /// placing the page by the given alignment ("" means centered)
    pub fn pad_to(&mut self, width: u32, height: u32, color: Rgba<u8>, h_align: &str, v_align: &str) {
        let (fw, fh) = (self.width(), self.page_height());
        if width <= fw && height <= fh {
            return;
        }
        let width = width.max(fw);
        let height = height.max(fh);
        let left = match h_align {
            "left" => 0,
            "right" => width - fw,
            _ => (width - fw) / 2,
        };
        let top = match v_align {
            "top" => 0,
            "bottom" => height - fh,
            _ => (height - fh) / 2,
        };
        self.map_pages(|f| {
            let mut canvas = RgbaImage::from_pixel(width, height, color);
            imageops::overlay(&mut canvas, f, left as i64, top as i64);
            canvas
        });
    }

    /// Encode the pages into `format`. Quality applies where the encoder
    /// accepts it. Multi-page output is preserved for GIF only; other
    /// formats encode the first page.
    pub fn export(&self, format: ImageFormat, quality: u8) -> Result<(Bytes, Meta)> {
        let first = self.frames.first().ok_or(Error::Internal)?;
        let (width, height) = (first.width(), first.height());
        let mut out = Vec::new();

        let format = match format {
            ImageFormat::Gif if self.pages() > 1 => {
                let mut encoder = GifEncoder::new(&mut out);
                encoder.set_repeat(Repeat::Infinite)?;
                for (frame, delay) in self.frames.iter().zip(&self.delays) {
                    encoder.encode_frame(Frame::from_parts(frame.clone(), 0, 0, *delay))?;
                }
                drop(encoder);
                ImageFormat::Gif
            }
            ImageFormat::Gif => {
                let mut encoder = GifEncoder::new(&mut out);
                encoder.encode_frame(Frame::from_parts(first.clone(), 0, 0, self.delays[0]))?;
                drop(encoder);
                ImageFormat::Gif
            }
            ImageFormat::Png => {
                PngEncoder::new(&mut out).write_image(
                    first.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
                ImageFormat::Png
            }
            ImageFormat::WebP => {
                WebPEncoder::new_lossless(&mut out).encode(
                    first.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
                ImageFormat::WebP
            }
            ImageFormat::Bmp => {
                BmpEncoder::new(&mut out).encode(
                    first.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
                ImageFormat::Bmp
            }
            ImageFormat::Tiff => {
                let mut cursor = Cursor::new(Vec::new());
                TiffEncoder::new(&mut cursor).write_image(
                    first.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
                out = cursor.into_inner();
                ImageFormat::Tiff
            }
            // everything else exports as JPEG, like unknown formats
            _ => {
                let rgb = DynamicImage::ImageRgba8(first.clone()).to_rgb8();
                let q = if quality > 0 { quality.min(100) } else { 75 };
                JpegEncoder::new_with_quality(&mut out, q).write_image(
                    rgb.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )?;
                ImageFormat::Jpeg
            }
        };

        let meta = Meta {
            format: format_name(format).to_string(),
            content_type: content_type(format).to_string(),
            width,
            height,
            orientation: 1,
        };
        Ok((Bytes::from(out), meta))
    }
}

/// Pick the crop window with the most luminance detail, a cheap stand-in
/// for saliency-driven attention cropping
fn attention_window(frame: &RgbaImage, crop_w: u32, crop_h: u32) -> (u32, u32) {
    let (w, h) = (frame.width(), frame.height());
    if crop_w >= w && crop_h >= h {
        return (0, 0);
    }
    let luma = |x: u32, y: u32| -> i64 {
        let p = frame.get_pixel(x, y);
        (p[0] as i64 * 299 + p[1] as i64 * 587 + p[2] as i64 * 114) / 1000
    };
    let mut col_energy = vec![0i64; w as usize];
    let mut row_energy = vec![0i64; h as usize];
    for y in 0..h {
        for x in 1..w {
            let d = (luma(x, y) - luma(x - 1, y)).abs();
            col_energy[x as usize] += d;
            row_energy[y as usize] += d;
        }
    }
    (
        best_offset(&col_energy, crop_w.min(w)),
        best_offset(&row_energy, crop_h.min(h)),
    )
}

fn best_offset(energy: &[i64], window: u32) -> u32 {
    let window = window as usize;
    if window >= energy.len() {
        return 0;
    }
    let mut sum: i64 = energy[..window].iter().sum();
    let mut best = sum;
    let mut best_at = 0usize;
    for start in 1..=(energy.len() - window) {
        sum += energy[start + window - 1] - energy[start - 1];
        if sum > best {
            best = sum;
            best_at = start;
        }
    }
    best_at as u32
}

/// Export format for a filter argument like `format(webp)`
pub fn parse_format(name: &str) -> Option<ImageFormat> {
    match name.trim().to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "gif" => Some(ImageFormat::Gif),
        "webp" => Some(ImageFormat::WebP),
        "bmp" => Some(ImageFormat::Bmp),
        "tiff" | "tif" => Some(ImageFormat::Tiff),
        _ => None,
    }
}

pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "jpeg",
    }
}

pub fn content_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        _ => "image/jpeg",
    }
}
