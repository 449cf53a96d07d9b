//! Raster processor
//!
//! Translates a parsed parameter bundle into decode hints and image
//! operations. The load decision is the performance-critical part: most
//! requests ride the thumbnail path with interest/size hints, while
//! "special" requests (trim, auto fill) force a full decode because their
//! preprocessing cannot be expressed as decode hints.
//!
//! Filter names are fixed at construction into an enabled set; disabled
//! and unknown names are silently ignored so old URLs keep working.

pub(crate) mod imaging;
mod filters;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::blob::Blob;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::gateway::{Fetch, Processed, Processor};
use crate::urlpath::{Filter, Params, H_ALIGN_LEFT, H_ALIGN_RIGHT, V_ALIGN_BOTTOM, V_ALIGN_TOP};
use self::imaging::{parse_format, Raster};

/// Region-of-interest policy when source aspect differs from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    None,
    Low,
    High,
    Centre,
    Attention,
}

/// How the target box constrains scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMode {
    Both,
    Down,
    Force,
}

/// Decode hints chosen by the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbSpec {
    pub width: u32,
    pub height: u32,
    pub interest: Interest,
    pub size: SizeMode,
}

/// Mode flags gathered in one pass over the filter list before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mode {
    special: bool,
    upscale: bool,
    stretch: bool,
    max_frames: i32,
    export: Option<ImageFormat>,
    autojpg: bool,
    quality: u8,
}

#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub max_filter_ops: usize,
    /// −1 means unbounded; 0 and values below −1 normalise to 1
    pub max_animation_frames: i32,
    /// Concurrent pipelines; 0 means unlimited
    pub concurrency: usize,
    pub disable_blur: bool,
    pub disable_filters: Vec<String>,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            max_width: 9999,
            max_height: 9999,
            max_filter_ops: 10,
            max_animation_frames: -1,
            concurrency: 0,
            disable_blur: false,
            disable_filters: Vec::new(),
        }
    }
}

const FILTER_NAMES: &[&str] = &[
    "watermark",
    "round_corner",
    "rotate",
    "grayscale",
    "brightness",
    "background_color",
    "contrast",
    "hue",
    "saturation",
    "rgb",
    "blur",
    "sharpen",
    "trim",
    "fill",
];

pub struct RasterProcessor {
    options: RasterOptions,
    enabled: HashSet<&'static str>,
    permits: Option<Arc<Semaphore>>,
}

impl RasterProcessor {
    pub fn new(options: RasterOptions) -> Self {
        let mut disabled: Vec<&str> = options.disable_filters.iter().map(String::as_str).collect();
        if options.disable_blur {
            disabled.push("blur");
            disabled.push("sharpen");
        }
        let enabled = FILTER_NAMES
            .iter()
            .copied()
            .filter(|name| !disabled.contains(name))
            .collect();
        let permits = if options.concurrency > 0 {
            Some(Arc::new(Semaphore::new(options.concurrency)))
        } else {
            None
        };
        Self {
            options,
            enabled,
            permits,
        }
    }

    pub(crate) fn filter_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    /// One pass over the filters for the flags that steer decoding
    fn scan(&self, p: &Params) -> Mode {
        let mut mode = Mode {
            special: p.trim,
            upscale: !p.fit_in,
            stretch: p.stretch,
            max_frames: normalize_frames(self.options.max_animation_frames),
            export: None,
            autojpg: false,
            quality: 0,
        };
        for f in &p.filters {
            match f.name.as_str() {
                "format" => {
                    if let Some(fmt) = parse_format(&f.args) {
                        mode.export = Some(fmt);
                        if fmt != ImageFormat::Gif && fmt != ImageFormat::WebP {
                            // export format cannot carry frames
                            mode.max_frames = 1;
                        }
                    }
                }
                "stretch" => mode.stretch = true,
                "upscale" => mode.upscale = true,
                "no_upscale" => mode.upscale = false,
                "fill" | "background_color" => {
                    if f.args.split(',').next().map(str::trim) == Some("auto") {
                        mode.special = true;
                    }
                }
                "trim" => mode.special = true,
                "quality" => mode.quality = f.args.trim().parse().unwrap_or(0),
                "autojpg" => mode.autojpg = true,
                _ => {}
            }
        }
        mode
    }

    async fn apply(
        &self,
        raster: &mut Raster,
        filter: &Filter,
        p: &Params,
        fetch: &dyn Fetch,
    ) -> Result<()> {
        match filter.name.as_str() {
            "watermark" => filters::watermark(raster, &filter.args, fetch).await?,
            "round_corner" => filters::round_corner(raster, &filter.args),
            "rotate" => filters::rotate(raster, &filter.args),
            "grayscale" => filters::grayscale(raster),
            "brightness" => filters::brightness(raster, &filter.args),
            "background_color" => filters::background_color(raster, &filter.args),
            "contrast" => filters::contrast(raster, &filter.args),
            "hue" => filters::hue(raster, &filter.args),
            "saturation" => filters::saturation(raster, &filter.args),
            "rgb" => filters::rgb(raster, &filter.args),
            "blur" => filters::blur(raster, &filter.args),
            "sharpen" => filters::sharpen(raster, &filter.args),
            "trim" => filters::trim(raster, &filter.args),
            "fill" => filters::fill(
                raster,
                &filter.args,
                p.fit_in,
                p.width.max(0) as u32,
                p.height.max(0) as u32,
                &p.h_align,
                &p.v_align,
            ),
            _ => {}
        }
        Ok(())
    }

    fn apply_crop_insets(&self, raster: &mut Raster, p: &Params) -> Result<()> {
        let left = (p.crop_left.max(0) as u32).min(raster.width());
        let top = (p.crop_top.max(0) as u32).min(raster.page_height());
        let right = (p.crop_right.max(0) as u32).min(raster.width());
        let bottom = (p.crop_bottom.max(0) as u32).min(raster.page_height());
        if right > left && bottom > top {
            raster.extract(left, top, right - left, bottom - top)?;
        }
        Ok(())
    }
}

fn normalize_frames(n: i32) -> i32 {
    if n == 0 || n < -1 {
        1
    } else {
        n
    }
}

/// The branch table mapping parameters to decode hints. `None` means no
/// explicit thumbnail branch matched and sizing (if any) happens after a
/// plain load.
fn select_branch(p: &Params, mode: &Mode, max_w: u32, max_h: u32) -> Option<ThumbSpec> {
    let (w, h) = (p.width.max(0) as u32, p.height.max(0) as u32);
    if p.fit_in {
        if w > 0 || h > 0 {
            let size = if mode.upscale {
                SizeMode::Both
            } else {
                SizeMode::Down
            };
            return Some(ThumbSpec {
                width: if w == 0 { max_w } else { w },
                height: if h == 0 { max_h } else { h },
                interest: Interest::None,
                size,
            });
        }
        return None;
    }
    if mode.stretch {
        if w > 0 && h > 0 {
            return Some(ThumbSpec {
                width: w,
                height: h,
                interest: Interest::None,
                size: SizeMode::Force,
            });
        }
        return None;
    }
    if w > 0 && h > 0 {
        let interest = if p.smart {
            Interest::Attention
        } else if (p.v_align == V_ALIGN_TOP && p.h_align.is_empty())
            || (p.h_align == H_ALIGN_LEFT && p.v_align.is_empty())
        {
            Interest::Low
        } else if (p.v_align == V_ALIGN_BOTTOM && p.h_align.is_empty())
            || (p.h_align == H_ALIGN_RIGHT && p.v_align.is_empty())
        {
            Interest::High
        } else if (p.v_align.is_empty() || p.v_align == "middle")
            && (p.h_align.is_empty() || p.h_align == "center")
        {
            Interest::Centre
        } else {
            // mixed alignment has no thumbnail equivalent
            return None;
        };
        return Some(ThumbSpec {
            width: w,
            height: h,
            interest,
            size: SizeMode::Both,
        });
    }
    if w > 0 {
        return Some(ThumbSpec {
            width: w,
            height: max_h,
            interest: Interest::None,
            size: SizeMode::Both,
        });
    }
    if h > 0 {
        return Some(ThumbSpec {
            width: max_w,
            height: h,
            interest: Interest::None,
            size: SizeMode::Both,
        });
    }
    None
}

#[async_trait]
impl Processor for RasterProcessor {
    async fn startup(&self, _cx: &Cx) -> Result<()> {
        info!(
            max_width = self.options.max_width,
            max_height = self.options.max_height,
            max_filter_ops = self.options.max_filter_ops,
            max_animation_frames = self.options.max_animation_frames,
            concurrency = self.options.concurrency,
            filters = self.enabled.len(),
            "raster processor ready"
        );
        Ok(())
    }

    async fn process(
        &self,
        cx: &Cx,
        blob: Blob,
        params: &Params,
        fetch: &dyn Fetch,
    ) -> Result<Processed> {
        let _permit = match &self.permits {
            Some(semaphore) => Some(semaphore.acquire().await.map_err(|_| Error::Internal)?),
            None => None,
        };
        if blob.is_empty() {
            return Err(Error::NotFound);
        }
        let mode = self.scan(params);
        let (max_w, max_h) = (self.options.max_width, self.options.max_height);
        let crops_clear = params.crop_left == 0
            && params.crop_top == 0
            && params.crop_right == 0
            && params.crop_bottom == 0;

        let mut sized = false;
        let mut raster = if !mode.special && crops_clear {
            match select_branch(params, &mode, max_w, max_h) {
                Some(spec) => {
                    sized = true;
                    Raster::thumbnail_from(
                        &blob,
                        spec.width,
                        spec.height,
                        spec.interest,
                        spec.size,
                        mode.max_frames,
                        max_w,
                        max_h,
                    )?
                }
                None => Raster::thumbnail_from(
                    &blob,
                    max_w,
                    max_h,
                    Interest::None,
                    SizeMode::Down,
                    mode.max_frames,
                    max_w,
                    max_h,
                )?,
            }
        } else if mode.special {
            // trim and auto fill need the full pixels before any scaling
            Raster::decode(&blob, mode.max_frames)?
        } else {
            Raster::thumbnail_from(
                &blob,
                max_w,
                max_h,
                Interest::None,
                SizeMode::Down,
                mode.max_frames,
                max_w,
                max_h,
            )?
        };
        debug!(
            pages = raster.pages(),
            width = raster.width(),
            page_height = raster.page_height(),
            sized,
            "decoded"
        );

        if !sized {
            if params.trim {
                filters::trim_raster(&mut raster, &params.trim_by, params.trim_tolerance);
            }
            if !crops_clear {
                self.apply_crop_insets(&mut raster, params)?;
            }
            if let Some(spec) = select_branch(params, &mode, max_w, max_h) {
                raster.thumbnail(spec.width, spec.height, spec.interest, spec.size, max_w, max_h)?;
            }
        }
        if params.h_flip {
            raster.flip_horizontal();
        }
        if params.v_flip {
            raster.flip_vertical();
        }

        let mut ops = 0usize;
        for filter in &params.filters {
            if !self.enabled.contains(filter.name.as_str()) {
                continue;
            }
            if self.options.max_filter_ops > 0 && ops >= self.options.max_filter_ops {
                debug!(limit = self.options.max_filter_ops, "filter budget exhausted");
                break;
            }
            ops += 1;
            self.apply(&mut raster, filter, params, fetch).await?;
            if cx.expired() {
                return Err(Error::Timeout);
            }
        }

        let mut format = mode.export.unwrap_or_else(|| raster.format());
        if mode.autojpg {
            format = ImageFormat::Jpeg;
        }
        let (bytes, meta) = raster.export(format, mode.quality)?;
        Ok(Processed::Done(Blob::with_meta(bytes, meta)))
    }

    async fn shutdown(&self, _cx: &Cx) -> Result<()> {
        debug!("raster processor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::imaging::testutil::{gif_blob, png_blob};
    use super::*;
    use crate::urlpath::parse;

    struct NoFetch;

    #[async_trait]
    impl Fetch for NoFetch {
        async fn fetch(&self, _key: &str) -> Result<Blob> {
            Err(Error::NotFound)
        }
    }

    fn processor() -> RasterProcessor {
        RasterProcessor::new(RasterOptions::default())
    }

    fn mode_for(url: &str) -> Mode {
        processor().scan(&parse(url))
    }

    #[test]
    fn test_scan_format_override_caps_frames() {
        let mode = mode_for("/unsafe/filters:format(png)/a.gif");
        assert_eq!(mode.export, Some(ImageFormat::Png));
        assert_eq!(mode.max_frames, 1);
        // animated export formats keep their frames
        let mode = mode_for("/unsafe/filters:format(webp)/a.gif");
        assert_eq!(mode.export, Some(ImageFormat::WebP));
        assert_eq!(mode.max_frames, -1);
    }

    #[test]
    fn test_scan_upscale_flags() {
        assert!(mode_for("/unsafe/100x100/a.jpg").upscale);
        assert!(!mode_for("/unsafe/fit-in/100x100/a.jpg").upscale);
        assert!(mode_for("/unsafe/fit-in/filters:upscale()/a.jpg").upscale);
        assert!(!mode_for("/unsafe/filters:no_upscale()/a.jpg").upscale);
    }

    #[test]
    fn test_scan_special_markers() {
        assert!(mode_for("/unsafe/trim/a.jpg").special);
        assert!(mode_for("/unsafe/filters:trim(10)/a.jpg").special);
        assert!(mode_for("/unsafe/filters:fill(auto)/a.jpg").special);
        assert!(mode_for("/unsafe/filters:background_color(auto)/a.jpg").special);
        assert!(!mode_for("/unsafe/filters:fill(white)/a.jpg").special);
        assert!(!mode_for("/unsafe/100x100/a.jpg").special);
    }

    #[test]
    fn test_scan_quality_and_autojpg_read_ahead() {
        let mode = mode_for("/unsafe/filters:quality(80):autojpg()/a.png");
        assert_eq!(mode.quality, 80);
        assert!(mode.autojpg);
        assert_eq!(mode.export, None);
    }

    #[test]
    fn test_normalize_frames() {
        assert_eq!(normalize_frames(-1), -1);
        assert_eq!(normalize_frames(0), 1);
        assert_eq!(normalize_frames(-5), 1);
        assert_eq!(normalize_frames(7), 7);
    }

    fn branch(url: &str) -> Option<ThumbSpec> {
        let p = parse(url);
        let processor = processor();
        let mode = processor.scan(&p);
        select_branch(&p, &mode, 9999, 8888)
    }

    #[test]
    fn test_branch_fit_in_downscales_without_upscale() {
        assert_eq!(
            branch("/unsafe/fit-in/200x200/big.jpg"),
            Some(ThumbSpec {
                width: 200,
                height: 200,
                interest: Interest::None,
                size: SizeMode::Down,
            })
        );
        assert_eq!(
            branch("/unsafe/fit-in/200x200/filters:upscale()/big.jpg").unwrap().size,
            SizeMode::Both
        );
    }

    #[test]
    fn test_branch_fit_in_fills_missing_dimension() {
        let spec = branch("/unsafe/fit-in/200x0/a.jpg").unwrap();
        assert_eq!((spec.width, spec.height), (200, 8888));
    }

    #[test]
    fn test_branch_fit_in_wins_over_stretch() {
        let spec = branch("/unsafe/fit-in/stretch/100x100/a.jpg").unwrap();
        assert_eq!(spec.size, SizeMode::Down);
    }

    #[test]
    fn test_branch_stretch_forces() {
        let spec = branch("/unsafe/stretch/100x200/a.jpg").unwrap();
        assert_eq!(spec.size, SizeMode::Force);
        assert_eq!((spec.width, spec.height), (100, 200));
        // stretch without both dimensions falls through
        assert_eq!(branch("/unsafe/stretch/100x0/a.jpg"), None);
    }

    #[test]
    fn test_branch_alignment_interest() {
        assert_eq!(branch("/unsafe/100x100/smart/a.jpg").unwrap().interest, Interest::Attention);
        assert_eq!(branch("/unsafe/100x100/left/a.jpg").unwrap().interest, Interest::Low);
        assert_eq!(branch("/unsafe/100x100/top/a.jpg").unwrap().interest, Interest::Low);
        assert_eq!(branch("/unsafe/100x100/right/a.jpg").unwrap().interest, Interest::High);
        assert_eq!(branch("/unsafe/100x100/bottom/a.jpg").unwrap().interest, Interest::High);
        assert_eq!(branch("/unsafe/100x100/a.jpg").unwrap().interest, Interest::Centre);
        assert_eq!(
            branch("/unsafe/100x100/center/middle/a.jpg").unwrap().interest,
            Interest::Centre
        );
        // mixed alignment has no thumbnail path
        assert_eq!(branch("/unsafe/100x100/left/top/a.jpg"), None);
    }

    #[test]
    fn test_branch_single_dimension() {
        let spec = branch("/unsafe/200x0/a.jpg").unwrap();
        assert_eq!(
            (spec.width, spec.height, spec.size),
            (200, 8888, SizeMode::Both)
        );
        let spec = branch("/unsafe/0x150/a.jpg").unwrap();
        assert_eq!((spec.width, spec.height), (9999, 150));
    }

    #[test]
    fn test_branch_no_dimensions_falls_through() {
        assert_eq!(branch("/unsafe/a.jpg"), None);
    }

    async fn run(processor: &RasterProcessor, blob: Blob, url: &str) -> Blob {
        match processor
            .process(&Cx::root(), blob, &parse(url), &NoFetch)
            .await
            .unwrap()
        {
            Processed::Done(blob) => blob,
            Processed::Pass(_) => panic!("raster processor never passes"),
        }
    }

    #[tokio::test]
    async fn test_identity_round_trip_preserves_shape() {
        let out = run(&processor(), png_blob(8, 4), "/unsafe/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!(meta.format, "png");
        assert_eq!((meta.width, meta.height), (8, 4));
    }

    #[tokio::test]
    async fn test_fit_in_shrinks_into_box() {
        let out = run(&processor(), png_blob(100, 50), "/unsafe/fit-in/40x40/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!((meta.width, meta.height), (40, 20));
    }

    #[tokio::test]
    async fn test_fit_in_does_not_upscale_by_default() {
        let out = run(&processor(), png_blob(10, 5), "/unsafe/fit-in/400x400/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!((meta.width, meta.height), (10, 5));
    }

    #[tokio::test]
    async fn test_centre_crop_fills_box() {
        let out = run(&processor(), png_blob(100, 50), "/unsafe/40x40/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!((meta.width, meta.height), (40, 40));
    }

    #[tokio::test]
    async fn test_stretch_distorts_to_exact_box() {
        let out = run(&processor(), png_blob(100, 50), "/unsafe/stretch/30x30/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!((meta.width, meta.height), (30, 30));
    }

    #[tokio::test]
    async fn test_animated_centre_crop_keeps_frames() {
        let out = run(&processor(), gif_blob(3, 100, 50), "/unsafe/40x40/anim.gif").await;
        let meta = out.meta().unwrap();
        assert_eq!(meta.format, "gif");
        assert_eq!((meta.width, meta.height), (40, 40));
        let back = Raster::decode(&Blob::new(out.bytes().clone()), -1).unwrap();
        assert_eq!(back.pages(), 3);
    }

    #[tokio::test]
    async fn test_animation_frame_cap_collapses_to_static() {
        let processor = RasterProcessor::new(RasterOptions {
            max_animation_frames: 1,
            ..Default::default()
        });
        let out = run(&processor, gif_blob(3, 20, 20), "/unsafe/anim.gif").await;
        let back = Raster::decode(&Blob::new(out.bytes().clone()), -1).unwrap();
        assert_eq!(back.pages(), 1);
    }

    #[tokio::test]
    async fn test_format_filter_converts() {
        let out = run(&processor(), png_blob(6, 6), "/unsafe/filters:format(jpeg)/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!(meta.format, "jpeg");
        assert_eq!(meta.content_type, "image/jpeg");
        assert_eq!(out.sniff_content_type(), "image/jpeg");
    }

    #[tokio::test]
    async fn test_crop_insets_apply_before_sizing() {
        let out = run(&processor(), png_blob(20, 20), "/unsafe/5x5:15x15/foo.png").await;
        let meta = out.meta().unwrap();
        assert_eq!((meta.width, meta.height), (10, 10));
    }

    #[tokio::test]
    async fn test_unknown_filter_is_ignored() {
        let out = run(&processor(), png_blob(6, 6), "/unsafe/filters:sparkle(11)/foo.png").await;
        assert_eq!(out.meta().unwrap().width, 6);
    }

    #[tokio::test]
    async fn test_empty_blob_is_not_found() {
        let err = processor()
            .process(&Cx::root(), Blob::empty(), &parse("/unsafe/foo.png"), &NoFetch)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn test_disable_filters_removes_names() {
        let processor = RasterProcessor::new(RasterOptions {
            disable_filters: vec!["grayscale".into(), "watermark".into()],
            ..Default::default()
        });
        assert!(!processor.filter_enabled("grayscale"));
        assert!(!processor.filter_enabled("watermark"));
        assert!(processor.filter_enabled("brightness"));
    }

    #[test]
    fn test_disable_blur_also_removes_sharpen() {
        let processor = RasterProcessor::new(RasterOptions {
            disable_blur: true,
            ..Default::default()
        });
        assert!(!processor.filter_enabled("blur"));
        assert!(!processor.filter_enabled("sharpen"));
        assert!(processor.filter_enabled("grayscale"));
    }

    #[tokio::test]
    async fn test_filter_budget_stops_dispatch() {
        let limited = RasterProcessor::new(RasterOptions {
            max_filter_ops: 1,
            ..Default::default()
        });
        let out = run(
            &limited,
            png_blob(4, 4),
            "/unsafe/filters:brightness(20):grayscale()/foo.png",
        )
        .await;
        // brightness ran, grayscale did not: channels stay unequal
        let back = Raster::decode(&Blob::new(out.bytes().clone()), 1).unwrap();
        let p = back.frames()[0].get_pixel(0, 0);
        assert_ne!(p[0], p[2]);
    }
}
