//! Filter operations over a decoded raster
//!
//! Arguments arrive as the raw string between the parentheses of the URL
//! filter segment. Bad arguments degrade to no-ops rather than failing the
//! request, matching the forgiving URL surface.

use image::imageops::{self, colorops};
use image::{Rgba, RgbaImage};

use super::imaging::Raster;
use crate::error::{Error, Result};
use crate::gateway::Fetch;

pub(super) fn rotate(raster: &mut Raster, args: &str) {
    if let Ok(degrees) = args.trim().parse::<i64>() {
        raster.rotate(degrees);
    }
}

pub(super) fn grayscale(raster: &mut Raster) {
    for frame in raster.frames_mut() {
        for pixel in frame.pixels_mut() {
            let luma =
                ((pixel[0] as u32 * 299 + pixel[1] as u32 * 587 + pixel[2] as u32 * 114) / 1000)
                    as u8;
            pixel[0] = luma;
            pixel[1] = luma;
            pixel[2] = luma;
        }
    }
}

/// `brightness(v)` with v in -100..100 percent
pub(super) fn brightness(raster: &mut Raster, args: &str) {
    let v: i32 = match args.trim().parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let delta = v.clamp(-100, 100) * 255 / 100;
    for frame in raster.frames_mut() {
        colorops::brighten_in_place(frame, delta);
    }
}

/// `contrast(v)` with v in -100..100 percent
pub(super) fn contrast(raster: &mut Raster, args: &str) {
    let v: f32 = match args.trim().parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let v = v.clamp(-100.0, 100.0);
    for frame in raster.frames_mut() {
        colorops::contrast_in_place(frame, v);
    }
}

/// `saturation(v)`: v in -100..100, -100 desaturates fully
pub(super) fn saturation(raster: &mut Raster, args: &str) {
    let v: f32 = match args.trim().parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    let factor = 1.0 + v.clamp(-100.0, 100.0) / 100.0;
    for frame in raster.frames_mut() {
        for pixel in frame.pixels_mut() {
            let luma = pixel[0] as f32 * 0.299 + pixel[1] as f32 * 0.587 + pixel[2] as f32 * 0.114;
            for c in 0..3 {
                let adjusted = luma + (pixel[c] as f32 - luma) * factor;
                pixel[c] = adjusted.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// `hue(degrees)`
pub(super) fn hue(raster: &mut Raster, args: &str) {
    if let Ok(degrees) = args.trim().parse::<i32>() {
        for frame in raster.frames_mut() {
            colorops::huerotate_in_place(frame, degrees);
        }
    }
}

/// `rgb(r,g,b)`: per-channel shifts in -100..100 percent
pub(super) fn rgb(raster: &mut Raster, args: &str) {
    let shifts: Vec<i32> = args
        .split(',')
        .map(|s| s.trim().parse().unwrap_or(0))
        .collect();
    if shifts.len() < 3 {
        return;
    }
    let deltas: Vec<i32> = shifts
        .iter()
        .take(3)
        .map(|&v| v.clamp(-100, 100) * 255 / 100)
        .collect();
    for frame in raster.frames_mut() {
        for pixel in frame.pixels_mut() {
            for c in 0..3 {
                pixel[c] = (pixel[c] as i32 + deltas[c]).clamp(0, 255) as u8;
            }
        }
    }
}

/// `blur(sigma)`
pub(super) fn blur(raster: &mut Raster, args: &str) {
    let sigma: f32 = args
        .split(',')
        .next()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0);
    if sigma > 0.0 {
        raster.map_pages(|f| imageops::blur(f, sigma));
    }
}

/// `sharpen(sigma)`
pub(super) fn sharpen(raster: &mut Raster, args: &str) {
    let sigma: f32 = args
        .split(',')
        .next()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0);
    if sigma > 0.0 {
        raster.map_pages(|f| imageops::unsharpen(f, sigma, 1));
    }
}

/// `round_corner(radius[,r,g,b])`: transparent corners unless a color is
/// given
pub(super) fn round_corner(raster: &mut Raster, args: &str) {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    let radius: u32 = match parts.first().and_then(|s| s.split('|').next()) {
        Some(first) => first.trim().parse().unwrap_or(0),
        None => 0,
    };
    if radius == 0 {
        return;
    }
    let color = if parts.len() >= 4 {
        let ch = |i: usize| parts[i].parse::<u8>().unwrap_or(0);
        Some(Rgba([ch(1), ch(2), ch(3), 255]))
    } else {
        None
    };
    let (w, h) = (raster.width(), raster.page_height());
    let radius = radius.min(w / 2).min(h / 2);
    if radius == 0 {
        return;
    }
    let r2 = (radius * radius) as i64;
    for frame in raster.frames_mut() {
        for y in 0..h {
            for x in 0..w {
                let dx = corner_distance(x, radius, w);
                let dy = corner_distance(y, radius, h);
                if let (Some(dx), Some(dy)) = (dx, dy) {
                    if dx * dx + dy * dy > r2 {
                        *frame.get_pixel_mut(x, y) = color.unwrap_or(Rgba([0, 0, 0, 0]));
                    }
                }
            }
        }
    }
}

/// Distance past the corner-circle center along one axis, `None` when the
/// coordinate is in the straight-edge span
fn corner_distance(v: u32, radius: u32, extent: u32) -> Option<i64> {
    if v < radius {
        Some((radius - v) as i64)
    } else if v >= extent - radius {
        Some((v - (extent - radius - 1)) as i64)
    } else {
        None
    }
}

/// `background_color(color)`: flatten transparency onto a solid color
pub(super) fn background_color(raster: &mut Raster, args: &str) {
    let color = match parse_color(raster, args.trim()) {
        Some(c) => c,
        None => return,
    };
    for frame in raster.frames_mut() {
        for pixel in frame.pixels_mut() {
            let alpha = pixel[3] as u32;
            if alpha == 255 {
                continue;
            }
            for c in 0..3 {
                pixel[c] = ((pixel[c] as u32 * alpha + color[c] as u32 * (255 - alpha)) / 255) as u8;
            }
            pixel[3] = 255;
        }
    }
}

/// `fill(color)`: flatten onto the color, and with `fit-in` pad the result
/// out to the requested box
pub(super) fn fill(
    raster: &mut Raster,
    args: &str,
    fit_in: bool,
    width: u32,
    height: u32,
    h_align: &str,
    v_align: &str,
) {
    let spec = args.trim();
    let transparent = matches!(spec, "none" | "transparent");
    let color = if transparent {
        Rgba([0, 0, 0, 0])
    } else {
        match parse_color(raster, spec) {
            Some(c) => c,
            None => return,
        }
    };
    if !transparent {
        background_color(raster, spec);
    }
    if fit_in && width > 0 && height > 0 {
        raster.pad_to(width, height, color, h_align, v_align);
    }
}

/// `trim(tolerance)` filter; also backs the `trim` URL flag
pub(super) fn trim(raster: &mut Raster, args: &str) {
    let mut tolerance = 0u32;
    let mut by = "top-left";
    for part in args.split(',').map(str::trim) {
        if part == "bottom-right" || part == "top-left" {
            by = if part == "bottom-right" {
                "bottom-right"
            } else {
                "top-left"
            };
        } else if let Ok(t) = part.parse::<u32>() {
            tolerance = t;
        }
    }
    trim_raster(raster, by, tolerance);
}

/// Remove a uniform border, judged against the top-left or bottom-right
/// reference pixel of the first page
pub(super) fn trim_raster(raster: &mut Raster, by: &str, tolerance: u32) {
    let (w, h) = (raster.width(), raster.page_height());
    if w < 2 || h < 2 {
        return;
    }
    let frame = &raster.frames()[0];
    let reference = if by == "bottom-right" {
        *frame.get_pixel(w - 1, h - 1)
    } else {
        *frame.get_pixel(0, 0)
    };
    let tol2 = (tolerance as i64) * (tolerance as i64);
    let differs = |p: &Rgba<u8>| {
        let dr = p[0] as i64 - reference[0] as i64;
        let dg = p[1] as i64 - reference[1] as i64;
        let db = p[2] as i64 - reference[2] as i64;
        dr * dr + dg * dg + db * db > tol2
    };
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
    for (x, y, pixel) in frame.enumerate_pixels() {
        if differs(pixel) {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x || min_y > max_y {
        // nothing but border
        return;
    }
    if min_x == 0 && min_y == 0 && max_x == w - 1 && max_y == h - 1 {
        return;
    }
    let _ = raster.extract(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1);
}

/// `watermark(image,x,y,alpha[,w_ratio,h_ratio])`. The watermark image is
/// fetched through the gateway chain, so it caches and coalesces like any
/// other source.
pub(super) async fn watermark(raster: &mut Raster, args: &str, fetch: &dyn Fetch) -> Result<()> {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    if parts.is_empty() || parts[0].is_empty() {
        return Ok(());
    }
    let blob = fetch.fetch(parts[0]).await?;
    if blob.is_empty() {
        return Err(Error::NotFound);
    }
    let mut mark = Raster::decode(&blob, 1)?;

    // optional percentage scaling relative to the base image
    let ratio = |i: usize| -> Option<f64> {
        parts
            .get(i)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|r| *r > 0.0)
    };
    if let (Some(wr), Some(hr)) = (ratio(4), ratio(5)) {
        let w = ((raster.width() as f64 * wr / 100.0).round() as u32).max(1);
        let h = ((raster.page_height() as f64 * hr / 100.0).round() as u32).max(1);
        mark.resize_exact(w, h);
    }

    let alpha: u32 = parts
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
        .min(100);
    if alpha > 0 {
        let keep = 100 - alpha;
        for frame in mark.frames_mut() {
            for pixel in frame.pixels_mut() {
                pixel[3] = ((pixel[3] as u32 * keep) / 100) as u8;
            }
        }
    }

    let (bw, bh) = (raster.width(), raster.page_height());
    let (mw, mh) = (mark.width(), mark.page_height());
    let xs = positions(parts.get(1).copied().unwrap_or("0"), bw, mw);
    let ys = positions(parts.get(2).copied().unwrap_or("0"), bh, mh);
    let overlay_frame = mark.frames()[0].clone();
    for frame in raster.frames_mut() {
        for &y in &ys {
            for &x in &xs {
                imageops::overlay(frame, &overlay_frame, x, y);
            }
        }
    }
    Ok(())
}

/// Watermark offsets along one axis: a pixel offset (negative measures
/// from the far edge), `center`, or `repeat`
fn positions(spec: &str, base: u32, mark: u32) -> Vec<i64> {
    match spec {
        "center" => vec![(base as i64 - mark as i64) / 2],
        "repeat" => {
            let mut out = Vec::new();
            let step = mark.max(1) as i64;
            let mut at = 0i64;
            while at < base as i64 {
                out.push(at);
                at += step;
            }
            out
        }
        other => {
            let offset: i64 = other.parse().unwrap_or(0);
            if offset < 0 {
                vec![base as i64 - mark as i64 + offset]
            } else {
                vec![offset]
            }
        }
    }
}

/// Resolve a color argument: hex (3 or 6 digits), a named color, or
/// `auto` (average of the corner pixels)
pub(super) fn parse_color(raster: &Raster, spec: &str) -> Option<Rgba<u8>> {
    let spec = spec.trim().trim_start_matches('#').to_ascii_lowercase();
    match spec.as_str() {
        "auto" => Some(corner_average(&raster.frames()[0])),
        "none" | "transparent" => Some(Rgba([0, 0, 0, 0])),
        "white" => Some(Rgba([255, 255, 255, 255])),
        "black" => Some(Rgba([0, 0, 0, 255])),
        "red" => Some(Rgba([255, 0, 0, 255])),
        "green" => Some(Rgba([0, 128, 0, 255])),
        "blue" => Some(Rgba([0, 0, 255, 255])),
        "yellow" => Some(Rgba([255, 255, 0, 255])),
        "cyan" => Some(Rgba([0, 255, 255, 255])),
        "magenta" => Some(Rgba([255, 0, 255, 255])),
        "gray" | "grey" => Some(Rgba([128, 128, 128, 255])),
        "silver" => Some(Rgba([192, 192, 192, 255])),
        "orange" => Some(Rgba([255, 165, 0, 255])),
        hex if hex.len() == 6 => {
            let v = u32::from_str_radix(hex, 16).ok()?;
            Some(Rgba([(v >> 16) as u8, (v >> 8) as u8, v as u8, 255]))
        }
        hex if hex.len() == 3 => {
            let v = u32::from_str_radix(hex, 16).ok()?;
            let (r, g, b) = ((v >> 8) & 0xf, (v >> 4) & 0xf, v & 0xf);
            Some(Rgba([(r * 17) as u8, (g * 17) as u8, (b * 17) as u8, 255]))
        }
        _ => None,
    }
}

fn corner_average(frame: &RgbaImage) -> Rgba<u8> {
    let (w, h) = (frame.width(), frame.height());
    let corners = [
        frame.get_pixel(0, 0),
        frame.get_pixel(w - 1, 0),
        frame.get_pixel(0, h - 1),
        frame.get_pixel(w - 1, h - 1),
    ];
    let mut sum = [0u32; 3];
    for p in corners {
        for c in 0..3 {
            sum[c] += p[c] as u32;
        }
    }
    Rgba([(sum[0] / 4) as u8, (sum[1] / 4) as u8, (sum[2] / 4) as u8, 255])
}
