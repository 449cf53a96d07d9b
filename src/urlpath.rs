//! Thumbor-convention URL parsing and signing
//!
//! The URL surface is a fixed external contract:
//!
//! ```text
//! /HASH|unsafe/meta/trim/AxB:CxD/fit-in/stretch/-WxH/halign/valign/smart/filters:.../IMAGE
//! ```
//!
//! with an optional `params/` prefix that switches the gateway into
//! params-echo mode. The signature is HMAC-SHA1 over the tail after the
//! hash segment, base64 url-safe encoded.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;

/// One `name(args)` pair from the filters segment, in URL order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
}

/// Parsed URL parameters, the input to the gateway core.
/// Serialization matches the params-echo JSON surface: absent fields vanish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(skip)]
    pub params: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "unsafe")]
    pub unsafe_: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub meta: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub trim: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trim_by: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub trim_tolerance: u32,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub crop_left: i32,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub crop_top: i32,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub crop_right: i32,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub crop_bottom: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fit_in: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stretch: bool,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub width: i32,
    #[serde(default, skip_serializing_if = "is_zero_i")]
    pub height: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub h_flip: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub v_flip: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub h_align: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v_align: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub smart: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i(v: &i32) -> bool {
    *v == 0
}

pub const H_ALIGN_LEFT: &str = "left";
pub const H_ALIGN_RIGHT: &str = "right";
pub const V_ALIGN_TOP: &str = "top";
pub const V_ALIGN_BOTTOM: &str = "bottom";

static OUTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/?(?P<params>params/)?((?P<unsafe>unsafe/)|(?P<hash>[A-Za-z0-9_=-]{8,})/)?(?P<rest>.*)$",
    )
    .expect("outer url grammar")
});

static TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        (?P<meta>meta/)?
        (?P<trim>trim(:(?P<trim_by>top-left|bottom-right))?(:(?P<tolerance>\d+))?/)?
        ((?P<cl>\d+)x(?P<ct>\d+):(?P<cr>\d+)x(?P<cb>\d+)/)?
        (?P<fit_in>fit-in/)?
        (?P<stretch>stretch/)?
        ((?P<h_neg>-?)(?P<w>\d*)x(?P<v_neg>-?)(?P<h>\d*)/)?
        ((?P<h_align>left|right|center)/)?
        ((?P<v_align>top|bottom|middle)/)?
        (?P<smart>smart/)?
        (filters:(?P<filters>.+?\))/)?
        (?P<image>.*)$",
    )
    .expect("tail url grammar")
});

/// Parse an escaped request path into `Params`.
/// The grammar never fails; unrecognised segments fold into the image key.
pub fn parse(path: &str) -> Params {
    let mut p = Params::default();
    let outer = match OUTER.captures(path) {
        Some(c) => c,
        None => return p,
    };
    p.params = outer.name("params").is_some();
    p.unsafe_ = outer.name("unsafe").is_some();
    if let Some(hash) = outer.name("hash") {
        p.hash = hash.as_str().to_string();
    }
    let rest = outer.name("rest").map(|m| m.as_str()).unwrap_or_default();
    p.path = rest.to_string();

    let tail = match TAIL.captures(rest) {
        Some(c) => c,
        None => return p,
    };
    p.meta = tail.name("meta").is_some();
    p.trim = tail.name("trim").is_some();
    if p.trim {
        p.trim_by = tail
            .name("trim_by")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "top-left".to_string());
        p.trim_tolerance = tail
            .name("tolerance")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
    }
    p.crop_left = int(&tail, "cl");
    p.crop_top = int(&tail, "ct");
    p.crop_right = int(&tail, "cr");
    p.crop_bottom = int(&tail, "cb");
    p.fit_in = tail.name("fit_in").is_some();
    p.stretch = tail.name("stretch").is_some();
    p.h_flip = tail.name("h_neg").map(|m| m.as_str() == "-").unwrap_or(false);
    p.v_flip = tail.name("v_neg").map(|m| m.as_str() == "-").unwrap_or(false);
    p.width = int(&tail, "w");
    p.height = int(&tail, "h");
    if let Some(a) = tail.name("h_align") {
        p.h_align = a.as_str().to_string();
    }
    if let Some(a) = tail.name("v_align") {
        p.v_align = a.as_str().to_string();
    }
    p.smart = tail.name("smart").is_some();
    if let Some(filters) = tail.name("filters") {
        p.filters = parse_filters(filters.as_str());
    }
    if let Some(image) = tail.name("image") {
        p.image = percent_decode(image.as_str());
    }
    p
}

fn int(caps: &regex::Captures<'_>, name: &str) -> i32 {
    caps.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Split `name1(a):name2(b,c)` respecting parentheses in args,
/// e.g. watermark URLs containing colons
fn parse_filters(segment: &str) -> Vec<Filter> {
    let mut filters = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = segment.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b':' if depth == 0 => {
                push_filter(&mut filters, &segment[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_filter(&mut filters, &segment[start..]);
    filters
}

fn push_filter(filters: &mut Vec<Filter>, raw: &str) {
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.find('(') {
        Some(open) => {
            let name = raw[..open].to_string();
            let args = raw[open + 1..]
                .strip_suffix(')')
                .unwrap_or(&raw[open + 1..])
                .to_string();
            filters.push(Filter { name, args });
        }
        None => filters.push(Filter {
            name: raw.to_string(),
            args: String::new(),
        }),
    }
}

/// Decode %XX escapes; leaves malformed escapes untouched
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

/// HMAC-SHA1 signature of a URL tail, base64 url-safe encoded.
/// This is the established signing contract; the leading slash never
/// participates.
pub fn sign(path: &str, secret: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(path.trim_start_matches('/').as_bytes());
    URL_SAFE.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unsafe_full() {
        let p = parse(
            "/unsafe/meta/trim:bottom-right:10/10x20:300x400/fit-in/-200x-300/left/top/smart/filters:grayscale():brightness(10)/img.jpg",
        );
        assert!(p.unsafe_);
        assert!(p.meta);
        assert!(p.trim);
        assert_eq!(p.trim_by, "bottom-right");
        assert_eq!(p.trim_tolerance, 10);
        assert_eq!(
            (p.crop_left, p.crop_top, p.crop_right, p.crop_bottom),
            (10, 20, 300, 400)
        );
        assert!(p.fit_in);
        assert!(p.h_flip && p.v_flip);
        assert_eq!((p.width, p.height), (200, 300));
        assert_eq!(p.h_align, "left");
        assert_eq!(p.v_align, "top");
        assert!(p.smart);
        assert_eq!(p.filters.len(), 2);
        assert_eq!(p.filters[0], Filter { name: "grayscale".into(), args: "".into() });
        assert_eq!(p.filters[1], Filter { name: "brightness".into(), args: "10".into() });
        assert_eq!(p.image, "img.jpg");
        assert!(p.path.starts_with("meta/trim"));
    }

    #[test]
    fn test_parse_hashed() {
        let p = parse("/abcdefgh1234=/300x300/foo.jpg");
        assert_eq!(p.hash, "abcdefgh1234=");
        assert!(!p.unsafe_);
        assert_eq!(p.path, "300x300/foo.jpg");
        assert_eq!((p.width, p.height), (300, 300));
        assert_eq!(p.image, "foo.jpg");
    }

    #[test]
    fn test_parse_params_echo_mode() {
        let p = parse("/params/unsafe/100x100/foo.jpg");
        assert!(p.params);
        assert!(p.unsafe_);
        assert_eq!((p.width, p.height), (100, 100));
    }

    #[test]
    fn test_parse_plain_image() {
        let p = parse("/unsafe/foo/bar.png");
        assert_eq!(p.image, "foo/bar.png");
        assert_eq!((p.width, p.height), (0, 0));
        assert!(!p.fit_in && !p.smart);
    }

    #[test]
    fn test_parse_single_dimension() {
        let p = parse("/unsafe/200x0/foo.jpg");
        assert_eq!((p.width, p.height), (200, 0));
        let p = parse("/unsafe/0x150/foo.jpg");
        assert_eq!((p.width, p.height), (0, 150));
    }

    #[test]
    fn test_parse_stretch() {
        let p = parse("/unsafe/stretch/100x200/foo.jpg");
        assert!(p.stretch);
        assert_eq!((p.width, p.height), (100, 200));
    }

    #[test]
    fn test_filters_with_nested_colons() {
        let p = parse(
            "/unsafe/filters:watermark(https://example.com/w.png,10,-10,50):rotate(90)/foo.jpg",
        );
        assert_eq!(p.filters.len(), 2);
        assert_eq!(p.filters[0].name, "watermark");
        assert_eq!(p.filters[0].args, "https://example.com/w.png,10,-10,50");
        assert_eq!(p.filters[1].name, "rotate");
        assert_eq!(p.filters[1].args, "90");
        assert_eq!(p.image, "foo.jpg");
    }

    #[test]
    fn test_trim_defaults() {
        let p = parse("/unsafe/trim/foo.jpg");
        assert!(p.trim);
        assert_eq!(p.trim_by, "top-left");
        assert_eq!(p.trim_tolerance, 0);
    }

    #[test]
    fn test_percent_decoding() {
        let p = parse("/unsafe/some%20dir/img%2Bplus.jpg");
        assert_eq!(p.image, "some dir/img+plus.jpg");
    }

    #[test]
    fn test_sign_is_deterministic_and_keyed() {
        let a = sign("300x300/foo.jpg", "secret");
        let b = sign("300x300/foo.jpg", "secret");
        let c = sign("300x300/foo.jpg", "other");
        let d = sign("301x300/foo.jpg", "secret");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        // sha1 digest is 20 bytes; padded url-safe base64 is 28 chars
        assert_eq!(a.len(), 28);
        assert!(!a.contains('+') && !a.contains('/'));
    }

    #[test]
    fn test_sign_ignores_leading_slash() {
        assert_eq!(sign("/a/b.jpg", "k"), sign("a/b.jpg", "k"));
    }

    #[test]
    fn test_signed_round_trip() {
        let tail = "fit-in/200x200/foo.jpg";
        let url = format!("/{}/{}", sign(tail, "k"), tail);
        let p = parse(&url);
        assert_eq!(p.path, tail);
        assert_eq!(p.hash, sign(&p.path, "k"));
    }

    #[test]
    fn test_echo_serialization_skips_defaults() {
        let p = parse("/unsafe/200x300/foo.jpg");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["width"], 200);
        assert_eq!(v["height"], 300);
        assert_eq!(v["image"], "foo.jpg");
        assert_eq!(v["unsafe"], true);
        assert!(v.get("meta").is_none());
        assert!(v.get("filters").is_none());
        assert!(v.get("crop_left").is_none());
    }
}
