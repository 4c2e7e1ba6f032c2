//! Split captcha: every approver renders its own secret, the question shows
//! one slice of each, and every approver only checks its own slice.

use super::font::{self, GLYPH_HEIGHT, GLYPH_WIDTH};
use super::ApprovalError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{imageops, DynamicImage, ImageFormat, ImageOutputFormat, Rgba, RgbaImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::ops::Range;

pub const MIN_WIDTH: u32 = 100;
pub const MAX_WIDTH: u32 = 800;
const DATA_URI_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaOptions {
    pub length: usize,
    pub width: u32,
    /// `transparent` or `#rrggbb`.
    pub background: String,
    /// `random` or `#rrggbb`.
    pub color: String,
}

impl Default for CaptchaOptions {
    fn default() -> Self {
        Self {
            length: 6,
            width: 240,
            background: "transparent".to_string(),
            color: "random".to_string(),
        }
    }
}

/// Rendering preferences a client may send with its approval info.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptchaClientInfo {
    pub width: Option<u32>,
    pub background: Option<String>,
    pub color: Option<String>,
}

impl CaptchaClientInfo {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ApprovalError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let info: Self = serde_json::from_value(value.clone())
            .map_err(|err| ApprovalError::InvalidInfo(err.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    pub fn validate(&self) -> Result<(), ApprovalError> {
        if let Some(width) = self.width {
            check_width(width)?;
        }
        if let Some(background) = &self.background {
            parse_background(background)?;
        }
        if let Some(color) = &self.color {
            parse_color(color)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fill {
    Transparent,
    Random,
    Solid([u8; 3]),
}

fn check_width(width: u32) -> Result<(), ApprovalError> {
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
        return Err(ApprovalError::InvalidInfo(format!(
            "captcha width must be within {MIN_WIDTH}..={MAX_WIDTH}, got {width}"
        )));
    }
    Ok(())
}

fn parse_hex(value: &str) -> Option<[u8; 3]> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

fn parse_background(value: &str) -> Result<Fill, ApprovalError> {
    if value == "transparent" {
        return Ok(Fill::Transparent);
    }
    parse_hex(value)
        .map(Fill::Solid)
        .ok_or_else(|| ApprovalError::InvalidInfo(format!("invalid captcha background `{value}`")))
}

fn parse_color(value: &str) -> Result<Fill, ApprovalError> {
    if value == "random" {
        return Ok(Fill::Random);
    }
    parse_hex(value)
        .map(Fill::Solid)
        .ok_or_else(|| ApprovalError::InvalidInfo(format!("invalid captcha color `{value}`")))
}

/// Character ranges of the answer assigned to each of `approvers` approvers.
///
/// Approver `i` gets `floor(remaining / (approvers - i))` characters.
pub fn split_slices(length: usize, approvers: usize) -> Vec<Range<usize>> {
    let mut offset = 0;
    (0..approvers)
        .map(|i| {
            let count = (length - offset) / (approvers - i);
            let range = offset..offset + count;
            offset += count;
            range
        })
        .collect()
}

impl CaptchaOptions {
    pub fn validate(&self) -> Result<(), ApprovalError> {
        if self.length == 0 {
            return Err(ApprovalError::InvalidInfo(
                "captcha length must be positive".to_string(),
            ));
        }
        check_width(self.width)?;
        if self.width / (self.length as u32) < GLYPH_WIDTH {
            return Err(ApprovalError::InvalidInfo(format!(
                "captcha width {} is too small for {} characters",
                self.width, self.length
            )));
        }
        parse_background(&self.background)?;
        parse_color(&self.color)?;
        Ok(())
    }

    pub fn create_text(&self) -> String {
        let alphabet: Vec<char> = font::ALPHABET.chars().collect();
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect()
    }

    /// Render `text` with one equally wide cell per character.
    pub fn render(&self, text: &str, client: &CaptchaClientInfo) -> Result<RgbaImage, ApprovalError> {
        let width = client.width.unwrap_or(self.width);
        check_width(width)?;
        let background = parse_background(client.background.as_deref().unwrap_or(&self.background))?;
        let color = parse_color(client.color.as_deref().unwrap_or(&self.color))?;

        let chars: Vec<char> = text.chars().collect();
        let cells = chars.len().max(1) as u32;
        let cell_width = width / cells;
        let height = (width * 2 / 5).max(GLYPH_HEIGHT * 4);
        let scale = ((cell_width * 3 / 4) / GLYPH_WIDTH)
            .min((height * 3 / 5) / GLYPH_HEIGHT)
            .max(1);

        let mut rng = rand::thread_rng();
        let base = match background {
            Fill::Solid([r, g, b]) => Rgba([r, g, b, 255]),
            _ => Rgba([0, 0, 0, 0]),
        };
        let mut img = RgbaImage::from_pixel(width, height, base);

        let pick = |rng: &mut rand::rngs::ThreadRng| match color {
            Fill::Solid([r, g, b]) => Rgba([r, g, b, 255]),
            _ => Rgba([rng.gen_range(0..160), rng.gen_range(0..160), rng.gen_range(0..160), 255]),
        };

        for (i, ch) in chars.iter().enumerate() {
            let Some(rows) = font::glyph(*ch) else {
                return Err(ApprovalError::InvalidInfo(format!("no glyph for `{ch}`")));
            };
            let ink = pick(&mut rng);
            let glyph_width = GLYPH_WIDTH * scale;
            let glyph_height = GLYPH_HEIGHT * scale;
            let slack_x = cell_width.saturating_sub(glyph_width);
            let slack_y = height.saturating_sub(glyph_height);
            let left = i as u32 * cell_width + rng.gen_range(0..=slack_x);
            let top = rng.gen_range(0..=slack_y);
            for gy in 0..GLYPH_HEIGHT {
                for gx in 0..GLYPH_WIDTH {
                    if !font::is_set(&rows, gx, gy) {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let (x, y) = (left + gx * scale + dx, top + gy * scale + dy);
                            if x < width && y < height {
                                img.put_pixel(x, y, ink);
                            }
                        }
                    }
                }
            }
        }

        let noise = (width * height) / 60;
        for _ in 0..noise {
            let x = rng.gen_range(0..width);
            let y = rng.gen_range(0..height);
            let mut dot = pick(&mut rng);
            dot.0[3] = 160;
            img.put_pixel(x, y, dot);
        }
        Ok(img)
    }

    /// A fresh secret and its rendering as base64 PNG.
    pub fn create_info(&self, client_info: &serde_json::Value) -> Result<(String, String), ApprovalError> {
        let client = CaptchaClientInfo::from_value(client_info)?;
        let text = self.create_text();
        let img = self.render(&text, &client)?;
        Ok((encode_png(img)?, text))
    }

    /// Stitch slice `i` of every approver image, in approver order.
    pub fn create_question(&self, infos: &[String]) -> Result<String, ApprovalError> {
        if infos.is_empty() {
            return Err(ApprovalError::InvalidInfo("no approver infos".to_string()));
        }
        let slices = split_slices(self.length, infos.len());
        let mut parts = Vec::with_capacity(infos.len());
        for (info, slice) in infos.iter().zip(&slices) {
            let img = decode_png(info)?.to_rgba8();
            let cell_width = img.width() / self.length as u32;
            let part_width = (cell_width * slice.len() as u32).min(img.width());
            parts.push(imageops::crop_imm(&img, 0, 0, part_width, img.height()).to_image());
        }

        let width: u32 = parts.iter().map(|p| p.width()).sum::<u32>().max(1);
        let height = parts.iter().map(|p| p.height()).max().unwrap_or(1).max(1);
        let mut canvas = RgbaImage::new(width, height);
        let mut x = 0i64;
        for part in &parts {
            imageops::replace(&mut canvas, part, x, 0);
            x += i64::from(part.width());
        }
        Ok(format!("{DATA_URI_PREFIX}{}", encode_png(canvas)?))
    }

    /// Check the part of `answer` assigned to `own_address` against the first
    /// characters of the stored secret. Case-insensitive.
    pub fn check_answer(&self, answer: &str, stored: &str, approvers: &[String], own_address: &str) -> bool {
        let Some(index) = approvers.iter().position(|a| a == own_address) else {
            return false;
        };
        let answer: Vec<char> = answer.chars().collect();
        let stored: Vec<char> = stored.chars().collect();
        let slice = split_slices(self.length, approvers.len())[index].clone();
        if answer.len() != self.length || stored.len() < slice.len() {
            return false;
        }
        answer[slice.clone()]
            .iter()
            .zip(&stored[..slice.len()])
            .all(|(a, s)| a.eq_ignore_ascii_case(s))
    }

    pub fn validate_client_answer(&self, answer: &str) -> Result<(), ApprovalError> {
        if answer.chars().count() != self.length {
            return Err(ApprovalError::InvalidAnswer(format!(
                "expected {} characters",
                self.length
            )));
        }
        Ok(())
    }
}

/// Whether `info` is a base64 PNG.
pub fn validate_approver_info(info: &str) -> Result<(), ApprovalError> {
    let bytes = STANDARD.decode(info)?;
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Png) => Ok(()),
        _ => Err(ApprovalError::InvalidInfo("approver info is not a png".to_string())),
    }
}

fn encode_png(img: RgbaImage) -> Result<String, ApprovalError> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
    Ok(STANDARD.encode(bytes))
}

fn decode_png(info: &str) -> Result<DynamicImage, ApprovalError> {
    let bytes = STANDARD.decode(info)?;
    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn approvers(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn slices_follow_remaining_length() {
        assert_eq!(split_slices(6, 3), vec![0..2, 2..4, 4..6]);
        assert_eq!(split_slices(7, 3), vec![0..2, 2..4, 4..7]);
        assert_eq!(split_slices(6, 4), vec![0..1, 1..2, 2..4, 4..6]);
        assert_eq!(split_slices(2, 3), vec![0..0, 0..1, 1..2]);
    }

    #[test]
    fn checks_only_own_slice() {
        let captcha = CaptchaOptions::default();
        let list = approvers(&["localhost:1", "localhost:3", "localhost:2"]);
        assert!(captcha.check_answer("123456", "34", &list, "localhost:3"));
        assert!(captcha.check_answer("12ab56", "AB", &list, "localhost:3"));

        let last = approvers(&["localhost:1", "localhost:2", "localhost:3"]);
        assert!(!captcha.check_answer("123456", "34", &last, "localhost:3"));
        assert!(!captcha.check_answer("123456", "34", &list, "localhost:9"));
        assert!(!captcha.check_answer("1234", "34", &list, "localhost:3"));
    }

    #[test]
    fn renders_requested_width() {
        let captcha = CaptchaOptions::default();
        let client = CaptchaClientInfo {
            width: Some(200),
            background: Some("transparent".into()),
            color: Some("#000000".into()),
        };
        let text = captcha.create_text();
        assert_eq!(text.chars().count(), 6);
        assert!(text.chars().all(|c| font::ALPHABET.contains(c)));
        let img = captcha.render(&text, &client).unwrap();
        assert_eq!(img.width(), 200);
        assert!(img.pixels().any(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn info_is_png_and_question_is_data_uri() {
        let captcha = CaptchaOptions::default();
        let mut infos = Vec::new();
        for _ in 0..3 {
            let (info, answer) = captcha.create_info(&json!({})).unwrap();
            validate_approver_info(&info).unwrap();
            assert_eq!(answer.len(), captcha.length);
            infos.push(info);
        }
        let question = captcha.create_question(&infos).unwrap();
        let encoded = question.strip_prefix(DATA_URI_PREFIX).unwrap();
        let img = decode_png(encoded).unwrap();
        assert_eq!(img.width(), captcha.width);
        assert!(validate_approver_info("wrong").is_err());
    }

    #[test]
    fn client_info_rules() {
        for bad in [
            json!({ "length": 1 }),
            json!({ "width": 90 }),
            json!({ "width": 1000 }),
            json!({ "background": "wrong" }),
            json!({ "color": "wrong" }),
        ] {
            assert!(CaptchaClientInfo::from_value(&bad).is_err(), "{bad}");
        }
        for good in [
            json!(null),
            json!({ "width": 200 }),
            json!({ "background": "transparent" }),
            json!({ "background": "#000000" }),
            json!({ "color": "random" }),
            json!({ "color": "#000000" }),
        ] {
            assert!(CaptchaClientInfo::from_value(&good).is_ok(), "{good}");
        }
    }

    #[test]
    fn options_reject_cramped_layouts() {
        assert!(CaptchaOptions::default().validate().is_ok());
        let cramped = CaptchaOptions {
            length: 40,
            width: 100,
            ..CaptchaOptions::default()
        };
        assert!(cramped.validate().is_err());
    }

    proptest! {
        #[test]
        fn slices_partition_the_answer(length in 1usize..32, count in 1usize..10) {
            let slices = split_slices(length, count);
            prop_assert_eq!(slices.len(), count);
            let mut next = 0;
            for slice in &slices {
                prop_assert_eq!(slice.start, next);
                next = slice.end;
            }
            prop_assert_eq!(next, length);
        }

        #[test]
        fn concatenated_slices_pass_every_approver(count in 1usize..6) {
            let captcha = CaptchaOptions::default();
            let list: Vec<String> = (0..count).map(|i| format!("localhost:{}", i + 1)).collect();
            let secrets: Vec<String> = (0..count).map(|_| captcha.create_text()).collect();
            let slices = split_slices(captcha.length, count);
            let answer: String = secrets
                .iter()
                .zip(&slices)
                .map(|(secret, slice)| &secret[..slice.len()])
                .collect();
            for (address, secret) in list.iter().zip(&secrets) {
                prop_assert!(captcha.check_answer(&answer, secret, &list, address));
            }
        }
    }

    #[test]
    fn omitted_or_reordered_slices_fail() {
        let captcha = CaptchaOptions::default();
        let list = approvers(&["localhost:1", "localhost:2", "localhost:3"]);
        let secrets = ["AAAAAA", "BBBBBB", "CCCCCC"];
        assert!(captcha.check_answer("AABBCC", secrets[1], &list, "localhost:2"));
        assert!(!captcha.check_answer("BBAACC", secrets[0], &list, "localhost:1"));
        assert!(!captcha.check_answer("BBAACC", secrets[1], &list, "localhost:2"));
        assert!(!captcha.check_answer("AACC", secrets[2], &list, "localhost:3"));
    }
}
