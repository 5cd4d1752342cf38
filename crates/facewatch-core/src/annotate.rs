//! Frame annotation: bounding boxes and caption bars drawn in place.
//!
//! Captions use a built-in 5x7 bitmap font (upper-case letters, digits and a
//! little punctuation). Lower-case input is drawn upper-case; anything else
//! is drawn as `?`.

use crate::types::{FaceRegion, Resolution, ResolvedLabel};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: u32 = 2;
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_W + 1;
const BAR_PADDING: u32 = 2;

/// Box/caption colour for a label.
pub fn label_color(label: &ResolvedLabel) -> Rgb<u8> {
    match label {
        ResolvedLabel::Known(_) => KNOWN_COLOR,
        ResolvedLabel::Unknown => UNKNOWN_COLOR,
    }
}

/// Draw the region outline and its caption (`name (0.40)`) onto `image`.
///
/// Regions entirely outside the image draw nothing.
pub fn annotate_face(image: &mut RgbImage, region: &FaceRegion, resolution: &Resolution) {
    let Some((x, y, w, h)) = region.crop_rect(image.width(), image.height()) else {
        return;
    };
    let color = label_color(&resolution.label);

    draw_box(image, x, y, w, h, color, BOX_THICKNESS);

    let caption = resolution.caption();
    let bar_w = caption.chars().count() as u32 * GLYPH_ADVANCE * TEXT_SCALE + 2 * BAR_PADDING;
    let bar_h = GLYPH_H * TEXT_SCALE + 2 * BAR_PADDING;
    // Above the box when there is room, otherwise just inside its top edge.
    let bar_y = if y >= bar_h { y - bar_h } else { y };

    fill(image, x, bar_y, bar_w, bar_h, color);
    draw_text(image, x + BAR_PADDING, bar_y + BAR_PADDING, &caption, TEXT_COLOR, TEXT_SCALE);
}

/// Box outline `thickness` pixels wide, growing inwards. Clipped to the image.
fn draw_box(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>, thickness: u32) {
    for inset in 0..thickness {
        if w <= 2 * inset || h <= 2 * inset {
            break;
        }
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(image, rect, color);
    }
}

fn fill(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    if w == 0 || h == 0 || x >= image.width() || y >= image.height() {
        return;
    }
    let w = w.min(image.width() - x);
    let h = h.min(image.height() - y);
    draw_filled_rect_mut(image, Rect::at(x as i32, y as i32).of_size(w, h), color);
}

/// Draw `text` with its top-left corner at `(x, y)`, clipped to the image.
pub fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str, color: Rgb<u8>, scale: u32) {
    let mut pen_x = x;
    for ch in text.chars() {
        let rows = glyph(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                fill(
                    image,
                    pen_x.saturating_add(col * scale),
                    y.saturating_add(row as u32 * scale),
                    scale,
                    scale,
                    color,
                );
            }
        }
        pen_x = pen_x.saturating_add(GLYPH_ADVANCE * scale);
    }
}

/// Rows of a 5x7 glyph, most significant of the low five bits is the left column.
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ' ' => [0x00; 7],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}
