//! Frame annotation for the live stream: detection boxes and labels
//! burned directly into the grayscale pixels.
//!
//! Text uses a built-in 5×7 glyph set covering what the stream actually
//! renders — digits, `%`, and the label alphabet. Characters outside the
//! set draw as a hollow box.

use crate::frame::Frame;

const GLYPH_W: usize = 5;
const GLYPH_H: usize = 7;
/// Horizontal advance between glyph origins, in glyph cells.
const GLYPH_ADVANCE: usize = 6;

/// Draw a hollow rectangle. Coordinates may extend past the frame; the
/// visible portion is drawn and the rest clipped.
pub fn draw_box(frame: &mut Frame, x: i32, y: i32, w: u32, h: u32, intensity: u8, thickness: u32) {
    let t = thickness as i32;
    let (w, h) = (w as i32, h as i32);

    // top / bottom bands
    fill_rect(frame, x, y, w, t, intensity);
    fill_rect(frame, x, y + h - t, w, t, intensity);
    // left / right bands
    fill_rect(frame, x, y, t, h, intensity);
    fill_rect(frame, x + w - t, y, t, h, intensity);
}

/// Draw `text` with its top-left corner at (x, y). `scale` multiplies
/// the 5×7 cell size.
pub fn draw_text(frame: &mut Frame, text: &str, x: i32, y: i32, intensity: u8, scale: u32) {
    let scale = scale.max(1) as i32;
    let mut pen_x = x;

    for ch in text.chars() {
        let glyph = glyph(ch);
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits >> (GLYPH_W - 1 - col) & 1 == 1 {
                    fill_rect(
                        frame,
                        pen_x + col as i32 * scale,
                        y + row as i32 * scale,
                        scale,
                        scale,
                        intensity,
                    );
                }
            }
        }
        pen_x += GLYPH_ADVANCE as i32 * scale;
    }
}

/// Fill a rectangle, clipping to the frame bounds.
fn fill_rect(frame: &mut Frame, x: i32, y: i32, w: i32, h: i32, intensity: u8) {
    if w <= 0 || h <= 0 {
        return;
    }
    let fw = frame.width as i32;
    let fh = frame.height as i32;

    let x0 = x.clamp(0, fw);
    let y0 = y.clamp(0, fh);
    let x1 = (x + w).clamp(0, fw);
    let y1 = (y + h).clamp(0, fh);

    for yy in y0..y1 {
        let row = (yy * fw) as usize;
        for xx in x0..x1 {
            frame.data[row + xx as usize] = intensity;
        }
    }
}

/// 5×7 bitmap for a character; each row is 5 bits, MSB leftmost.
fn glyph(ch: char) -> [u8; GLYPH_H] {
    match ch {
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
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ' ' => [0x00; GLYPH_H],
        'i' => [0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x0E],
        'd' => [0x01, 0x01, 0x0D, 0x13, 0x11, 0x13, 0x0D],
        'u' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x13, 0x0D],
        'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
        'k' => [0x10, 0x10, 0x12, 0x14, 0x18, 0x14, 0x12],
        'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
        'w' => [0x00, 0x00, 0x11, 0x11, 0x15, 0x15, 0x0A],
        // fallback: hollow box
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}
