//! Cursor overlay for capture backends whose grab API leaves the pointer out.

/// Cursor bitmap in `0xAARRGGBB` pixels, premultiplied alpha.
#[derive(Debug, Clone, Default)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    pub pixels: Vec<u32>,
}

/// Alpha-blend `cursor` into a BGRA buffer with its hotspot at (`x`, `y`).
///
/// Pixels falling outside the frame are clipped.
pub fn draw_cursor(
    frame: &mut [u8],
    stride: usize,
    width: u32,
    height: u32,
    cursor: &CursorImage,
    x: i32,
    y: i32,
) {
    let origin_x = x - cursor.hotspot_x;
    let origin_y = y - cursor.hotspot_y;

    for cy in 0..cursor.height as i32 {
        let fy = origin_y + cy;
        if fy < 0 || fy >= height as i32 {
            continue;
        }
        for cx in 0..cursor.width as i32 {
            let fx = origin_x + cx;
            if fx < 0 || fx >= width as i32 {
                continue;
            }
            let Some(&argb) = cursor.pixels.get((cy as u32 * cursor.width + cx as u32) as usize)
            else {
                return;
            };
            let alpha = argb >> 24;
            if alpha == 0 {
                continue;
            }

            let offset = fy as usize * stride + fx as usize * 4;
            let Some(px) = frame.get_mut(offset..offset + 4) else {
                continue;
            };
            let inv = 255 - alpha;
            // channel order in the frame is B, G, R, A
            for (i, shift) in [0u32, 8, 16].into_iter().enumerate() {
                let src = (argb >> shift) & 0xFF;
                let dst = px[i] as u32;
                px[i] = (src + (dst * inv + 127) / 255).min(255) as u8;
            }
            px[3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_cursor_replaces_pixels() {
        let mut frame = vec![0u8; 4 * 4 * 4];
        let cursor = CursorImage {
            width: 1,
            height: 1,
            hotspot_x: 0,
            hotspot_y: 0,
            pixels: vec![0xFF_11_22_33],
        };

        draw_cursor(&mut frame, 16, 4, 4, &cursor, 2, 1);

        let offset = 16 + 2 * 4;
        assert_eq!(&frame[offset..offset + 4], &[0x33, 0x22, 0x11, 0xFF]);
    }

    #[test]
    fn test_cursor_clipped_at_edges() {
        let mut frame = vec![7u8; 2 * 2 * 4];
        let cursor = CursorImage {
            width: 2,
            height: 2,
            hotspot_x: 1,
            hotspot_y: 1,
            pixels: vec![0xFF_FF_FF_FF; 4],
        };

        // Hotspot at the origin leaves only the bottom-right cursor pixel visible
        draw_cursor(&mut frame, 8, 2, 2, &cursor, 0, 0);

        assert_eq!(&frame[0..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&frame[4..8], &[7, 7, 7, 7]);
        assert_eq!(&frame[8..16], &[7u8; 8]);
    }

    #[test]
    fn test_transparent_pixels_leave_frame_untouched() {
        let mut frame = vec![9u8; 4];
        let cursor = CursorImage {
            width: 1,
            height: 1,
            hotspot_x: 0,
            hotspot_y: 0,
            pixels: vec![0x00_FF_FF_FF],
        };
        draw_cursor(&mut frame, 4, 1, 1, &cursor, 0, 0);
        assert_eq!(frame, vec![9u8; 4]);
    }
}
