//! Built-in 3x5 bitmap font for the text overlay.

use umbra_core::{Texture, TextureFormat};

/// Glyph width in texels.
pub const GLYPH_WIDTH: u32 = 3;
/// Glyph height in texels.
pub const GLYPH_HEIGHT: u32 = 5;
const CELL_WIDTH: u32 = GLYPH_WIDTH + 1;
const CELL_HEIGHT: u32 = GLYPH_HEIGHT + 1;
const COLUMNS: u32 = 16;

const CHARSET: &str = " 0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ:.-/%()=";

#[rustfmt::skip]
const GLYPHS: [[u8; 5]; 45] = [
    [0b000, 0b000, 0b000, 0b000, 0b000],
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b001, 0b001, 0b001],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
    [0b010, 0b101, 0b111, 0b101, 0b101],
    [0b110, 0b101, 0b110, 0b101, 0b110],
    [0b011, 0b100, 0b100, 0b100, 0b011],
    [0b110, 0b101, 0b101, 0b101, 0b110],
    [0b111, 0b100, 0b110, 0b100, 0b111],
    [0b111, 0b100, 0b110, 0b100, 0b100],
    [0b011, 0b100, 0b101, 0b101, 0b011],
    [0b101, 0b101, 0b111, 0b101, 0b101],
    [0b111, 0b010, 0b010, 0b010, 0b111],
    [0b001, 0b001, 0b001, 0b101, 0b010],
    [0b101, 0b101, 0b110, 0b101, 0b101],
    [0b100, 0b100, 0b100, 0b100, 0b111],
    [0b101, 0b111, 0b111, 0b101, 0b101],
    [0b110, 0b101, 0b101, 0b101, 0b101],
    [0b010, 0b101, 0b101, 0b101, 0b010],
    [0b110, 0b101, 0b110, 0b100, 0b100],
    [0b010, 0b101, 0b101, 0b110, 0b011],
    [0b110, 0b101, 0b110, 0b101, 0b101],
    [0b011, 0b100, 0b010, 0b001, 0b110],
    [0b111, 0b010, 0b010, 0b010, 0b010],
    [0b101, 0b101, 0b101, 0b101, 0b111],
    [0b101, 0b101, 0b101, 0b101, 0b010],
    [0b101, 0b101, 0b111, 0b111, 0b101],
    [0b101, 0b101, 0b010, 0b101, 0b101],
    [0b101, 0b101, 0b010, 0b010, 0b010],
    [0b111, 0b001, 0b010, 0b100, 0b111],
    [0b000, 0b010, 0b000, 0b010, 0b000],
    [0b000, 0b000, 0b000, 0b000, 0b010],
    [0b000, 0b000, 0b111, 0b000, 0b000],
    [0b001, 0b001, 0b010, 0b100, 0b100],
    [0b101, 0b001, 0b010, 0b100, 0b101],
    [0b001, 0b010, 0b010, 0b010, 0b001],
    [0b100, 0b010, 0b010, 0b010, 0b100],
    [0b000, 0b111, 0b000, 0b111, 0b000],
];

const GLYPH_COUNT: u32 = CHARSET.len() as u32;

/// Atlas size in texels.
pub const fn atlas_extent() -> (u32, u32) {
    (COLUMNS * CELL_WIDTH, GLYPH_COUNT.div_ceil(COLUMNS) * CELL_HEIGHT)
}

/// Atlas slot of `ch`; lowercase letters share the uppercase glyphs.
pub fn glyph_index(ch: char) -> Option<u32> {
    let ch = ch.to_ascii_uppercase();
    CHARSET.find(ch).map(|i| i as u32)
}

/// Texture coordinates `[u0, v0, u1, v1]` of glyph `index`.
pub fn glyph_uv(index: u32) -> [f32; 4] {
    let (width, height) = atlas_extent();
    let x = (index % COLUMNS) * CELL_WIDTH;
    let y = (index / COLUMNS) * CELL_HEIGHT;
    [
        x as f32 / width as f32,
        y as f32 / height as f32,
        (x + GLYPH_WIDTH) as f32 / width as f32,
        (y + GLYPH_HEIGHT) as f32 / height as f32,
    ]
}

/// Single-channel glyph atlas.
pub fn atlas_texture() -> umbra_core::Result<Texture> {
    let (width, height) = atlas_extent();
    let mut pixels = vec![0u8; (width * height) as usize];
    for (index, rows) in GLYPHS.iter().take(GLYPH_COUNT as usize).enumerate() {
        let index = index as u32;
        let (cx, cy) = ((index % COLUMNS) * CELL_WIDTH, (index / COLUMNS) * CELL_HEIGHT);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) != 0 {
                    let px = cx + col;
                    let py = cy + row as u32;
                    pixels[(py * width + px) as usize] = 255;
                }
            }
        }
    }
    Texture::new("glyph atlas", width, height, TextureFormat::R8Unorm, pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_matches_glyph_table() {
        assert_eq!(CHARSET.len(), GLYPHS.len());
        assert_eq!(glyph_index(' '), Some(0));
        assert_eq!(glyph_index('a'), glyph_index('A'));
        assert_eq!(glyph_index('#'), None);
    }

    #[test]
    fn atlas_contains_glyph_bits() {
        let atlas = atlas_texture().unwrap();
        let (width, height) = atlas_extent();
        assert_eq!((atlas.width, atlas.height), (width, height));
        assert_eq!(atlas.raw().len(), (width * height) as usize);

        // Top row of '1' is 0b010.
        let index = glyph_index('1').unwrap();
        let (cx, cy) = ((index % COLUMNS) * CELL_WIDTH, (index / COLUMNS) * CELL_HEIGHT);
        let row: Vec<u8> = (0..3)
            .map(|c| atlas.raw()[(cy * width + cx + c) as usize])
            .collect();
        assert_eq!(row, [0, 255, 0]);
    }

    #[test]
    fn uvs_stay_inside_the_atlas() {
        for index in 0..GLYPH_COUNT {
            let [u0, v0, u1, v1] = glyph_uv(index);
            assert!(u0 < u1 && v0 < v1);
            assert!(u1 <= 1.0 && v1 <= 1.0);
        }
    }
}
