use serde::{Deserialize, Serialize};

const BINS: usize = 256;

/// Contrast-limited adaptive histogram equalization parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaheParams {
    /// Histogram clip limit, relative to a uniform distribution
    pub clip_limit: f32,
    /// Number of tiles along (x, y)
    pub tile_grid: (u32, u32),
}

impl Default for ClaheParams {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: (8, 8),
        }
    }
}

/// Bounds of tile `index` when `len` pixels are split into `count` tiles
fn tile_span(index: u32, count: u32, len: u32) -> (u32, u32) {
    let start = (index as u64 * len as u64 / count as u64) as u32;
    let end = ((index as u64 + 1) * len as u64 / count as u64) as u32;
    (start, end)
}

fn clip_histogram(hist: &mut [u32; BINS], limit: u32) {
    let mut excess: u32 = 0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let batch = excess / BINS as u32;
    let residual = excess - batch * BINS as u32;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (BINS as u32 / residual).max(1) as usize;
        for bin in hist.iter_mut().step_by(step).take(residual as usize) {
            *bin += 1;
        }
    }
}

fn tile_lut(
    plane: &[u8],
    width: u32,
    (x0, x1): (u32, u32),
    (y0, y1): (u32, u32),
    clip_limit: f32,
) -> [u8; BINS] {
    let mut hist = [0u32; BINS];
    for y in y0..y1 {
        let row = (y * width) as usize;
        for &v in &plane[row + x0 as usize..row + x1 as usize] {
            hist[v as usize] += 1;
        }
    }

    let area = (x1 - x0) * (y1 - y0);
    let mut lut = [0u8; BINS];
    if area == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return lut;
    }

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / BINS as f32) as u32).max(1);
        clip_histogram(&mut hist, limit);
    }

    let scale = 255.0 / area as f32;
    let mut sum: u32 = 0;
    for (slot, count) in lut.iter_mut().zip(hist.iter()) {
        sum += count;
        *slot = (sum as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Neighbouring tile indices and the weight of the second one for a pixel
fn interpolation_axis(pos: u32, tile_size: f32, tiles: u32) -> (usize, usize, f32) {
    let t = (pos as f32 + 0.5) / tile_size - 0.5;
    let base = t.floor();
    let weight = t - base;
    let last = tiles as i64 - 1;
    let lo = (base as i64).clamp(0, last) as usize;
    let hi = (base as i64 + 1).clamp(0, last) as usize;
    (lo, hi, weight)
}

/// Equalize an 8-bit plane in row-major order. Output has the same size.
pub fn equalize_plane(plane: &[u8], width: u32, height: u32, params: &ClaheParams) -> Vec<u8> {
    if width == 0 || height == 0 {
        return plane.to_vec();
    }

    let tiles_x = params.tile_grid.0.clamp(1, width);
    let tiles_y = params.tile_grid.1.clamp(1, height);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        let ys = tile_span(ty, tiles_y, height);
        for tx in 0..tiles_x {
            let xs = tile_span(tx, tiles_x, width);
            luts.push(tile_lut(plane, width, xs, ys, params.clip_limit));
        }
    }

    let tile_w = width as f32 / tiles_x as f32;
    let tile_h = height as f32 / tiles_y as f32;
    let columns: Vec<(usize, usize, f32)> = (0..width)
        .map(|x| interpolation_axis(x, tile_w, tiles_x))
        .collect();

    let mut out = vec![0u8; plane.len()];
    for y in 0..height {
        let (ty0, ty1, wy) = interpolation_axis(y, tile_h, tiles_y);
        let row = (y * width) as usize;
        for (x, &(tx0, tx1, wx)) in columns.iter().enumerate() {
            let v = plane[row + x] as usize;
            let lut = |ty: usize, tx: usize| luts[ty * tiles_x as usize + tx][v] as f32;

            let top = lut(ty0, tx0) * (1.0 - wx) + lut(ty0, tx1) * wx;
            let bottom = lut(ty1, tx0) * (1.0 - wx) + lut(ty1, tx1) * wx;
            let value = top * (1.0 - wy) + bottom * wy;
            out[row + x] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_plane_stays_constant() {
        let plane = vec![120u8; 64 * 48];
        let out = equalize_plane(&plane, 64, 48, &ClaheParams::default());
        assert_eq!(out.len(), plane.len());
        assert!(out.iter().all(|&v| v == out[0]));
    }

    #[test]
    fn test_low_contrast_is_stretched() {
        let (w, h) = (256u32, 256u32);
        let plane: Vec<u8> = (0..h)
            .flat_map(|_| (0..w).map(|x| 100 + (x % 16) as u8))
            .collect();
        let params = ClaheParams {
            clip_limit: 2.0,
            tile_grid: (2, 2),
        };
        let out = equalize_plane(&plane, w, h, &params);

        let spread = |p: &[u8]| p.iter().max().unwrap() - p.iter().min().unwrap();
        assert_eq!(spread(&plane), 15);
        assert!(spread(&out) > 30, "spread {}", spread(&out));
    }

    #[test]
    fn test_tiny_image_with_large_grid() {
        let plane = vec![10u8, 200, 30, 90, 60, 250];
        let out = equalize_plane(&plane, 3, 2, &ClaheParams::default());
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_clip_redistributes_excess() {
        let mut hist = [0u32; BINS];
        hist[10] = 1000;
        clip_histogram(&mut hist, 100);
        assert_eq!(hist.iter().sum::<u32>(), 1000);
        assert!(hist[10] <= 100 + 4);
    }

    #[test]
    fn test_tile_spans_cover_axis() {
        let spans: Vec<(u32, u32)> = (0..3).map(|i| tile_span(i, 3, 10)).collect();
        assert_eq!(spans, vec![(0, 3), (3, 6), (6, 10)]);
    }
}
