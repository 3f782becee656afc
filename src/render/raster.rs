/// Supersampled triangle rasterizer
///
/// Triangles arrive in normalized device coordinates with a flat color.
/// The raster keeps a depth buffer at `samples` x `samples` the output
/// resolution and resolves to RGBA by averaging covered samples, so edge
/// pixels get fractional alpha against the transparent background.
use cgmath::Vector3;
use image::{Rgba, RgbaImage};

/// Color and depth buffers at sample resolution
pub struct Raster {
    /// Output pixels per side
    size: u32,
    /// Samples per output pixel side
    samples: u32,
    /// Linear RGB per sample, row-major
    color: Vec<[f32; 3]>,
    /// `INFINITY` marks a sample nothing was drawn to
    depth: Vec<f32>,
    /// Samples written at least once
    covered: usize,
}

impl Raster {
    /// Create a square raster of `size` output pixels per side
    pub fn new(size: u32, samples: u32) -> Self {
        let samples = samples.max(1);
        let side = (size * samples) as usize;
        Self {
            size,
            samples,
            color: vec![[0.0; 3]; side * side],
            depth: vec![f32::INFINITY; side * side],
            covered: 0,
        }
    }

    /// Buffer width and height in samples
    fn side(&self) -> u32 {
        self.size * self.samples
    }

    /// Number of samples written at least once
    pub fn covered_samples(&self) -> usize {
        self.covered
    }

    /// Draw one triangle given in NDC (x, y in [-1, 1], z in [-1, 1])
    ///
    /// Both windings are accepted; hidden surfaces are resolved by depth only.
    pub fn draw_triangle(&mut self, ndc: [Vector3<f32>; 3], rgb: [f32; 3]) {
        // NaN from a degenerate projection
        if ndc.iter().any(|v| !(v.x.is_finite() && v.y.is_finite() && v.z.is_finite())) {
            return;
        }

        // NDC to sample coordinates, y pointing down
        let side = self.side() as f32;
        let to_screen = |v: &Vector3<f32>| {
            (
                (v.x + 1.0) * 0.5 * side,
                (1.0 - v.y) * 0.5 * side,
                v.z,
            )
        };
        let (x0, y0, z0) = to_screen(&ndc[0]);
        let (x1, y1, z1) = to_screen(&ndc[1]);
        let (x2, y2, z2) = to_screen(&ndc[2]);

        // Zero-area triangles cover nothing
        let area = edge(x0, y0, x1, y1, x2, y2);
        if area.abs() < f32::EPSILON {
            return;
        }

        // Bounding box clipped to the buffer
        let min_x = x0.min(x1).min(x2).floor().max(0.0) as u32;
        let min_y = y0.min(y1).min(y2).floor().max(0.0) as u32;
        let max_x = (x0.max(x1).max(x2).ceil() as i64).clamp(0, self.side() as i64) as u32;
        let max_y = (y0.max(y1).max(y2).ceil() as i64).clamp(0, self.side() as i64) as u32;

        let stride = self.side() as usize;
        for py in min_y..max_y {
            for px in min_x..max_x {
                // Sample at the center of the cell
                let sx = px as f32 + 0.5;
                let sy = py as f32 + 0.5;

                // Barycentric weights; dividing by the signed area makes either winding positive
                let w0 = edge(x1, y1, x2, y2, sx, sy) / area;
                let w1 = edge(x2, y2, x0, y0, sx, sy) / area;
                let w2 = edge(x0, y0, x1, y1, sx, sy) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }

                let z = w0 * z0 + w1 * z1 + w2 * z2;
                // Outside the near/far planes
                if !(-1.0..=1.0).contains(&z) {
                    continue;
                }

                // Depth test, counting first writes
                let idx = py as usize * stride + px as usize;
                if z < self.depth[idx] {
                    if self.depth[idx] == f32::INFINITY {
                        self.covered += 1;
                    }
                    self.depth[idx] = z;
                    self.color[idx] = rgb;
                }
            }
        }
    }

    /// Downsample to the output size
    pub fn resolve(&self) -> RgbaImage {
        let stride = self.side() as usize;
        let n = self.samples as usize;
        let total = (n * n) as f32;

        RgbaImage::from_fn(self.size, self.size, |x, y| {
            let mut sum = [0.0f32; 3];
            let mut hits = 0usize;

            // Average the covered samples of this pixel
            for sy in 0..n {
                for sx in 0..n {
                    let idx = (y as usize * n + sy) * stride + x as usize * n + sx;
                    if self.depth[idx] != f32::INFINITY {
                        let c = self.color[idx];
                        sum[0] += c[0];
                        sum[1] += c[1];
                        sum[2] += c[2];
                        hits += 1;
                    }
                }
            }

            // Background stays fully transparent
            if hits == 0 {
                return Rgba([0, 0, 0, 0]);
            }

            // Color from covered samples only, alpha from coverage
            let to_byte = |v: f32| (v / hits as f32 * 255.0).round().clamp(0.0, 255.0) as u8;
            Rgba([
                to_byte(sum[0]),
                to_byte(sum[1]),
                to_byte(sum[2]),
                (hits as f32 / total * 255.0).round() as u8,
            ])
        })
    }
}

/// Twice the signed area of (a, b, p)
fn edge(ax: f32, ay: f32, bx: f32, by: f32, px: f32, py: f32) -> f32 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}
