/// Camera framing, lighting and encoding for model thumbnails
use cgmath::{perspective, Deg, InnerSpace, Matrix4, Point3, Vector3, Vector4};
use tracing::debug;

use super::raster::Raster;
use crate::error::PreviewError;
use crate::model::SceneObject;
use crate::preview::PreviewImage;

/// Size of generated previews (square)
pub const PREVIEW_SIZE: u32 = 256;

/// Samples per pixel side used for anti-aliasing
const SUPERSAMPLE: u32 = 3;

/// Vertical field of view of the preview camera
const FOV_DEGREES: f32 = 45.0;
/// Camera sits at (d, d, d) with d = largest edge times this
const CAMERA_DISTANCE_FACTOR: f32 = 1.6;
// Clip planes, relative to the largest edge
const FAR_PLANE_FACTOR: f32 = 10.0;
// Near plane close enough to never clip the model
const NEAR_PLANE_FACTOR: f32 = 0.01;

/// Light every face gets regardless of orientation
const AMBIENT_INTENSITY: f32 = 0.4;
/// Extra light from (1, 1, 1), scaled by the facing angle
const DIRECTIONAL_INTENSITY: f32 = 0.7;

/// 0x8aa7ff
const BASE_COLOR: [f32; 3] = [138.0 / 255.0, 167.0 / 255.0, 1.0];

/// Axis-aligned bounding box of a scene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl BoundingBox {
    /// Bounds of `points`; inverted (min > max) when there are none
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f32>>) -> Self {
        let mut min = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);

        for p in points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Self { min, max }
    }

    /// Edge lengths along each axis
    pub fn size(&self) -> Vector3<f32> {
        self.max - self.min
    }

    /// Midpoint of the box
    pub fn center(&self) -> Point3<f32> {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// Largest edge length; NaN or infinite for an empty box
    pub fn max_dim(&self) -> f32 {
        let size = self.size();
        size.x.max(size.y).max(size.z)
    }
}

/// Render a scene into a `PREVIEW_SIZE` PNG
pub fn render(scene: &SceneObject) -> Result<PreviewImage, PreviewError> {
    render_with_size(scene, PREVIEW_SIZE)
}

/// Render at an arbitrary square size (tests use small ones)
pub fn render_with_size(scene: &SceneObject, size: u32) -> Result<PreviewImage, PreviewError> {
    let bounds = BoundingBox::from_points(scene.positions());
    // Nothing to frame: no vertices, or all of them in one point
    let max_dim = bounds.max_dim();
    if !max_dim.is_finite() || max_dim <= 0.0 {
        return Err(PreviewError::EmptyGeometry);
    }

    // Recenter on the bounding box so the camera can look at the origin
    let center = bounds.center();
    let offset = Point3::new(0.0, 0.0, 0.0) - center;

    // Isometric-ish view from the +x +y +z octant, z up
    let distance = max_dim * CAMERA_DISTANCE_FACTOR;
    let eye = Point3::new(distance, distance, distance);
    let view = Matrix4::look_at_rh(eye, Point3::new(0.0, 0.0, 0.0), Vector3::unit_z());
    let projection = perspective(
        Deg(FOV_DEGREES),
        1.0,
        max_dim * NEAR_PLANE_FACTOR,
        max_dim * FAR_PLANE_FACTOR,
    );
    let view_projection = projection * view;
    let light = Vector3::new(1.0, 1.0, 1.0).normalize();

    // Transparent canvas, supersampled
    let mut raster = Raster::new(size, SUPERSAMPLE);

    for [a, b, c] in scene.faces() {
        let (a, b, c) = (a + offset, b + offset, c + offset);

        // Skip degenerate faces
        let normal = (b - a).cross(c - a);
        if normal.magnitude2() == 0.0 || !normal.magnitude2().is_finite() {
            continue;
        }
        let mut normal = normal.normalize();

        // Light both sides; flip toward the viewer
        let centroid = Point3::new((a.x + b.x + c.x) / 3.0, (a.y + b.y + c.y) / 3.0, (a.z + b.z + c.z) / 3.0);
        if normal.dot(eye - centroid) < 0.0 {
            normal = -normal;
        }

        // Flat shading: one color per face
        let intensity = AMBIENT_INTENSITY + DIRECTIONAL_INTENSITY * normal.dot(light).max(0.0);
        let rgb = BASE_COLOR.map(|channel| (channel * intensity).min(1.0));

        // Clip space to NDC; points behind the camera drop the face
        let project = |p: Point3<f32>| -> Option<Vector3<f32>> {
            let clip = view_projection * Vector4::new(p.x, p.y, p.z, 1.0);
            if clip.w <= 0.0 || !clip.w.is_finite() {
                return None;
            }
            Some(clip.truncate() / clip.w)
        };

        if let (Some(pa), Some(pb), Some(pc)) = (project(a), project(b), project(c)) {
            raster.draw_triangle([pa, pb, pc], rgb);
        }
    }

    // Geometry exists but every face was culled or off screen
    if raster.covered_samples() == 0 {
        return Err(PreviewError::RenderError("no geometry visible from the camera".to_string()));
    }

    // Downsample and encode
    let image = raster.resolve();
    let encoded = PreviewImage::encode(&image)?;
    debug!(bytes = encoded.len(), max_dim, "rendered preview");
    Ok(encoded)
}
