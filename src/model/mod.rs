/// Model decoding module
///
/// This module turns raw model file bytes into a scene the thumbnail
/// renderer can draw:
/// - Binary and ASCII STL (stl.rs)
/// - Wavefront OBJ (obj.rs)
/// - 3MF zip containers, including embedded thumbnails (threemf.rs)
///
/// Dispatch happens strictly on the file extension (decoder.rs).

pub mod decoder;
pub mod obj;
pub mod stl;
pub mod threemf;

// Format dispatch by extension
pub use decoder::{decode, Decoded};

use cgmath::Point3;

/// Model formats the preview pipeline knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Stl,
    Obj,
    ThreeMf,
}

impl ModelFormat {
    /// Pick a format from a file name or path, case-insensitively
    pub fn from_file_name(name: &str) -> Option<Self> {
        match extension(name).as_str() {
            "stl" => Some(Self::Stl),
            "obj" => Some(Self::Obj),
            "3mf" => Some(Self::ThreeMf),
            _ => None,
        }
    }
}

/// Lowercase extension without the dot ("" when there is none)
pub fn extension(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rfind('.') {
        Some(idx) => base[idx + 1..].to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Opaque CAD formats this crate cannot decode; previews for these come
/// from the desktop shell instead
pub fn is_opaque_cad(name: &str) -> bool {
    matches!(extension(name).as_str(), "step" | "stp")
}

/// A single indexed triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Point3<f32>>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    /// Iterate triangles as vertex triples, skipping out-of-range indices
    pub fn faces(&self) -> impl Iterator<Item = [Point3<f32>; 3]> + '_ {
        self.triangles.iter().filter_map(|tri| {
            let a = *self.positions.get(tri[0] as usize)?;
            let b = *self.positions.get(tri[1] as usize)?;
            let c = *self.positions.get(tri[2] as usize)?;
            Some([a, b, c])
        })
    }
}

/// Decoded model ready for rendering
#[derive(Debug, Clone, Default, PartialEq)]
/// Everything to draw for one file, already in world space
pub struct SceneObject {
    pub meshes: Vec<Mesh>,
}

impl SceneObject {
    /// Scene holding a single mesh (STL)
    pub fn from_mesh(mesh: Mesh) -> Self {
        Self { meshes: vec![mesh] }
    }

    /// Triangles across all meshes
    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(|m| m.triangles.len()).sum()
    }

    /// All vertex positions across meshes
    pub fn positions(&self) -> impl Iterator<Item = &Point3<f32>> {
        self.meshes.iter().flat_map(|m| m.positions.iter())
    }

    pub fn faces(&self) -> impl Iterator<Item = [Point3<f32>; 3]> + '_ {
        self.meshes.iter().flat_map(|m| m.faces())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_name() {
        assert_eq!(ModelFormat::from_file_name("part.STL"), Some(ModelFormat::Stl));
        assert_eq!(ModelFormat::from_file_name("C:\\jobs\\bracket.obj"), Some(ModelFormat::Obj));
        assert_eq!(ModelFormat::from_file_name("/tmp/plate.3mf"), Some(ModelFormat::ThreeMf));
        assert_eq!(ModelFormat::from_file_name("drawing.step"), None);
        assert_eq!(ModelFormat::from_file_name("README"), None);
    }

    #[test]
    fn test_extension_ignores_dotted_directories() {
        assert_eq!(extension("/home/me/v1.2/model"), "");
        assert_eq!(extension("archive.tar.GZ"), "gz");
    }

    #[test]
    fn test_faces_skip_bad_indices() {
        let mesh = Mesh {
            positions: vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0)],
            triangles: vec![[0, 1, 2], [0, 1, 9]],
        };
        assert_eq!(mesh.faces().count(), 1);
    }
}
