/// STL parsing (binary and ASCII) via stl_io
///
/// Degenerate geometry is accepted here; an all-zero bounding box is
/// reported later by the renderer as `EmptyGeometry`.
use cgmath::Point3;
use std::io::Cursor;

use super::Mesh;
use crate::error::PreviewError;

/// Parse STL bytes into an indexed mesh
pub fn parse(bytes: &[u8]) -> Result<Mesh, PreviewError> {
    let mut cursor = Cursor::new(bytes);
    // stl_io detects ASCII vs binary and merges shared vertices
    let indexed = stl_io::read_stl(&mut cursor)
        .map_err(|e| PreviewError::CorruptData(format!("STL: {}", e)))?;

    let positions = indexed
        .vertices
        .iter()
        .map(|v| Point3::new(v.0[0], v.0[1], v.0[2]))
        .collect();

    // Face indices narrowed to the mesh index type
    let triangles = indexed
        .faces
        .iter()
        .map(|face| {
            [
                face.vertices[0] as u32,
                face.vertices[1] as u32,
                face.vertices[2] as u32,
            ]
        })
        .collect();

    Ok(Mesh { positions, triangles })
}

/// Encode triangles as a binary STL (used to build test fixtures)
#[cfg(test)]
pub(crate) fn binary_stl_bytes(triangles: &[[[f32; 3]; 3]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(84 + triangles.len() * 50);

    let mut header = [0u8; 80];
    header[..9].copy_from_slice(b"fixture  ");
    out.extend_from_slice(&header);
    // 80-byte header, then the triangle count
    out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());

    for tri in triangles {
        // Normal left at zero; readers recompute it
        for _ in 0..3 {
            out.extend_from_slice(&0f32.to_le_bytes());
        }
        for vertex in tri {
            for coord in vertex {
                out.extend_from_slice(&coord.to_le_bytes());
            }
        }
        // Attribute byte count
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    out
}

/// A closed tetrahedron, small enough to keep tests fast
#[cfg(test)]
pub(crate) fn tetrahedron_stl() -> Vec<u8> {
    let a = [0.0, 0.0, 0.0];
    let b = [10.0, 0.0, 0.0];
    let c = [0.0, 10.0, 0.0];
    let d = [0.0, 0.0, 10.0];
    binary_stl_bytes(&[[a, c, b], [a, b, d], [a, d, c], [b, c, d]])
}
