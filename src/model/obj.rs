/// Wavefront OBJ parsing via tobj
///
/// Material libraries are never resolved: previews use one flat color.
use cgmath::Point3;

use super::{Mesh, SceneObject};
use crate::error::PreviewError;

/// Parse OBJ text into one mesh per object/group
pub fn parse(bytes: &[u8]) -> Result<SceneObject, PreviewError> {
    // Exporters sometimes write Latin-1 names; geometry is ASCII either way
    let text = String::from_utf8_lossy(bytes);
    let mut reader = text.as_bytes();

    // Faces become triangles sharing one index buffer; points and lines are dropped
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ignore_points: true,
        ignore_lines: true,
        ..Default::default()
    };

    // Every `mtllib` resolves to an empty material set
    let (models, _materials) = tobj::load_obj_buf(&mut reader, &options, |_| Ok(Default::default()))
        .map_err(|e| PreviewError::CorruptData(format!("OBJ: {}", e)))?;

    let meshes = models
        .into_iter()
        .map(|model| {
            let positions = model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| Point3::new(p[0], p[1], p[2]))
                .collect();
            let triangles = model
                .mesh
                .indices
                .chunks_exact(3)
                .map(|t| [t[0], t[1], t[2]])
                .collect();
            Mesh { positions, triangles }
        })
        .collect();

    Ok(SceneObject { meshes })
}

#[cfg(test)]
pub(crate) const QUAD_OBJ: &str = "\
# two triangles forming a tilted quad
o plate
v 0 0 0
v 20 0 0
v 20 10 5
v 0 10 5
f 1 2 3 4
";
