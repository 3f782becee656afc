/// 3MF container handling
///
/// A 3MF file is a zip (OPC package). Two things are read from it:
/// - an embedded thumbnail at `.../metadata/thumbnail.(png|jpg|jpeg)`
/// - the mesh resources of the root model part, flattened through build
///   items and components (including `p:path` references into other parts
///   as written by slicers)
use cgmath::{Matrix4, Point3, SquareMatrix, Transform};
use image::ImageFormat;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::debug;
use zip::ZipArchive;

use super::{Mesh, SceneObject};
use crate::error::PreviewError;
use crate::preview::PreviewImage;

/// Package relationships, which name the root model part
const RELS_PATH: &str = "_rels/.rels";
/// Where slicers put the root part when the relationships are missing
const DEFAULT_MODEL_PATH: &str = "3D/3dmodel.model";
/// Relationship type of a model part, matched on the tail of the URI
const MODEL_REL_SUFFIX: &str = "/3dmodel";
/// Thumbnail entries, matched case-insensitively on the tail of the name
const THUMBNAIL_SUFFIXES: [&str; 3] = [
    "metadata/thumbnail.png",
    "metadata/thumbnail.jpg",
    "metadata/thumbnail.jpeg",
];
/// Guards against component cycles
const MAX_COMPONENT_DEPTH: usize = 16;

/// Zip reader over the borrowed file bytes
type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Any zip error means the file is not a usable 3MF
fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, PreviewError> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| PreviewError::CorruptData(format!("3MF: {}", e)))
}

/// Read one entry fully into memory
fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, PreviewError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| PreviewError::CorruptData(format!("3MF entry {}: {}", name, e)))?;
    // Declared size is only a capacity hint
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut data)
        .map_err(|e| PreviewError::CorruptData(format!("3MF entry {}: {}", name, e)))?;
    Ok(data)
}

/// All entry names, in archive order
fn entry_names(archive: &mut Archive<'_>) -> Vec<String> {
    (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|entry| entry.name().to_string()))
        .collect()
}

/// Part names in relationships and `p:path` are absolute, zip entries are not
fn normalize_part_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Find the embedded thumbnail, if any
///
/// PNG thumbnails are returned byte-for-byte. JPEG thumbnails are re-encoded
/// as PNG so that every stored preview matches its `.preview.png` name.
/// A thumbnail that does not decode counts as a miss.
pub fn extract_thumbnail(bytes: &[u8]) -> Result<Option<PreviewImage>, PreviewError> {
    let mut archive = open_archive(bytes)?;

    // First entry that looks like a package thumbnail
    let candidate = entry_names(&mut archive).into_iter().find(|name| {
        let lower = name.to_ascii_lowercase();
        THUMBNAIL_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
    });

    let Some(name) = candidate else {
        return Ok(None);
    };

    // Sniff the real format, the extension is not trusted
    let data = read_entry(&mut archive, &name)?;
    let format = match image::guess_format(&data) {
        Ok(format) => format,
        Err(_) => {
            debug!(entry = %name, "embedded thumbnail has unknown image format");
            return Ok(None);
        }
    };

    // PNG passes through as is, JPEG gets re-encoded
    match format {
        ImageFormat::Png if image::load_from_memory_with_format(&data, format).is_ok() => {
            Ok(Some(PreviewImage::from_png(data)))
        }
        ImageFormat::Jpeg => match image::load_from_memory_with_format(&data, format) {
            Ok(decoded) => Ok(PreviewImage::encode(&decoded.to_rgba8()).ok()),
            Err(e) => {
                debug!(entry = %name, error = %e, "embedded JPEG thumbnail does not decode");
                Ok(None)
            }
        },
        _ => Ok(None),
    }
}

/// Parse the mesh geometry of the package's root model
pub fn parse(bytes: &[u8]) -> Result<SceneObject, PreviewError> {
    let mut archive = open_archive(bytes)?;
    let root = root_model_path(&mut archive)?;

    // Parts are parsed lazily as build items and components reach them
    let mut parts = PartCache::default();
    parts.load(&mut archive, &root)?;

    // World-space meshes, one per instantiated object
    let mut meshes = Vec::new();
    let build = parts.get(&root).map(|p| p.build.clone()).unwrap_or_default();

    if build.is_empty() {
        // No build section: show every mesh object of the root part
        let mut ids: Vec<u32> = parts
            .get(&root)
            .map(|p| p.objects.iter().filter(|(_, o)| o.mesh.is_some()).map(|(id, _)| *id).collect())
            .unwrap_or_default();
        // Stable output regardless of hash order
        ids.sort_unstable();
        for id in ids {
            instantiate(&mut archive, &mut parts, &root, id, Matrix4::identity(), 0, &mut meshes)?;
        }
    } else {
        // Build items may point into other parts via `p:path`
        for item in build {
            let part = match item.path.as_deref() {
                Some(path) => normalize_part_path(path).to_string(),
                None => root.clone(),
            };
            instantiate(&mut archive, &mut parts, &part, item.object_id, item.transform, 0, &mut meshes)?;
        }
    }

    debug!(meshes = meshes.len(), "parsed 3MF geometry");
    Ok(SceneObject { meshes })
}

/// Locate the root model part through `_rels/.rels`, falling back to the
/// conventional path and then to any `.model` entry
fn root_model_path(archive: &mut Archive<'_>) -> Result<String, PreviewError> {
    let names = entry_names(archive);

    // Relationship target, only if the entry really exists
    if names.iter().any(|n| n == RELS_PATH) {
        let rels = read_entry(archive, RELS_PATH)?;
        if let Some(target) = model_relationship_target(&rels)? {
            let target = normalize_part_path(&target).to_string();
            if names.iter().any(|n| *n == target) {
                return Ok(target);
            }
        }
    }

    // Conventional location
    if names.iter().any(|n| n == DEFAULT_MODEL_PATH) {
        return Ok(DEFAULT_MODEL_PATH.to_string());
    }

    // Last resort: any model part at all
    names
        .into_iter()
        .find(|n| n.to_ascii_lowercase().ends_with(".model"))
        .ok_or_else(|| PreviewError::CorruptData("3MF: no model part in package".to_string()))
}

/// Target of the first relationship whose type is a 3D model
fn model_relationship_target(xml: &[u8]) -> Result<Option<String>, PreviewError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let attrs = parse_attributes(e)?;
                    let is_model = attrs
                        .get("Type")
                        .map(|t| t.ends_with(MODEL_REL_SUFFIX))
                        .unwrap_or(false);
                    if is_model {
                        return Ok(attrs.get("Target").cloned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PreviewError::CorruptData(format!("3MF relationships: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(None)
}

#[derive(Debug, Clone)]
/// Reference to an object, from a build item or a component
struct Component {
    /// `objectid` of the referenced object
    object_id: u32,
    /// Identity when the attribute is absent
    transform: Matrix4<f32>,
    /// Other model part holding the object (`p:path`)
    path: Option<String>,
}

#[derive(Debug, Default)]
/// An `<object>`: its own mesh and/or references to other objects
struct ObjectDef {
    /// Own geometry, in object space
    mesh: Option<Mesh>,
    /// Child objects placed relative to this one
    components: Vec<Component>,
}

#[derive(Debug, Default)]
/// One parsed `.model` entry
struct ModelPart {
    /// Every `<object>` keyed by its id
    objects: HashMap<u32, ObjectDef>,
    /// `<item>`s of the `<build>` section, in document order
    build: Vec<Component>,
}

#[derive(Debug, Default)]
/// Parsed parts keyed by normalized entry name
struct PartCache {
    parts: HashMap<String, ModelPart>,
}

impl PartCache {
    fn get(&self, path: &str) -> Option<&ModelPart> {
        self.parts.get(path)
    }

    /// Parse `path` unless it is already cached
    fn load(&mut self, archive: &mut Archive<'_>, path: &str) -> Result<(), PreviewError> {
        if self.parts.contains_key(path) {
            return Ok(());
        }
        let xml = read_entry(archive, path)?;
        let part = parse_model_part(&xml)?;
        self.parts.insert(path.to_string(), part);
        Ok(())
    }
}

/// Append the meshes of one object (and its components) in world space
fn instantiate(
    archive: &mut Archive<'_>,
    parts: &mut PartCache,
    part_path: &str,
    object_id: u32,
    transform: Matrix4<f32>,
    depth: usize,
    out: &mut Vec<Mesh>,
) -> Result<(), PreviewError> {
    // Cyclic or absurdly nested components
    if depth > MAX_COMPONENT_DEPTH {
        return Err(PreviewError::CorruptData("3MF: component nesting too deep".to_string()));
    }

    // Component paths may name a part we have not parsed yet
    parts.load(archive, part_path)?;

    let (mesh, components) = match parts.get(part_path).and_then(|p| p.objects.get(&object_id)) {
        Some(object) => (
            object.mesh.as_ref().map(|m| transform_mesh(m, &transform)),
            object.components.clone(),
        ),
        None => {
            debug!(part = part_path, object_id, "build references a missing object");
            return Ok(());
        }
    };

    // The object's own mesh, then its children under the combined transform
    if let Some(mesh) = mesh {
        out.push(mesh);
    }

    for component in components {
        let next_part = component
            .path
            .as_deref()
            .map(normalize_part_path)
            .unwrap_or(part_path)
            .to_string();
        instantiate(
            archive,
            parts,
            &next_part,
            component.object_id,
            transform * component.transform,
            depth + 1,
            out,
        )?;
    }

    Ok(())
}

/// Copy of `mesh` with every vertex moved into world space
fn transform_mesh(mesh: &Mesh, transform: &Matrix4<f32>) -> Mesh {
    Mesh {
        positions: mesh.positions.iter().map(|p| transform.transform_point(*p)).collect(),
        triangles: mesh.triangles.clone(),
    }
}

/// Parse one `.model` XML part into its objects and build items
fn parse_model_part(xml: &[u8]) -> Result<ModelPart, PreviewError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut part = ModelPart::default();
    let mut buf = Vec::new();
    // Parser state: inside <build>, the open <object>, the open <mesh>
    let mut in_build = false;
    let mut current: Option<(u32, ObjectDef)> = None;
    let mut current_mesh: Option<Mesh> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| PreviewError::CorruptData(format!("3MF model XML: {}", e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"object" => {
                        let attrs = parse_attributes(e)?;
                        let id = parse_index(&attrs, "id")?;
                        if is_empty {
                            part.objects.insert(id, ObjectDef::default());
                        } else {
                            current = Some((id, ObjectDef::default()));
                        }
                    }
                    // Meshes only count inside an object
                    b"mesh" if current.is_some() => {
                        current_mesh = Some(Mesh::default());
                    }
                    b"vertex" => {
                        if let Some(mesh) = current_mesh.as_mut() {
                            let attrs = parse_attributes(e)?;
                            mesh.positions.push(Point3::new(
                                parse_coord(&attrs, "x")?,
                                parse_coord(&attrs, "y")?,
                                parse_coord(&attrs, "z")?,
                            ));
                        }
                    }
                    b"triangle" => {
                        if let Some(mesh) = current_mesh.as_mut() {
                            let attrs = parse_attributes(e)?;
                            mesh.triangles.push([
                                parse_index(&attrs, "v1")?,
                                parse_index(&attrs, "v2")?,
                                parse_index(&attrs, "v3")?,
                            ]);
                        }
                    }
                    b"component" => {
                        if let Some((_, object)) = current.as_mut() {
                            object.components.push(parse_component(e)?);
                        }
                    }
                    b"build" => {
                        in_build = !is_empty;
                    }
                    // Build items share the component attribute layout
                    b"item" if in_build => {
                        part.build.push(parse_component(e)?);
                    }
                    _ => {}
                }
            }
            // Closing tags hand finished meshes and objects up one level
            Event::End(ref e) => match e.local_name().as_ref() {
                b"mesh" => {
                    if let (Some((_, object)), Some(mesh)) = (current.as_mut(), current_mesh.take()) {
                        object.mesh = Some(mesh);
                    }
                }
                b"object" => {
                    if let Some((id, object)) = current.take() {
                        part.objects.insert(id, object);
                    }
                }
                b"build" => in_build = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(part)
}

/// Attributes keyed by local name (namespace prefix stripped)
fn parse_attributes(e: &BytesStart) -> Result<HashMap<String, String>, PreviewError> {
    let mut attrs = HashMap::with_capacity(8);

    for attr in e.attributes() {
        let attr = attr.map_err(|e| PreviewError::CorruptData(format!("3MF attribute: {}", e)))?;
        // Names and values are UTF-8 in any valid 3MF
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| PreviewError::CorruptData(e.to_string()))?;
        let value = std::str::from_utf8(&attr.value)
            .map_err(|e| PreviewError::CorruptData(e.to_string()))?;
        // `p:path` and `path` land under the same key
        let local = key.rsplit(':').next().unwrap_or(key);
        attrs.insert(local.to_string(), value.to_string());
    }

    Ok(attrs)
}

/// Required float attribute
fn parse_coord(attrs: &HashMap<String, String>, key: &str) -> Result<f32, PreviewError> {
    attrs
        .get(key)
        .ok_or_else(|| PreviewError::CorruptData(format!("3MF: missing attribute {}", key)))?
        .trim()
        .parse::<f32>()
        .map_err(|e| PreviewError::CorruptData(format!("3MF: bad {} value: {}", key, e)))
}

/// Required integer attribute (object ids, vertex indices)
fn parse_index(attrs: &HashMap<String, String>, key: &str) -> Result<u32, PreviewError> {
    attrs
        .get(key)
        .ok_or_else(|| PreviewError::CorruptData(format!("3MF: missing attribute {}", key)))?
        .trim()
        .parse::<u32>()
        .map_err(|e| PreviewError::CorruptData(format!("3MF: bad {} value: {}", key, e)))
}

/// `<component>` or `<item>`: object id, optional transform and part path
fn parse_component(e: &BytesStart) -> Result<Component, PreviewError> {
    let attrs = parse_attributes(e)?;
    let transform = match attrs.get("transform") {
        Some(value) => parse_transform(value)?,
        None => Matrix4::identity(),
    };
    Ok(Component {
        object_id: parse_index(&attrs, "objectid")?,
        transform,
        path: attrs.get("path").cloned(),
    })
}

/// 3MF affine transform: twelve numbers `m00 m01 m02 m10 ... m32`, row-vector
/// convention with the translation in the last row
fn parse_transform(value: &str) -> Result<Matrix4<f32>, PreviewError> {
    let m: Vec<f32> = value
        .split_whitespace()
        .map(|v| v.parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|e| PreviewError::CorruptData(format!("3MF: bad transform: {}", e)))?;

    // Exactly a 4x3 matrix
    if m.len() != 12 {
        return Err(PreviewError::CorruptData(format!(
            "3MF: transform needs 12 values, got {}",
            m.len()
        )));
    }

    // 3MF rows become cgmath columns (column-vector convention)
    #[rustfmt::skip]
    let matrix = Matrix4::new(
        m[0], m[1], m[2], 0.0,
        m[3], m[4], m[5], 0.0,
        m[6], m[7], m[8], 0.0,
        m[9], m[10], m[11], 1.0,
    );
    Ok(matrix)
}
