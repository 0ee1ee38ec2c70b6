//! Low-level lopdf plumbing: page sizes, resource dictionaries, image
//! XObjects and content appends.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::RgbaImage;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use crate::error::ExportError;
use crate::geometry::Size;
use crate::raster;

/// Used when a page carries no usable MediaBox anywhere up its tree.
pub const FALLBACK_PAGE_SIZE: Size = Size::new(595.0, 842.0);

pub fn load(bytes: &[u8]) -> Result<Document, ExportError> {
    Document::load_mem(bytes).map_err(ExportError::Load)
}

/// Page object ids ordered by 1-based page number.
pub fn page_ids(doc: &Document) -> Vec<(u32, ObjectId)> {
    // get_pages is a BTreeMap, already sorted by page number.
    doc.get_pages().into_iter().collect()
}

pub fn page_sizes(doc: &Document) -> Vec<Size> {
    page_ids(doc)
        .into_iter()
        .map(|(_, id)| page_size(doc, id))
        .collect()
}

/// Width and height of the page's MediaBox, inherited through `Parent`.
pub fn page_size(doc: &Document, page_id: ObjectId) -> Size {
    inherited(doc, page_id, b"MediaBox")
        .and_then(|obj| media_box_size(doc, &obj))
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

fn media_box_size(doc: &Document, obj: &Object) -> Option<Size> {
    let resolved = resolve(doc, obj)?;
    let arr = resolved.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    let size = Size::new((urx - llx).abs(), (ury - lly).abs());
    (size.width > 0.0 && size.height > 0.0).then_some(size)
}

/// Looks `key` up on the page, then on each ancestor in the page tree.
fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = Some(page_id);
    let mut hops = 0;
    while let Some(id) = current {
        let dict = doc.get_object(id).and_then(|o| o.as_dict()).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value.clone());
        }
        current = dict.get(b"Parent").and_then(|o| o.as_reference()).ok();
        hops += 1;
        if hops > 64 {
            return None;
        }
    }
    None
}

fn resolve(doc: &Document, obj: &Object) -> Option<Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok().cloned(),
        other => Some(other.clone()),
    }
}

fn resolve_to_dict(doc: &Document, obj: &Object) -> Result<Dictionary, ExportError> {
    match resolve(doc, obj) {
        Some(Object::Dictionary(d)) => Ok(d),
        Some(Object::Stream(s)) => Ok(s.dict),
        other => Err(ExportError::Document(format!(
            "expected a dictionary, found {:?}",
            other
        ))),
    }
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary, ExportError> {
    doc.get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|e| ExportError::Document(format!("page {:?} is not a dictionary: {}", page_id, e)))
}

/// Adds `/name target` to the page's `category` resource dictionary
/// (`XObject`, `Font`, ...). Inherited resources are copied onto the page first
/// so existing content keeps resolving.
pub fn register_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &[u8],
    name: &str,
    target: ObjectId,
) -> Result<(), ExportError> {
    let current = inherited(doc, page_id, b"Resources");
    let shared_id = match &current {
        Some(Object::Reference(id)) => Some(*id),
        _ => None,
    };
    let mut resources = match &current {
        Some(obj) => resolve_to_dict(doc, obj)?,
        None => Dictionary::new(),
    };

    let mut entries = match resources.get(category) {
        Ok(obj) => resolve_to_dict(doc, obj)?,
        Err(_) => Dictionary::new(),
    };
    entries.set(name, Object::Reference(target));
    resources.set(category.to_vec(), Object::Dictionary(entries));

    match shared_id {
        Some(id) => {
            let slot = doc
                .get_object_mut(id)
                .map_err(|e| ExportError::Document(e.to_string()))?;
            *slot = Object::Dictionary(resources);
        }
        None => {
            page_dict_mut(doc, page_id)?.set("Resources", Object::Dictionary(resources));
        }
    }
    Ok(())
}

/// Brackets the page's existing content in `q`/`Q` so graphics state left over
/// by the original drawing cannot displace anything appended afterwards.
pub fn isolate_contents(doc: &mut Document, page_id: ObjectId) -> Result<(), ExportError> {
    let existing = page_dict_mut(doc, page_id)?.get(b"Contents").ok().cloned();
    let Some(existing) = existing else {
        return Ok(());
    };

    let mut parts = match existing {
        Object::Array(items) => items,
        other => vec![other],
    };
    let push_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let pop_id = doc.add_object(Stream::new(dictionary! {}, b"\nQ\n".to_vec()));
    parts.insert(0, Object::Reference(push_id));
    parts.push(Object::Reference(pop_id));

    page_dict_mut(doc, page_id)?.set("Contents", Object::Array(parts));
    Ok(())
}

pub fn append_content(
    doc: &mut Document,
    page_id: ObjectId,
    operations: Vec<Operation>,
) -> Result<(), ExportError> {
    let bytes = Content { operations }
        .encode()
        .map_err(|e| ExportError::Document(e.to_string()))?;
    doc.add_page_contents(page_id, bytes)
        .map_err(|e| ExportError::Document(e.to_string()))
}

/// Standard Helvetica, so text needs no embedded font program.
pub fn add_standard_font(doc: &mut Document) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    })
}

/// Adds an RGB image XObject with a soft mask carrying the alpha channel.
pub fn add_image(doc: &mut Document, image: &RgbaImage) -> std::io::Result<ObjectId> {
    let (w, h) = image.dimensions();
    let (rgb, alpha) = raster::split_alpha(image);

    let smask = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
        },
        deflate(&alpha)?,
    );
    let smask_id = doc.add_object(smask);

    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
            "SMask" => smask_id,
        },
        deflate(&rgb)?,
    );
    Ok(doc.add_object(image))
}

fn deflate(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

/// In-memory documents for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// `pages` pages of `size`, each with a trivial drawing and resources
    /// inherited from the page tree root.
    pub fn blank_document(pages: usize, size: Size) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids = Vec::new();
        for _ in 0..pages {
            let content = Stream::new(dictionary! {}, b"2 w 0 0 m 10 10 l S".to_vec());
            let content_id = doc.add_object(content);
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }

        let tree = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), (size.width as f32).into(), (size.height as f32).into()],
            "Resources" => dictionary! {},
        };
        doc.objects.insert(pages_id, Object::Dictionary(tree));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).expect("fixture saves");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::blank_document;
    use super::*;

    #[test]
    fn page_sizes_are_inherited_from_tree() {
        let doc = load(&blank_document(3, Size::new(612.0, 792.0))).unwrap();
        assert_eq!(page_sizes(&doc), vec![Size::new(612.0, 792.0); 3]);
    }

    #[test]
    fn register_resource_copies_inherited_resources_onto_page() {
        let mut doc = load(&blank_document(2, Size::new(100.0, 100.0))).unwrap();
        let (_, first) = page_ids(&doc)[0];
        let font = add_standard_font(&mut doc);
        register_resource(&mut doc, first, b"Font", "SigHelv", font).unwrap();

        let page = doc.get_object(first).unwrap().as_dict().unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let fonts = resources.get(b"Font").unwrap().as_dict().unwrap();
        assert_eq!(fonts.get(b"SigHelv").unwrap().as_reference().unwrap(), font);

        let (_, second) = page_ids(&doc)[1];
        let other = doc.get_object(second).unwrap().as_dict().unwrap();
        assert!(other.get(b"Resources").is_err());
    }

    #[test]
    fn isolate_then_append_wraps_original_drawing() {
        let mut doc = load(&blank_document(1, Size::new(100.0, 100.0))).unwrap();
        let (_, page) = page_ids(&doc)[0];
        isolate_contents(&mut doc, page).unwrap();
        append_content(&mut doc, page, vec![Operation::new("n", vec![])]).unwrap();

        let content = doc.get_page_content(page).unwrap();
        let ops: Vec<String> = Content::decode(&content)
            .unwrap()
            .operations
            .into_iter()
            .map(|op| op.operator)
            .collect();
        assert_eq!(ops.first().map(String::as_str), Some("q"));
        assert_eq!(ops.last().map(String::as_str), Some("n"));
        let pop = ops.iter().position(|op| op == "Q").unwrap();
        assert_eq!(pop, ops.len() - 2);
    }

    #[test]
    fn image_xobject_has_soft_mask() {
        let mut doc = Document::with_version("1.5");
        let image = RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 128]));
        let id = add_image(&mut doc, &image).unwrap();
        let stream = doc.get_object(id).unwrap().as_stream().unwrap();
        assert_eq!(stream.dict.get(b"Width").unwrap().as_i64().unwrap(), 3);
        let smask = stream.dict.get(b"SMask").unwrap().as_reference().unwrap();
        assert!(doc.get_object(smask).is_ok());
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        assert!(matches!(load(b"not a pdf"), Err(ExportError::Load(_))));
    }
}
