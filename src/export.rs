//! Re-projects placed overlays into document space and embeds them into the
//! source PDF.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use lopdf::content::Operation;
use lopdf::{Document, Object, ObjectId, StringFormat};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EmbedError, ExportError};
use crate::geometry::{document_from_display, DisplayContext, DocumentRect, Point};
use crate::overlay::{DrawnSignature, Overlay, OverlayContent, OverlayId, OverlayStore, TextContent};
use crate::{pdf, raster};

const TEXT_FONT: &str = "SigHelv";
/// Helvetica descender depth as a fraction of the font size.
const HELVETICA_DESCENT: f64 = 0.207;

thread_local! {
    static PROCESSING: Cell<bool> = const { Cell::new(false) };
}

/// Holds the event loop's "processing" flag for the lifetime of one export.
#[derive(Debug)]
pub struct ProcessingGuard {
    _not_send: PhantomData<*const ()>,
}

impl ProcessingGuard {
    pub fn acquire() -> Result<Self, ExportError> {
        PROCESSING.with(|flag| {
            if flag.replace(true) {
                Err(ExportError::Busy)
            } else {
                Ok(Self {
                    _not_send: PhantomData,
                })
            }
        })
    }

    pub fn is_processing() -> bool {
        PROCESSING.with(Cell::get)
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        PROCESSING.with(|flag| flag.set(false));
    }
}

/// Document handed over by the file-selection collaborator.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

/// An overlay that did not make it into the output.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayWarning {
    Skipped { overlay: OverlayId, error: EmbedError },
    PageOutOfRange { overlay: OverlayId, page: u32 },
}

impl OverlayWarning {
    pub fn overlay(&self) -> OverlayId {
        match self {
            OverlayWarning::Skipped { overlay, .. } | OverlayWarning::PageOutOfRange { overlay, .. } => {
                *overlay
            }
        }
    }
}

impl fmt::Display for OverlayWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayWarning::Skipped { overlay, error } => write!(f, "{overlay} skipped: {error}"),
            OverlayWarning::PageOutOfRange { overlay, page } => {
                write!(f, "{overlay} is anchored to page {page}, which the document does not have")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub page_count: usize,
    pub warnings: Vec<OverlayWarning>,
}

pub struct DocumentExporter {
    config: EngineConfig,
}

impl DocumentExporter {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Embeds every overlay of `store` on its anchor page. A failing overlay is
    /// reported in [`ExportOutput::warnings`] and the rest still go through.
    pub fn export(
        &self,
        source: &SourceDocument,
        store: &OverlayStore,
    ) -> Result<ExportOutput, ExportError> {
        let _processing = ProcessingGuard::acquire()?;

        let mut doc = pdf::load(&source.bytes)?;
        let pages = pdf::page_ids(&doc);
        let expected = pages.len();
        info!(
            file = %source.file_name,
            pages = expected,
            overlays = store.len(),
            "export started"
        );

        let mut session = EmbedSession {
            config: &self.config,
            doc: &mut doc,
            font: None,
            isolated: HashSet::new(),
        };
        let mut warnings = Vec::new();

        for overlay in store.iter() {
            let Some(&(_, page_id)) = pages.iter().find(|(n, _)| *n == overlay.anchor_page) else {
                warn!(overlay = %overlay.id, page = overlay.anchor_page, "anchor page not in document");
                warnings.push(OverlayWarning::PageOutOfRange {
                    overlay: overlay.id,
                    page: overlay.anchor_page,
                });
                continue;
            };

            let ctx = store.page_context(overlay.anchor_page).unwrap_or_else(|| {
                warn!(page = overlay.anchor_page, "no display context, assuming scale 1.0");
                DisplayContext::new(pdf::page_size(&*session.doc, page_id), 1.0)
            });

            if let Err(error) = session.embed(page_id, overlay, &ctx) {
                warn!(overlay = %overlay.id, %error, "overlay skipped");
                warnings.push(OverlayWarning::Skipped {
                    overlay: overlay.id,
                    error,
                });
            }
        }

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)
            .map_err(|e| ExportError::Save(e.to_string()))?;

        let found = Document::load_mem(&bytes)
            .map_err(|e| ExportError::Save(e.to_string()))?
            .get_pages()
            .len();
        if found != expected {
            return Err(ExportError::PageCount { expected, found });
        }

        info!(bytes = bytes.len(), warnings = warnings.len(), "export finished");
        Ok(ExportOutput {
            bytes,
            file_name: suggested_file_name(&source.file_name, &self.config.output_suffix),
            page_count: found,
            warnings,
        })
    }
}

/// `contract.pdf` becomes `contract-signed.pdf` for the default suffix.
pub fn suggested_file_name(original: &str, suffix: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    format!("{stem}{suffix}.pdf")
}

struct EmbedSession<'a> {
    config: &'a EngineConfig,
    doc: &'a mut Document,
    font: Option<ObjectId>,
    isolated: HashSet<ObjectId>,
}

impl EmbedSession<'_> {
    fn embed(
        &mut self,
        page_id: ObjectId,
        overlay: &Overlay,
        ctx: &DisplayContext,
    ) -> Result<(), EmbedError> {
        if self.isolated.insert(page_id) {
            if let Err(err) = pdf::isolate_contents(self.doc, page_id) {
                warn!(%err, "could not isolate page content");
            }
        }

        let rect = document_from_display(overlay.rect(), ctx);
        match &overlay.content {
            OverlayContent::Text(text) => self.embed_text(page_id, overlay, text, rect, ctx),
            OverlayContent::Drawn(drawn) => self.embed_drawn(page_id, overlay, drawn, rect),
        }
    }

    fn embed_text(
        &mut self,
        page_id: ObjectId,
        overlay: &Overlay,
        text: &TextContent,
        rect: DocumentRect,
        ctx: &DisplayContext,
    ) -> Result<(), EmbedError> {
        let mut font_size = text.font_size * overlay.scale / ctx.display_scale;
        // A box clamped narrower than its text shrinks the glyphs with it.
        let advance = text.text.chars().count().max(1) as f64 * self.config.text_char_width;
        let fitted = rect.width / advance;
        if fitted.is_finite() && fitted > 0.0 {
            font_size = font_size.min(fitted);
        }
        let font = match self.font {
            Some(id) => id,
            None => {
                let id = pdf::add_standard_font(self.doc);
                self.font = Some(id);
                id
            }
        };
        pdf::register_resource(self.doc, page_id, b"Font", TEXT_FONT, font)
            .map_err(|e| EmbedError::Path(e.to_string()))?;

        let baseline = rect.y + (rect.height - font_size) / 2.0 + HELVETICA_DESCENT * font_size;
        let [r, g, b] = self.config.stroke_color;
        let operations = vec![
            Operation::new("q", vec![]),
            Operation::new("rg", vec![r.into(), g.into(), b.into()]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(TEXT_FONT.into()), real(font_size)]),
            Operation::new("Td", vec![real(rect.x), real(baseline)]),
            Operation::new(
                "Tj",
                vec![Object::String(win_ansi(&text.text), StringFormat::Literal)],
            ),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ];
        pdf::append_content(self.doc, page_id, operations).map_err(|e| EmbedError::Path(e.to_string()))
    }

    fn embed_drawn(
        &mut self,
        page_id: ObjectId,
        overlay: &Overlay,
        drawn: &DrawnSignature,
        rect: DocumentRect,
    ) -> Result<(), EmbedError> {
        if let Some(preview) = &drawn.preview {
            match self.embed_preview(page_id, overlay.id, preview, rect) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(overlay = %overlay.id, %error, "falling back to vector strokes");
                }
            }
        }
        self.embed_strokes(page_id, drawn, rect)
    }

    fn embed_preview(
        &mut self,
        page_id: ObjectId,
        id: OverlayId,
        preview: &[u8],
        rect: DocumentRect,
    ) -> Result<(), EmbedError> {
        let image = raster::decode_preview(preview).map_err(|e| EmbedError::Image(e.to_string()))?;
        let image_id = pdf::add_image(self.doc, &image).map_err(|e| EmbedError::Image(e.to_string()))?;

        let name = format!("SigIm{}", id.get());
        pdf::register_resource(self.doc, page_id, b"XObject", &name, image_id)
            .map_err(|e| EmbedError::Image(e.to_string()))?;

        let operations = vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    real(rect.width),
                    0.into(),
                    0.into(),
                    real(rect.height),
                    real(rect.x),
                    real(rect.y),
                ],
            ),
            Operation::new("Do", vec![Object::Name(name.into_bytes())]),
            Operation::new("Q", vec![]),
        ];
        pdf::append_content(self.doc, page_id, operations).map_err(|e| EmbedError::Image(e.to_string()))
    }

    /// Redraws the captured strokes as paths. Local capture coordinates grow
    /// downwards, so y is mirrored against the rectangle's top edge.
    fn embed_strokes(
        &mut self,
        page_id: ObjectId,
        drawn: &DrawnSignature,
        rect: DocumentRect,
    ) -> Result<(), EmbedError> {
        let path = &drawn.path;
        if !(path.width > 0.0 && path.height > 0.0) {
            return Err(EmbedError::Path(format!(
                "degenerate capture size {}x{}",
                path.width, path.height
            )));
        }
        if path.local_paths.iter().all(Vec::is_empty) {
            return Err(EmbedError::Path("no strokes to draw".to_string()));
        }

        let k = rect.width / path.width;
        let top = rect.top();
        let [r, g, b] = self.config.stroke_color;
        let mut operations = vec![
            Operation::new("q", vec![]),
            Operation::new("RG", vec![r.into(), g.into(), b.into()]),
            Operation::new("w", vec![real(self.config.stroke_width * k)]),
            Operation::new("J", vec![1.into()]),
            Operation::new("j", vec![1.into()]),
        ];
        for stroke in path.local_paths.iter().filter(|s| !s.is_empty()) {
            let to_doc = |p: &Point| vec![real(rect.x + p.x * k), real(top - p.y * k)];
            operations.push(Operation::new("m", to_doc(&stroke[0])));
            match stroke.len() {
                1 => operations.push(Operation::new("l", to_doc(&stroke[0]))),
                _ => operations.extend(stroke[1..].iter().map(|p| Operation::new("l", to_doc(p)))),
            }
            operations.push(Operation::new("S", vec![]));
        }
        operations.push(Operation::new("Q", vec![]));

        pdf::append_content(self.doc, page_id, operations).map_err(|e| EmbedError::Path(e.to_string()))
    }
}

fn real(v: f64) -> Object {
    Object::Real(v as f32)
}

/// Encodes `text` for Helvetica's WinAnsiEncoding; unmapped characters
/// become `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars().map(win_ansi_byte).collect()
}

fn win_ansi_byte(c: char) -> u8 {
    match u32::from(c) {
        code @ (0x20..=0x7E | 0xA0..=0xFF) => code as u8,
        _ => match c {
            '€' => 0x80,
            '‚' => 0x82,
            'ƒ' => 0x83,
            '„' => 0x84,
            '…' => 0x85,
            '†' => 0x86,
            '‡' => 0x87,
            'ˆ' => 0x88,
            '‰' => 0x89,
            'Š' => 0x8A,
            '‹' => 0x8B,
            'Œ' => 0x8C,
            'Ž' => 0x8E,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '\u{2014}' => 0x97,
            '˜' => 0x98,
            '™' => 0x99,
            'š' => 0x9A,
            '›' => 0x9B,
            'œ' => 0x9C,
            'ž' => 0x9E,
            'Ÿ' => 0x9F,
            _ => b'?',
        },
    }
}

#[cfg(test)]
mod tests {
    use lopdf::content::Content;

    use super::*;
    use crate::capture::PathCapture;
    use crate::geometry::{Rect, Size};
    use crate::overlay::OverlayContent;
    use crate::pdf::fixtures::blank_document;

    fn letter_store(pages: u32) -> OverlayStore {
        let mut store = OverlayStore::new(Size::new(24.0, 24.0));
        for page in 1..=pages {
            store.set_page_context(page, DisplayContext::new(Size::new(612.0, 792.0), 1.0));
        }
        store
    }

    fn source(pages: usize) -> SourceDocument {
        SourceDocument {
            bytes: blank_document(pages, Size::new(612.0, 792.0)),
            file_name: "lease.pdf".to_string(),
        }
    }

    fn page_ops(bytes: &[u8], page: u32) -> Vec<Operation> {
        let doc = Document::load_mem(bytes).unwrap();
        let id = doc.get_pages()[&page];
        Content::decode(&doc.get_page_content(id).unwrap())
            .unwrap()
            .operations
    }

    fn has_op(ops: &[Operation], operator: &str) -> bool {
        ops.iter().any(|op| op.operator == operator)
    }

    fn num(obj: &Object) -> f64 {
        match obj {
            Object::Integer(i) => *i as f64,
            Object::Real(f) => f64::from(*f),
            other => panic!("not a number: {other:?}"),
        }
    }

    fn signature(config: &EngineConfig, with_preview: bool) -> OverlayContent {
        let mut capture = PathCapture::new(0.0);
        capture.begin(Point::new(0.0, 0.0));
        capture.extend(Point::new(50.0, 40.0));
        capture.extend(Point::new(100.0, 0.0));
        capture.end();
        let path = capture.finish().unwrap();
        let preview = with_preview.then(|| raster::render_preview(&path, config).unwrap());
        OverlayContent::Drawn(DrawnSignature { path, preview })
    }

    fn text(s: &str) -> OverlayContent {
        OverlayContent::Text(TextContent {
            text: s.to_string(),
            font_size: 24.0,
        })
    }

    #[test]
    fn text_lands_on_anchor_page_with_flipped_y() {
        let config = EngineConfig::default();
        let mut store = letter_store(3);
        let size = config.text_box("John Doe", 24.0);
        store.create(1, Rect::new(Point::new(100.0, 100.0), size), text("John Doe"));

        let output = DocumentExporter::new(config).export(&source(3), &store).unwrap();
        assert_eq!(output.page_count, 3);
        assert!(output.warnings.is_empty());

        let ops = page_ops(&output.bytes, 1);
        let tj = ops.iter().find(|op| op.operator == "Tj").unwrap();
        assert_eq!(tj.operands[0].as_str().unwrap(), b"John Doe");
        let td = ops.iter().find(|op| op.operator == "Td").unwrap();
        assert!((num(&td.operands[0]) - 100.0).abs() < 1e-3);
        let y = num(&td.operands[1]);
        assert!(y > 792.0 - 100.0 - size.height && y < 692.0, "baseline {y}");

        for page in [2, 3] {
            assert!(!has_op(&page_ops(&output.bytes, page), "Tj"));
        }
    }

    #[test]
    fn preview_is_embedded_as_image() {
        let config = EngineConfig::default();
        let mut store = letter_store(2);
        store.create(
            2,
            Rect::new(Point::new(300.0, 500.0), Size::new(100.0, 40.0)),
            signature(&config, true),
        );

        let output = DocumentExporter::new(config).export(&source(2), &store).unwrap();
        let ops = page_ops(&output.bytes, 2);
        assert!(has_op(&ops, "Do"));
        assert!(!has_op(&ops, "RG"));
        assert!(!has_op(&page_ops(&output.bytes, 1), "Do"));
    }

    #[test]
    fn corrupt_preview_falls_back_to_strokes() {
        let config = EngineConfig::default();
        let mut store = letter_store(1);
        let id = store.create(
            1,
            Rect::new(Point::new(100.0, 100.0), Size::new(100.0, 40.0)),
            signature(&config, false),
        );
        store.set_preview(id, Some(b"\x89PNG broken".to_vec()));

        let output = DocumentExporter::new(config).export(&source(1), &store).unwrap();
        assert!(output.warnings.is_empty());

        let ops = page_ops(&output.bytes, 1);
        assert!(!has_op(&ops, "Do"));
        let start = ops.iter().position(|op| op.operator == "RG").unwrap();
        let moveto = ops[start..].iter().find(|op| op.operator == "m").unwrap();
        // First local point (0, 0) maps to the rectangle's top-left corner.
        assert!((num(&moveto.operands[0]) - 100.0).abs() < 1e-3);
        assert!((num(&moveto.operands[1]) - 692.0).abs() < 1e-3);
        let lineto = ops[start..].iter().find(|op| op.operator == "l").unwrap();
        assert!((num(&lineto.operands[0]) - 150.0).abs() < 1e-3);
        assert!((num(&lineto.operands[1]) - 652.0).abs() < 1e-3);
    }

    #[test]
    fn one_failing_overlay_does_not_lose_the_others() {
        let config = EngineConfig::default();
        let mut store = letter_store(3);
        let first = store.create(1, Rect::new(Point::new(10.0, 10.0), Size::new(120.0, 30.0)), text("Ana"));
        let broken = store.create(
            2,
            Rect::new(Point::new(10.0, 10.0), Size::new(100.0, 40.0)),
            OverlayContent::Drawn(DrawnSignature {
                path: crate::capture::CapturedPath {
                    local_paths: vec![],
                    width: 100.0,
                    height: 40.0,
                },
                preview: Some(b"garbage".to_vec()),
            }),
        );
        let last = store.create(
            3,
            Rect::new(Point::new(10.0, 10.0), Size::new(100.0, 40.0)),
            signature(&config, true),
        );

        let output = DocumentExporter::new(config).export(&source(3), &store).unwrap();
        assert_eq!(output.page_count, 3);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].overlay(), broken);
        assert!(matches!(
            output.warnings[0],
            OverlayWarning::Skipped {
                error: EmbedError::Path(_),
                ..
            }
        ));
        assert!(has_op(&page_ops(&output.bytes, 1), "Tj"));
        assert!(has_op(&page_ops(&output.bytes, 3), "Do"));
        assert!(store.get(first).is_some() && store.get(last).is_some());
    }

    #[test]
    fn overlay_beyond_last_page_is_reported() {
        let mut store = letter_store(2);
        store.create(5, Rect::new(Point::new(0.0, 0.0), Size::new(40.0, 40.0)), text("x"));
        let output = DocumentExporter::new(EngineConfig::default())
            .export(&source(2), &store)
            .unwrap();
        assert_eq!(output.page_count, 2);
        assert!(matches!(
            output.warnings[0],
            OverlayWarning::PageOutOfRange { page: 5, .. }
        ));
    }

    #[test]
    fn second_export_is_refused_while_processing() {
        let store = letter_store(1);
        let exporter = DocumentExporter::new(EngineConfig::default());
        {
            let _held = ProcessingGuard::acquire().unwrap();
            assert!(ProcessingGuard::is_processing());
            assert!(matches!(exporter.export(&source(1), &store), Err(ExportError::Busy)));
        }
        assert!(!ProcessingGuard::is_processing());
        assert!(exporter.export(&source(1), &store).is_ok());
        assert!(!ProcessingGuard::is_processing());
    }

    #[test]
    fn corrupt_source_fails_without_touching_store() {
        let mut store = letter_store(1);
        store.create(1, Rect::new(Point::new(0.0, 0.0), Size::new(40.0, 40.0)), text("x"));
        let bad = SourceDocument {
            bytes: b"%PDF-1.4 truncated".to_vec(),
            file_name: "bad.pdf".to_string(),
        };
        let result = DocumentExporter::new(EngineConfig::default()).export(&bad, &store);
        assert!(matches!(result, Err(ExportError::Load(_))));
        assert_eq!(store.len(), 1);
        assert!(!ProcessingGuard::is_processing());
    }

    #[test]
    fn missing_display_context_uses_media_box() {
        let mut store = OverlayStore::new(Size::new(24.0, 24.0));
        store.create(1, Rect::new(Point::new(100.0, 100.0), Size::new(100.0, 30.0)), text("n"));
        let output = DocumentExporter::new(EngineConfig::default())
            .export(&source(1), &store)
            .unwrap();
        assert!(has_op(&page_ops(&output.bytes, 1), "Tj"));
    }

    #[test]
    fn file_names_get_suffix() {
        assert_eq!(suggested_file_name("lease.pdf", "-signed"), "lease-signed.pdf");
        assert_eq!(suggested_file_name("dir/a.b.PDF", "-x"), "a.b-x.pdf");
        assert_eq!(suggested_file_name("", "-signed"), "document-signed.pdf");
    }

    #[test]
    fn non_latin_text_is_replaced() {
        assert_eq!(win_ansi("José 日"), vec![b'J', b'o', b's', 0xE9, b' ', b'?']);
    }

    #[test]
    fn win_ansi_maps_typographic_punctuation() {
        assert_eq!(
            win_ansi("\u{201C}Ok\u{201D} \u{2014} 5€ \u{2019}"),
            vec![0x93, b'O', b'k', 0x94, b' ', 0x97, b' ', b'5', 0x80, b' ', 0x92]
        );
        // C1 controls share byte values with those glyphs but are not them.
        assert_eq!(win_ansi("\u{80}\u{93}\u{9F}\n"), b"????".to_vec());
    }

    #[test]
    fn text_wider_than_page_shrinks_to_its_box() {
        let config = EngineConfig::default();
        let mut store = letter_store(1);
        let name = "Maximilian Alexander Bartholomew Featherstonehaugh III";
        let requested = config.text_box(name, 24.0);
        assert!(requested.width > 612.0);
        let id = store.create(1, Rect::new(Point::new(0.0, 100.0), requested), text(name));
        let width = store.get(id).unwrap().size.width;
        assert!(width <= 612.0);

        let output = DocumentExporter::new(config.clone()).export(&source(1), &store).unwrap();
        let ops = page_ops(&output.bytes, 1);
        let tf = ops.iter().find(|op| op.operator == "Tf").unwrap();
        let font_size = num(&tf.operands[1]);
        assert!(font_size < 24.0);
        let drawn = name.chars().count() as f64 * config.text_char_width * font_size;
        assert!(drawn <= width + 1e-3, "text {drawn} wider than box {width}");
    }
}
