pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod geometry;
pub mod interaction;
pub mod overlay;
pub mod pdf;
pub mod raster;

use std::rc::Rc;

use serde_json::json;
use wasm_bindgen::prelude::*;

use config::EngineConfig;
use export::{DocumentExporter, ExportOutput, SourceDocument};
use geometry::{ContainerRect, DisplayContext, Point, Size};
use interaction::{
    CountingListenerHost, Effect, InteractionController, Key, ListenerHost, PageRects,
    PointerInput, PointerKind,
};
use overlay::{OverlayId, OverlayStore};

fn js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// One signing session over one document, driven from JavaScript.
#[wasm_bindgen]
pub struct SignerSession {
    config: EngineConfig,
    store: OverlayStore,
    surface: PageRects,
    listeners: Rc<CountingListenerHost>,
    controller: InteractionController,
    last_export: Option<ExportOutput>,
}

#[wasm_bindgen]
impl SignerSession {
    #[wasm_bindgen(constructor)]
    pub fn new() -> SignerSession {
        Self::from_config(EngineConfig::default())
    }

    /// Session with tunables read from a JSON object; missing keys keep their
    /// defaults.
    pub fn with_config(json: &str) -> Result<SignerSession, JsValue> {
        let config = EngineConfig::from_json(json)
            .map_err(|e| JsValue::from_str(&format!("Invalid configuration: {}", e)))?;
        Ok(Self::from_config(config))
    }

    /// Reports how `page` is rendered. Call again whenever zoom or layout
    /// changes; overlays on that page follow.
    pub fn set_page(&mut self, page: u32, native_width: f64, native_height: f64, display_scale: f64) {
        let ctx = DisplayContext::new(Size::new(native_width, native_height), display_scale);
        self.store.set_page_context(page, ctx);
    }

    /// Client-space bounding rectangle of the element showing `page`.
    pub fn set_page_rect(&mut self, page: u32, left: f64, top: f64, width: f64, height: f64) {
        self.surface.set(page, ContainerRect::new(left, top, width, height));
    }

    pub fn clear_page_rects(&mut self) {
        self.surface.clear();
    }

    pub fn pointer_down(
        &mut self,
        x: f64,
        y: f64,
        pointer_id: i32,
        pointer_type: &str,
        is_primary: bool,
    ) -> String {
        let input = pointer(x, y, pointer_id, pointer_type, is_primary);
        let effects = self
            .controller
            .pointer_down(&mut self.store, &self.surface, input);
        effects_json(&effects)
    }

    pub fn pointer_move(
        &mut self,
        x: f64,
        y: f64,
        pointer_id: i32,
        pointer_type: &str,
        is_primary: bool,
    ) -> String {
        let input = pointer(x, y, pointer_id, pointer_type, is_primary);
        let effects = self
            .controller
            .pointer_move(&mut self.store, &self.surface, input);
        effects_json(&effects)
    }

    pub fn pointer_up(
        &mut self,
        x: f64,
        y: f64,
        pointer_id: i32,
        pointer_type: &str,
        is_primary: bool,
    ) -> String {
        let input = pointer(x, y, pointer_id, pointer_type, is_primary);
        effects_json(&self.controller.pointer_up(&mut self.store, input))
    }

    pub fn pointer_cancel(&mut self, pointer_id: i32, pointer_type: &str) -> String {
        let input = pointer(0.0, 0.0, pointer_id, pointer_type, true);
        effects_json(&self.controller.pointer_cancel(&mut self.store, input))
    }

    /// `KeyboardEvent.key` of a key press.
    pub fn key(&mut self, key: &str) -> String {
        let key = match key {
            "Escape" | "Esc" => Key::Escape,
            "Delete" => Key::Delete,
            "Backspace" => Key::Backspace,
            _ => Key::Other,
        };
        effects_json(&self.controller.key_down(&mut self.store, key))
    }

    pub fn arm_text(&mut self, text: &str, font_size: Option<f64>) -> bool {
        self.controller.arm_text(text, font_size)
    }

    /// Opens the drawing pad; `left`/`top`/`width`/`height` is the pad's
    /// client rectangle.
    pub fn begin_drawing(&mut self, left: f64, top: f64, width: f64, height: f64, anchor_page: u32) -> bool {
        self.controller
            .begin_drawing(ContainerRect::new(left, top, width, height), anchor_page)
    }

    pub fn clear_drawing(&mut self) {
        self.controller.clear_drawing();
    }

    /// Returns the new overlay's id.
    pub fn finish_drawing(&mut self) -> Result<u64, JsValue> {
        self.controller
            .finish_drawing(&mut self.store)
            .map(OverlayId::get)
            .map_err(js_err)
    }

    pub fn cancel(&mut self) {
        self.controller.cancel(&mut self.store);
    }

    pub fn state(&self) -> String {
        self.controller.state().name().to_string()
    }

    /// Changes the selection. Returns false for an unknown id, or while an
    /// overlay is being dragged or resized.
    pub fn select(&mut self, id: Option<u64>) -> bool {
        self.store.select(id.map(OverlayId::from_raw))
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.store.remove(OverlayId::from_raw(id))
    }

    /// Replaces the generated raster preview of a drawn overlay.
    pub fn set_preview(&mut self, id: u64, image: Vec<u8>) -> bool {
        self.store.set_preview(OverlayId::from_raw(id), Some(image))
    }

    /// Drops every overlay and returns to idle.
    pub fn reset(&mut self) {
        self.controller.cancel(&mut self.store);
        self.store.clear();
        self.last_export = None;
    }

    /// Overlays anchored to `page`, bottom to top, as JSON.
    pub fn overlays_json(&self, page: u32) -> Result<String, JsValue> {
        serde_json::to_string(&self.store.list(page)).map_err(js_err)
    }

    /// True while global pointer listeners should be attached.
    pub fn listeners_attached(&self) -> bool {
        self.listeners.active() > 0
    }

    pub fn is_processing(&self) -> bool {
        export::ProcessingGuard::is_processing()
    }

    /// Embeds every overlay into `pdf_bytes` and returns the signed document.
    pub fn export(&mut self, pdf_bytes: &[u8], file_name: &str) -> Result<Vec<u8>, JsValue> {
        let source = SourceDocument {
            bytes: pdf_bytes.to_vec(),
            file_name: file_name.to_string(),
        };
        let output = DocumentExporter::new(self.config.clone())
            .export(&source, &self.store)
            .map_err(|e| JsValue::from_str(&format!("Error generating PDF: {}", e)))?;
        let bytes = output.bytes.clone();
        self.last_export = Some(output);
        Ok(bytes)
    }

    /// Download name for the last export.
    pub fn output_file_name(&self) -> Option<String> {
        self.last_export.as_ref().map(|o| o.file_name.clone())
    }

    /// Overlays the last export had to leave out, one message each, as JSON.
    pub fn export_warnings(&self) -> String {
        let messages: Vec<String> = self
            .last_export
            .iter()
            .flat_map(|o| o.warnings.iter().map(ToString::to_string))
            .collect();
        json!(messages).to_string()
    }
}

impl SignerSession {
    fn from_config(config: EngineConfig) -> Self {
        let listeners = Rc::new(CountingListenerHost::default());
        let host: Rc<dyn ListenerHost> = listeners.clone();
        Self {
            store: OverlayStore::new(config.min_overlay_size),
            surface: PageRects::new(),
            controller: InteractionController::new(config.clone(), host),
            listeners,
            config,
            last_export: None,
        }
    }
}

impl Default for SignerSession {
    fn default() -> Self {
        Self::new()
    }
}

fn pointer(x: f64, y: f64, pointer_id: i32, pointer_type: &str, is_primary: bool) -> PointerInput {
    let kind = match pointer_type {
        "touch" => PointerKind::Touch,
        "pen" => PointerKind::Pen,
        _ => PointerKind::Mouse,
    };
    PointerInput {
        pointer_id,
        kind,
        client: Point::new(x, y),
        is_primary,
    }
}

fn effects_json(effects: &[Effect]) -> String {
    serde_json::to_string(effects).unwrap_or_else(|_| "[]".to_string())
}

/// Page count and native page sizes, for building each page's display context.
#[wasm_bindgen]
pub fn inspect_document(pdf_bytes: &[u8]) -> Result<String, JsValue> {
    let doc = pdf::load(pdf_bytes).map_err(js_err)?;
    let pages: Vec<_> = pdf::page_sizes(&doc)
        .into_iter()
        .map(|size| json!({ "width": size.width, "height": size.height }))
        .collect();
    Ok(json!({ "page_count": pages.len(), "pages": pages }).to_string())
}
