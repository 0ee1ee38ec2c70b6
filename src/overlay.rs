//! The authoritative collection of placed signatures.
//!
//! Every mutation is total: unknown ids are ignored, geometry is clamped to the
//! anchor page's display bounds and the configured minimum size.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::capture::CapturedPath;
use crate::geometry::{DisplayContext, Point, Rect, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OverlayId(u64);

impl OverlayId {
    pub fn get(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    Text,
    Drawn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextContent {
    pub text: String,
    /// Display pixels at `scale == 1.0`.
    pub font_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawnSignature {
    pub path: CapturedPath,
    /// Encoded raster (PNG or JPEG) of the strokes, preferred at export.
    #[serde(skip)]
    pub preview: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OverlayContent {
    Text(TextContent),
    Drawn(DrawnSignature),
}

impl OverlayContent {
    pub fn kind(&self) -> OverlayKind {
        match self {
            OverlayContent::Text(_) => OverlayKind::Text,
            OverlayContent::Drawn(_) => OverlayKind::Drawn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionState {
    #[default]
    None,
    Selected,
    Dragging,
    Resizing,
}

impl SelectionState {
    pub fn is_manipulating(self) -> bool {
        matches!(self, SelectionState::Dragging | SelectionState::Resizing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub id: OverlayId,
    pub anchor_page: u32,
    pub position: Point,
    pub size: Size,
    pub scale: f64,
    pub content: OverlayContent,
    pub selection: SelectionState,
}

impl Overlay {
    pub fn kind(&self) -> OverlayKind {
        self.content.kind()
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.position, self.size)
    }
}

/// Partial geometry update. A size change without an explicit scale scales
/// `scale` by the width ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeometryPatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub scale: Option<f64>,
}

impl GeometryPatch {
    pub fn position(position: Point) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }
}

/// Clamps a rectangle so it is at least `min` large and, when the page bounds
/// are known, lies entirely on the page. Width and height are clamped
/// independently.
pub fn clamp_geometry(position: Point, size: Size, bounds: Option<Size>, min: Size) -> Rect {
    let mut width = finite_or(size.width, min.width).max(min.width);
    let mut height = finite_or(size.height, min.height).max(min.height);
    if let Some(bounds) = bounds {
        width = width.min(bounds.width);
        height = height.min(bounds.height);
    }
    place(position, Size::new(width, height), bounds)
}

/// Like [`clamp_geometry`], but grows or shrinks both sides by one factor so
/// the aspect ratio of `size` survives.
pub fn clamp_geometry_uniform(position: Point, size: Size, bounds: Option<Size>, min: Size) -> Rect {
    let width = finite_or(size.width, min.width).max(f64::EPSILON);
    let height = finite_or(size.height, min.height).max(f64::EPSILON);

    let mut factor = (min.width / width).max(min.height / height).max(1.0);
    if let Some(bounds) = bounds {
        factor = factor
            .min(bounds.width / width)
            .min(bounds.height / height);
    }
    place(position, Size::new(width, height).scaled(factor), bounds)
}

fn finite_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

fn place(position: Point, size: Size, bounds: Option<Size>) -> Rect {
    let mut x = finite_or(position.x, 0.0).max(0.0);
    let mut y = finite_or(position.y, 0.0).max(0.0);
    if let Some(bounds) = bounds {
        x = x.min((bounds.width - size.width).max(0.0));
        y = y.min((bounds.height - size.height).max(0.0));
    }
    Rect::new(Point::new(x, y), size)
}

/// Clamps `geometry` for `content`. Drawn signatures keep the aspect ratio of
/// their capture; the requested width decides their size.
fn clamp_for(content: &OverlayContent, geometry: Rect, bounds: Option<Size>, min: Size) -> Rect {
    match content {
        OverlayContent::Drawn(drawn) if drawn.path.width > 0.0 && drawn.path.height > 0.0 => {
            let size = drawn.path.size().scaled(geometry.size.width / drawn.path.width);
            clamp_geometry_uniform(geometry.origin, size, bounds, min)
        }
        _ => clamp_geometry(geometry.origin, geometry.size, bounds, min),
    }
}

/// Scale matching a clamped size. Drawn signatures follow their capture width;
/// anything else follows how far clamping moved the width from `requested`.
fn derived_scale(overlay: &Overlay, size: Size, wanted: f64, requested: Size) -> f64 {
    match &overlay.content {
        OverlayContent::Drawn(drawn) if drawn.path.width > 0.0 => size.width / drawn.path.width,
        _ if requested.width > 0.0 => wanted * size.width / requested.width,
        _ => wanted,
    }
}

#[derive(Debug, Clone)]
pub struct OverlayStore {
    overlays: Vec<Overlay>,
    pages: BTreeMap<u32, DisplayContext>,
    next_id: u64,
    min_size: Size,
}

impl OverlayStore {
    pub fn new(min_size: Size) -> Self {
        Self {
            overlays: Vec::new(),
            pages: BTreeMap::new(),
            next_id: 1,
            min_size,
        }
    }

    /// Minimum overlay size in document units.
    pub fn min_size(&self) -> Size {
        self.min_size
    }

    /// Minimum overlay size in display pixels of `page` as currently shown.
    pub fn min_display_size(&self, page: u32) -> Size {
        match self.pages.get(&page) {
            Some(ctx) => self.min_size.scaled(ctx.display_scale),
            None => self.min_size,
        }
    }

    /// Records how `page` is displayed. When its display scale changes, the
    /// page's overlays are rescaled so their document geometry is preserved.
    pub fn set_page_context(&mut self, page: u32, ctx: DisplayContext) {
        let previous = self.pages.insert(page, ctx);
        let Some(previous) = previous else {
            return;
        };
        if (previous.display_scale - ctx.display_scale).abs() <= f64::EPSILON {
            return;
        }

        let ratio = ctx.display_scale / previous.display_scale;
        let bounds = Some(ctx.display_size());
        let min = self.min_display_size(page);
        for overlay in self.overlays.iter_mut().filter(|o| o.anchor_page == page) {
            let scaled = Rect::new(
                Point::new(overlay.position.x * ratio, overlay.position.y * ratio),
                overlay.size.scaled(ratio),
            );
            let rect = clamp_for(&overlay.content, scaled, bounds, min);
            overlay.scale = derived_scale(overlay, rect.size, overlay.scale * ratio, scaled.size);
            overlay.position = rect.origin;
            overlay.size = rect.size;
        }
        debug!(page, ratio, "page display scale changed");
    }

    pub fn page_context(&self, page: u32) -> Option<DisplayContext> {
        self.pages.get(&page).copied()
    }

    pub fn page_bounds(&self, page: u32) -> Option<Size> {
        self.pages.get(&page).map(DisplayContext::display_size)
    }

    pub fn create(&mut self, anchor_page: u32, geometry: Rect, content: OverlayContent) -> OverlayId {
        let id = OverlayId(self.next_id);
        self.next_id += 1;

        let rect = clamp_for(
            &content,
            geometry,
            self.page_bounds(anchor_page),
            self.min_display_size(anchor_page),
        );
        let scale = match &content {
            OverlayContent::Drawn(drawn) if drawn.path.width > 0.0 => {
                rect.size.width / drawn.path.width
            }
            _ => 1.0,
        };

        debug!(%id, anchor_page, kind = ?content.kind(), "overlay created");
        self.overlays.push(Overlay {
            id,
            anchor_page,
            position: rect.origin,
            size: rect.size,
            scale,
            content,
            selection: SelectionState::None,
        });
        id
    }

    pub fn update(&mut self, id: OverlayId, patch: GeometryPatch) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let page = self.overlays[index].anchor_page;
        let bounds = self.page_bounds(page);
        let min = self.min_display_size(page);
        let overlay = &mut self.overlays[index];

        let requested = Rect::new(
            patch.position.unwrap_or(overlay.position),
            patch.size.unwrap_or(overlay.size),
        );
        let rect = clamp_for(&overlay.content, requested, bounds, min);
        let wanted_scale = match (patch.scale, patch.size) {
            (Some(scale), _) => scale,
            (None, Some(_)) if overlay.size.width > 0.0 => {
                overlay.scale * requested.size.width / overlay.size.width
            }
            _ => overlay.scale,
        };
        let scale = derived_scale(overlay, rect.size, wanted_scale, requested.size);

        overlay.position = rect.origin;
        overlay.size = rect.size;
        if scale.is_finite() && scale > 0.0 {
            overlay.scale = scale;
        }
        true
    }

    pub fn remove(&mut self, id: OverlayId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        self.overlays.remove(index);
        debug!(%id, "overlay removed");
        true
    }

    pub fn clear(&mut self) {
        self.overlays.clear();
    }

    /// Selects one overlay, or none. Selecting an unknown id does nothing, and
    /// neither does anything while an overlay is being dragged or resized.
    pub fn select(&mut self, id: Option<OverlayId>) -> bool {
        if self.active().is_some() {
            return false;
        }
        if let Some(id) = id {
            if self.index_of(id).is_none() {
                return false;
            }
        }
        for overlay in &mut self.overlays {
            if Some(overlay.id) == id {
                if !overlay.selection.is_manipulating() {
                    overlay.selection = SelectionState::Selected;
                }
            } else {
                overlay.selection = SelectionState::None;
            }
        }
        true
    }

    /// Marks `id` as being dragged or resized. Refused while any other overlay
    /// is already being manipulated.
    pub fn begin_manipulation(&mut self, id: OverlayId, state: SelectionState) -> bool {
        if !state.is_manipulating() || self.index_of(id).is_none() {
            return false;
        }
        if self.active().is_some_and(|active| active != id) {
            return false;
        }
        for overlay in &mut self.overlays {
            overlay.selection = if overlay.id == id {
                state
            } else {
                SelectionState::None
            };
        }
        true
    }

    /// Returns a dragged or resized overlay to plain `Selected`.
    pub fn end_manipulation(&mut self, id: OverlayId) {
        if let Some(overlay) = self.get_mut(id) {
            if overlay.selection.is_manipulating() {
                overlay.selection = SelectionState::Selected;
            }
        }
    }

    pub fn active(&self) -> Option<OverlayId> {
        self.overlays
            .iter()
            .find(|o| o.selection.is_manipulating())
            .map(|o| o.id)
    }

    pub fn selected(&self) -> Option<OverlayId> {
        self.overlays
            .iter()
            .find(|o| o.selection != SelectionState::None)
            .map(|o| o.id)
    }

    pub fn get(&self, id: OverlayId) -> Option<&Overlay> {
        self.overlays.iter().find(|o| o.id == id)
    }

    /// Replaces a drawn overlay's raster preview.
    pub fn set_preview(&mut self, id: OverlayId, preview: Option<Vec<u8>>) -> bool {
        match self.get_mut(id).map(|o| &mut o.content) {
            Some(OverlayContent::Drawn(drawn)) => {
                drawn.preview = preview;
                true
            }
            _ => false,
        }
    }

    /// Overlays anchored to `page`, in creation order (bottom to top).
    pub fn list(&self, page: u32) -> Vec<&Overlay> {
        self.overlays
            .iter()
            .filter(|o| o.anchor_page == page)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Overlay> {
        self.overlays.iter()
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    fn get_mut(&mut self, id: OverlayId) -> Option<&mut Overlay> {
        self.overlays.iter_mut().find(|o| o.id == id)
    }

    fn index_of(&self, id: OverlayId) -> Option<usize> {
        self.overlays.iter().position(|o| o.id == id)
    }
}
