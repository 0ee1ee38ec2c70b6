//! Pointer-driven state machine for placing, moving, resizing and drawing
//! signatures.
//!
//! The controller owns no overlays. Every handler receives the
//! [`OverlayStore`] to mutate and a [`RenderSurface`] describing where pages
//! currently sit on screen, so it can be driven without any UI toolkit.
//!
//! Window-wide move/up listeners are represented by a [`Subscription`] held
//! inside the dragging, resizing and drawing states. Leaving such a state, by
//! any path, drops the state and with it the subscription.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::capture::PathCapture;
use crate::config::EngineConfig;
use crate::error::CaptureError;
use crate::geometry::{display_point, ContainerRect, Point, Rect, Size};
use crate::overlay::{
    DrawnSignature, GeometryPatch, OverlayContent, OverlayId, OverlayStore, SelectionState,
    TextContent,
};
use crate::raster;

/// Supplied by the rendering collaborator: where each page is on screen.
pub trait RenderSurface {
    fn container(&self, page: u32) -> Option<ContainerRect>;
    fn page_at(&self, client: Point) -> Option<u32>;
}

/// Page rectangles reported by the host after each layout pass.
#[derive(Debug, Clone, Default)]
pub struct PageRects {
    rects: BTreeMap<u32, ContainerRect>,
}

impl PageRects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, page: u32, rect: ContainerRect) {
        self.rects.insert(page, rect);
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}

impl RenderSurface for PageRects {
    fn container(&self, page: u32) -> Option<ContainerRect> {
        self.rects.get(&page).copied()
    }

    fn page_at(&self, client: Point) -> Option<u32> {
        self.rects
            .iter()
            .find(|(_, rect)| rect.contains(client))
            .map(|(page, _)| *page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(pub u64);

/// Attaches and detaches the global pointer-move/pointer-up listeners.
pub trait ListenerHost {
    fn attach(&self) -> ListenerToken;
    fn detach(&self, token: ListenerToken);
}

/// Global listeners held for as long as this value lives.
pub struct Subscription {
    host: Rc<dyn ListenerHost>,
    token: ListenerToken,
}

impl Subscription {
    pub fn acquire(host: &Rc<dyn ListenerHost>) -> Self {
        let token = host.attach();
        Self {
            host: Rc::clone(host),
            token,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.host.detach(self.token);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscription").field(&self.token).finish()
    }
}

/// Host that only keeps count; the embedder polls [`Self::active`] and wires
/// real listeners accordingly.
#[derive(Debug, Default)]
pub struct CountingListenerHost {
    next: Cell<u64>,
    active: Cell<usize>,
}

impl CountingListenerHost {
    pub fn active(&self) -> usize {
        self.active.get()
    }
}

impl ListenerHost for CountingListenerHost {
    fn attach(&self) -> ListenerToken {
        let token = self.next.get() + 1;
        self.next.set(token);
        self.active.set(self.active.get() + 1);
        ListenerToken(token)
    }

    fn detach(&self, _token: ListenerToken) {
        self.active.set(self.active.get().saturating_sub(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Mouse,
    Touch,
    Pen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerInput {
    pub pointer_id: i32,
    pub kind: PointerKind,
    pub client: Point,
    /// False for the second and later fingers of a multi-touch gesture.
    pub is_primary: bool,
}

impl PointerInput {
    pub fn mouse(x: f64, y: f64) -> Self {
        Self {
            pointer_id: 1,
            kind: PointerKind::Mouse,
            client: Point::new(x, y),
            is_primary: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Delete,
    Backspace,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    fn is_right(self) -> bool {
        matches!(self, Corner::TopRight | Corner::BottomRight)
    }

    fn is_bottom(self) -> bool {
        matches!(self, Corner::BottomLeft | Corner::BottomRight)
    }

    pub fn of(self, rect: &Rect) -> Point {
        Point::new(
            if self.is_right() { rect.right() } else { rect.origin.x },
            if self.is_bottom() { rect.bottom() } else { rect.origin.y },
        )
    }

    fn opposite(self) -> Corner {
        match self {
            Corner::TopLeft => Corner::BottomRight,
            Corner::TopRight => Corner::BottomLeft,
            Corner::BottomLeft => Corner::TopRight,
            Corner::BottomRight => Corner::TopLeft,
        }
    }
}

/// Observable outcome of a handled input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Effect {
    Created(OverlayId),
    Updated(OverlayId),
    SelectionChanged(Option<OverlayId>),
    Removed(OverlayId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionState {
    Idle,
    PlacingNew,
    Dragging(OverlayId),
    Resizing(OverlayId, Corner),
    Drawing,
}

impl InteractionState {
    pub fn name(self) -> &'static str {
        match self {
            InteractionState::Idle => "idle",
            InteractionState::PlacingNew => "placing",
            InteractionState::Dragging(_) => "dragging",
            InteractionState::Resizing(..) => "resizing",
            InteractionState::Drawing => "drawing",
        }
    }
}

#[derive(Debug)]
enum Mode {
    Idle,
    PlacingNew {
        text: String,
        font_size: f64,
    },
    Dragging {
        id: OverlayId,
        pointer_id: i32,
        offset: Point,
        _listeners: Subscription,
    },
    Resizing {
        id: OverlayId,
        pointer_id: i32,
        corner: Corner,
        initial: Rect,
        initial_scale: f64,
        initial_pointer: Point,
        /// Corner opposite the dragged handle; it stays put.
        pivot: Point,
        _listeners: Subscription,
    },
    Drawing {
        capture: PathCapture,
        canvas: ContainerRect,
        anchor_page: u32,
        pointer_id: Option<i32>,
        _listeners: Subscription,
    },
}

pub struct InteractionController {
    config: EngineConfig,
    listeners: Rc<dyn ListenerHost>,
    mode: Mode,
}

impl InteractionController {
    pub fn new(config: EngineConfig, listeners: Rc<dyn ListenerHost>) -> Self {
        Self {
            config,
            listeners,
            mode: Mode::Idle,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> InteractionState {
        match &self.mode {
            Mode::Idle => InteractionState::Idle,
            Mode::PlacingNew { .. } => InteractionState::PlacingNew,
            Mode::Dragging { id, .. } => InteractionState::Dragging(*id),
            Mode::Resizing { id, corner, .. } => InteractionState::Resizing(*id, *corner),
            Mode::Drawing { .. } => InteractionState::Drawing,
        }
    }

    /// Arms creation of a text signature on the next press on an empty spot.
    pub fn arm_text(&mut self, text: impl Into<String>, font_size: Option<f64>) -> bool {
        if !matches!(self.mode, Mode::Idle | Mode::PlacingNew { .. }) {
            return false;
        }
        let text = text.into();
        if text.trim().is_empty() {
            return false;
        }
        let font_size = font_size
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(self.config.default_font_size);
        self.set_mode(Mode::PlacingNew { text, font_size });
        true
    }

    /// Enters the modal drawing pad occupying `canvas` (client coordinates).
    pub fn begin_drawing(&mut self, canvas: ContainerRect, anchor_page: u32) -> bool {
        if !matches!(self.mode, Mode::Idle | Mode::PlacingNew { .. }) {
            return false;
        }
        let listeners = Subscription::acquire(&self.listeners);
        self.set_mode(Mode::Drawing {
            capture: PathCapture::new(self.config.capture_padding),
            canvas,
            anchor_page,
            pointer_id: None,
            _listeners: listeners,
        });
        true
    }

    /// Discards strokes drawn so far without leaving the pad.
    pub fn clear_drawing(&mut self) {
        if let Mode::Drawing {
            capture, pointer_id, ..
        } = &mut self.mode
        {
            capture.clear();
            *pointer_id = None;
        }
    }

    /// Turns the strokes drawn on the pad into a drawn overlay centered on the
    /// anchor page. With too few points the pad stays open.
    pub fn finish_drawing(&mut self, store: &mut OverlayStore) -> Result<OverlayId, CaptureError> {
        let Mode::Drawing {
            capture,
            anchor_page,
            ..
        } = &self.mode
        else {
            return Err(CaptureError::Empty { points: 0 });
        };
        let anchor_page = *anchor_page;
        let path = capture.clone().finish()?;

        let preview = match raster::render_preview(&path, &self.config) {
            Ok(png) => Some(png),
            Err(err) => {
                warn!(%err, "could not render signature preview");
                None
            }
        };

        let captured = path.size();
        let geometry = match store.page_bounds(anchor_page) {
            Some(bounds) => {
                let fit = (bounds.width / captured.width)
                    .min(bounds.height / captured.height)
                    .min(1.0);
                let size = captured.scaled(fit);
                Rect::new(
                    Point::new(
                        (bounds.width - size.width) / 2.0,
                        (bounds.height - size.height) / 2.0,
                    ),
                    size,
                )
            }
            None => Rect::new(Point::default(), captured),
        };

        let id = store.create(
            anchor_page,
            geometry,
            OverlayContent::Drawn(DrawnSignature { path, preview }),
        );
        store.select(Some(id));
        self.set_mode(Mode::Idle);
        Ok(id)
    }

    /// Escape: back to idle. Updates already applied stay applied.
    pub fn cancel(&mut self, store: &mut OverlayStore) {
        if let Mode::Dragging { id, .. } | Mode::Resizing { id, .. } = &self.mode {
            store.end_manipulation(*id);
        }
        self.set_mode(Mode::Idle);
    }

    pub fn key_down(&mut self, store: &mut OverlayStore, key: Key) -> Vec<Effect> {
        match key {
            Key::Escape => {
                self.cancel(store);
                Vec::new()
            }
            Key::Delete | Key::Backspace if matches!(self.mode, Mode::Idle) => {
                match store.selected() {
                    Some(id) if store.remove(id) => vec![Effect::Removed(id)],
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn pointer_down(
        &mut self,
        store: &mut OverlayStore,
        surface: &dyn RenderSurface,
        input: PointerInput,
    ) -> Vec<Effect> {
        if !input.is_primary {
            return Vec::new();
        }
        if matches!(self.mode, Mode::Idle | Mode::PlacingNew { .. }) {
            return self.press_on_page(store, surface, input);
        }

        match &mut self.mode {
            Mode::Dragging { .. } | Mode::Resizing { .. } => {
                debug!(pointer = input.pointer_id, "press ignored during manipulation");
                Vec::new()
            }
            Mode::Drawing {
                capture,
                canvas,
                pointer_id,
                ..
            } => {
                if pointer_id.is_none() && canvas.contains(input.client) {
                    capture.begin(canvas_point(canvas, input.client));
                    *pointer_id = Some(input.pointer_id);
                }
                Vec::new()
            }
            Mode::Idle | Mode::PlacingNew { .. } => Vec::new(),
        }
    }

    pub fn pointer_move(
        &mut self,
        store: &mut OverlayStore,
        surface: &dyn RenderSurface,
        input: PointerInput,
    ) -> Vec<Effect> {
        match &mut self.mode {
            Mode::Dragging {
                id,
                pointer_id,
                offset,
                ..
            } if *pointer_id == input.pointer_id => {
                let (id, offset) = (*id, *offset);
                let Some(p) = locate_on_anchor(store, surface, id, input.client) else {
                    return Vec::new();
                };
                let position = Point::new(p.x - offset.x, p.y - offset.y);
                if store.update(id, GeometryPatch::position(position)) {
                    vec![Effect::Updated(id)]
                } else {
                    Vec::new()
                }
            }
            Mode::Resizing {
                id,
                pointer_id,
                corner,
                initial,
                initial_scale,
                initial_pointer,
                pivot,
                ..
            } if *pointer_id == input.pointer_id => {
                let (id, corner, initial, initial_scale) = (*id, *corner, *initial, *initial_scale);
                let initial_distance = initial_pointer.distance(*pivot);
                let pivot = *pivot;
                let Some(p) = locate_on_anchor(store, surface, id, input.client) else {
                    return Vec::new();
                };
                let Some(anchor_page) = store.get(id).map(|o| o.anchor_page) else {
                    return Vec::new();
                };

                let ratio = if initial_distance > f64::EPSILON {
                    p.distance(pivot) / initial_distance
                } else {
                    1.0
                };
                let ratio = clamp_ratio(
                    ratio,
                    &initial,
                    corner,
                    store.min_display_size(anchor_page),
                    store.page_bounds(anchor_page),
                );
                let patch = resize_patch(&initial, corner, ratio, initial_scale);
                if store.update(id, patch) {
                    vec![Effect::Updated(id)]
                } else {
                    Vec::new()
                }
            }
            Mode::Drawing {
                capture,
                canvas,
                pointer_id,
                ..
            } if *pointer_id == Some(input.pointer_id) => {
                capture.extend(canvas_point(canvas, input.client));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn pointer_up(&mut self, store: &mut OverlayStore, input: PointerInput) -> Vec<Effect> {
        match &mut self.mode {
            Mode::Dragging { id, pointer_id, .. } | Mode::Resizing { id, pointer_id, .. }
                if *pointer_id == input.pointer_id =>
            {
                let id = *id;
                store.end_manipulation(id);
                debug!(%id, "manipulation finished");
                self.set_mode(Mode::Idle);
                Vec::new()
            }
            Mode::Drawing {
                capture, pointer_id, ..
            } if *pointer_id == Some(input.pointer_id) => {
                capture.end();
                *pointer_id = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Touch cancellation ends the gesture like a release.
    pub fn pointer_cancel(&mut self, store: &mut OverlayStore, input: PointerInput) -> Vec<Effect> {
        self.pointer_up(store, input)
    }

    fn press_on_page(
        &mut self,
        store: &mut OverlayStore,
        surface: &dyn RenderSurface,
        input: PointerInput,
    ) -> Vec<Effect> {
        let Some(page) = surface.page_at(input.client) else {
            return Vec::new();
        };
        let (Some(container), Some(ctx)) = (surface.container(page), store.page_context(page)) else {
            return Vec::new();
        };
        let p = display_point(input.client, &container, &ctx);

        if let Some((id, corner, rect, scale)) = self.handle_hit(store, page, p) {
            if store.begin_manipulation(id, SelectionState::Resizing) {
                let listeners = Subscription::acquire(&self.listeners);
                debug!(%id, ?corner, "resize started");
                self.set_mode(Mode::Resizing {
                    id,
                    pointer_id: input.pointer_id,
                    corner,
                    initial: rect,
                    initial_scale: scale,
                    initial_pointer: p,
                    pivot: corner.opposite().of(&rect),
                    _listeners: listeners,
                });
            }
            return Vec::new();
        }

        let hit = store
            .list(page)
            .into_iter()
            .rev()
            .find(|o| o.rect().contains(p))
            .map(|o| (o.id, o.position));
        if let Some((id, position)) = hit {
            let previously = store.selected();
            if store.begin_manipulation(id, SelectionState::Dragging) {
                let listeners = Subscription::acquire(&self.listeners);
                debug!(%id, "drag started");
                self.set_mode(Mode::Dragging {
                    id,
                    pointer_id: input.pointer_id,
                    offset: p.offset_from(position),
                    _listeners: listeners,
                });
            }
            return if previously != Some(id) {
                vec![Effect::SelectionChanged(Some(id))]
            } else {
                Vec::new()
            };
        }

        if let Mode::PlacingNew { text, font_size } = &self.mode {
            let (font_size, size) = self.config.fit_text(text, *font_size, store.page_bounds(page));
            let content = TextContent {
                text: text.clone(),
                font_size,
            };
            let id = store.create(page, Rect::new(p, size), OverlayContent::Text(content));
            store.select(Some(id));
            self.set_mode(Mode::Idle);
            return vec![Effect::Created(id), Effect::SelectionChanged(Some(id))];
        }

        if store.selected().is_some() {
            store.select(None);
            return vec![Effect::SelectionChanged(None)];
        }
        Vec::new()
    }

    /// Corner handle of the selected overlay on `page` under `p`, if any.
    fn handle_hit(
        &self,
        store: &OverlayStore,
        page: u32,
        p: Point,
    ) -> Option<(OverlayId, Corner, Rect, f64)> {
        let half = self.config.handle_size / 2.0;
        let selected = store.selected()?;
        let overlay = store.get(selected).filter(|o| o.anchor_page == page)?;
        let rect = overlay.rect();
        Corner::ALL
            .into_iter()
            .find(|corner| {
                let c = corner.of(&rect);
                (p.x - c.x).abs() <= half && (p.y - c.y).abs() <= half
            })
            .map(|corner| (overlay.id, corner, rect, overlay.scale))
    }

    fn set_mode(&mut self, mode: Mode) {
        let from = self.state();
        self.mode = mode;
        debug!(?from, to = ?self.state(), "interaction state");
    }
}

fn canvas_point(canvas: &ContainerRect, client: Point) -> Point {
    Point::new(client.x - canvas.left, client.y - canvas.top)
}

/// Maps a client position into display space of the overlay's anchor page,
/// even when the pointer has wandered off that page.
fn locate_on_anchor(
    store: &OverlayStore,
    surface: &dyn RenderSurface,
    id: OverlayId,
    client: Point,
) -> Option<Point> {
    let page = store.get(id)?.anchor_page;
    let container = surface.container(page)?;
    let ctx = store.page_context(page)?;
    Some(display_point(client, &container, &ctx))
}

/// Bounds a uniform resize so the result is at least `min` and, with the
/// opposite corner held still, stays on the page.
fn clamp_ratio(ratio: f64, initial: &Rect, corner: Corner, min: Size, bounds: Option<Size>) -> f64 {
    let w = initial.size.width.max(f64::EPSILON);
    let h = initial.size.height.max(f64::EPSILON);
    let lower = (min.width / w).max(min.height / h);
    let ratio = if ratio.is_finite() { ratio } else { 1.0 };

    let Some(bounds) = bounds else {
        return ratio.max(lower);
    };
    let anchor = corner.opposite().of(initial);
    let room_x = if corner.is_right() { bounds.width - anchor.x } else { anchor.x };
    let room_y = if corner.is_bottom() { bounds.height - anchor.y } else { anchor.y };
    let upper = (room_x / w).min(room_y / h);
    ratio.min(upper).max(lower)
}

fn resize_patch(initial: &Rect, corner: Corner, ratio: f64, initial_scale: f64) -> GeometryPatch {
    let size = initial.size.scaled(ratio);
    let anchor = corner.opposite().of(initial);
    let x = if corner.is_right() { anchor.x } else { anchor.x - size.width };
    let y = if corner.is_bottom() { anchor.y } else { anchor.y - size.height };
    GeometryPatch {
        position: Some(Point::new(x, y)),
        size: Some(size),
        scale: Some(initial_scale * ratio),
    }
}
