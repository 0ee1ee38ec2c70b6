//! Conversions between the three coordinate systems the engine deals with:
//!
//! - client coordinates carried by pointer and touch events,
//! - display space: pixels of a page as currently rendered, origin top-left,
//! - document space: native page units (points), origin bottom-left.
//!
//! Everything here is pure and allocation free.

use serde::{Deserialize, Serialize};

const MIN_DISPLAY_SCALE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn offset_from(self, origin: Point) -> Point {
        Point::new(self.x - origin.x, self.y - origin.y)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn scaled(self, factor: f64) -> Size {
        Size::new(self.width * factor, self.height * factor)
    }
}

/// Axis-aligned rectangle in display space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub const fn new(origin: Point, size: Size) -> Self {
        Self { origin, size }
    }

    pub fn right(&self) -> f64 {
        self.origin.x + self.size.width
    }

    pub fn bottom(&self) -> f64 {
        self.origin.y + self.size.height
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.origin.x + self.size.width / 2.0,
            self.origin.y + self.size.height / 2.0,
        )
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.origin.x && p.x <= self.right() && p.y >= self.origin.y && p.y <= self.bottom()
    }
}

/// Bounding rectangle of a rendered page element, in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ContainerRect {
    pub const fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn contains(&self, client: Point) -> bool {
        client.x >= self.left
            && client.x <= self.left + self.width
            && client.y >= self.top
            && client.y <= self.top + self.height
    }
}

/// How one page is currently shown: its native size and the ratio of display
/// pixels to document units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayContext {
    pub native: Size,
    pub display_scale: f64,
}

impl DisplayContext {
    pub fn new(native: Size, display_scale: f64) -> Self {
        Self {
            native,
            display_scale: sanitize_scale(display_scale),
        }
    }

    pub fn display_size(&self) -> Size {
        self.native.scaled(self.display_scale)
    }
}

fn sanitize_scale(scale: f64) -> f64 {
    if !scale.is_finite() || scale < MIN_DISPLAY_SCALE {
        MIN_DISPLAY_SCALE
    } else {
        scale
    }
}

/// Rectangle in document space, `(x, y)` being its bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DocumentRect {
    pub fn top(&self) -> f64 {
        self.y + self.height
    }
}

/// Resolves a client-space pointer position to display space relative to the
/// page origin. A container stretched by CSS is compensated for.
pub fn display_point(client: Point, container: &ContainerRect, ctx: &DisplayContext) -> Point {
    let display = ctx.display_size();
    let sx = if container.width > 0.0 {
        display.width / container.width
    } else {
        1.0
    };
    let sy = if container.height > 0.0 {
        display.height / container.height
    } else {
        1.0
    };
    Point::new(
        (client.x - container.left) * sx,
        (client.y - container.top) * sy,
    )
}

pub fn document_from_display(rect: Rect, ctx: &DisplayContext) -> DocumentRect {
    let s = ctx.display_scale;
    let height = rect.size.height / s;
    DocumentRect {
        x: rect.origin.x / s,
        y: ctx.native.height - rect.origin.y / s - height,
        width: rect.size.width / s,
        height,
    }
}

pub fn display_from_document(rect: DocumentRect, ctx: &DisplayContext) -> Rect {
    let s = ctx.display_scale;
    Rect::new(
        Point::new(rect.x * s, (ctx.native.height - rect.y - rect.height) * s),
        Size::new(rect.width * s, rect.height * s),
    )
}

pub fn document_length(display: f64, ctx: &DisplayContext) -> f64 {
    display / ctx.display_scale
}

pub fn display_length(document: f64, ctx: &DisplayContext) -> f64 {
    document * ctx.display_scale
}
