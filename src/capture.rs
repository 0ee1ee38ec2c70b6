//! Freehand stroke recording for drawn signatures.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CaptureError;
use crate::geometry::{Point, Size};

/// Fewest points a capture needs to become a signature.
pub const MIN_CAPTURE_POINTS: usize = 2;

/// Normalized strokes, each point relative to the top-left corner of a
/// `width × height` box that contains all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedPath {
    pub local_paths: Vec<Vec<Point>>,
    pub width: f64,
    pub height: f64,
}

impl CapturedPath {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn point_count(&self) -> usize {
        self.local_paths.iter().map(Vec::len).sum()
    }
}

/// Records pointer drags on the drawing pad. Several strokes can be drawn
/// before [`PathCapture::finish`] normalizes them together.
#[derive(Debug, Clone, Default)]
pub struct PathCapture {
    strokes: Vec<Vec<Point>>,
    active: bool,
    padding: f64,
}

impl PathCapture {
    pub fn new(padding: f64) -> Self {
        Self {
            strokes: Vec::new(),
            active: false,
            padding: padding.max(0.0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn point_count(&self) -> usize {
        self.strokes.iter().map(Vec::len).sum()
    }

    pub fn begin(&mut self, p: Point) {
        self.active = true;
        self.strokes.push(Vec::new());
        self.extend(p);
    }

    /// Ignored unless a stroke is in progress.
    pub fn extend(&mut self, p: Point) {
        if !self.active || !p.is_finite() {
            return;
        }
        if let Some(stroke) = self.strokes.last_mut() {
            stroke.push(p);
        }
    }

    pub fn end(&mut self) {
        self.active = false;
        if self.strokes.last().is_some_and(Vec::is_empty) {
            self.strokes.pop();
        }
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
        self.active = false;
    }

    pub fn finish(mut self) -> Result<CapturedPath, CaptureError> {
        self.end();
        let points = self.point_count();
        if points < MIN_CAPTURE_POINTS {
            return Err(CaptureError::Empty { points });
        }

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in self.strokes.iter().flatten() {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }

        let origin = Point::new(min_x - self.padding, min_y - self.padding);
        let local_paths = self
            .strokes
            .into_iter()
            .map(|stroke| stroke.into_iter().map(|p| p.offset_from(origin)).collect())
            .collect();
        let path = CapturedPath {
            local_paths,
            width: max_x - min_x + 2.0 * self.padding,
            height: max_y - min_y + 2.0 * self.padding,
        };
        debug!(
            points,
            width = path.width,
            height = path.height,
            "capture normalized"
        );
        Ok(path)
    }
}
