//! Canvas element definitions.
//!
//! Elements serialize to the camelCase JSON shape shared by every client on a
//! canvas, with the element variant carried in the `type` field.

mod geometry;
mod text;

pub use geometry::{ArrowPath, Arrowhead, BoxSize, StrokePath};
pub use kurbo::Point;
pub use text::{DEFAULT_FONT_FAMILY, DEFAULT_FONT_SIZE, FontStyle, FontWeight, TextContent, TextDecoration};

use crate::clock::now_millis;
use kurbo::Vec2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an element.
pub type ElementId = String;

/// Default stroke color for new elements.
pub const DEFAULT_STROKE_COLOR: &str = "#ffffff";
/// Default fill color for new elements.
pub const DEFAULT_FILL_COLOR: &str = "transparent";
/// Default stroke width for new elements.
pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;

/// Generate a fresh element identifier.
pub fn new_element_id() -> ElementId {
    Uuid::new_v4().simple().to_string()
}

/// Embedded image content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Image bytes as a `data:` URL.
    pub data_url: String,
    pub width: f64,
    pub height: f64,
}

/// Per-variant geometry and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementShape {
    Rectangle(BoxSize),
    Ellipse(BoxSize),
    Arrow(ArrowPath),
    Freedraw(StrokePath),
    Text(TextContent),
    Image(ImageContent),
}

impl ElementShape {
    /// Variant name as it appears on the wire.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ElementShape::Rectangle(_) => "rectangle",
            ElementShape::Ellipse(_) => "ellipse",
            ElementShape::Arrow(_) => "arrow",
            ElementShape::Freedraw(_) => "freedraw",
            ElementShape::Text(_) => "text",
            ElementShape::Image(_) => "image",
        }
    }
}

/// A drawable element on the shared canvas.
///
/// The identifier is fixed at creation. `is_deleted` marks a tombstone: the
/// element stays in the store so the deletion can propagate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasElement {
    pub id: ElementId,
    pub x: f64,
    pub y: f64,
    pub stroke_color: String,
    pub fill_color: String,
    pub stroke_width: f64,
    pub opacity: f64,
    /// Compositing order, higher draws on top.
    pub z_index: i64,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    /// Hex public key of the author.
    pub created_by: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_deleted: bool,
    #[serde(flatten)]
    pub shape: ElementShape,
}

impl CanvasElement {
    /// Create an element with default styling, anchored at `(x, y)`.
    pub fn new(shape: ElementShape, x: f64, y: f64, created_by: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: new_element_id(),
            x,
            y,
            stroke_color: DEFAULT_STROKE_COLOR.to_string(),
            fill_color: DEFAULT_FILL_COLOR.to_string(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            opacity: 1.0,
            z_index: now,
            created_at: now,
            updated_at: now,
            created_by: created_by.into(),
            is_deleted: false,
            shape,
        }
    }

    /// Convenience constructor for a rectangle.
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64, created_by: impl Into<String>) -> Self {
        Self::new(ElementShape::Rectangle(BoxSize::new(width, height)), x, y, created_by)
    }

    /// Convenience constructor for an ellipse.
    pub fn ellipse(x: f64, y: f64, width: f64, height: f64, created_by: impl Into<String>) -> Self {
        Self::new(ElementShape::Ellipse(BoxSize::new(width, height)), x, y, created_by)
    }

    /// Convenience constructor for a freehand stroke anchored at its first sample.
    pub fn freedraw(points: Vec<Point>, created_by: impl Into<String>) -> Self {
        let origin = points.first().copied().unwrap_or(Point::ZERO);
        Self::new(ElementShape::Freedraw(StrokePath::new(points)), origin.x, origin.y, created_by)
    }

    /// Convenience constructor for a text element.
    pub fn text(x: f64, y: f64, text: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self::new(ElementShape::Text(TextContent::new(text)), x, y, created_by)
    }

    /// Set the stroke color.
    pub fn with_stroke(mut self, color: impl Into<String>, width: f64) -> Self {
        self.stroke_color = color.into();
        self.stroke_width = width;
        self
    }

    /// Set the fill color.
    pub fn with_fill(mut self, color: impl Into<String>) -> Self {
        self.fill_color = color.into();
        self
    }

    /// Anchor point.
    pub fn anchor(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Move the anchor point.
    pub fn translate(&mut self, offset: Vec2) {
        let moved = self.anchor() + offset;
        self.x = moved.x;
        self.y = moved.y;
    }

    /// Variant name as it appears on the wire.
    pub fn kind_name(&self) -> &'static str {
        self.shape.kind_name()
    }
}

/// A partial set of element fields for [`ElementStore::update`](crate::store::ElementStore::update).
///
/// A whole element converts into a patch that overwrites every mutable
/// field, which is how remote updates are applied. The identifier is never
/// part of a patch, and `is_deleted` can only be raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub stroke_color: Option<String>,
    pub fill_color: Option<String>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub z_index: Option<i64>,
    pub created_at: Option<i64>,
    pub created_by: Option<String>,
    pub is_deleted: Option<bool>,
    pub shape: Option<ElementShape>,
}

impl ElementPatch {
    /// Patch that moves the anchor point.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Patch that replaces the geometry/content.
    pub fn shape(shape: ElementShape) -> Self {
        Self {
            shape: Some(shape),
            ..Self::default()
        }
    }

    /// Patch that sets the z-order value.
    pub fn z_index(z_index: i64) -> Self {
        Self {
            z_index: Some(z_index),
            ..Self::default()
        }
    }

    /// Patch that marks the element deleted.
    pub fn tombstone() -> Self {
        Self {
            is_deleted: Some(true),
            ..Self::default()
        }
    }

    /// Merge the patch into `element`, refreshing its update timestamp.
    pub(crate) fn apply_to(self, element: &mut CanvasElement, now: i64) {
        if let Some(x) = self.x {
            element.x = x;
        }
        if let Some(y) = self.y {
            element.y = y;
        }
        if let Some(color) = self.stroke_color {
            element.stroke_color = color;
        }
        if let Some(color) = self.fill_color {
            element.fill_color = color;
        }
        if let Some(width) = self.stroke_width {
            element.stroke_width = width;
        }
        if let Some(opacity) = self.opacity {
            element.opacity = opacity;
        }
        if let Some(z) = self.z_index {
            element.z_index = z;
        }
        if let Some(created_at) = self.created_at {
            element.created_at = created_at;
        }
        if let Some(created_by) = self.created_by {
            element.created_by = created_by;
        }
        if let Some(shape) = self.shape {
            element.shape = shape;
        }
        element.is_deleted |= self.is_deleted.unwrap_or(false);
        element.updated_at = now;
    }
}

impl From<CanvasElement> for ElementPatch {
    fn from(element: CanvasElement) -> Self {
        Self {
            x: Some(element.x),
            y: Some(element.y),
            stroke_color: Some(element.stroke_color),
            fill_color: Some(element.fill_color),
            stroke_width: Some(element.stroke_width),
            opacity: Some(element.opacity),
            z_index: Some(element.z_index),
            created_at: Some(element.created_at),
            created_by: Some(element.created_by),
            is_deleted: Some(element.is_deleted),
            shape: Some(element.shape),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
