//! Geometry payloads for box-shaped and path-shaped elements.

use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// Width and height of a rectangle, ellipse or image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxSize {
    pub width: f64,
    pub height: f64,
}

impl BoxSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Rectangle anchored at the given top-left corner.
    pub fn rect_at(&self, origin: Point) -> Rect {
        Rect::from_origin_size(origin, (self.width, self.height))
    }
}

/// Arrowhead style at either end of an arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arrowhead {
    None,
    #[default]
    Arrow,
}

/// Polyline of an arrow with its arrowheads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrowPath {
    pub points: Vec<Point>,
    #[serde(default = "no_arrowhead")]
    pub start_arrowhead: Arrowhead,
    #[serde(default)]
    pub end_arrowhead: Arrowhead,
}

impl ArrowPath {
    /// Straight arrow between two points with a head at the end.
    pub fn between(start: Point, end: Point) -> Self {
        Self {
            points: vec![start, end],
            start_arrowhead: Arrowhead::None,
            end_arrowhead: Arrowhead::Arrow,
        }
    }
}

/// Freehand stroke samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrokePath {
    pub points: Vec<Point>,
}

impl StrokePath {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Append a sample.
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Bounding box of all samples, if any.
    pub fn bounds(&self) -> Option<Rect> {
        let first = self.points.first()?;
        let init = Rect::from_points(*first, *first);
        Some(self.points.iter().fold(init, |acc, p| acc.union_pt(*p)))
    }
}

fn no_arrowhead() -> Arrowhead {
    Arrowhead::None
}
