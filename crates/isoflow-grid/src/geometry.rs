// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Planar polygon geometry in lon/lat degrees.
//!
//! Only what rasterization needs: ring areas, envelopes, and the exact area
//! of a polygon clipped to an axis-aligned rectangle. Rings may be given
//! open or closed (first point repeated); winding order does not matter.

use serde::{Deserialize, Serialize};

/// A lon/lat position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    /// Longitude in decimal degrees.
    pub x: f64,
    /// Latitude in decimal degrees.
    pub y: f64,
}

impl Coord {
    /// Create a coordinate from longitude and latitude.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    /// Western edge.
    pub min_x: f64,
    /// Southern edge.
    pub min_y: f64,
    /// Eastern edge.
    pub max_x: f64,
    /// Northern edge.
    pub max_y: f64,
}

impl Envelope {
    fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    fn expand(&mut self, c: Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    fn merge(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Area of the box.
    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0) * (self.max_y - self.min_y).max(0.0)
    }

    /// Closed ring tracing the box counter-clockwise.
    pub fn to_ring(&self) -> Vec<Coord> {
        vec![
            Coord::new(self.min_x, self.min_y),
            Coord::new(self.max_x, self.min_y),
            Coord::new(self.max_x, self.max_y),
            Coord::new(self.min_x, self.max_y),
            Coord::new(self.min_x, self.min_y),
        ]
    }
}

/// A polygon with one exterior ring and any number of holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    /// Outer boundary.
    pub exterior: Vec<Coord>,
    /// Holes, each lying inside the exterior.
    #[serde(default)]
    pub interiors: Vec<Vec<Coord>>,
}

impl Polygon {
    /// Polygon without holes.
    pub fn new(exterior: Vec<Coord>) -> Self {
        Self {
            exterior,
            interiors: Vec::new(),
        }
    }

    /// Polygon covering an envelope.
    pub fn from_envelope(env: &Envelope) -> Self {
        Self::new(env.to_ring())
    }

    /// Planar area in square degrees.
    pub fn area(&self) -> f64 {
        let holes: f64 = self.interiors.iter().map(|r| ring_area(r)).sum();
        (ring_area(&self.exterior) - holes).max(0.0)
    }

    /// Bounding box of the exterior ring.
    pub fn envelope(&self) -> Envelope {
        let mut env = Envelope::empty();
        for c in &self.exterior {
            env.expand(*c);
        }
        env
    }

    /// Area of the part of this polygon inside `rect`.
    pub fn intersection_area(&self, rect: &Envelope) -> f64 {
        let outer = ring_area(&clip_ring(&self.exterior, rect));
        let holes: f64 = self
            .interiors
            .iter()
            .map(|r| ring_area(&clip_ring(r, rect)))
            .sum();
        (outer - holes).max(0.0)
    }
}

/// Vector geometry accepted by [`Grid::rasterize`](crate::Grid::rasterize).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "polygons", rename_all = "PascalCase")]
pub enum Geometry {
    /// A single polygon.
    Polygon(Polygon),
    /// Non-overlapping polygons treated as one feature.
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    /// Planar area in square degrees.
    pub fn area(&self) -> f64 {
        match self {
            Geometry::Polygon(p) => p.area(),
            Geometry::MultiPolygon(ps) => ps.iter().map(Polygon::area).sum(),
        }
    }

    /// Bounding box of all members.
    pub fn envelope(&self) -> Envelope {
        match self {
            Geometry::Polygon(p) => p.envelope(),
            Geometry::MultiPolygon(ps) => {
                let mut env = Envelope::empty();
                for p in ps {
                    env.merge(&p.envelope());
                }
                env
            }
        }
    }

    /// Area of the part of this geometry inside `rect`.
    pub fn intersection_area(&self, rect: &Envelope) -> f64 {
        match self {
            Geometry::Polygon(p) => p.intersection_area(rect),
            Geometry::MultiPolygon(ps) => ps.iter().map(|p| p.intersection_area(rect)).sum(),
        }
    }
}

impl From<Polygon> for Geometry {
    fn from(p: Polygon) -> Self {
        Geometry::Polygon(p)
    }
}

/// Unsigned shoelace area of a ring.
fn ring_area(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        twice += a.x * b.y - b.x * a.y;
    }
    (twice / 2.0).abs()
}

#[derive(Clone, Copy)]
enum Edge {
    Left(f64),
    Right(f64),
    Bottom(f64),
    Top(f64),
}

impl Edge {
    fn inside(self, c: Coord) -> bool {
        match self {
            Edge::Left(v) => c.x >= v,
            Edge::Right(v) => c.x <= v,
            Edge::Bottom(v) => c.y >= v,
            Edge::Top(v) => c.y <= v,
        }
    }

    fn crossing(self, a: Coord, b: Coord) -> Coord {
        match self {
            Edge::Left(v) | Edge::Right(v) => {
                let t = (v - a.x) / (b.x - a.x);
                Coord::new(v, a.y + t * (b.y - a.y))
            }
            Edge::Bottom(v) | Edge::Top(v) => {
                let t = (v - a.y) / (b.y - a.y);
                Coord::new(a.x + t * (b.x - a.x), v)
            }
        }
    }
}

/// Clip a ring to a rectangle (Sutherland-Hodgman).
///
/// The clip window is convex, so the shoelace area of the output equals the
/// area of the intersection even for concave input rings; degenerate
/// zero-width slivers along the window edges contribute nothing.
fn clip_ring(ring: &[Coord], rect: &Envelope) -> Vec<Coord> {
    let mut points: Vec<Coord> = ring.to_vec();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    for edge in [
        Edge::Left(rect.min_x),
        Edge::Right(rect.max_x),
        Edge::Bottom(rect.min_y),
        Edge::Top(rect.max_y),
    ] {
        if points.is_empty() {
            break;
        }
        let input = std::mem::take(&mut points);
        let mut prev = input[input.len() - 1];
        for &cur in &input {
            match (edge.inside(cur), edge.inside(prev)) {
                (true, true) => points.push(cur),
                (true, false) => {
                    points.push(edge.crossing(prev, cur));
                    points.push(cur);
                }
                (false, true) => points.push(edge.crossing(prev, cur)),
                (false, false) => {}
            }
            prev = cur;
        }
    }
    points
}
