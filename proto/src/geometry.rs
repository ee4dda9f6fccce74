use serde::{Deserialize, Serialize};

/// A lon-lat position, WGS84, degrees. Altitude is meters above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
    pub alt: Option<f64>,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self { Self { lon, lat, alt: None } }
}

/// Geometry attached to entities (shape component) and filters.
/// Polygons carry an exterior ring plus zero or more holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Point(Position),
    Line(Vec<Position>),
    Polygon { exterior: Vec<Position>, holes: Vec<Vec<Position>> },
}

impl Geometry {
    /// Axis-aligned bounding rectangle, or None for geometry with no vertices.
    pub fn bounding_rect(&self) -> Option<Rect> {
        let positions: Vec<&Position> = match self {
            Geometry::Point(p) => vec![p],
            Geometry::Line(points) => points.iter().collect(),
            // Holes cannot extend the hull, the exterior ring bounds the polygon
            Geometry::Polygon { exterior, .. } => exterior.iter().collect(),
        };

        let first = positions.first()?;
        let mut rect = Rect { min_lon: first.lon, min_lat: first.lat, max_lon: first.lon, max_lat: first.lat };
        for p in &positions[1..] {
            rect.min_lon = rect.min_lon.min(p.lon);
            rect.min_lat = rect.min_lat.min(p.lat);
            rect.max_lon = rect.max_lon.max(p.lon);
            rect.max_lat = rect.max_lat.max(p.lat);
        }
        Some(rect)
    }
}

/// Axis-aligned bounding box in lon-lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Rect {
    pub fn contains(&self, p: &Position) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }
}
