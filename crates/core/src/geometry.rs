#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// `[longitude, latitude]` or `[longitude, latitude, altitude]`.
pub type Position = Vec<f64>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeometryError {
    InvalidPosition { len: usize },
    NonFiniteCoordinate,
    LongitudeOutOfRange(f64),
    LatitudeOutOfRange(f64),
    LineTooShort { len: usize },
    RingTooShort { len: usize },
    RingNotClosed,
    EmptyPolygon,
}

impl GeometryError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidPosition { .. } => "position must have 2 or 3 coordinates",
            Self::NonFiniteCoordinate => "coordinate is not a finite number",
            Self::LongitudeOutOfRange(_) => "longitude must be within [-180, 180]",
            Self::LatitudeOutOfRange(_) => "latitude must be within [-90, 90]",
            Self::LineTooShort { .. } => "line string needs at least 2 positions",
            Self::RingTooShort { .. } => "linear ring needs at least 4 positions",
            Self::RingNotClosed => "linear ring is not closed",
            Self::EmptyPolygon => "polygon has no rings",
        }
    }
}

impl std::fmt::Display for GeometryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid geometry: ")?;
        f.write_str(self.message())
    }
}

impl std::error::Error for GeometryError {}

pub trait Validate {
    fn validate(&self) -> Result<(), GeometryError>;
}

impl Validate for Geometry {
    fn validate(&self) -> Result<(), GeometryError> {
        match self {
            Self::Point { coordinates } => validate_position(coordinates),
            Self::MultiPoint { coordinates } => coordinates.iter().try_for_each(|p| validate_position(p)),
            Self::LineString { coordinates } => validate_line(coordinates),
            Self::MultiLineString { coordinates } => {
                coordinates.iter().try_for_each(|l| validate_line(l))
            }
            Self::Polygon { coordinates } => validate_polygon(coordinates),
            Self::MultiPolygon { coordinates } => {
                coordinates.iter().try_for_each(|p| validate_polygon(p))
            }
            Self::GeometryCollection { geometries } => {
                geometries.iter().try_for_each(Validate::validate)
            }
        }
    }
}

fn validate_position(position: &[f64]) -> Result<(), GeometryError> {
    if !(2..=3).contains(&position.len()) {
        return Err(GeometryError::InvalidPosition {
            len: position.len(),
        });
    }
    if position.iter().any(|c| !c.is_finite()) {
        return Err(GeometryError::NonFiniteCoordinate);
    }
    let (lon, lat) = (position[0], position[1]);
    if !(-180.0..=180.0).contains(&lon) {
        return Err(GeometryError::LongitudeOutOfRange(lon));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(GeometryError::LatitudeOutOfRange(lat));
    }
    Ok(())
}

fn validate_line(line: &[Position]) -> Result<(), GeometryError> {
    if line.len() < 2 {
        return Err(GeometryError::LineTooShort { len: line.len() });
    }
    line.iter().try_for_each(|p| validate_position(p))
}

fn validate_polygon(rings: &[Vec<Position>]) -> Result<(), GeometryError> {
    if rings.is_empty() {
        return Err(GeometryError::EmptyPolygon);
    }
    for ring in rings {
        if ring.len() < 4 {
            return Err(GeometryError::RingTooShort { len: ring.len() });
        }
        ring.iter().try_for_each(|p| validate_position(p))?;
        if ring.first() != ring.last() {
            return Err(GeometryError::RingNotClosed);
        }
    }
    Ok(())
}

/// `[west, south, east, north]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    fn of_point(p: &[f64]) -> Option<Self> {
        let (lon, lat) = (*p.first()?, *p.get(1)?);
        Some(Self {
            min_lon: lon,
            min_lat: lat,
            max_lon: lon,
            max_lat: lat,
        })
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&lon) && (self.min_lat..=self.max_lat).contains(&lat)
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self {
            min_lon: v[0],
            min_lat: v[1],
            max_lon: v[2],
            max_lat: v[3],
        }
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Point { .. } => "Point",
            Self::MultiPoint { .. } => "MultiPoint",
            Self::LineString { .. } => "LineString",
            Self::MultiLineString { .. } => "MultiLineString",
            Self::Polygon { .. } => "Polygon",
            Self::MultiPolygon { .. } => "MultiPolygon",
            Self::GeometryCollection { .. } => "GeometryCollection",
        }
    }

    /// Bounding box over every position; `None` for empty geometries.
    pub fn bbox(&self) -> Option<BBox> {
        let mut acc: Option<BBox> = None;
        self.for_each_position(&mut |p: &[f64]| {
            if let Some(b) = BBox::of_point(p) {
                acc = Some(match acc {
                    Some(a) => a.union(b),
                    None => b,
                });
            }
        });
        acc
    }

    fn for_each_position(&self, f: &mut dyn FnMut(&[f64])) {
        match self {
            Self::Point { coordinates } => f(coordinates),
            Self::MultiPoint { coordinates } | Self::LineString { coordinates } => {
                coordinates.iter().for_each(|p| f(p))
            }
            Self::MultiLineString { coordinates } | Self::Polygon { coordinates } => coordinates
                .iter()
                .flatten()
                .for_each(|p| f(p)),
            Self::MultiPolygon { coordinates } => coordinates
                .iter()
                .flatten()
                .flatten()
                .for_each(|p| f(p)),
            Self::GeometryCollection { geometries } => {
                for g in geometries {
                    g.for_each_position(f);
                }
            }
        }
    }
}
