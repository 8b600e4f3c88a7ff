//! Geometry records, metadata values, and the textual ingest grammar.
//!
//! An input line is a whitespace-separated run of `lat,lon` coordinate
//! tokens followed by optional metadata tokens:
//!
//! - `bits:value` — a fixed-width inline field (inline stores),
//! - `key=value` — a named tag (tagged stores),
//! - `:value` — an anonymous tag.
//!
//! Tag values may be JSON-style quoted strings with escapes; bare values
//! that parse as integers or numbers are stored typed.

use crate::bits::CoordVec;
use geo::Point;
use smallvec::SmallVec;
use thiserror::Error;

/// Bits used by the geometry type code in a pool entry tag.
pub const GEOM_TYPE_BITS: u32 = 4;

/// Geometry type carried in the low bits of a pool entry tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeomType {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    Collection,
}

impl GeomType {
    pub fn code(self) -> u8 {
        match self {
            GeomType::Point => 0,
            GeomType::MultiPoint => 1,
            GeomType::LineString => 2,
            GeomType::MultiLineString => 3,
            GeomType::Polygon => 4,
            GeomType::MultiPolygon => 5,
            GeomType::Collection => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => GeomType::Point,
            1 => GeomType::MultiPoint,
            2 => GeomType::LineString,
            3 => GeomType::MultiLineString,
            4 => GeomType::Polygon,
            5 => GeomType::MultiPolygon,
            6 => GeomType::Collection,
            _ => return None,
        })
    }
}

/// A typed metadata value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    String(String),
    Integer(i64),
    Number(f64),
}

/// Value-type codes used in pool entries.
impl TagValue {
    pub fn type_code(&self) -> i64 {
        match self {
            TagValue::String(_) => 0,
            TagValue::Integer(_) => -1,
            TagValue::Number(_) => -2,
        }
    }
}

/// A named metadata value. Anonymous (`:value`) tags carry an empty key.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: TagValue,
}

/// One fixed-width inline metadata field: `bits` bits of `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InlineField {
    pub bits: u32,
    pub value: i64,
}

/// Metadata attached to a decoded record.
#[derive(Clone, Debug, PartialEq)]
pub enum Metadata {
    None,
    /// Raw inline bit field (inline stores).
    Inline(u64),
    /// Key/value tags resolved through the pool (tagged stores).
    Tags(Vec<Tag>),
}

/// A decoded geometry record: parallel world-coordinate arrays plus
/// metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub xs: CoordVec,
    pub ys: CoordVec,
    pub geom: GeomType,
    pub metadata: Metadata,
}

impl Record {
    pub fn vertex_count(&self) -> usize {
        self.xs.len()
    }

    /// Vertices as lon/lat points, in order.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.xs
            .iter()
            .zip(self.ys.iter())
            .map(|(&x, &y)| crate::projection::unproject(x, y))
    }
}

/// A parsed (not yet projected) input feature.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    /// Lon/lat vertices in input order.
    pub points: SmallVec<[Point; 4]>,
    /// `bits:value` inline fields, in input order.
    pub fields: SmallVec<[InlineField; 2]>,
    /// `key=value` and `:value` tags, in input order.
    pub tags: Vec<Tag>,
}

impl Feature {
    /// Build a feature from bare points with no metadata.
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Self {
        Self {
            points: points.into_iter().collect(),
            fields: SmallVec::new(),
            tags: Vec::new(),
        }
    }

    pub fn geom_type(&self) -> GeomType {
        if self.points.len() > 1 {
            GeomType::LineString
        } else {
            GeomType::Point
        }
    }
}

/// Reasons an input line cannot become a feature. These are advisory: the
/// ingest layer logs them and moves on.
#[derive(Error, Debug, PartialEq)]
pub enum LineError {
    #[error("no coordinates")]
    NoCoordinates,
    #[error("bad coordinate pair {0:?}")]
    BadCoordinate(String),
    #[error("unparsable token {0:?}")]
    BadToken(String),
}

/// Split a line into whitespace-separated tokens, keeping quoted sections
/// (with backslash escapes) intact.
fn tokenize(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let start = i;

        let mut quoted = false;
        while i < bytes.len() && (quoted || !bytes[i].is_ascii_whitespace()) {
            match bytes[i] {
                b'"' => quoted = !quoted,
                b'\\' if quoted && i + 1 < bytes.len() => i += 1,
                _ => {}
            }
            i += 1;
        }

        if i > start {
            tokens.push(&line[start..i]);
        }
    }

    tokens
}

fn parse_value(raw: &str) -> TagValue {
    if raw.starts_with('"') {
        if let Ok(s) = serde_json::from_str::<String>(raw) {
            return TagValue::String(s);
        }
    }
    if let Ok(i) = raw.parse::<i64>() {
        return TagValue::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return TagValue::Number(f);
        }
    }
    TagValue::String(raw.to_string())
}

/// Parse one input line into a [`Feature`].
pub fn parse_line(line: &str) -> std::result::Result<Feature, LineError> {
    let mut feature = Feature {
        points: SmallVec::new(),
        fields: SmallVec::new(),
        tags: Vec::new(),
    };

    for token in tokenize(line) {
        if let Some((key, value)) = token.split_once('=') {
            if key.is_empty() {
                return Err(LineError::BadToken(token.to_string()));
            }
            feature.tags.push(Tag {
                key: key.to_string(),
                value: parse_value(value),
            });
        } else if let Some((bits, value)) = token.split_once(':') {
            if bits.is_empty() {
                feature.tags.push(Tag {
                    key: String::new(),
                    value: parse_value(value),
                });
            } else {
                let bits: u32 = bits
                    .parse()
                    .map_err(|_| LineError::BadToken(token.to_string()))?;
                let value: i64 = value
                    .parse()
                    .map_err(|_| LineError::BadToken(token.to_string()))?;
                feature.fields.push(InlineField { bits, value });
            }
        } else if token.contains(',') {
            let (lat, lon) = token
                .split_once(',')
                .filter(|(lat, lon)| !lat.is_empty() && !lon.is_empty())
                .ok_or_else(|| LineError::BadCoordinate(token.to_string()))?;
            let lat: f64 = lat
                .parse()
                .map_err(|_| LineError::BadCoordinate(token.to_string()))?;
            let lon: f64 = lon
                .parse()
                .map_err(|_| LineError::BadCoordinate(token.to_string()))?;
            feature.points.push(Point::new(lon, lat));
        } else {
            return Err(LineError::BadToken(token.to_string()));
        }
    }

    if feature.points.is_empty() {
        return Err(LineError::NoCoordinates);
    }

    Ok(feature)
}

/// Longest shared leading-bit prefix across a record's vertices.
///
/// The returned value is the largest `common <= half` such that every
/// vertex agrees with the first on its top `common` bits of both x and y.
/// Single-vertex records report 0. Duplicate consecutive vertices are left
/// as-is; they simply agree on every bit.
pub fn shared_prefix_bits(xs: &[u32], ys: &[u32], half: u32) -> u32 {
    if xs.len() < 2 {
        return 0;
    }

    let mut common = 0;
    while common < half {
        let shift = 31 - common;
        let x0 = (xs[0] >> shift) & 1;
        let y0 = (ys[0] >> shift) & 1;

        let agree = xs[1..]
            .iter()
            .zip(ys[1..].iter())
            .all(|(&x, &y)| (x >> shift) & 1 == x0 && (y >> shift) & 1 == y0);

        if !agree {
            break;
        }
        common += 1;
    }

    common
}

/// Project a feature's vertices to world coordinates.
///
/// Returns `None` if any vertex is outside the projectable range; the
/// whole record is rejected, never partially stored.
pub fn project_feature(feature: &Feature) -> Option<(CoordVec, CoordVec)> {
    let mut xs = CoordVec::with_capacity(feature.points.len());
    let mut ys = CoordVec::with_capacity(feature.points.len());

    for point in &feature.points {
        let (x, y) = crate::projection::project(point)?;
        xs.push(x);
        ys.push(y);
    }

    Some((xs, ys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_point() {
        let feature = parse_line("40.0,-73.0").unwrap();
        assert_eq!(feature.points.len(), 1);
        assert_eq!(feature.points[0].x(), -73.0);
        assert_eq!(feature.points[0].y(), 40.0);
        assert_eq!(feature.geom_type(), GeomType::Point);
    }

    #[test]
    fn test_parse_polyline_with_inline_fields() {
        let feature = parse_line("40.0,-73.0 40.1,-73.2 8:5 4:-1").unwrap();
        assert_eq!(feature.points.len(), 2);
        assert_eq!(feature.geom_type(), GeomType::LineString);
        assert_eq!(
            feature.fields.as_slice(),
            &[
                InlineField { bits: 8, value: 5 },
                InlineField { bits: 4, value: -1 }
            ]
        );
    }

    #[test]
    fn test_parse_tags() {
        let feature = parse_line(r#"40.0,-73.0 name="main st" lanes=2 grade=0.5 :7"#).unwrap();
        assert_eq!(feature.tags.len(), 4);
        assert_eq!(
            feature.tags[0],
            Tag {
                key: "name".to_string(),
                value: TagValue::String("main st".to_string()),
            }
        );
        assert_eq!(feature.tags[1].value, TagValue::Integer(2));
        assert_eq!(feature.tags[2].value, TagValue::Number(0.5));
        assert_eq!(feature.tags[3].key, "");
        assert_eq!(feature.tags[3].value, TagValue::Integer(7));
    }

    #[test]
    fn test_parse_quoted_escapes() {
        let feature = parse_line(r#"1.0,2.0 name="say \"hi\" \\ there""#).unwrap();
        assert_eq!(
            feature.tags[0].value,
            TagValue::String(r#"say "hi" \ there"#.to_string())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_line(""), Err(LineError::NoCoordinates));
        assert_eq!(parse_line("8:5"), Err(LineError::NoCoordinates));
        assert!(matches!(
            parse_line("40.0,-73.0 what"),
            Err(LineError::BadToken(_))
        ));
        assert!(matches!(
            parse_line("40.0,abc"),
            Err(LineError::BadCoordinate(_))
        ));
        assert!(matches!(
            parse_line("nine:9 1,2"),
            Err(LineError::BadToken(_))
        ));
    }

    #[test]
    fn test_shared_prefix() {
        // Disagreement in the very first bit pair.
        assert_eq!(shared_prefix_bits(&[0, u32::MAX], &[0, 0], 24), 0);

        // Identical vertices agree everywhere; capped at half.
        assert_eq!(shared_prefix_bits(&[7, 7, 7], &[9, 9, 9], 24), 24);

        // Single vertex: no prefix by definition.
        assert_eq!(shared_prefix_bits(&[42], &[42], 24), 0);

        // Differ in x bit 16: 31 - 16 = 15 leading bits agree.
        let a = 0xAAAA_0000u32;
        let b = a ^ (1 << 16);
        assert_eq!(shared_prefix_bits(&[a, b], &[0, 0], 24), 15);

        // y disagreement counts too.
        assert_eq!(shared_prefix_bits(&[a, a], &[0, 1 << 20], 24), 11);
    }

    #[test]
    fn test_geom_type_codes() {
        for code in 0..7u8 {
            assert_eq!(GeomType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(GeomType::from_code(7), None);
    }
}
