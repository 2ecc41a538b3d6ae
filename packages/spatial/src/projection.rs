//! Local planar projection and geometry helpers.
//!
//! Upstream layers arrive as WGS84 `GeoJSON`. Distances and areas are
//! computed after projecting every geometry of a request with one
//! [`LocalProjection`] centered on that request's extent, which keeps
//! errors negligible at city scale.

use geo::{Area, BoundingRect, Centroid, Coord, Geometry, InteriorPoint, MapCoords};
use sirtep_provision_models::PlanarPoint;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Equirectangular projection centered on a reference longitude/latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    origin_lon: f64,
    origin_lat: f64,
    cos_lat: f64,
}

impl LocalProjection {
    /// Projection centered on the given WGS84 point.
    #[must_use]
    pub fn centered_on(lon: f64, lat: f64) -> Self {
        Self {
            origin_lon: lon,
            origin_lat: lat,
            cos_lat: lat.to_radians().cos(),
        }
    }

    /// Projection centered on the bounding box of all `geometries`.
    ///
    /// Returns `None` when no geometry has a bounding box.
    #[must_use]
    pub fn for_geometries<'a, I>(geometries: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Geometry<f64>>,
    {
        let mut bounds: Option<(Coord<f64>, Coord<f64>)> = None;
        for rect in geometries.into_iter().filter_map(|g| g.bounding_rect()) {
            bounds = Some(match bounds {
                None => (rect.min(), rect.max()),
                Some((min, max)) => (
                    Coord {
                        x: min.x.min(rect.min().x),
                        y: min.y.min(rect.min().y),
                    },
                    Coord {
                        x: max.x.max(rect.max().x),
                        y: max.y.max(rect.max().y),
                    },
                ),
            });
        }
        bounds.map(|(min, max)| {
            Self::centered_on(f64::midpoint(min.x, max.x), f64::midpoint(min.y, max.y))
        })
    }

    /// Projects one WGS84 coordinate to local meters.
    #[must_use]
    pub fn project_coord(&self, lon: f64, lat: f64) -> Coord<f64> {
        Coord {
            x: EARTH_RADIUS_M * (lon - self.origin_lon).to_radians() * self.cos_lat,
            y: EARTH_RADIUS_M * (lat - self.origin_lat).to_radians(),
        }
    }

    /// Projects a whole geometry to local meters.
    #[must_use]
    pub fn project(&self, geometry: &Geometry<f64>) -> Geometry<f64> {
        geometry.map_coords(|c| self.project_coord(c.x, c.y))
    }
}

/// Centroid of a projected geometry, `None` for empty or degenerate input.
#[must_use]
pub fn centroid(geometry: &Geometry<f64>) -> Option<PlanarPoint> {
    geometry
        .centroid()
        .map(|p| PlanarPoint::new(p.x(), p.y()))
        .filter(PlanarPoint::is_finite)
}

/// A point guaranteed to lie on the geometry (the centroid of a
/// crescent-shaped polygon may fall outside it).
#[must_use]
pub fn representative_point(geometry: &Geometry<f64>) -> Option<PlanarPoint> {
    geometry
        .interior_point()
        .map(|p| PlanarPoint::new(p.x(), p.y()))
        .filter(PlanarPoint::is_finite)
}

/// Unsigned area of a projected geometry, in square meters.
#[must_use]
pub fn area(geometry: &Geometry<f64>) -> f64 {
    geometry.unsigned_area()
}

/// Whether the geometry has a non-zero area by construction.
#[must_use]
pub const fn is_areal(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) | Geometry::Rect(_) | Geometry::Triangle(_)
    )
}

/// Converts a `GeoJSON` geometry into a [`geo::Geometry`].
#[must_use]
pub fn from_geojson(geometry: &geojson::Geometry) -> Option<Geometry<f64>> {
    Geometry::<f64>::try_from(geometry.clone()).ok()
}
