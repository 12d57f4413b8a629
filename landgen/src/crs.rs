//! Coordinate reference systems, point reprojection and raster geotransforms.
//!
//! Every transform goes through EPSG:4326: source coordinates are converted to longitude/latitude and from there
//! to the target. There is no incremental transform state, so the result for a point depends only on the point.

use std::{
	fmt::{Debug, Display, Formatter},
	str::FromStr,
};

use proj4rs::{proj::Proj, transform::transform};
use serde::{Deserialize, Serialize};

use crate::{GenError, GeographicExtent, Result};

/// The highest latitude representable in Web Mercator.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// An EPSG coded coordinate reference system.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs(u16);

impl Crs {
	pub const WGS84: Crs = Crs(4326);
	pub const WEB_MERCATOR: Crs = Crs(3857);

	pub const fn epsg(code: u16) -> Self { Self(code) }

	pub fn code(self) -> u16 { self.0 }

	pub fn validate(self) -> Result<()> { self.definition().map(|_| ()) }

	pub fn is_geographic(self) -> bool {
		self.definition()
			.map(|x| x.contains("+proj=longlat"))
			.unwrap_or(false)
	}

	pub fn is_mercator(self) -> bool {
		self.definition()
			.map(|x| x.contains("+proj=merc"))
			.unwrap_or(false)
	}

	fn definition(self) -> Result<&'static str> {
		crs_definitions::from_code(self.0)
			.map(|x| x.proj4)
			.ok_or_else(|| GenError::UnsupportedCrs(self.to_string()))
	}

	fn proj(self) -> Result<Proj> {
		Proj::from_proj_string(self.definition()?)
			.map_err(|e| GenError::UnsupportedCrs(format!("{}: {:?}", self, e)))
	}
}

impl Display for Crs {
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { write!(f, "EPSG:{}", self.0) }
}

impl Debug for Crs {
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { Display::fmt(self, f) }
}

impl FromStr for Crs {
	type Err = GenError;

	fn from_str(s: &str) -> Result<Self> {
		let trimmed = s.trim();
		let code = match trimmed.get(..5) {
			Some(prefix) if prefix.eq_ignore_ascii_case("epsg:") => &trimmed[5..],
			_ => trimmed,
		};
		code.parse()
			.map(Crs)
			.map_err(|_| GenError::UnsupportedCrs(s.to_string()))
	}
}

impl TryFrom<String> for Crs {
	type Error = GenError;

	fn try_from(x: String) -> Result<Self> { x.parse() }
}

impl From<Crs> for String {
	fn from(x: Crs) -> Self { x.to_string() }
}

/// A position in some CRS. `x` is longitude or easting, `y` is latitude or northing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
	pub x: f64,
	pub y: f64,
}

impl Point {
	pub const fn new(x: f64, y: f64) -> Self { Self { x, y } }
}

const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

struct Endpoint {
	crs: Crs,
	proj: Option<Proj>,
	geographic: bool,
	mercator: bool,
}

impl Endpoint {
	fn new(crs: Crs) -> Result<Self> {
		crs.validate()?;
		// EPSG:4326 is the hub, EPSG:3857 is done in closed form.
		let proj = if crs == Crs::WGS84 || crs == Crs::WEB_MERCATOR {
			None
		} else {
			Some(crs.proj()?)
		};
		Ok(Self {
			crs,
			proj,
			geographic: crs.is_geographic(),
			mercator: crs.is_mercator(),
		})
	}

	fn to_hub(&self, p: Point, hub: &Proj) -> Option<Point> {
		if self.crs == Crs::WEB_MERCATOR {
			let lon = (p.x / WEB_MERCATOR_RADIUS).to_degrees();
			let lat = (2.0 * (p.y / WEB_MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
			return Some(Point::new(lon, lat));
		}
		match &self.proj {
			None => Some(p),
			Some(proj) => {
				let mut point = if self.geographic {
					(p.x.to_radians(), p.y.to_radians(), 0.0)
				} else {
					(p.x, p.y, 0.0)
				};
				transform(proj, hub, &mut point).ok()?;
				Some(Point::new(point.0.to_degrees(), point.1.to_degrees()))
			},
		}
	}

	fn from_hub(&self, geo: Point, hub: &Proj) -> Option<Point> {
		if self.crs == Crs::WEB_MERCATOR {
			let y = (std::f64::consts::FRAC_PI_4 + geo.y.to_radians() / 2.0).tan().ln();
			return Some(Point::new(
				WEB_MERCATOR_RADIUS * geo.x.to_radians(),
				WEB_MERCATOR_RADIUS * y,
			));
		}
		match &self.proj {
			None => Some(geo),
			Some(proj) => {
				let mut point = (geo.x.to_radians(), geo.y.to_radians(), 0.0);
				transform(hub, proj, &mut point).ok()?;
				if self.geographic {
					Some(Point::new(point.0.to_degrees(), point.1.to_degrees()))
				} else {
					Some(Point::new(point.0, point.1))
				}
			},
		}
	}

	fn in_domain(&self, p: Point) -> bool {
		if !p.x.is_finite() || !p.y.is_finite() {
			return false;
		}
		if self.geographic {
			p.y.abs() <= 90.0 && p.x.abs() <= 180.0 + 1e-9
		} else {
			true
		}
	}
}

/// A pre-parsed pair of projections.
///
/// Not meant to be kept across await points: build one where it's needed.
pub struct Transformer {
	source: Endpoint,
	target: Endpoint,
	hub: Proj,
}

impl Transformer {
	pub fn new(from: Crs, to: Crs) -> Result<Self> {
		Ok(Self {
			source: Endpoint::new(from)?,
			target: Endpoint::new(to)?,
			hub: Crs::WGS84.proj()?,
		})
	}

	pub fn from(&self) -> Crs { self.source.crs }

	pub fn to(&self) -> Crs { self.target.crs }

	pub fn is_identity(&self) -> bool { self.source.crs == self.target.crs }

	pub fn project(&self, p: Point) -> Result<Point> {
		if !self.source.in_domain(p) {
			return Err(self.domain_error(p));
		}
		if self.is_identity() {
			return Ok(p);
		}

		let geo = self
			.source
			.to_hub(p, &self.hub)
			.ok_or_else(|| self.domain_error(p))?;
		if !geo.x.is_finite() || !geo.y.is_finite() || geo.y.abs() > 90.0 {
			return Err(self.domain_error(p));
		}
		if self.target.mercator && geo.y.abs() > MAX_MERCATOR_LATITUDE {
			return Err(self.domain_error(p));
		}

		let out = self
			.target
			.from_hub(geo, &self.hub)
			.ok_or_else(|| self.domain_error(p))?;
		if out.x.is_finite() && out.y.is_finite() {
			Ok(out)
		} else {
			Err(self.domain_error(p))
		}
	}

	fn domain_error(&self, p: Point) -> GenError {
		GenError::ProjectionDomain {
			x: p.x,
			y: p.y,
			from: self.source.crs.to_string(),
			to: self.target.crs.to_string(),
		}
	}
}

/// Project a single point. Use a [`Transformer`] when projecting many.
pub fn project(point: Point, from: Crs, to: Crs) -> Result<Point> { Transformer::new(from, to)?.project(point) }

/// A GDAL style affine transform from pixel/line to CRS coordinates.
///
/// `x = t[0] + col * t[1] + row * t[2]`, `y = t[3] + col * t[4] + row * t[5]`, where `(0, 0)` is the top-left
/// corner of the top-left pixel.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
	pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
		Self([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height])
	}

	pub fn is_north_up(&self) -> bool { self.0[2] == 0.0 && self.0[4] == 0.0 && self.0[1] > 0.0 && self.0[5] < 0.0 }

	pub fn pixel_to_geo(&self, col: f64, row: f64) -> Point {
		let t = &self.0;
		Point::new(t[0] + col * t[1] + row * t[2], t[3] + col * t[4] + row * t[5])
	}

	/// The inverse of [`Self::pixel_to_geo`]. `None` if the transform is singular.
	pub fn geo_to_pixel(&self, p: Point) -> Option<(f64, f64)> {
		let t = &self.0;
		if t[2] == 0.0 && t[4] == 0.0 {
			if t[1] == 0.0 || t[5] == 0.0 {
				return None;
			}
			return Some(((p.x - t[0]) / t[1], (p.y - t[3]) / t[5]));
		}

		let inv = self.invert()?;
		let point = inv.pixel_to_geo(p.x, p.y);
		Some((point.x, point.y))
	}

	pub fn invert(&self) -> Option<GeoTransform> {
		let t = &self.0;
		let det = t[1] * t[5] - t[2] * t[4];
		if det == 0.0 || !det.is_finite() {
			return None;
		}
		let inv = 1.0 / det;
		Some(GeoTransform([
			(t[2] * t[3] - t[0] * t[5]) * inv,
			t[5] * inv,
			-t[2] * inv,
			(-t[1] * t[3] + t[0] * t[4]) * inv,
			-t[4] * inv,
			t[1] * inv,
		]))
	}

	/// The transform of a grid whose pixels are `factor` times larger, such as an overview level.
	pub fn scaled(&self, factor: f64) -> Self {
		let t = &self.0;
		Self([t[0], t[1] * factor, t[2] * factor, t[3], t[4] * factor, t[5] * factor])
	}

	/// The transform of a sub-grid whose top-left pixel is `(col, row)` of this one.
	pub fn offset(&self, col: f64, row: f64) -> Self {
		let origin = self.pixel_to_geo(col, row);
		let t = &self.0;
		Self([origin.x, t[1], t[2], origin.y, t[4], t[5]])
	}

	/// Pixel width and height, for north-up transforms.
	pub fn pixel_size(&self) -> (f64, f64) { (self.0[1].abs(), self.0[5].abs()) }

	/// The bounding box of a `width` by `height` raster.
	pub fn extent(&self, width: usize, height: usize, crs: Crs) -> Result<GeographicExtent> {
		let corners = [
			self.pixel_to_geo(0.0, 0.0),
			self.pixel_to_geo(width as f64, 0.0),
			self.pixel_to_geo(0.0, height as f64),
			self.pixel_to_geo(width as f64, height as f64),
		];
		let (min_x, max_x) = corners
			.iter()
			.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
		let (min_y, max_y) = corners
			.iter()
			.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));
		GeographicExtent::new(crs, min_x, min_y, max_x, max_y)
	}
}

/// A regular grid of cell centres in some CRS.
///
/// Cell `(col, row)` sits at `origin.x + (col0 + col + 0.5) * resolution` and
/// `origin.y - (row0 + row + 0.5) * resolution`. Computing positions from the absolute index keeps samples bit
/// identical no matter which tile asks for them.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SampleGrid {
	pub crs: Crs,
	pub origin: Point,
	pub resolution: f64,
	pub col0: i64,
	pub row0: i64,
	pub width: usize,
	pub height: usize,
}

impl SampleGrid {
	pub fn from_extent(extent: &GeographicExtent, resolution: f64) -> Self {
		let cells = |len: f64| ((len / resolution).round() as usize).max(1);
		Self {
			crs: extent.crs(),
			origin: Point::new(extent.min_x(), extent.max_y()),
			resolution,
			col0: 0,
			row0: 0,
			width: cells(extent.width()),
			height: cells(extent.height()),
		}
	}

	pub fn cell_centre(&self, col: usize, row: usize) -> Point {
		Point::new(
			self.origin.x + ((self.col0 + col as i64) as f64 + 0.5) * self.resolution,
			self.origin.y - ((self.row0 + row as i64) as f64 + 0.5) * self.resolution,
		)
	}

	pub fn edge_x(&self, col: i64) -> f64 { self.origin.x + (self.col0 + col) as f64 * self.resolution }

	pub fn edge_y(&self, row: i64) -> f64 { self.origin.y - (self.row0 + row) as f64 * self.resolution }

	/// The area covered by the cells, edges included.
	pub fn extent(&self) -> Result<GeographicExtent> {
		GeographicExtent::new(
			self.crs,
			self.edge_x(0),
			self.edge_y(self.height as i64),
			self.edge_x(self.width as i64),
			self.edge_y(0),
		)
	}
}

/// Fractional pixel coordinates of every cell of a [`SampleGrid`] in some raster's grid.
///
/// Integer coordinates are pixel centres. Cells whose transform failed hold `NaN`.
#[derive(Clone, Debug)]
pub struct PixelGrid {
	width: usize,
	height: usize,
	coords: Vec<(f64, f64)>,
}

impl PixelGrid {
	pub fn width(&self) -> usize { self.width }

	pub fn height(&self) -> usize { self.height }

	pub fn get(&self, col: usize, row: usize) -> Option<(f64, f64)> {
		let c = self.coords[row * self.width + col];
		(!c.0.is_nan()).then(|| c)
	}

	pub fn unmapped(&self) -> usize { self.coords.iter().filter(|c| c.0.is_nan()).count() }
}

pub fn extent_to_pixel_grid(
	extent: &GeographicExtent, resolution: f64, raster_crs: Crs, geo_transform: &GeoTransform,
) -> Result<PixelGrid> {
	grid_to_pixels(&SampleGrid::from_extent(extent, resolution), raster_crs, geo_transform)
}

pub fn grid_to_pixels(grid: &SampleGrid, raster_crs: Crs, geo_transform: &GeoTransform) -> Result<PixelGrid> {
	tracy::zone!("Map pixel grid");

	let transformer = Transformer::new(grid.crs, raster_crs)?;
	if geo_transform.invert().is_none() {
		return Err(GenError::Decode("singular geotransform".to_string()));
	}

	let mut coords = Vec::with_capacity(grid.width * grid.height);
	for row in 0..grid.height {
		for col in 0..grid.width {
			let mapped = transformer
				.project(grid.cell_centre(col, row))
				.ok()
				.and_then(|p| geo_transform.geo_to_pixel(p))
				.map(|(x, y)| (x - 0.5, y - 0.5));
			coords.push(mapped.unwrap_or((f64::NAN, f64::NAN)));
		}
	}

	Ok(PixelGrid {
		width: grid.width,
		height: grid.height,
		coords,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn close(a: f64, b: f64, eps: f64) -> bool { (a - b).abs() < eps }

	#[test]
	fn parse_crs() {
		assert_eq!("EPSG:4326".parse::<Crs>().unwrap(), Crs::WGS84);
		assert_eq!("epsg:3857".parse::<Crs>().unwrap(), Crs::WEB_MERCATOR);
		assert_eq!(" 4326 ".parse::<Crs>().unwrap(), Crs::WGS84);
		assert!("EPSG:abc".parse::<Crs>().is_err());
		assert_eq!(Crs::WEB_MERCATOR.to_string(), "EPSG:3857");
	}

	#[test]
	fn geographic_detection() {
		assert!(Crs::WGS84.is_geographic());
		assert!(!Crs::WEB_MERCATOR.is_geographic());
		assert!(Crs::WEB_MERCATOR.is_mercator());
	}

	#[test]
	fn unknown_code_is_unsupported() {
		let err = project(Point::new(0.0, 0.0), Crs::epsg(1), Crs::WGS84).unwrap_err();
		assert!(matches!(err, GenError::UnsupportedCrs(_)));
	}

	#[test]
	fn wgs84_to_mercator() {
		let p = project(Point::new(0.0, 0.0), Crs::WGS84, Crs::WEB_MERCATOR).unwrap();
		assert!(close(p.x, 0.0, 1e-6) && close(p.y, 0.0, 1e-6));

		let p = project(Point::new(180.0, 0.0), Crs::WGS84, Crs::WEB_MERCATOR).unwrap();
		assert!(close(p.x, 20_037_508.342_789_244, 1e-3));
	}

	#[test]
	fn mercator_round_trip() {
		let forward = Transformer::new(Crs::WGS84, Crs::WEB_MERCATOR).unwrap();
		let back = Transformer::new(Crs::WEB_MERCATOR, Crs::WGS84).unwrap();
		for &(lon, lat) in &[(8.5, 47.3), (-122.4, 37.8), (151.2, -33.9), (0.0, 85.0)] {
			let p = back.project(forward.project(Point::new(lon, lat)).unwrap()).unwrap();
			assert!(close(p.x, lon, 1e-7), "{} != {}", p.x, lon);
			assert!(close(p.y, lat, 1e-7), "{} != {}", p.y, lat);
		}
	}

	#[test]
	fn outside_domain() {
		let err = project(Point::new(0.0, 86.0), Crs::WGS84, Crs::WEB_MERCATOR).unwrap_err();
		assert!(matches!(err, GenError::ProjectionDomain { .. }));

		let err = project(Point::new(0.0, 91.0), Crs::WGS84, Crs::WGS84).unwrap_err();
		assert!(matches!(err, GenError::ProjectionDomain { .. }));

		let err = project(Point::new(f64::NAN, 0.0), Crs::WEB_MERCATOR, Crs::WGS84).unwrap_err();
		assert!(matches!(err, GenError::ProjectionDomain { .. }));
	}

	#[test]
	fn geotransform_inverse() {
		let gt = GeoTransform([100.0, 2.0, 0.5, 50.0, 0.25, -3.0]);
		let inv = gt.invert().unwrap();
		let p = gt.pixel_to_geo(7.0, 11.0);
		let back = inv.pixel_to_geo(p.x, p.y);
		assert!(close(back.x, 7.0, 1e-9) && close(back.y, 11.0, 1e-9));
		let (x, y) = gt.geo_to_pixel(p).unwrap();
		assert!(close(x, 7.0, 1e-9) && close(y, 11.0, 1e-9));

		assert!(GeoTransform([0.0, 1.0, 1.0, 0.0, 1.0, 1.0]).invert().is_none());
	}

	#[test]
	fn scaled_and_offset() {
		let gt = GeoTransform::north_up(10.0, 20.0, 0.5, 0.5);
		let level = gt.scaled(4.0);
		assert_eq!(level.pixel_to_geo(1.0, 1.0), Point::new(12.0, 18.0));
		let sub = gt.offset(4.0, 2.0);
		assert_eq!(sub.pixel_to_geo(0.0, 0.0), Point::new(12.0, 19.0));
	}

	#[test]
	fn pixel_grid_uses_pixel_centres() {
		let extent = GeographicExtent::new(Crs::WGS84, 1.0, 1.0, 3.0, 2.0).unwrap();
		let gt = GeoTransform::north_up(0.0, 4.0, 0.5, 0.5);
		let grid = extent_to_pixel_grid(&extent, 0.5, Crs::WGS84, &gt).unwrap();
		assert_eq!((grid.width(), grid.height()), (4, 2));
		assert_eq!(grid.get(0, 0), Some((2.0, 4.0)));
		assert_eq!(grid.get(3, 1), Some((5.0, 5.0)));
		assert_eq!(grid.unmapped(), 0);
	}

	#[test]
	fn unmapped_samples_are_nan() {
		// The top row lies beyond the Mercator limit.
		let extent = GeographicExtent::new(Crs::WGS84, 0.0, 84.0, 2.0, 88.0).unwrap();
		let gt = GeoTransform::north_up(-20_037_508.342_789_244, 20_037_508.342_789_244, 1000.0, 1000.0);
		let grid = extent_to_pixel_grid(&extent, 2.0, Crs::WEB_MERCATOR, &gt).unwrap();
		assert_eq!((grid.width(), grid.height()), (1, 2));
		assert!(grid.get(0, 0).is_none());
		assert!(grid.get(0, 1).is_some());
		assert_eq!(grid.unmapped(), 1);
	}
}
