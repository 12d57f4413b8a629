use serde::{Deserialize, Serialize};

use crate::{
	crs::{Crs, Point, Transformer},
	GenError,
	Result,
};

/// An axis-aligned rectangle in some CRS.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExtentRepr", into = "ExtentRepr")]
pub struct GeographicExtent {
	crs: Crs,
	min_x: f64,
	min_y: f64,
	max_x: f64,
	max_y: f64,
}

impl GeographicExtent {
	pub fn new(crs: Crs, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
		if ![min_x, min_y, max_x, max_y].iter().all(|x| x.is_finite()) {
			return Err(GenError::Config(format!(
				"extent bounds must be finite: [{}, {}, {}, {}]",
				min_x, min_y, max_x, max_y
			)));
		}
		if min_x > max_x || min_y > max_y {
			return Err(GenError::Config(format!(
				"extent minimum exceeds maximum: [{}, {}, {}, {}]",
				min_x, min_y, max_x, max_y
			)));
		}
		crs.validate()?;

		Ok(Self {
			crs,
			min_x,
			min_y,
			max_x,
			max_y,
		})
	}

	pub fn crs(&self) -> Crs { self.crs }

	pub fn min_x(&self) -> f64 { self.min_x }

	pub fn min_y(&self) -> f64 { self.min_y }

	pub fn max_x(&self) -> f64 { self.max_x }

	pub fn max_y(&self) -> f64 { self.max_y }

	pub fn width(&self) -> f64 { self.max_x - self.min_x }

	pub fn height(&self) -> f64 { self.max_y - self.min_y }

	pub fn area(&self) -> f64 { self.width() * self.height() }

	pub fn centre(&self) -> Point { Point::new((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0) }

	pub fn is_empty(&self) -> bool { self.area() == 0.0 }

	/// The overlap of two extents. `None` when they are in different CRSs or only touch.
	pub fn intersection(&self, other: &GeographicExtent) -> Option<GeographicExtent> {
		if self.crs != other.crs {
			return None;
		}
		let min_x = self.min_x.max(other.min_x);
		let min_y = self.min_y.max(other.min_y);
		let max_x = self.max_x.min(other.max_x);
		let max_y = self.max_y.min(other.max_y);
		(min_x < max_x && min_y < max_y).then(|| Self {
			crs: self.crs,
			min_x,
			min_y,
			max_x,
			max_y,
		})
	}

	pub fn intersects(&self, other: &GeographicExtent) -> bool { self.intersection(other).is_some() }

	pub fn contains(&self, p: Point) -> bool {
		p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
	}

	pub fn contains_extent(&self, other: &GeographicExtent) -> bool {
		self.crs == other.crs
			&& other.min_x >= self.min_x
			&& other.max_x <= self.max_x
			&& other.min_y >= self.min_y
			&& other.max_y <= self.max_y
	}

	/// Grow by `dx` horizontally and `dy` vertically on each side.
	pub fn expand(&self, dx: f64, dy: f64) -> Self {
		Self {
			crs: self.crs,
			min_x: self.min_x - dx,
			min_y: self.min_y - dy,
			max_x: self.max_x + dx,
			max_y: self.max_y + dy,
		}
	}

	/// Points along the boundary, `per_edge` of them on each edge, corners included.
	pub fn densify(&self, per_edge: usize) -> Vec<Point> {
		let steps = per_edge.max(2) - 1;
		let mut out = Vec::with_capacity(steps * 4);
		for i in 0..steps {
			let t = i as f64 / steps as f64;
			let x = self.min_x + self.width() * t;
			let y = self.min_y + self.height() * t;
			let rx = self.max_x - self.width() * t;
			let ry = self.max_y - self.height() * t;
			out.push(Point::new(x, self.min_y));
			out.push(Point::new(self.max_x, y));
			out.push(Point::new(rx, self.max_y));
			out.push(Point::new(self.min_x, ry));
		}
		out
	}

	/// The bounding box of this extent in another CRS, from a densified boundary.
	///
	/// Boundary points outside the transform's domain are skipped. Fails only if none of them project.
	pub fn reproject(&self, to: Crs) -> Result<GeographicExtent> {
		if to == self.crs {
			return Ok(*self);
		}
		tracy::zone!("Reproject extent");

		let transformer = Transformer::new(self.crs, to)?;
		let mut first_error = None;
		let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
		let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
		for p in self.densify(9).into_iter().chain(std::iter::once(self.centre())) {
			match transformer.project(p) {
				Ok(p) => {
					min_x = min_x.min(p.x);
					min_y = min_y.min(p.y);
					max_x = max_x.max(p.x);
					max_y = max_y.max(p.y);
				},
				Err(e) => {
					first_error.get_or_insert(e);
				},
			}
		}

		if min_x > max_x {
			return Err(first_error.unwrap_or_else(|| GenError::ProjectionDomain {
				x: self.min_x,
				y: self.min_y,
				from: self.crs.to_string(),
				to: to.to_string(),
			}));
		}
		GeographicExtent::new(to, min_x, min_y, max_x, max_y)
	}

	pub(crate) fn key_bits(&self) -> [u64; 4] {
		[
			self.min_x.to_bits(),
			self.min_y.to_bits(),
			self.max_x.to_bits(),
			self.max_y.to_bits(),
		]
	}
}

#[derive(Serialize, Deserialize)]
struct ExtentRepr {
	crs: Crs,
	min_x: f64,
	min_y: f64,
	max_x: f64,
	max_y: f64,
}

impl TryFrom<ExtentRepr> for GeographicExtent {
	type Error = GenError;

	fn try_from(x: ExtentRepr) -> Result<Self> { GeographicExtent::new(x.crs, x.min_x, x.min_y, x.max_x, x.max_y) }
}

impl From<GeographicExtent> for ExtentRepr {
	fn from(x: GeographicExtent) -> Self {
		Self {
			crs: x.crs,
			min_x: x.min_x,
			min_y: x.min_y,
			max_x: x.max_x,
			max_y: x.max_y,
		}
	}
}
