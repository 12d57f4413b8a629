//! Partitioning a request into tiles on a fixed grid.
//!
//! The grid is anchored at an origin in the output CRS, with columns growing east and rows growing south. A tile's
//! absolute coordinate alone decides what it contains, so overlapping requests produce identical tiles.

use serde::{Deserialize, Serialize};

use crate::{
	crs::{Crs, GeoTransform, Point, SampleGrid, Transformer},
	GenError,
	GeographicExtent,
	Result,
};

/// Upper bound on tiles in one plan.
pub const MAX_TILES: usize = 1 << 20;

/// Absolute position of a tile on the grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
	pub row: i64,
	pub col: i64,
}

/// Placement of the tile grid.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridGeoreference {
	pub crs: Crs,
	pub origin: Point,
	pub resolution: f64,
	pub tile_size: usize,
}

/// A point's place on the grid.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TileLocation {
	pub tile: TileCoord,
	/// Fractional pixel inside the tile, `(0, 0)` being the top-left corner.
	pub pixel_x: f64,
	pub pixel_y: f64,
}

impl GridGeoreference {
	fn edge_x(&self, sample: i64) -> f64 { self.origin.x + sample as f64 * self.resolution }

	fn edge_y(&self, sample: i64) -> f64 { self.origin.y - sample as f64 * self.resolution }

	pub fn tile_extent(&self, tile: TileCoord) -> Result<GeographicExtent> {
		let size = self.tile_size as i64;
		GeographicExtent::new(
			self.crs,
			self.edge_x(tile.col * size),
			self.edge_y((tile.row + 1) * size),
			self.edge_x((tile.col + 1) * size),
			self.edge_y(tile.row * size),
		)
	}

	/// The sample grid of a tile, grown by `halo` samples on every side.
	pub fn sample_grid(&self, tile: TileCoord, halo: usize) -> SampleGrid {
		let size = self.tile_size as i64;
		SampleGrid {
			crs: self.crs,
			origin: self.origin,
			resolution: self.resolution,
			col0: tile.col * size - halo as i64,
			row0: tile.row * size - halo as i64,
			width: self.tile_size + 2 * halo,
			height: self.tile_size + 2 * halo,
		}
	}

	/// The pixel-to-CRS transform of a tile's heightmap.
	pub fn geo_transform(&self, tile: TileCoord) -> GeoTransform {
		let size = self.tile_size as i64;
		GeoTransform::north_up(
			self.edge_x(tile.col * size),
			self.edge_y(tile.row * size),
			self.resolution,
			self.resolution,
		)
	}

	/// Find the tile and pixel containing `point`, given in `crs`.
	pub fn locate(&self, point: Point, crs: Crs) -> Result<TileLocation> {
		let p = Transformer::new(crs, self.crs)?.project(point)?;
		let gx = (p.x - self.origin.x) / self.resolution;
		let gy = (self.origin.y - p.y) / self.resolution;
		let size = self.tile_size as f64;
		let tile = TileCoord {
			row: (gy / size).floor() as i64,
			col: (gx / size).floor() as i64,
		};
		Ok(TileLocation {
			tile,
			pixel_x: gx - tile.col as f64 * size,
			pixel_y: gy - tile.row as f64 * size,
		})
	}

	/// The position of fractional pixel `(pixel_x, pixel_y)` of `tile`, in `crs`.
	pub fn position(&self, tile: TileCoord, pixel_x: f64, pixel_y: f64, crs: Crs) -> Result<Point> {
		let p = self.geo_transform(tile).pixel_to_geo(pixel_x, pixel_y);
		Transformer::new(self.crs, crs)?.project(p)
	}
}

/// A tile of a plan.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlannedTile {
	/// Position relative to the plan's top-left tile.
	pub row: u32,
	pub col: u32,
	pub grid: TileCoord,
	pub extent: GeographicExtent,
	/// The part of the request inside this tile.
	pub coverage: GeographicExtent,
}

#[derive(Clone, Debug)]
pub struct TilePlan {
	request: GeographicExtent,
	georeference: GridGeoreference,
	first: TileCoord,
	rows: u32,
	cols: u32,
}

impl TilePlan {
	pub fn new(extent: GeographicExtent, resolution: f64, tile_size: usize, origin: Point) -> Result<Self> {
		if !(resolution > 0.0) || !resolution.is_finite() {
			return Err(GenError::Config(format!("resolution must be positive, got {}", resolution)));
		}
		if tile_size == 0 {
			return Err(GenError::Config("tile size must be positive".to_string()));
		}
		extent.crs().validate()?;

		let georeference = GridGeoreference {
			crs: extent.crs(),
			origin,
			resolution,
			tile_size,
		};
		let span = tile_size as f64 * resolution;

		let scale = [origin.x, origin.y, extent.min_x(), extent.min_y(), extent.max_x(), extent.max_y()]
			.iter()
			.fold(0.0f64, |a, x| a.max(x.abs()));
		if resolution <= scale * f64::EPSILON * 4.0 {
			return Err(GenError::Config(format!(
				"resolution {} is below the precision of coordinates near {}",
				resolution, scale
			)));
		}

		let c0 = ((extent.min_x() - origin.x) / span).floor();
		let c1 = ((extent.max_x() - origin.x) / span).ceil() - 1.0;
		let r0 = ((origin.y - extent.max_y()) / span).floor();
		let r1 = ((origin.y - extent.min_y()) / span).ceil() - 1.0;
		let estimate = (c1 - c0 + 1.0).max(1.0) * (r1 - r0 + 1.0).max(1.0);
		// Room for the edge corrections below, a tile or two either way.
		let reach = (i64::MAX / tile_size as i64 / 4) as f64;
		if !(estimate <= MAX_TILES as f64) || [c0, c1, r0, r1].iter().any(|x| !(x.abs() < reach)) {
			return Err(GenError::Config(format!(
				"request needs about {:.0} tiles, more than the limit of {}",
				estimate, MAX_TILES
			)));
		}
		let (mut c0, mut c1, mut r0, mut r1) = (c0 as i64, c1 as i64, r0 as i64, r1 as i64);

		// Division rounding can land one tile off the exact edges.
		let size = tile_size as i64;
		let edge = |tile: i64, offset: i64| {
			tile.checked_add(offset)
				.and_then(|x| x.checked_mul(size))
				.ok_or_else(|| GenError::Config(format!("tile {} is out of range", tile)))
		};
		while georeference.edge_x(edge(c0, 0)?) > extent.min_x() {
			c0 -= 1;
		}
		while georeference.edge_x(edge(c0, 1)?) <= extent.min_x() && c0 < c1 {
			c0 += 1;
		}
		while georeference.edge_x(edge(c1, 1)?) < extent.max_x() {
			c1 += 1;
		}
		while georeference.edge_x(edge(c1, 0)?) >= extent.max_x() && c1 > c0 {
			c1 -= 1;
		}
		while georeference.edge_y(edge(r0, 0)?) < extent.max_y() {
			r0 -= 1;
		}
		while georeference.edge_y(edge(r0, 1)?) >= extent.max_y() && r0 < r1 {
			r0 += 1;
		}
		while georeference.edge_y(edge(r1, 1)?) > extent.min_y() {
			r1 += 1;
		}
		while georeference.edge_y(edge(r1, 0)?) <= extent.min_y() && r1 > r0 {
			r1 -= 1;
		}
		let c1 = c1.max(c0);
		let r1 = r1.max(r0);

		let rows = (r1 - r0 + 1) as u64;
		let cols = (c1 - c0 + 1) as u64;
		if rows * cols > MAX_TILES as u64 {
			return Err(GenError::Config(format!(
				"request needs {}x{} tiles, more than the limit of {}",
				cols, rows, MAX_TILES
			)));
		}

		Ok(Self {
			request: extent,
			georeference,
			first: TileCoord { row: r0, col: c0 },
			rows: rows as u32,
			cols: cols as u32,
		})
	}

	pub fn len(&self) -> usize { self.rows as usize * self.cols as usize }

	pub fn is_empty(&self) -> bool { self.len() == 0 }

	pub fn rows(&self) -> u32 { self.rows }

	pub fn cols(&self) -> u32 { self.cols }

	pub fn request(&self) -> &GeographicExtent { &self.request }

	pub fn georeference(&self) -> &GridGeoreference { &self.georeference }

	pub fn tile(&self, row: u32, col: u32) -> Result<PlannedTile> {
		let grid = TileCoord {
			row: self.first.row + row as i64,
			col: self.first.col + col as i64,
		};
		let extent = self.georeference.tile_extent(grid)?;
		let coverage = GeographicExtent::new(
			extent.crs(),
			extent.min_x().max(self.request.min_x()),
			extent.min_y().max(self.request.min_y()),
			extent.max_x().min(self.request.max_x()),
			extent.max_y().min(self.request.max_y()),
		)?;

		Ok(PlannedTile {
			row,
			col,
			grid,
			extent,
			coverage,
		})
	}

	/// Every tile, row by row.
	pub fn tiles(&self) -> Result<Vec<PlannedTile>> {
		let mut out = Vec::with_capacity(self.len());
		for row in 0..self.rows {
			for col in 0..self.cols {
				out.push(self.tile(row, col)?);
			}
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn extent(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> GeographicExtent {
		GeographicExtent::new(Crs::WGS84, min_x, min_y, max_x, max_y).unwrap()
	}

	#[test]
	fn aligned_request() {
		let plan = TilePlan::new(extent(0.0, -2.0, 3.0, 0.0), 0.25, 4, Point::default()).unwrap();
		assert_eq!((plan.rows(), plan.cols()), (2, 3));
		let tile = plan.tile(1, 2).unwrap();
		assert_eq!(tile.grid, TileCoord { row: 1, col: 2 });
		assert_eq!(tile.extent, extent(2.0, -2.0, 3.0, -1.0));
		assert_eq!(tile.coverage, tile.extent);
	}

	#[test]
	fn unaligned_request_is_clipped() {
		let plan = TilePlan::new(extent(0.5, 0.2, 1.7, 0.9), 0.25, 4, Point::default()).unwrap();
		// Tiles are one unit wide, rows grow south from y = 0.
		assert_eq!(plan.tiles().unwrap()[0].grid, TileCoord { row: -1, col: 0 });
		assert_eq!((plan.rows(), plan.cols()), (1, 2));
		let tiles = plan.tiles().unwrap();
		assert_eq!(tiles[0].coverage, extent(0.5, 0.2, 1.0, 0.9));
		assert_eq!(tiles[1].coverage, extent(1.0, 0.2, 1.7, 0.9));
	}

	#[test]
	fn coverages_partition_the_request() {
		let request = extent(-3.3, 10.1, 7.9, 19.45);
		let plan = TilePlan::new(request, 0.1, 16, Point::new(0.05, 0.0)).unwrap();
		let tiles = plan.tiles().unwrap();
		let area: f64 = tiles.iter().map(|t| t.coverage.area()).sum();
		assert!((area - request.area()).abs() < 1e-9);

		for (i, a) in tiles.iter().enumerate() {
			assert!(request.contains_extent(&a.coverage));
			for b in &tiles[i + 1..] {
				assert!(a.coverage.intersection(&b.coverage).is_none());
			}
		}
	}

	#[test]
	fn sample_positions_depend_only_on_grid_coordinate() {
		let a = TilePlan::new(extent(0.0, -1.0, 2.0, 0.0), 0.01, 50, Point::default()).unwrap();
		let b = TilePlan::new(extent(0.6, -1.0, 5.0, 0.0), 0.01, 50, Point::default()).unwrap();
		let ta = a.tiles().unwrap().into_iter().find(|t| t.grid.col == 1).unwrap();
		let tb = b.tiles().unwrap().into_iter().find(|t| t.grid.col == 1).unwrap();
		assert_ne!((ta.row, ta.col), (tb.row, tb.col));
		let ga = a.georeference().sample_grid(ta.grid, 3);
		let gb = b.georeference().sample_grid(tb.grid, 3);
		for (x, y) in [(0, 0), (17, 42), (55, 55)] {
			assert_eq!(ga.cell_centre(x, y), gb.cell_centre(x, y));
		}
	}

	#[test]
	fn locate_and_position() {
		let plan = TilePlan::new(extent(0.0, -2.0, 2.0, 0.0), 0.25, 4, Point::default()).unwrap();
		let geo = plan.georeference();
		let loc = geo.locate(Point::new(1.125, -0.375), Crs::WGS84).unwrap();
		assert_eq!(loc.tile, TileCoord { row: 0, col: 1 });
		assert_eq!((loc.pixel_x, loc.pixel_y), (0.5, 1.5));
		let back = geo.position(loc.tile, loc.pixel_x, loc.pixel_y, Crs::WGS84).unwrap();
		assert_eq!(back, Point::new(1.125, -0.375));
	}

	#[test]
	fn rejects_bad_parameters() {
		let e = extent(0.0, 0.0, 1.0, 1.0);
		assert!(matches!(TilePlan::new(e, 0.0, 4, Point::default()), Err(GenError::Config(_))));
		assert!(matches!(TilePlan::new(e, 0.1, 0, Point::default()), Err(GenError::Config(_))));
		assert!(matches!(TilePlan::new(e, 1e-9, 1, Point::default()), Err(GenError::Config(_))));
	}

	#[test]
	fn extreme_grids_are_config_errors() {
		let e = extent(0.0, 0.0, 1.0, 1.0);
		assert!(matches!(TilePlan::new(e, 1e-20, 64, Point::default()), Err(GenError::Config(_))));
		assert!(matches!(TilePlan::new(e, 1e-12, 64, Point::default()), Err(GenError::Config(_))));
		assert!(matches!(TilePlan::new(e, 1.0, 64, Point::new(1e300, 0.0)), Err(GenError::Config(_))));
		assert!(matches!(TilePlan::new(e, 0.5, MAX_TILES, Point::new(-1e16, 0.0)), Err(GenError::Config(_))));
		// Far from the origin but still resolvable.
		let plan = TilePlan::new(extent(1e6, 0.0, 1e6 + 1.0, 1.0), 0.125, 4, Point::default()).unwrap();
		assert_eq!((plan.rows(), plan.cols()), (2, 2));
	}
}
