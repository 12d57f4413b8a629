use crate::{
	crs::{Crs, GeoTransform},
	GenError,
	GeographicExtent,
	Result,
};

/// The largest mosaic assembled for a single fetch, per side.
pub const MAX_MOSAIC_SIZE: usize = 16384;

/// A rectangle of pixels. May start at negative coordinates when it hangs off a raster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PixelWindow {
	pub x: i64,
	pub y: i64,
	pub width: usize,
	pub height: usize,
}

impl PixelWindow {
	pub fn new(x: i64, y: i64, width: usize, height: usize) -> Self { Self { x, y, width, height } }

	pub fn right(&self) -> i64 { self.x + self.width as i64 }

	pub fn bottom(&self) -> i64 { self.y + self.height as i64 }

	pub fn is_empty(&self) -> bool { self.width == 0 || self.height == 0 }

	pub fn intersect(&self, other: &PixelWindow) -> Option<PixelWindow> {
		let x = self.x.max(other.x);
		let y = self.y.max(other.y);
		let right = self.right().min(other.right());
		let bottom = self.bottom().min(other.bottom());
		(x < right && y < bottom).then(|| PixelWindow::new(x, y, (right - x) as usize, (bottom - y) as usize))
	}
}

/// The pixel grid of a raster, or of one of its overview levels.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RasterGrid {
	pub crs: Crs,
	pub geo_transform: GeoTransform,
	pub width: u64,
	pub height: u64,
}

impl RasterGrid {
	pub fn bounds(&self) -> PixelWindow { PixelWindow::new(0, 0, self.width as usize, self.height as usize) }

	/// The grid with pixels `2^level` times larger.
	pub fn level(&self, level: u32) -> RasterGrid {
		let factor = 1u64 << level;
		RasterGrid {
			crs: self.crs,
			geo_transform: self.geo_transform.scaled(factor as f64),
			width: ((self.width + factor - 1) / factor).max(1),
			height: ((self.height + factor - 1) / factor).max(1),
		}
	}

	/// The pixels touching `extent` (in the grid's CRS), grown by `margin` pixels on every side.
	///
	/// Not clamped to the grid.
	pub fn window_for(&self, extent: &GeographicExtent, margin: i64) -> Result<PixelWindow> {
		let corners = [
			(extent.min_x(), extent.min_y()),
			(extent.max_x(), extent.max_y()),
			(extent.min_x(), extent.max_y()),
			(extent.max_x(), extent.min_y()),
		];
		let mut lo = (f64::INFINITY, f64::INFINITY);
		let mut hi = (f64::NEG_INFINITY, f64::NEG_INFINITY);
		for (x, y) in corners {
			let (px, py) = self
				.geo_transform
				.geo_to_pixel(crate::crs::Point::new(x, y))
				.ok_or_else(|| GenError::Decode("singular geotransform".to_string()))?;
			lo = (lo.0.min(px), lo.1.min(py));
			hi = (hi.0.max(px), hi.1.max(py));
		}

		let x0 = lo.0.floor() as i64 - margin;
		let y0 = lo.1.floor() as i64 - margin;
		let x1 = (hi.0.ceil() as i64).max(x0 + margin + 1) + margin;
		let y1 = (hi.1.ceil() as i64).max(y0 + margin + 1) + margin;
		let window = PixelWindow::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize);

		if window.width > MAX_MOSAIC_SIZE || window.height > MAX_MOSAIC_SIZE {
			return Err(GenError::SourceUnavailable(format!(
				"a {}x{} pixel read exceeds the mosaic limit of {}",
				window.width, window.height, MAX_MOSAIC_SIZE
			)));
		}
		Ok(window)
	}

	pub fn window_transform(&self, window: &PixelWindow) -> GeoTransform {
		self.geo_transform.offset(window.x as f64, window.y as f64)
	}

	pub fn window_extent(&self, window: &PixelWindow) -> Result<GeographicExtent> {
		self.window_transform(window)
			.extent(window.width, window.height, self.crs)
	}
}

/// Decoded samples of one raster region.
///
/// Samples are row-major, `valid` is `false` for no-data. The classification grid, if present, shares the mask.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterBlock {
	crs: Crs,
	geo_transform: GeoTransform,
	width: usize,
	height: usize,
	samples: Vec<f32>,
	valid: Vec<bool>,
	classes: Option<Vec<u16>>,
}

impl RasterBlock {
	pub fn new(
		crs: Crs, geo_transform: GeoTransform, width: usize, height: usize, samples: Vec<f32>, valid: Vec<bool>,
		classes: Option<Vec<u16>>,
	) -> Result<Self> {
		let len = width * height;
		if samples.len() != len || valid.len() != len || classes.as_ref().map_or(false, |c| c.len() != len) {
			return Err(GenError::Decode(format!(
				"block of {}x{} has {} samples and {} mask entries",
				width,
				height,
				samples.len(),
				valid.len()
			)));
		}

		Ok(Self {
			crs,
			geo_transform,
			width,
			height,
			samples,
			valid,
			classes,
		})
	}

	/// A block with every sample set to no-data.
	pub fn empty(crs: Crs, geo_transform: GeoTransform, width: usize, height: usize, with_classes: bool) -> Self {
		let len = width * height;
		Self {
			crs,
			geo_transform,
			width,
			height,
			samples: vec![0.0; len],
			valid: vec![false; len],
			classes: with_classes.then(|| vec![0; len]),
		}
	}

	pub fn crs(&self) -> Crs { self.crs }

	pub fn geo_transform(&self) -> &GeoTransform { &self.geo_transform }

	pub fn width(&self) -> usize { self.width }

	pub fn height(&self) -> usize { self.height }

	pub fn samples(&self) -> &[f32] { &self.samples }

	pub fn valid(&self) -> &[bool] { &self.valid }

	pub fn classes(&self) -> Option<&[u16]> { self.classes.as_deref() }

	pub fn extent(&self) -> Result<GeographicExtent> { self.geo_transform.extent(self.width, self.height, self.crs) }

	/// Sample spacing along x and y.
	pub fn spacing(&self) -> (f64, f64) { self.geo_transform.pixel_size() }

	pub fn sample(&self, x: usize, y: usize) -> Option<f32> {
		let i = y * self.width + x;
		self.valid[i].then(|| self.samples[i])
	}

	pub fn class(&self, x: usize, y: usize) -> Option<u16> {
		let i = y * self.width + x;
		if self.valid[i] {
			self.classes.as_ref().map(|c| c[i])
		} else {
			None
		}
	}

	pub fn valid_count(&self) -> usize { self.valid.iter().filter(|&&x| x).count() }

	/// Approximate heap footprint, used for cache accounting.
	pub fn byte_size(&self) -> usize {
		std::mem::size_of::<Self>()
			+ self.samples.len() * std::mem::size_of::<f32>()
			+ self.valid.len()
			+ self.classes.as_ref().map_or(0, |c| c.len() * std::mem::size_of::<u16>())
	}

	/// Copy all of `src` into this block with its top-left pixel at `(x, y)`. Parts falling outside are clipped.
	pub fn paste(&mut self, src: &RasterBlock, x: i64, y: i64) {
		let target = PixelWindow::new(0, 0, self.width, self.height);
		let Some(overlap) = target.intersect(&PixelWindow::new(x, y, src.width, src.height)) else {
			return;
		};

		for row in overlap.y..overlap.bottom() {
			let dst = row as usize * self.width + overlap.x as usize;
			let from = (row - y) as usize * src.width + (overlap.x - x) as usize;
			let len = overlap.width;
			self.samples[dst..dst + len].copy_from_slice(&src.samples[from..from + len]);
			self.valid[dst..dst + len].copy_from_slice(&src.valid[from..from + len]);
			if let (Some(dst_classes), Some(src_classes)) = (self.classes.as_mut(), src.classes.as_ref()) {
				dst_classes[dst..dst + len].copy_from_slice(&src_classes[from..from + len]);
			}
		}
	}

	/// A copy of the `window` region.
	pub fn crop(&self, window: PixelWindow) -> RasterBlock {
		let mut out = RasterBlock::empty(
			self.crs,
			self.geo_transform.offset(window.x as f64, window.y as f64),
			window.width,
			window.height,
			self.classes.is_some(),
		);
		out.paste(self, -window.x, -window.y);
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn block(width: usize, height: usize, value: impl Fn(usize, usize) -> f32) -> RasterBlock {
		let samples = (0..height)
			.flat_map(|y| (0..width).map(move |x| (x, y)))
			.map(|(x, y)| value(x, y))
			.collect();
		RasterBlock::new(
			Crs::WGS84,
			GeoTransform::north_up(0.0, height as f64, 1.0, 1.0),
			width,
			height,
			samples,
			vec![true; width * height],
			None,
		)
		.unwrap()
	}

	#[test]
	fn length_mismatch_is_decode_error() {
		let err = RasterBlock::new(
			Crs::WGS84,
			GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
			2,
			2,
			vec![0.0; 3],
			vec![true; 4],
			None,
		)
		.unwrap_err();
		assert!(matches!(err, GenError::Decode(_)));
	}

	#[test]
	fn paste_clips() {
		let mut dst = RasterBlock::empty(Crs::WGS84, GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), 4, 4, false);
		let src = block(3, 3, |x, y| (y * 3 + x) as f32);
		dst.paste(&src, 2, -1);

		assert_eq!(dst.sample(2, 0), Some(3.0));
		assert_eq!(dst.sample(3, 1), Some(7.0));
		assert_eq!(dst.sample(1, 0), None);
		assert_eq!(dst.sample(2, 2), None);
		assert_eq!(dst.valid_count(), 4);
	}

	#[test]
	fn crop_keeps_georeference() {
		let src = block(4, 4, |x, y| (y * 4 + x) as f32);
		let cropped = src.crop(PixelWindow::new(1, 2, 2, 2));
		assert_eq!(cropped.sample(0, 0), Some(9.0));
		assert_eq!(cropped.sample(1, 1), Some(14.0));
		let e = cropped.extent().unwrap();
		assert_eq!((e.min_x(), e.max_y()), (1.0, 2.0));
	}

	#[test]
	fn windows_cover_extent_with_margin() {
		let grid = RasterGrid {
			crs: Crs::WGS84,
			geo_transform: GeoTransform::north_up(0.0, 10.0, 0.5, 0.5),
			width: 20,
			height: 20,
		};
		let extent = GeographicExtent::new(Crs::WGS84, 1.0, 6.0, 2.0, 8.0).unwrap();
		assert_eq!(grid.window_for(&extent, 0).unwrap(), PixelWindow::new(2, 4, 2, 4));
		assert_eq!(grid.window_for(&extent, 2).unwrap(), PixelWindow::new(0, 2, 6, 8));

		let level = grid.level(1);
		assert_eq!((level.width, level.height), (10, 10));
		assert_eq!(level.window_for(&extent, 0).unwrap(), PixelWindow::new(1, 2, 1, 2));
	}
}
