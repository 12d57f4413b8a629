//! The boundary to raster file decoding.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
};

use crate::{
	crs::{Crs, GeoTransform},
	raster::PixelWindow,
	GenError,
	Result,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RasterMetadata {
	pub crs: Option<Crs>,
	pub geo_transform: GeoTransform,
	pub width: u64,
	pub height: u64,
	pub band_count: usize,
}

/// Samples read from a window, with `valid` set to `false` for no-data.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowData {
	pub samples: Vec<f64>,
	pub valid: Vec<bool>,
}

/// Opens raster files.
pub trait RasterDecoder: Send + Sync {
	fn open_raster(&self, path: &Path) -> Result<Arc<dyn RasterHandle>>;
}

/// An open raster. Reads block the calling thread.
pub trait RasterHandle: Send + Sync {
	fn metadata(&self) -> &RasterMetadata;

	/// Read `window` (in native pixels) of the 1-based `band`, resampled to `out_size`.
	///
	/// Categorical bands are read with nearest neighbour sampling, others are averaged.
	fn read_window(
		&self, window: PixelWindow, out_size: (usize, usize), band: usize, categorical: bool,
	) -> Result<WindowData>;
}

/// The decoder used when no raster library is built in. Every open fails.
pub struct UnavailableDecoder;

impl RasterDecoder for UnavailableDecoder {
	fn open_raster(&self, path: &Path) -> Result<Arc<dyn RasterHandle>> {
		Err(GenError::SourceUnavailable(format!(
			"cannot open {}: built without a raster decoder",
			path.display()
		)))
	}
}

/// The GDAL decoder when the `gdal` feature is on, [`UnavailableDecoder`] otherwise.
pub fn default_decoder() -> Arc<dyn RasterDecoder> {
	#[cfg(feature = "gdal")]
	{
		Arc::new(super::gdal::GdalDecoder)
	}
	#[cfg(not(feature = "gdal"))]
	{
		Arc::new(UnavailableDecoder)
	}
}

/// Rasters held in memory, registered under a path.
///
/// Useful for hosts that already have decoded data.
#[derive(Default)]
pub struct MemoryDecoder {
	rasters: RwLock<HashMap<PathBuf, Arc<MemoryRaster>>>,
}

impl MemoryDecoder {
	pub fn new() -> Self { Self::default() }

	pub fn insert(&self, path: impl Into<PathBuf>, raster: MemoryRaster) {
		self.rasters.write().unwrap().insert(path.into(), Arc::new(raster));
	}
}

impl RasterDecoder for MemoryDecoder {
	fn open_raster(&self, path: &Path) -> Result<Arc<dyn RasterHandle>> {
		self.rasters
			.read()
			.unwrap()
			.get(path)
			.cloned()
			.map(|x| x as Arc<dyn RasterHandle>)
			.ok_or_else(|| GenError::SourceUnavailable(format!("{} does not exist", path.display())))
	}
}

pub struct MemoryRaster {
	metadata: RasterMetadata,
	bands: Vec<Vec<f64>>,
	no_data: Option<f64>,
}

impl MemoryRaster {
	/// A raster with one band per entry of `bands`, each `width * height` row-major samples.
	pub fn new(
		crs: Option<Crs>, geo_transform: GeoTransform, width: usize, height: usize, bands: Vec<Vec<f64>>,
	) -> Result<Self> {
		if bands.is_empty() || bands.iter().any(|b| b.len() != width * height) {
			return Err(GenError::Decode(format!(
				"every band of a {}x{} raster needs {} samples",
				width,
				height,
				width * height
			)));
		}

		Ok(Self {
			metadata: RasterMetadata {
				crs,
				geo_transform,
				width: width as u64,
				height: height as u64,
				band_count: bands.len(),
			},
			bands,
			no_data: None,
		})
	}

	pub fn with_no_data(mut self, value: f64) -> Self {
		self.no_data = Some(value);
		self
	}

	fn is_valid(&self, x: f64) -> bool { !x.is_nan() && self.no_data.map_or(true, |n| x != n) }
}

impl RasterHandle for MemoryRaster {
	fn metadata(&self) -> &RasterMetadata { &self.metadata }

	fn read_window(
		&self, window: PixelWindow, out_size: (usize, usize), band: usize, categorical: bool,
	) -> Result<WindowData> {
		let data = band
			.checked_sub(1)
			.and_then(|b| self.bands.get(b))
			.ok_or_else(|| GenError::Config(format!("band {} does not exist", band)))?;
		let width = self.metadata.width as i64;
		let height = self.metadata.height as i64;
		if window.x < 0 || window.y < 0 || window.right() > width || window.bottom() > height {
			return Err(GenError::Decode(format!("window {:?} is outside the raster", window)));
		}

		let (out_w, out_h) = out_size;
		let sx = window.width as f64 / out_w as f64;
		let sy = window.height as f64 / out_h as f64;
		let mut samples = Vec::with_capacity(out_w * out_h);
		let mut valid = Vec::with_capacity(out_w * out_h);
		for oy in 0..out_h {
			for ox in 0..out_w {
				let x0 = (ox as f64 * sx).floor() as i64;
				let y0 = (oy as f64 * sy).floor() as i64;

				let value = if categorical || (sx <= 1.0 && sy <= 1.0) {
					let x = (((ox as f64 + 0.5) * sx) as i64).min(window.width as i64 - 1);
					let y = (((oy as f64 + 0.5) * sy) as i64).min(window.height as i64 - 1);
					let v = data[((window.y + y) * width + window.x + x) as usize];
					self.is_valid(v).then(|| v)
				} else {
					let x1 = (((ox + 1) as f64 * sx).ceil() as i64).clamp(x0 + 1, window.width as i64);
					let y1 = (((oy + 1) as f64 * sy).ceil() as i64).clamp(y0 + 1, window.height as i64);
					let (mut sum, mut count) = (0.0, 0);
					for y in y0..y1 {
						for x in x0..x1 {
							let v = data[((window.y + y) * width + window.x + x) as usize];
							if self.is_valid(v) {
								sum += v;
								count += 1;
							}
						}
					}
					(count > 0).then(|| sum / count as f64)
				};

				samples.push(value.unwrap_or(0.0));
				valid.push(value.is_some());
			}
		}

		Ok(WindowData { samples, valid })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn raster() -> MemoryRaster {
		let data = (0..16).map(|x| x as f64).collect();
		MemoryRaster::new(
			Some(Crs::WGS84),
			GeoTransform::north_up(0.0, 4.0, 1.0, 1.0),
			4,
			4,
			vec![data],
		)
		.unwrap()
		.with_no_data(5.0)
	}

	#[test]
	fn reads_native_window() {
		let data = raster()
			.read_window(PixelWindow::new(1, 1, 2, 2), (2, 2), 1, false)
			.unwrap();
		assert_eq!(data.samples, vec![0.0, 6.0, 9.0, 10.0]);
		assert_eq!(data.valid, vec![false, true, true, true]);
	}

	#[test]
	fn averages_when_downsampling() {
		let data = raster()
			.read_window(PixelWindow::new(0, 0, 4, 4), (2, 2), 1, false)
			.unwrap();
		// The top-left 2x2 block is 0, 1, 4 and 5, with 5 being no-data.
		assert_eq!(data.samples[0], 5.0 / 3.0);
		assert_eq!(data.samples[3], (10.0 + 11.0 + 14.0 + 15.0) / 4.0);
		assert!(data.valid.iter().all(|&x| x));
	}

	#[test]
	fn categorical_reads_pick_a_sample() {
		let data = raster()
			.read_window(PixelWindow::new(0, 0, 4, 4), (2, 2), 1, true)
			.unwrap();
		assert_eq!(data.samples, vec![0.0, 7.0, 13.0, 15.0]);
		assert_eq!(data.valid, vec![false, true, true, true]);
	}

	#[test]
	fn missing_band_and_path() {
		assert!(raster()
			.read_window(PixelWindow::new(0, 0, 1, 1), (1, 1), 2, false)
			.is_err());
		assert!(MemoryDecoder::new().open_raster(Path::new("missing.tif")).is_err());
	}
}
