use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use gdal::{errors::GdalError, raster::ResampleAlg, Dataset};
use thread_local::ThreadLocal;

use crate::{
	crs::{Crs, GeoTransform},
	raster::PixelWindow,
	source::{RasterDecoder, RasterHandle, RasterMetadata, WindowData},
	GenError,
	Result,
};

/// Decodes anything GDAL can open.
pub struct GdalDecoder;

impl RasterDecoder for GdalDecoder {
	fn open_raster(&self, path: &Path) -> Result<Arc<dyn RasterHandle>> {
		Ok(Arc::new(GdalRaster::load(path)?))
	}
}

fn unavailable(path: &Path, err: GdalError) -> GenError {
	GenError::SourceUnavailable(format!("{}: {}", path.display(), err))
}

/// A GDAL dataset, opened once per thread that reads from it.
pub struct GdalRaster {
	path: PathBuf,
	set: ThreadLocal<Dataset>,
	metadata: RasterMetadata,
}

impl GdalRaster {
	pub fn load(path: &Path) -> Result<Self> {
		tracy::zone!("Load raster");

		let dataset = Dataset::open(path).map_err(|e| unavailable(path, e))?;
		let transform = dataset.geo_transform().map_err(|e| unavailable(path, e))?;
		let (width, height) = dataset.raster_size();

		let crs = match dataset.spatial_ref().and_then(|srs| srs.auth_code()) {
			Ok(code) => u16::try_from(code).ok().map(Crs::epsg),
			Err(_) => None,
		};
		if crs.is_none() {
			log::warn!("{} has no EPSG coded CRS", path.display());
		}

		let band_count = dataset.raster_count().max(0) as usize;
		for band in 1..=band_count {
			let has_no_data = dataset
				.rasterband(band as isize)
				.map(|b| b.no_data_value().is_some())
				.unwrap_or(false);
			if !has_no_data {
				log::warn!("Band {} of {} declares no no-data value", band, path.display());
			}
		}

		let set = ThreadLocal::new();
		set.get_or(|| dataset);

		Ok(Self {
			path: path.to_path_buf(),
			set,
			metadata: RasterMetadata {
				crs,
				geo_transform: GeoTransform(transform),
				width: width as u64,
				height: height as u64,
				band_count,
			},
		})
	}
}

impl RasterHandle for GdalRaster {
	fn metadata(&self) -> &RasterMetadata { &self.metadata }

	fn read_window(
		&self, window: PixelWindow, out_size: (usize, usize), band: usize, categorical: bool,
	) -> Result<WindowData> {
		tracy::zone!("Read raster window");

		let set = self
			.set
			.get_or_try(|| Dataset::open(&self.path))
			.map_err(|e| unavailable(&self.path, e))?;
		let band = set
			.rasterband(band as isize)
			.map_err(|e| GenError::Config(format!("{}: {}", self.path.display(), e)))?;

		let alg = if categorical {
			ResampleAlg::NearestNeighbour
		} else {
			ResampleAlg::Average
		};
		let buffer = band
			.read_as::<f64>(
				(window.x as isize, window.y as isize),
				(window.width, window.height),
				out_size,
				Some(alg),
			)
			.map_err(|e| GenError::Decode(format!("{}: {}", self.path.display(), e)))?;

		let no_data = band.no_data_value();
		let valid = buffer
			.data
			.iter()
			.map(|&x| !x.is_nan() && no_data.map_or(true, |n| x != n))
			.collect();

		Ok(WindowData {
			samples: buffer.data,
			valid,
		})
	}
}
