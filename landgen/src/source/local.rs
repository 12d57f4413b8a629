use std::sync::Arc;

use crate::{
	cache::CacheKey,
	raster::{PixelWindow, RasterGrid},
	source::{join_error, Fetched, FetchContext, IoLimits, LocalFile, RasterDecoder, RasterHandle, SourceDescriptor},
	Crs,
	GenError,
	GeographicExtent,
	RasterBlock,
	Result,
};

/// Files are read and cached in aligned blocks of this many pixels per side.
pub const FILE_BLOCK_SIZE: usize = 256;
/// Extra pixels read around a request so resampling kernels have their neighbours.
pub(crate) const KERNEL_MARGIN: i64 = 2;
const MAX_LEVEL: u32 = 16;

/// A geo-referenced raster file.
pub struct LocalSource {
	id: Arc<str>,
	handle: Arc<dyn RasterHandle>,
	band: usize,
	classification_band: Option<usize>,
	grid: RasterGrid,
	bounds: GeographicExtent,
	native_resolution: f64,
}

impl LocalSource {
	pub async fn open(
		descriptor: &SourceDescriptor, file: &LocalFile, decoder: Arc<dyn RasterDecoder>, limits: &IoLimits,
	) -> Result<Self> {
		let handle = {
			let _permit = limits.disk().await?;
			let path = file.path.clone();
			tokio::task::spawn_blocking(move || decoder.open_raster(&path))
				.await
				.map_err(join_error)??
		};

		let metadata = handle.metadata().clone();
		let crs = file
			.crs
			.or(metadata.crs)
			.ok_or_else(|| GenError::UnsupportedCrs(format!("{} has no CRS", file.path.display())))?;
		crs.validate()?;

		if !metadata.geo_transform.is_north_up() {
			return Err(GenError::Decode(format!(
				"{} is rotated, only north-up rasters are supported",
				file.path.display()
			)));
		}
		for band in std::iter::once(file.band).chain(file.classification_band) {
			if band == 0 || band > metadata.band_count {
				return Err(GenError::Config(format!(
					"{} has no band {} (it has {})",
					file.path.display(),
					band,
					metadata.band_count
				)));
			}
		}

		let grid = RasterGrid {
			crs,
			geo_transform: metadata.geo_transform,
			width: metadata.width,
			height: metadata.height,
		};
		let bounds = grid.window_extent(&grid.bounds())?;
		let native_resolution = descriptor.native_resolution().unwrap_or_else(|| {
			let (w, h) = metadata.geo_transform.pixel_size();
			w.min(h)
		});

		log::debug!(
			"Opened {} ({}x{}, {}, {} per pixel)",
			file.path.display(),
			metadata.width,
			metadata.height,
			crs,
			native_resolution
		);

		Ok(Self {
			id: descriptor.identity().into(),
			handle,
			band: file.band,
			classification_band: file.classification_band,
			grid,
			bounds,
			native_resolution,
		})
	}

	pub fn identity(&self) -> &str { &self.id }

	pub fn crs(&self) -> Crs { self.grid.crs }

	pub fn bounds(&self) -> GeographicExtent { self.bounds }

	pub fn has_classes(&self) -> bool { self.classification_band.is_some() }

	/// The coarsest power-of-two overview that is still at least as fine as `resolution`.
	pub fn level_for(&self, resolution: f64) -> u32 {
		let mut level = 0;
		while level < MAX_LEVEL
			&& self.native_resolution * (1u64 << (level + 1)) as f64 <= resolution * (1.0 + 1e-9)
			&& self.grid.width >> (level + 1) > 0
			&& self.grid.height >> (level + 1) > 0
		{
			level += 1;
		}
		level
	}

	pub async fn fetch(&self, extent: &GeographicExtent, resolution: f64, ctx: &FetchContext) -> Result<Fetched> {
		let level = self.level_for(resolution);
		let grid = self.grid.level(level);
		let window = grid.window_for(extent, KERNEL_MARGIN)?;
		let core = grid.window_for(extent, 0)?;

		let mut block = RasterBlock::empty(
			grid.crs,
			grid.window_transform(&window),
			window.width,
			window.height,
			self.has_classes(),
		);
		let mut issues = Vec::new();
		if core.intersect(&grid.bounds()) != Some(core) {
			issues.push(GenError::PartialCoverage(format!(
				"{} covers only part of the request",
				self.id
			)));
		}
		let inner = match window.intersect(&grid.bounds()) {
			Some(x) => x,
			None => return Ok(Fetched { block, issues }),
		};

		let units = file_blocks(&inner, &grid);
		let reads = units.iter().map(|&unit| self.read_unit(&grid, level, unit, ctx));
		let results = futures::future::join_all(reads).await;

		for (unit, result) in units.iter().zip(results) {
			match result {
				Ok(read) => block.paste(&read, unit.x - window.x, unit.y - window.y),
				Err(e) => issues.push(e),
			}
		}

		Ok(Fetched { block, issues })
	}

	async fn read_unit(
		&self, grid: &RasterGrid, level: u32, unit: PixelWindow, ctx: &FetchContext,
	) -> Result<Arc<RasterBlock>> {
		let key = CacheKey::new(
			self.id.clone(),
			grid.window_extent(&unit)?,
			grid.geo_transform.pixel_size().0,
		);
		if let Some(block) = ctx.cache.get(&key) {
			return Ok(block);
		}

		let factor = 1i64 << level;
		let native = PixelWindow::new(unit.x * factor, unit.y * factor, 0, 0);
		let native = PixelWindow {
			width: ((unit.right() * factor).min(self.grid.width as i64) - native.x) as usize,
			height: ((unit.bottom() * factor).min(self.grid.height as i64) - native.y) as usize,
			..native
		};

		let handle = self.handle.clone();
		let band = self.band;
		let classification_band = self.classification_band;
		let crs = grid.crs;
		let geo_transform = grid.window_transform(&unit);

		let block = {
			let _permit = ctx.limits.disk().await?;
			ctx.guard("file read", async move {
				tokio::task::spawn_blocking(move || {
					tracy::zone!("Read file block");

					let size = (unit.width, unit.height);
					let heights = handle.read_window(native, size, band, false)?;
					let classes = match classification_band {
						Some(b) => Some(handle.read_window(native, size, b, true)?),
						None => None,
					};

					// Cells without a class fall back to class 0.
					let classes = classes.map(|c| {
						c.samples
							.iter()
							.zip(c.valid.iter())
							.map(|(&x, &valid)| if valid { x.round().clamp(0.0, u16::MAX as f64) as u16 } else { 0 })
							.collect()
					});
					RasterBlock::new(
						crs,
						geo_transform,
						unit.width,
						unit.height,
						heights.samples.iter().map(|&x| x as f32).collect(),
						heights.valid,
						classes,
					)
				})
				.await
				.map_err(join_error)?
			})
			.await?
		};

		let block = Arc::new(block);
		if !ctx.cancel.is_cancelled() {
			ctx.cache.put(key, block.clone());
		}
		Ok(block)
	}
}

/// The aligned file blocks overlapping `window`, clipped to the grid.
fn file_blocks(window: &PixelWindow, grid: &RasterGrid) -> Vec<PixelWindow> {
	let size = FILE_BLOCK_SIZE as i64;
	let bounds = grid.bounds();
	let mut out = Vec::new();
	for by in window.y / size..=(window.bottom() - 1) / size {
		for bx in window.x / size..=(window.right() - 1) / size {
			if let Some(unit) = PixelWindow::new(bx * size, by * size, FILE_BLOCK_SIZE, FILE_BLOCK_SIZE).intersect(&bounds) {
				out.push(unit);
			}
		}
	}
	out
}
