//! Drives a generation run: plans tiles, fetches their sources, and synthesizes output tiles.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::{
	runtime::Runtime,
	sync::{OwnedSemaphorePermit, Semaphore},
};

use crate::{
	cache::{TileCache, DEFAULT_CACHE_CAPACITY},
	crs::{grid_to_pixels, Transformer},
	resample::{resample, Resampling, SourceLayer},
	source::{
		default_decoder,
		FetchContext,
		Fetched,
		HttpTileFetcher,
		IoLimits,
		RasterDecoder,
		RasterSource,
		RetryPolicy,
		SourceDescriptor,
		TileFetcher,
	},
	synth::{HeightEncoding, Synthesized, Synthesizer, Weightmap, WeightmapConfig},
	tiling::{GridGeoreference, PlannedTile, TileCoord, TilePlan},
	CancelToken,
	ErrorKind,
	GenError,
	GeographicExtent,
	Point,
	RasterBlock,
	Result,
	SampleGrid,
};

pub const MAX_TILE_SIZE: usize = 16384;
const MAX_MESSAGES: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
	pub resampling: Resampling,
	/// Cells with no data are filled from valid samples within this many cells. Zero disables filling.
	pub hole_fill_radius: usize,
	/// Byte budget of the generator's source cache. Every run of a [`Generator`] shares that cache, so the run
	/// started last sets the budget for all of them, evicting right away when it shrinks.
	pub cache_capacity_bytes: usize,
	pub max_concurrent_fetches: usize,
	pub max_concurrent_reads: usize,
	/// Tiles being fetched or synthesized at once.
	pub tile_workers: usize,
	/// Deadline of a single fetch attempt.
	pub fetch_timeout: Duration,
	pub retry: RetryPolicy,
	pub height_encoding: HeightEncoding,
	pub weightmap: Option<WeightmapConfig>,
	/// The point tile edges are aligned to, in the output CRS.
	pub grid_origin: Point,
}

impl Default for GenerateOptions {
	fn default() -> Self {
		Self {
			resampling: Resampling::default(),
			hole_fill_radius: 0,
			cache_capacity_bytes: DEFAULT_CACHE_CAPACITY,
			max_concurrent_fetches: 8,
			max_concurrent_reads: 4,
			tile_workers: std::thread::available_parallelism().map_or(4, |x| x.get()),
			fetch_timeout: Duration::from_secs(30),
			retry: RetryPolicy::default(),
			height_encoding: HeightEncoding::default(),
			weightmap: None,
			grid_origin: Point::default(),
		}
	}
}

/// Generate the landscape covering `extent`, in `extent`'s CRS, at `resolution` CRS units per sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
	pub extent: GeographicExtent,
	pub resolution: f64,
	pub tile_size: usize,
	/// In priority order.
	pub sources: Vec<SourceDescriptor>,
	#[serde(default)]
	pub options: GenerateOptions,
}

impl GenerateRequest {
	pub fn new(extent: GeographicExtent, resolution: f64, tile_size: usize, sources: Vec<SourceDescriptor>) -> Self {
		Self {
			extent,
			resolution,
			tile_size,
			sources,
			options: GenerateOptions::default(),
		}
	}

	pub fn with_options(mut self, options: GenerateOptions) -> Self {
		self.options = options;
		self
	}

	/// Check everything that would make the whole run fail.
	pub fn validate(&self) -> Result<()> {
		let o = &self.options;
		self.extent.crs().validate()?;
		if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
			return Err(GenError::Config(format!(
				"tile size must be between 1 and {}, not {}",
				MAX_TILE_SIZE, self.tile_size
			)));
		}
		if !self.resolution.is_finite() || self.resolution <= 0.0 {
			return Err(GenError::Config(format!(
				"resolution must be positive, not {}",
				self.resolution
			)));
		}
		if self.sources.is_empty() {
			return Err(GenError::Config("no sources given".to_string()));
		}
		for (name, value) in [
			("max_concurrent_fetches", o.max_concurrent_fetches),
			("max_concurrent_reads", o.max_concurrent_reads),
			("tile_workers", o.tile_workers),
		] {
			if value == 0 {
				return Err(GenError::Config(format!("{} must be at least 1", name)));
			}
		}
		if o.hole_fill_radius > MAX_TILE_SIZE {
			return Err(GenError::Config(format!(
				"hole fill radius {} is too large",
				o.hole_fill_radius
			)));
		}
		if o.fetch_timeout.is_zero() {
			return Err(GenError::Config("fetch timeout must be positive".to_string()));
		}
		if !o.grid_origin.x.is_finite() || !o.grid_origin.y.is_finite() {
			return Err(GenError::Config("grid origin must be finite".to_string()));
		}
		HeightEncoding::new(o.height_encoding.offset, o.height_encoding.scale)?;
		if let Some(w) = &o.weightmap {
			w.validate()?;
		}
		Ok(())
	}

	pub fn plan(&self) -> Result<TilePlan> {
		self.validate()?;
		TilePlan::new(self.extent, self.resolution, self.tile_size, self.options.grid_origin)
	}
}

/// A finished tile of the landscape.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTile {
	/// Position relative to the request's top-left tile.
	pub row: u32,
	pub col: u32,
	/// Absolute position on the tile grid.
	pub grid: TileCoord,
	pub extent: GeographicExtent,
	/// The part of the request inside this tile.
	pub coverage: GeographicExtent,
	pub size: usize,
	pub resolution: f64,
	pub encoding: HeightEncoding,
	/// `size * size` values, row-major, north first.
	pub heightmap: Vec<u16>,
	/// `true` where the heightmap has no data.
	pub no_data: Vec<bool>,
	pub weightmaps: Vec<Weightmap>,
	pub unfilled_holes: usize,
	pub clamped_samples: usize,
	pub elevation_range: Option<(f32, f32)>,
}

impl OutputTile {
	fn new(tile: &PlannedTile, resolution: f64, encoding: HeightEncoding, synthesized: Synthesized) -> Self {
		Self {
			row: tile.row,
			col: tile.col,
			grid: tile.grid,
			extent: tile.extent,
			coverage: tile.coverage,
			size: synthesized.width,
			resolution,
			encoding,
			heightmap: synthesized.heightmap,
			no_data: synthesized.no_data,
			weightmaps: synthesized.weightmaps,
			unfilled_holes: synthesized.unfilled_holes,
			clamped_samples: synthesized.clamped_samples,
			elevation_range: synthesized.elevation_range,
		}
	}

	/// A tile with no data at all.
	fn empty(tile: &PlannedTile, size: usize, resolution: f64, encoding: HeightEncoding) -> Self {
		Self::new(
			tile,
			resolution,
			encoding,
			Synthesized {
				width: size,
				height: size,
				heightmap: vec![0; size * size],
				no_data: vec![true; size * size],
				weightmaps: Vec::new(),
				filled_holes: 0,
				unfilled_holes: size * size,
				clamped_samples: 0,
				elevation_range: None,
			},
		)
	}

	/// The elevation of a pixel in metres, after quantization.
	pub fn elevation(&self, x: usize, y: usize) -> Option<f64> {
		let i = y * self.size + x;
		(!self.no_data[i]).then(|| self.encoding.dequantize(self.heightmap[i]))
	}

	pub fn weightmap(&self, layer: &str) -> Option<&Weightmap> { self.weightmaps.iter().find(|x| x.layer == layer) }
}

/// What went wrong during a run, and how much.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostics {
	pub errors: BTreeMap<ErrorKind, usize>,
	/// `(row, col)` of the tiles that met at least one error.
	pub affected_tiles: BTreeSet<(u32, u32)>,
	/// The first few error messages.
	pub messages: Vec<String>,
	pub tiles_planned: usize,
	pub tiles_emitted: usize,
	pub unfilled_holes: usize,
	pub clamped_samples: usize,
	pub cancelled: bool,
}

impl Diagnostics {
	pub fn count(&self, kind: ErrorKind) -> usize { self.errors.get(&kind).copied().unwrap_or(0) }

	pub fn error_count(&self) -> usize { self.errors.values().sum() }

	pub fn is_clean(&self) -> bool { self.errors.is_empty() && self.unfilled_holes == 0 && self.clamped_samples == 0 }

	fn record(&mut self, tile: Option<(u32, u32)>, error: &GenError) {
		*self.errors.entry(error.kind()).or_default() += 1;
		if let Some(tile) = tile {
			self.affected_tiles.insert(tile);
		}
		if self.messages.len() < MAX_MESSAGES {
			self.messages.push(match tile {
				Some((row, col)) => format!("tile {}, {}: {}", row, col, error),
				None => error.to_string(),
			});
		}
	}
}

/// Generates landscapes. Keeps its cache between runs.
///
/// Owns an async runtime, so it must not be created or dropped from within async code.
pub struct Generator {
	runtime: Arc<Runtime>,
	cache: Arc<TileCache>,
	decoder: Arc<dyn RasterDecoder>,
	fetcher: Arc<dyn TileFetcher>,
}

#[derive(Default)]
pub struct GeneratorBuilder {
	cache: Option<Arc<TileCache>>,
	decoder: Option<Arc<dyn RasterDecoder>>,
	fetcher: Option<Arc<dyn TileFetcher>>,
	io_threads: Option<usize>,
}

impl GeneratorBuilder {
	pub fn cache(mut self, cache: Arc<TileCache>) -> Self {
		self.cache = Some(cache);
		self
	}

	pub fn decoder(mut self, decoder: Arc<dyn RasterDecoder>) -> Self {
		self.decoder = Some(decoder);
		self
	}

	pub fn fetcher(mut self, fetcher: Arc<dyn TileFetcher>) -> Self {
		self.fetcher = Some(fetcher);
		self
	}

	pub fn io_threads(mut self, threads: usize) -> Self {
		self.io_threads = Some(threads);
		self
	}

	pub fn build(self) -> Result<Generator> {
		let mut runtime = tokio::runtime::Builder::new_multi_thread();
		runtime.enable_all().thread_name("landgen-io");
		if let Some(threads) = self.io_threads {
			runtime.worker_threads(threads.max(1));
		}
		let runtime = runtime
			.build()
			.map_err(|e| GenError::Config(format!("could not start the I/O runtime: {}", e)))?;

		let fetcher = match self.fetcher {
			Some(x) => x,
			None => Arc::new(HttpTileFetcher::new()?),
		};

		Ok(Generator {
			runtime: Arc::new(runtime),
			cache: self.cache.unwrap_or_default(),
			decoder: self.decoder.unwrap_or_else(default_decoder),
			fetcher,
		})
	}
}

impl Generator {
	pub fn new() -> Result<Self> { Self::builder().build() }

	pub fn builder() -> GeneratorBuilder { GeneratorBuilder::default() }

	pub fn cache(&self) -> &Arc<TileCache> { &self.cache }

	/// Start a run. Tiles arrive through the returned stream as they are finished, in no particular order.
	///
	/// Fails only for problems with the request itself. Everything else shows up as no-data in the tiles and in
	/// the stream's [`Diagnostics`].
	///
	/// Resizes the shared cache to the request's `cache_capacity_bytes`, also for runs already in flight.
	pub fn generate(&self, request: GenerateRequest, cancel: CancelToken) -> Result<TileStream> {
		let plan = request.plan()?;
		let options = &request.options;
		let synth = Synthesizer::new(
			options.height_encoding,
			options.hole_fill_radius,
			options.weightmap.clone(),
		)?;
		if self.cache.capacity() != options.cache_capacity_bytes {
			log::debug!("Resizing the source cache to {} bytes", options.cache_capacity_bytes);
			self.cache.set_capacity(options.cache_capacity_bytes);
		}

		log::debug!(
			"Generating {} tiles ({}x{}) of {} samples over {:?}",
			plan.len(),
			plan.cols(),
			plan.rows(),
			request.tile_size,
			request.extent
		);

		let diagnostics = Arc::new(Mutex::new(Diagnostics {
			tiles_planned: plan.len(),
			..Default::default()
		}));
		let (tx, rx) = crossbeam::channel::bounded(options.tile_workers);
		let run = Arc::new(Run {
			ctx: FetchContext {
				cache: self.cache.clone(),
				limits: IoLimits::new(options.max_concurrent_fetches, options.max_concurrent_reads),
				cancel: cancel.clone(),
				timeout: options.fetch_timeout,
				retry: options.retry,
			},
			plan,
			synth,
			decoder: self.decoder.clone(),
			fetcher: self.fetcher.clone(),
			diagnostics: diagnostics.clone(),
			request,
		});
		self.runtime.spawn(drive(run, tx));

		Ok(TileStream {
			tiles: rx,
			diagnostics,
			cancel,
			_runtime: self.runtime.clone(),
		})
	}

	/// Run to completion, handing each tile to `sink` as it is finished.
	pub fn generate_with(
		&self, request: GenerateRequest, cancel: CancelToken, mut sink: impl FnMut(OutputTile),
	) -> Result<Diagnostics> {
		let mut stream = self.generate(request, cancel)?;
		for tile in &mut stream {
			sink(tile);
		}
		Ok(stream.finish())
	}
}

/// The tiles of a run, as they are finished. Dropping the stream cancels the run.
pub struct TileStream {
	tiles: Receiver<OutputTile>,
	diagnostics: Arc<Mutex<Diagnostics>>,
	cancel: CancelToken,
	_runtime: Arc<Runtime>,
}

impl std::fmt::Debug for TileStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("TileStream").finish_non_exhaustive() }
}

impl TileStream {
	pub fn cancel_token(&self) -> &CancelToken { &self.cancel }

	/// A snapshot of the run's diagnostics so far.
	pub fn diagnostics(&self) -> Diagnostics {
		let mut diagnostics = lock(&self.diagnostics).clone();
		diagnostics.cancelled = self.cancel.is_cancelled();
		diagnostics
	}

	/// Wait for the run to end, discarding remaining tiles.
	pub fn finish(mut self) -> Diagnostics {
		for _ in &mut self {}
		self.diagnostics()
	}
}

impl Iterator for TileStream {
	type Item = OutputTile;

	fn next(&mut self) -> Option<Self::Item> {
		if self.cancel.is_cancelled() {
			return None;
		}
		let tile = self.tiles.recv().ok()?;
		if self.cancel.is_cancelled() {
			return None;
		}

		lock(&self.diagnostics).tiles_emitted += 1;
		Some(tile)
	}
}

impl Drop for TileStream {
	fn drop(&mut self) { self.cancel.cancel(); }
}

fn lock(x: &Mutex<Diagnostics>) -> MutexGuard<'_, Diagnostics> { x.lock().unwrap_or_else(PoisonError::into_inner) }

struct Run {
	request: GenerateRequest,
	plan: TilePlan,
	synth: Synthesizer,
	ctx: FetchContext,
	decoder: Arc<dyn RasterDecoder>,
	fetcher: Arc<dyn TileFetcher>,
	diagnostics: Arc<Mutex<Diagnostics>>,
}

impl Run {
	fn record(&self, tile: Option<(u32, u32)>, errors: &[GenError]) {
		if errors.is_empty() {
			return;
		}
		let mut diagnostics = lock(&self.diagnostics);
		for e in errors {
			diagnostics.record(tile, e);
		}
	}
}

async fn drive(run: Arc<Run>, tx: Sender<OutputTile>) {
	let sources = Arc::new(open_sources(&run).await);
	let tiles = match run.plan.tiles() {
		Ok(x) => x,
		Err(e) => {
			log::error!("Could not plan tiles: {}", e);
			run.record(None, &[e]);
			return;
		},
	};

	let workers = Arc::new(Semaphore::new(run.request.options.tile_workers));
	let mut jobs = Vec::with_capacity(tiles.len());
	for tile in tiles {
		let permit = tokio::select! {
			biased;
			_ = run.ctx.cancel.cancelled() => None,
			x = workers.clone().acquire_owned() => x.ok(),
		};
		let permit = match permit {
			Some(x) => x,
			None => break,
		};
		jobs.push(tokio::spawn(process_tile(
			run.clone(),
			sources.clone(),
			tile,
			tx.clone(),
			permit,
		)));
	}

	for result in futures::future::join_all(jobs).await {
		if let Err(e) = result {
			log::error!("Tile task failed: {}", e);
		}
	}
	if run.ctx.cancel.is_cancelled() {
		log::debug!("Run cancelled");
	}
}

/// A source opened for a run.
struct OpenSource {
	source: RasterSource,
	/// Source units per output sample. Shared by every tile so that they all read the same zoom or overview.
	resolution: f64,
}

async fn open_sources(run: &Run) -> Vec<OpenSource> {
	let opens = run
		.request
		.sources
		.iter()
		.map(|x| RasterSource::open(x, run.decoder.clone(), run.fetcher.clone(), &run.ctx.limits));
	let opened = futures::future::join_all(opens).await;

	let mut sources = Vec::with_capacity(opened.len());
	for (descriptor, result) in run.request.sources.iter().zip(opened) {
		let opened = result.and_then(|source| {
			let resolution = read_resolution(&source, run.plan.georeference(), run.plan.request().centre())?;
			log::debug!("Reading {} at {} units per sample", descriptor.identity(), resolution);
			Ok(OpenSource { source, resolution })
		});
		match opened {
			Ok(x) => sources.push(x),
			Err(e) => {
				log::error!("Could not open {}: {}", descriptor.identity(), e);
				run.record(None, &[e]);
			},
		}
	}
	sources
}

/// The size of one output sample in the source's CRS, measured where the source's centre lands on the grid (or at
/// `fallback` when it does not project). The smaller of the two axes wins.
fn read_resolution(source: &RasterSource, grid: &GridGeoreference, fallback: Point) -> Result<f64> {
	let to_source = Transformer::new(grid.crs, source.crs())?;
	if to_source.is_identity() {
		return Ok(grid.resolution);
	}
	let anchor = Transformer::new(source.crs(), grid.crs)?
		.project(source.bounds().centre())
		.unwrap_or(fallback);
	let centre = to_source.project(anchor)?;

	let r = grid.resolution;
	let step = |dx: f64, dy: f64| -> Result<f64> {
		let p = to_source
			.project(Point::new(anchor.x + dx, anchor.y + dy))
			.or_else(|_| to_source.project(Point::new(anchor.x - dx, anchor.y - dy)))?;
		Ok((p.x - centre.x).hypot(p.y - centre.y))
	};
	let resolution = step(r, 0.0)?.min(step(0.0, r)?);
	if !(resolution > 0.0) || !resolution.is_finite() {
		return Err(GenError::ProjectionDomain {
			x: anchor.x,
			y: anchor.y,
			from: grid.crs.to_string(),
			to: source.crs().to_string(),
		});
	}
	Ok(resolution)
}

async fn fetch_source(
	open: &OpenSource, footprint: &GeographicExtent, ctx: &FetchContext,
) -> Result<Option<Fetched>> {
	let local = footprint.reproject(open.source.crs())?;
	if !local.intersects(&open.source.bounds()) {
		return Ok(None);
	}
	open.source.fetch(&local, open.resolution, ctx).await.map(Some)
}

async fn process_tile(
	run: Arc<Run>, sources: Arc<Vec<OpenSource>>, tile: PlannedTile, tx: Sender<OutputTile>,
	permit: OwnedSemaphorePermit,
) {
	let grid = run
		.plan
		.georeference()
		.sample_grid(tile.grid, run.synth.fill_radius());
	let mut issues = Vec::new();
	let mut blocks = Vec::with_capacity(sources.len());

	match grid.extent() {
		Ok(footprint) => {
			let fetches = sources.iter().map(|x| fetch_source(x, &footprint, &run.ctx));
			for result in futures::future::join_all(fetches).await {
				match result {
					Ok(Some(fetched)) => {
						blocks.push(fetched.block);
						issues.extend(fetched.issues);
					},
					Ok(None) => {},
					Err(e) => issues.push(e),
				}
			}
		},
		Err(e) => issues.push(e),
	}

	if run.ctx.cancel.is_cancelled() {
		return;
	}

	rayon::spawn(move || {
		let _permit = permit;
		tracy::zone!("Process tile");

		let output = synthesize_tile(&run, &tile, &grid, &blocks, &mut issues);
		let cancel = &run.ctx.cancel;
		if cancel.is_cancelled() {
			return;
		}

		run.record(Some((tile.row, tile.col)), &issues);
		{
			let mut diagnostics = lock(&run.diagnostics);
			diagnostics.unfilled_holes += output.unfilled_holes;
			diagnostics.clamped_samples += output.clamped_samples;
		}
		if tx.send(output).is_err() {
			cancel.cancel();
		}
	});
}

fn synthesize_tile(
	run: &Run, tile: &PlannedTile, grid: &SampleGrid, blocks: &[RasterBlock], issues: &mut Vec<GenError>,
) -> OutputTile {
	let request = &run.request;
	let halo = run.synth.fill_radius();

	let mut mapped = Vec::with_capacity(blocks.len());
	for block in blocks {
		match grid_to_pixels(grid, block.crs(), block.geo_transform()) {
			Ok(pixels) => mapped.push((block, pixels)),
			Err(e) => issues.push(e),
		}
	}
	let layers: Vec<_> = mapped
		.iter()
		.map(|(block, pixels)| SourceLayer { block, pixels })
		.collect();
	let resampled = resample(&layers, grid.width, grid.height, request.options.resampling);

	let synthesized = run.synth.synthesize(&resampled, halo).or_else(|e| {
		let retry = run.synth.without_weightmaps().synthesize(&resampled, halo);
		issues.push(e);
		retry
	});
	match synthesized {
		Ok(x) => OutputTile::new(tile, request.resolution, run.synth.encoding(), x),
		Err(e) => {
			issues.push(e);
			OutputTile::empty(tile, request.tile_size, request.resolution, run.synth.encoding())
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{source::LocalFile, Crs};

	fn request(tile_size: usize) -> GenerateRequest {
		GenerateRequest::new(
			GeographicExtent::new(Crs::WGS84, 0.0, 0.0, 1.0, 1.0).unwrap(),
			0.01,
			tile_size,
			vec![SourceDescriptor::local(LocalFile::new("dem.tif"))],
		)
	}

	#[test]
	fn rejects_bad_requests() {
		assert!(request(64).validate().is_ok());
		assert!(matches!(request(0).validate(), Err(GenError::Config(_))));
		assert!(matches!(request(MAX_TILE_SIZE + 1).validate(), Err(GenError::Config(_))));

		let mut r = request(64);
		r.resolution = -1.0;
		assert!(r.validate().is_err());

		let mut r = request(64);
		r.options.max_concurrent_fetches = 0;
		assert!(r.validate().is_err());

		let mut r = request(64);
		r.sources.clear();
		assert!(r.validate().is_err());

		let mut r = request(64);
		r.options.weightmap = Some(WeightmapConfig::default());
		assert!(r.validate().is_err());
	}

	#[test]
	fn options_from_json() {
		let json = r#"{"resampling": "bicubic", "hole_fill_radius": 3, "grid_origin": {"x": 10.0, "y": 20.0}}"#;
		let o: GenerateOptions = serde_json::from_str(json).unwrap();
		assert_eq!(o.resampling, Resampling::Bicubic);
		assert_eq!(o.hole_fill_radius, 3);
		assert_eq!(o.grid_origin, Point::new(10.0, 20.0));
		assert_eq!(o.max_concurrent_fetches, 8);
	}

	#[test]
	fn diagnostics_cap_messages() {
		let mut d = Diagnostics::default();
		for i in 0..100 {
			d.record(Some((0, i)), &GenError::Decode("bad".to_string()));
		}
		d.record(None, &GenError::PartialCoverage("edge".to_string()));
		assert_eq!(d.count(ErrorKind::Decode), 100);
		assert_eq!(d.count(ErrorKind::PartialCoverage), 1);
		assert_eq!(d.error_count(), 101);
		assert_eq!(d.messages.len(), MAX_MESSAGES);
		assert_eq!(d.affected_tiles.len(), 100);
		assert!(!d.is_clean());
	}
}
