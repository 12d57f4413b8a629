#![allow(dead_code)]

use std::{
	collections::{BTreeSet, HashMap},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
		Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use landgen::{
	source::{MemoryDecoder, MemoryRaster, TileFetchError, TileFetcher, TileIndex, TileRequest},
	Crs,
	GeoTransform,
	Generator,
	OutputTile,
	TileStream,
};

/// Serves terrain-RGB tiles whose elevation is `0.1 * (gx + gy)`, with `gx` and `gy` the global pixel indices at
/// the tile's zoom.
pub struct PlaneTiles {
	tile_size: u32,
	/// Pixels of junk around each served tile.
	border: u32,
	/// Transient failures before each tile is served.
	failures: u32,
	/// Tiles that always fail permanently.
	broken: Vec<TileIndex>,
	/// Tiles served as bytes that are not a PNG.
	corrupt: Vec<TileIndex>,
	delay: Option<Duration>,
	attempts: Mutex<HashMap<TileIndex, u32>>,
	requests: AtomicUsize,
	requested: Mutex<Vec<TileIndex>>,
}

impl PlaneTiles {
	pub fn new(tile_size: u32) -> Self {
		Self {
			tile_size,
			border: 0,
			failures: 0,
			broken: Vec::new(),
			corrupt: Vec::new(),
			delay: None,
			attempts: Mutex::new(HashMap::new()),
			requests: AtomicUsize::new(0),
			requested: Mutex::new(Vec::new()),
		}
	}

	pub fn bordered(mut self, border: u32) -> Self {
		self.border = border;
		self
	}

	pub fn corrupt(mut self, index: TileIndex) -> Self {
		self.corrupt.push(index);
		self
	}

	pub fn failing(mut self, failures: u32) -> Self {
		self.failures = failures;
		self
	}

	pub fn broken(mut self, index: TileIndex) -> Self {
		self.broken.push(index);
		self
	}

	pub fn delayed(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn requests(&self) -> usize { self.requests.load(Ordering::SeqCst) }

	pub fn zooms(&self) -> BTreeSet<u8> { self.requested.lock().unwrap().iter().map(|x| x.z).collect() }

	/// The elevation the tiles encode at fractional global pixel `(px, py)`, where integers are pixel centres.
	pub fn elevation(px: f64, py: f64) -> f64 { 0.1 * (px + py) }

	fn tile(&self, index: TileIndex) -> Vec<u8> {
		let (size, border) = (self.tile_size, self.border);
		let side = size + 2 * border;
		let inner = border..border + size;
		let mut rgb = Vec::with_capacity((side * side * 3) as usize);
		for y in 0..side {
			for x in 0..side {
				let v = if inner.contains(&x) && inner.contains(&y) {
					let gx = index.x * size + x - border;
					let gy = index.y * size + y - border;
					100_000 + gx + gy
				} else {
					0
				};
				rgb.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
			}
		}
		png_rgb(side, side, &rgb)
	}
}

#[async_trait]
impl TileFetcher for PlaneTiles {
	async fn fetch(&self, request: &TileRequest) -> Result<Vec<u8>, TileFetchError> {
		self.requests.fetch_add(1, Ordering::SeqCst);
		self.requested.lock().unwrap().push(request.index);
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}
		if self.broken.contains(&request.index) {
			return Err(TileFetchError::Permanent("HTTP 403".to_string()));
		}
		if self.corrupt.contains(&request.index) {
			return Ok(b"<html>rate limited</html>".to_vec());
		}

		let attempt = {
			let mut attempts = self.attempts.lock().unwrap();
			let attempt = attempts.entry(request.index).or_insert(0);
			*attempt += 1;
			*attempt
		};
		if attempt <= self.failures {
			return Err(TileFetchError::Transient("HTTP 503".to_string()));
		}
		Ok(self.tile(request.index))
	}
}

pub fn png_rgb(width: u32, height: u32, rgb: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	let mut encoder = png::Encoder::new(&mut out, width, height);
	encoder.set_color(png::ColorType::Rgb);
	encoder.set_depth(png::BitDepth::Eight);
	let mut writer = encoder.write_header().unwrap();
	writer.write_image_data(rgb).unwrap();
	drop(writer);
	out
}

/// A WGS84 raster with its top-left corner at `(left, top)` and `value(col, row)` as its only band.
pub fn wgs84_raster(
	left: f64, top: f64, pixel: f64, width: usize, height: usize, value: impl Fn(usize, usize) -> f64,
) -> MemoryRaster {
	let band = (0..height)
		.flat_map(|row| (0..width).map(move |col| (col, row)))
		.map(|(col, row)| value(col, row))
		.collect();
	MemoryRaster::new(
		Some(Crs::WGS84),
		GeoTransform::north_up(left, top, pixel, pixel),
		width,
		height,
		vec![band],
	)
	.unwrap()
}

pub fn local_generator(decoder: MemoryDecoder) -> Generator {
	Generator::builder()
		.decoder(Arc::new(decoder))
		.fetcher(Arc::new(PlaneTiles::new(256)))
		.build()
		.unwrap()
}

pub fn remote_generator(tiles: Arc<PlaneTiles>) -> Generator {
	Generator::builder()
		.decoder(Arc::new(MemoryDecoder::new()))
		.fetcher(tiles)
		.build()
		.unwrap()
}

/// Every tile of the stream, ordered by position.
pub fn collect(stream: TileStream) -> Vec<OutputTile> {
	let mut tiles: Vec<_> = stream.collect();
	tiles.sort_by_key(|x| (x.row, x.col));
	tiles
}
