use std::{
	fmt::{Display, Formatter},
	sync::Arc,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::local::KERNEL_MARGIN;
use crate::{
	cache::CacheKey,
	raster::{PixelWindow, RasterGrid},
	source::{cancelled, join_error, Credentials, Fetched, FetchContext, RemoteTiles, SourceDescriptor},
	Crs,
	GenError,
	GeoTransform,
	GeographicExtent,
	RasterBlock,
	Result,
};

/// Half the width of the Web Mercator plane, in metres.
pub const MERCATOR_HALF_EXTENT: f64 = 20_037_508.342_789_244;
pub const MAX_ZOOM: u8 = 24;

/// How elevations are packed into the colour channels of a tile.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ElevationEncoding {
	/// `base + (R * 65536 + G * 256 + B) * scale`.
	TerrainRgb { base: f64, scale: f64 },
	/// `R * 256 + G + B / 256 - 32768`.
	Terrarium,
}

impl Default for ElevationEncoding {
	fn default() -> Self {
		Self::TerrainRgb {
			base: -10000.0,
			scale: 0.1,
		}
	}
}

impl ElevationEncoding {
	pub fn decode(&self, r: u8, g: u8, b: u8) -> f64 {
		let (r, g, b) = (r as f64, g as f64, b as f64);
		match *self {
			Self::TerrainRgb { base, scale } => base + (r * 65536.0 + g * 256.0 + b) * scale,
			Self::Terrarium => r * 256.0 + g + b / 256.0 - 32768.0,
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex {
	pub z: u8,
	pub x: u32,
	pub y: u32,
}

impl Display for TileIndex {
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { write!(f, "{}/{}/{}", self.z, self.x, self.y) }
}

#[derive(Clone, Debug)]
pub struct TileRequest {
	pub index: TileIndex,
	pub url: Url,
}

#[derive(Clone, Debug, Error)]
pub enum TileFetchError {
	/// Worth retrying: timeouts, throttling, server errors, dropped connections.
	#[error("{0}")]
	Transient(String),
	#[error("tile not found")]
	NotFound,
	#[error("{0}")]
	Permanent(String),
}

/// Fetches the raw bytes of one service tile.
#[async_trait]
pub trait TileFetcher: Send + Sync {
	async fn fetch(&self, request: &TileRequest) -> std::result::Result<Vec<u8>, TileFetchError>;
}

pub struct HttpTileFetcher {
	client: reqwest::Client,
}

impl HttpTileFetcher {
	pub fn new() -> Result<Self> {
		let client = reqwest::Client::builder()
			.user_agent(concat!("landgen/", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(|e| GenError::Config(format!("could not create HTTP client: {}", e)))?;
		Ok(Self { client })
	}
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
	async fn fetch(&self, request: &TileRequest) -> std::result::Result<Vec<u8>, TileFetchError> {
		// Errors carry the URL, and with it the token, unless stripped.
		let response = self
			.client
			.get(request.url.clone())
			.send()
			.await
			.map_err(|e| TileFetchError::Transient(e.without_url().to_string()))?;

		let status = response.status();
		if status == StatusCode::NOT_FOUND {
			return Err(TileFetchError::NotFound);
		}
		if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
			return Err(TileFetchError::Transient(format!("HTTP {}", status)));
		}
		if !status.is_success() {
			return Err(TileFetchError::Permanent(format!("HTTP {}", status)));
		}

		response
			.bytes()
			.await
			.map(|x| x.to_vec())
			.map_err(|e| TileFetchError::Transient(e.without_url().to_string()))
	}
}

/// The size of a pixel at `zoom`, in Web Mercator metres.
pub fn pixel_size(zoom: u8, tile_size: u32) -> f64 {
	2.0 * MERCATOR_HALF_EXTENT / (tile_size as f64 * (1u64 << zoom) as f64)
}

/// Decode a PNG tile, cropping `border` pixels off every side.
pub fn decode_tile(
	bytes: &[u8], encoding: ElevationEncoding, tile_size: usize, border: usize, geo_transform: GeoTransform,
) -> Result<RasterBlock> {
	tracy::zone!("Decode tile");

	let decode = |e: png::DecodingError| GenError::Decode(e.to_string());
	let mut decoder = png::Decoder::new(bytes);
	decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
	let mut reader = decoder.read_info().map_err(decode)?;
	let mut buf = vec![0; reader.output_buffer_size()];
	let info = reader.next_frame(&mut buf).map_err(decode)?;

	let expected = tile_size + 2 * border;
	if info.width as usize != expected || info.height as usize != expected {
		return Err(GenError::Decode(format!(
			"expected a {0}x{0} tile, got {1}x{2}",
			expected, info.width, info.height
		)));
	}
	let channels = match info.color_type {
		png::ColorType::Rgb => 3,
		png::ColorType::Rgba => 4,
		other => return Err(GenError::Decode(format!("unsupported tile colour type {:?}", other))),
	};

	let mut samples = Vec::with_capacity(tile_size * tile_size);
	let mut valid = Vec::with_capacity(tile_size * tile_size);
	for y in border..border + tile_size {
		let line = &buf[y * info.line_size..];
		for x in border..border + tile_size {
			let px = &line[x * channels..x * channels + channels];
			let transparent = channels == 4 && px[3] == 0;
			samples.push(if transparent { 0.0 } else { encoding.decode(px[0], px[1], px[2]) as f32 });
			valid.push(!transparent);
		}
	}

	RasterBlock::new(
		Crs::WEB_MERCATOR,
		geo_transform,
		tile_size,
		tile_size,
		samples,
		valid,
		None,
	)
}

/// An XYZ tile service in Web Mercator.
pub struct RemoteSource {
	id: Arc<str>,
	tiles: RemoteTiles,
	bounds: GeographicExtent,
	credentials: Option<Credentials>,
	fetcher: Arc<dyn TileFetcher>,
}

impl RemoteSource {
	pub fn open(descriptor: &SourceDescriptor, tiles: &RemoteTiles, fetcher: Arc<dyn TileFetcher>) -> Result<Self> {
		for placeholder in ["{z}", "{x}", "{y}"] {
			if !tiles.url_template.contains(placeholder) {
				return Err(GenError::Config(format!(
					"tile URL template `{}` lacks {}",
					tiles.url_template, placeholder
				)));
			}
		}
		if tiles.tile_size == 0 {
			return Err(GenError::Config("tile size must be positive".to_string()));
		}
		if tiles.min_zoom > tiles.max_zoom || tiles.max_zoom > MAX_ZOOM {
			return Err(GenError::Config(format!(
				"invalid zoom range {}..={} (at most {})",
				tiles.min_zoom, tiles.max_zoom, MAX_ZOOM
			)));
		}

		let source = Self {
			id: descriptor.identity().into(),
			tiles: tiles.clone(),
			bounds: GeographicExtent::new(
				Crs::WEB_MERCATOR,
				-MERCATOR_HALF_EXTENT,
				-MERCATOR_HALF_EXTENT,
				MERCATOR_HALF_EXTENT,
				MERCATOR_HALF_EXTENT,
			)?,
			credentials: descriptor.credentials().cloned(),
			fetcher,
		};
		source.tile_url(TileIndex { z: 0, x: 0, y: 0 })?;
		Ok(source)
	}

	pub fn identity(&self) -> &str { &self.id }

	pub fn crs(&self) -> Crs { Crs::WEB_MERCATOR }

	pub fn bounds(&self) -> GeographicExtent { self.bounds }

	/// The coarsest zoom whose pixels are at least as fine as `resolution`, within the service's range.
	pub fn zoom_for(&self, resolution: f64) -> u8 {
		(self.tiles.min_zoom..=self.tiles.max_zoom)
			.find(|&z| pixel_size(z, self.tiles.tile_size) <= resolution * (1.0 + 1e-9))
			.unwrap_or(self.tiles.max_zoom)
	}

	pub fn tile_url(&self, index: TileIndex) -> Result<Url> {
		let raw = self
			.tiles
			.url_template
			.replace("{z}", &index.z.to_string())
			.replace("{x}", &index.x.to_string())
			.replace("{y}", &index.y.to_string());
		let mut url =
			Url::parse(&raw).map_err(|e| GenError::Config(format!("invalid tile URL `{}`: {}", raw, e)))?;
		if let Some(credentials) = &self.credentials {
			url.query_pairs_mut()
				.append_pair(&self.tiles.token_param, credentials.expose());
		}
		Ok(url)
	}

	fn grid(&self, zoom: u8) -> RasterGrid {
		let size = pixel_size(zoom, self.tiles.tile_size);
		let side = self.tiles.tile_size as u64 * (1u64 << zoom);
		RasterGrid {
			crs: Crs::WEB_MERCATOR,
			geo_transform: GeoTransform::north_up(-MERCATOR_HALF_EXTENT, MERCATOR_HALF_EXTENT, size, size),
			width: side,
			height: side,
		}
	}

	pub async fn fetch(&self, extent: &GeographicExtent, resolution: f64, ctx: &FetchContext) -> Result<Fetched> {
		let zoom = self.zoom_for(resolution);
		let grid = self.grid(zoom);
		let window = grid.window_for(extent, KERNEL_MARGIN)?;
		let core = grid.window_for(extent, 0)?;

		let mut block = RasterBlock::empty(
			Crs::WEB_MERCATOR,
			grid.window_transform(&window),
			window.width,
			window.height,
			false,
		);
		let mut issues = Vec::new();
		if core.intersect(&grid.bounds()) != Some(core) {
			issues.push(GenError::PartialCoverage(format!(
				"request extends beyond the tile grid of {}",
				self.id
			)));
		}
		let inner = match window.intersect(&grid.bounds()) {
			Some(x) => x,
			None => return Ok(Fetched { block, issues }),
		};

		let size = self.tiles.tile_size as i64;
		let mut indices = Vec::new();
		for y in inner.y / size..=(inner.bottom() - 1) / size {
			for x in inner.x / size..=(inner.right() - 1) / size {
				indices.push(TileIndex {
					z: zoom,
					x: x as u32,
					y: y as u32,
				});
			}
		}

		let fetches = indices.iter().map(|&index| self.fetch_tile(index, &grid, ctx));
		let results = futures::future::join_all(fetches).await;
		for (index, result) in indices.iter().zip(results) {
			match result {
				Ok(tile) => block.paste(&tile, index.x as i64 * size - window.x, index.y as i64 * size - window.y),
				Err(GenError::Decode(e)) => issues.push(GenError::Decode(format!("tile {}: {}", index, e))),
				Err(e) => issues.push(GenError::SourceUnavailable(format!("tile {}: {}", index, e))),
			}
		}

		Ok(Fetched { block, issues })
	}

	async fn fetch_tile(&self, index: TileIndex, grid: &RasterGrid, ctx: &FetchContext) -> Result<Arc<RasterBlock>> {
		let size = self.tiles.tile_size as usize;
		let window = PixelWindow::new(
			index.x as i64 * size as i64,
			index.y as i64 * size as i64,
			size,
			size,
		);
		let key = CacheKey::new(
			self.id.clone(),
			grid.window_extent(&window)?,
			grid.geo_transform.pixel_size().0,
		);
		if let Some(block) = ctx.cache.get(&key) {
			return Ok(block);
		}

		let request = TileRequest {
			index,
			url: self.tile_url(index)?,
		};
		let mut attempt = 0;
		let bytes = loop {
			if ctx.cancel.is_cancelled() {
				return Err(cancelled());
			}

			let outcome = {
				let _permit = ctx.limits.network().await?;
				tokio::select! {
					_ = ctx.cancel.cancelled() => return Err(cancelled()),
					x = tokio::time::timeout(ctx.timeout, self.fetcher.fetch(&request)) => match x {
						Ok(x) => x,
						Err(_) => Err(TileFetchError::Transient(format!("timed out after {:?}", ctx.timeout))),
					},
				}
			};

			match outcome {
				Ok(bytes) => break bytes,
				Err(TileFetchError::Transient(e)) if attempt < ctx.retry.max_retries => {
					let delay = ctx.retry.backoff(attempt);
					log::debug!("Retrying tile {} in {:?}: {}", index, delay, e);
					attempt += 1;
					tokio::select! {
						_ = ctx.cancel.cancelled() => return Err(cancelled()),
						_ = tokio::time::sleep(delay) => {},
					}
				},
				Err(e) => {
					log::warn!("Giving up on tile {} after {} attempts: {}", index, attempt + 1, e);
					return Err(GenError::SourceUnavailable(e.to_string()));
				},
			}
		};

		let encoding = self.tiles.encoding;
		let border = self.tiles.border as usize;
		let geo_transform = grid.window_transform(&window);
		let block = tokio::task::spawn_blocking(move || decode_tile(&bytes, encoding, size, border, geo_transform))
			.await
			.map_err(join_error)??;
		let block = Arc::new(block);
		if !ctx.cancel.is_cancelled() {
			ctx.cache.put(key, block.clone());
		}
		Ok(block)
	}
}
