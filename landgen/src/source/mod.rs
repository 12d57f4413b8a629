//! Where raster samples come from: local raster files and remote tile services.

use std::{
	fmt::{Debug, Formatter},
	future::Future,
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

pub use self::{decoder::*, local::LocalSource, remote::*};
use crate::{cache::TileCache, CancelToken, Crs, GenError, GeographicExtent, RasterBlock, Result};

mod decoder;
#[cfg(feature = "gdal")]
pub mod gdal;
mod local;
mod remote;

/// An API key or token. Never printed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(String);

impl Credentials {
	pub fn new(secret: impl Into<String>) -> Self { Self(secret.into()) }

	pub fn expose(&self) -> &str { &self.0 }
}

impl Debug for Credentials {
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { f.write_str("Credentials(<redacted>)") }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalFile {
	pub path: PathBuf,
	/// 1-based elevation band.
	pub band: usize,
	/// 1-based band of categorical classification values.
	pub classification_band: Option<usize>,
	/// Used when the file carries no CRS of its own.
	pub crs: Option<Crs>,
}

impl Default for LocalFile {
	fn default() -> Self {
		Self {
			path: PathBuf::new(),
			band: 1,
			classification_band: None,
			crs: None,
		}
	}
}

impl LocalFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			..Default::default()
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTiles {
	/// A URL with `{z}`, `{x}` and `{y}` placeholders.
	pub url_template: String,
	pub encoding: ElevationEncoding,
	pub tile_size: u32,
	/// Overlap pixels on each side of a served tile.
	pub border: u32,
	pub min_zoom: u8,
	pub max_zoom: u8,
	/// The query parameter carrying the credentials.
	pub token_param: String,
}

impl Default for RemoteTiles {
	fn default() -> Self {
		Self {
			url_template: String::new(),
			encoding: ElevationEncoding::default(),
			tile_size: 256,
			border: 0,
			min_zoom: 0,
			max_zoom: 15,
			token_param: "access_token".to_string(),
		}
	}
}

impl RemoteTiles {
	pub fn new(url_template: impl Into<String>) -> Self {
		Self {
			url_template: url_template.into(),
			..Default::default()
		}
	}

	/// Mapbox terrain-RGB tiles.
	pub fn mapbox_terrain() -> Self {
		Self::new("https://api.mapbox.com/v4/mapbox.terrain-rgb/{z}/{x}/{y}.pngraw")
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
	LocalFile(LocalFile),
	RemoteTile(RemoteTiles),
}

/// Describes a raster source. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
	#[serde(flatten)]
	kind: SourceKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	credentials: Option<Credentials>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	native_resolution: Option<f64>,
}

impl SourceDescriptor {
	pub fn new(kind: SourceKind) -> Self {
		Self {
			kind,
			credentials: None,
			native_resolution: None,
		}
	}

	pub fn local(file: LocalFile) -> Self { Self::new(SourceKind::LocalFile(file)) }

	pub fn remote(tiles: RemoteTiles) -> Self { Self::new(SourceKind::RemoteTile(tiles)) }

	pub fn with_credentials(mut self, credentials: Credentials) -> Self {
		self.credentials = Some(credentials);
		self
	}

	/// Overrides the resolution derived from the raster itself.
	pub fn with_native_resolution(mut self, resolution: f64) -> Self {
		self.native_resolution = Some(resolution);
		self
	}

	pub fn kind(&self) -> &SourceKind { &self.kind }

	pub fn credentials(&self) -> Option<&Credentials> { self.credentials.as_ref() }

	pub fn native_resolution(&self) -> Option<f64> { self.native_resolution }

	/// A stable name for cache keys. Leaves out credentials.
	pub fn identity(&self) -> String {
		match &self.kind {
			SourceKind::LocalFile(x) => format!(
				"file:{}#{}:{:?}:{:?}",
				x.path.display(),
				x.band,
				x.classification_band,
				x.crs.map(|c| c.code())
			),
			SourceKind::RemoteTile(x) => format!(
				"tiles:{}#{:?}:{}+{}",
				x.url_template, x.encoding, x.tile_size, x.border
			),
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff: Duration::from_millis(250),
			max_backoff: Duration::from_secs(4),
		}
	}
}

impl RetryPolicy {
	/// The delay before retry number `attempt`, counting from zero.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
		self.initial_backoff
			.checked_mul(factor)
			.unwrap_or(self.max_backoff)
			.min(self.max_backoff)
	}
}

/// Caps on concurrent I/O, shared by all sources of a run.
#[derive(Clone, Debug)]
pub struct IoLimits {
	network: Arc<Semaphore>,
	disk: Arc<Semaphore>,
}

impl IoLimits {
	pub fn new(max_fetches: usize, max_reads: usize) -> Self {
		Self {
			network: Arc::new(Semaphore::new(max_fetches)),
			disk: Arc::new(Semaphore::new(max_reads)),
		}
	}

	pub async fn network(&self) -> Result<SemaphorePermit<'_>> {
		self.network.acquire().await.map_err(|_| cancelled())
	}

	pub async fn disk(&self) -> Result<SemaphorePermit<'_>> { self.disk.acquire().await.map_err(|_| cancelled()) }
}

/// Everything a fetch needs besides the area.
#[derive(Clone)]
pub struct FetchContext {
	pub cache: Arc<TileCache>,
	pub limits: IoLimits,
	pub cancel: CancelToken,
	pub timeout: Duration,
	pub retry: RetryPolicy,
}

impl FetchContext {
	/// Run `fut`, giving up when the run is cancelled or the deadline passes.
	pub(crate) async fn guard<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
		tokio::select! {
			_ = self.cancel.cancelled() => Err(cancelled()),
			x = tokio::time::timeout(self.timeout, fut) => match x {
				Ok(x) => x,
				Err(_) => Err(GenError::SourceUnavailable(format!("{} timed out after {:?}", what, self.timeout))),
			},
		}
	}
}

pub(crate) fn cancelled() -> GenError { GenError::SourceUnavailable("cancelled".to_string()) }

pub(crate) fn join_error(e: tokio::task::JoinError) -> GenError {
	GenError::SourceUnavailable(format!("worker task failed: {}", e))
}

/// A fetched block and the problems met while assembling it.
///
/// Regions that could not be read are no-data in the block and have an entry in `issues`.
#[derive(Debug)]
pub struct Fetched {
	pub block: RasterBlock,
	pub issues: Vec<GenError>,
}

pub enum RasterSource {
	Local(LocalSource),
	Remote(RemoteSource),
}

impl RasterSource {
	pub async fn open(
		descriptor: &SourceDescriptor, decoder: Arc<dyn RasterDecoder>, fetcher: Arc<dyn TileFetcher>,
		limits: &IoLimits,
	) -> Result<Self> {
		match descriptor.kind() {
			SourceKind::LocalFile(file) => LocalSource::open(descriptor, file, decoder, limits)
				.await
				.map(Self::Local),
			SourceKind::RemoteTile(tiles) => RemoteSource::open(descriptor, tiles, fetcher).map(Self::Remote),
		}
	}

	pub fn identity(&self) -> &str {
		match self {
			Self::Local(x) => x.identity(),
			Self::Remote(x) => x.identity(),
		}
	}

	pub fn crs(&self) -> Crs {
		match self {
			Self::Local(x) => x.crs(),
			Self::Remote(x) => x.crs(),
		}
	}

	pub fn bounds(&self) -> GeographicExtent {
		match self {
			Self::Local(x) => x.bounds(),
			Self::Remote(x) => x.bounds(),
		}
	}

	pub fn has_classes(&self) -> bool {
		match self {
			Self::Local(x) => x.has_classes(),
			Self::Remote(_) => false,
		}
	}

	/// Samples covering `extent` at `resolution` (in the source's CRS units).
	///
	/// The extent is reprojected first if it is in another CRS.
	pub async fn fetch(&self, extent: &GeographicExtent, resolution: f64, ctx: &FetchContext) -> Result<Fetched> {
		let extent = extent.reproject(self.crs())?;
		match self {
			Self::Local(x) => x.fetch(&extent, resolution, ctx).await,
			Self::Remote(x) => x.fetch(&extent, resolution, ctx).await,
		}
	}
}
