//! Generates tiled landscapes (`u16` heightmaps and `u8` weightmaps) from geo-referenced elevation data.
//!
//! A run takes an extent in some CRS, a resolution in that CRS's units, a tile size and a list of sources in
//! priority order:
//! * Local raster files, read through a [`source::RasterDecoder`] (GDAL with the `gdal` feature).
//! * Remote slippy-map tiles carrying terrain-RGB or terrarium encoded elevations.
//!
//! Output tiles are aligned to a fixed grid so that overlapping requests produce bit-identical tiles. Source data is
//! cached between runs of the same [`Generator`].

mod cancel;
pub use cancel::*;
mod error;
pub use error::*;
mod extent;
pub use extent::*;

pub mod cache;
pub mod crs;
pub use crs::{Crs, GeoTransform, Point, SampleGrid};
pub mod pipeline;
pub use pipeline::{Diagnostics, GenerateOptions, GenerateRequest, Generator, OutputTile, TileStream};
pub mod raster;
pub use raster::RasterBlock;
pub mod resample;
pub use resample::Resampling;
pub mod source;
pub use source::{Credentials, LocalFile, RemoteTiles, SourceDescriptor};
pub mod synth;
pub use synth::{HeightEncoding, WeightmapConfig};
pub mod tiling;
