use std::path::PathBuf;

use clap::Args;
use landgen::source::{gdal::GdalDecoder, RasterDecoder};

use crate::common::Size;

#[derive(Args)]
/// Give information about a raster source.
pub struct Info {
	input: PathBuf,
}

pub fn info(info: Info) {
	let raster = match GdalDecoder.open_raster(&info.input) {
		Ok(x) => x,
		Err(err) => {
			eprintln!("raster could not be opened: {}", err);
			return;
		},
	};
	let metadata = raster.metadata();
	let transform = metadata.geo_transform;

	println!("Raster");
	println!("  Size: {}x{}", metadata.width, metadata.height);
	println!("  Bands: {}", metadata.band_count);
	println!(
		"  Uncompressed: {}",
		Size(metadata.width as usize * metadata.height as usize * metadata.band_count * 4)
	);

	println!();

	println!("Georeference");
	match metadata.crs {
		Some(crs) => println!("  CRS: {}", crs),
		None => println!("  CRS: unknown"),
	}
	println!("  Transform: {:?}", transform.0);
	let (w, h) = transform.pixel_size();
	println!("  Pixel size: {} x {}", w, h);
	println!("  North up: {}", transform.is_north_up());
	if let Some(crs) = metadata.crs {
		match transform.extent(metadata.width as usize, metadata.height as usize, crs) {
			Ok(extent) => println!("  Extent: {:?}", extent),
			Err(e) => println!("  Extent: {}", e),
		}
	}
}
