use std::{
	error::Error,
	fmt::Display,
	fs::File,
	io::BufReader,
	path::{Path, PathBuf},
};

use clap::Args;
use landgen::{
	source::SourceKind,
	Credentials,
	Crs,
	GenerateOptions,
	GeographicExtent,
	LocalFile,
	Point,
	RemoteTiles,
	SourceDescriptor,
};
use serde::de::DeserializeOwned;

#[derive(Args)]
pub struct Area {
	/// The area to cover, as `min_x,min_y,max_x,max_y` in the CRS's units.
	#[clap(short = 'e', long = "extent", parse(try_from_str = parse_bounds), allow_hyphen_values = true)]
	pub bounds: [f64; 4],
	/// The CRS of the extent and of the output tiles.
	#[clap(long = "crs", default_value = "EPSG:4326")]
	pub crs: Crs,
	/// CRS units per sample.
	#[clap(short = 'r', long = "res")]
	pub resolution: f64,
	/// Samples per tile side.
	#[clap(short = 's', long = "size", default_value_t = 256)]
	pub tile_size: usize,
	/// A JSON file with generation options.
	#[clap(long = "options")]
	pub options: Option<PathBuf>,
}

impl Area {
	pub fn extent(&self) -> Result<GeographicExtent, Box<dyn Error>> {
		let [min_x, min_y, max_x, max_y] = self.bounds;
		Ok(GeographicExtent::new(self.crs, min_x, min_y, max_x, max_y)?)
	}

	pub fn options(&self) -> Result<GenerateOptions, Box<dyn Error>> {
		match &self.options {
			Some(path) => load_json(path),
			None => Ok(GenerateOptions::default()),
		}
	}
}

#[derive(Args)]
pub struct Sources {
	/// Local rasters, highest priority first.
	#[clap(short = 'i', long = "input")]
	pub inputs: Vec<PathBuf>,
	/// The 1-based band of the local rasters that holds land cover classes.
	#[clap(long = "class-band")]
	pub class_band: Option<usize>,
	/// A JSON file with a list of source descriptors, used after the local rasters.
	#[clap(long = "sources")]
	pub sources: Option<PathBuf>,
	/// Use Mapbox terrain tiles where nothing else has data.
	#[clap(long = "mapbox")]
	pub mapbox: bool,
	/// Token for remote tiles. Falls back to the `MAPBOX_TOKEN` environment variable.
	#[clap(long = "token")]
	pub token: Option<String>,
}

impl Sources {
	pub fn load(&self) -> Result<Vec<SourceDescriptor>, Box<dyn Error>> {
		let mut sources: Vec<_> = self
			.inputs
			.iter()
			.map(|path| {
				SourceDescriptor::local(LocalFile {
					classification_band: self.class_band,
					..LocalFile::new(path)
				})
			})
			.collect();
		if let Some(path) = &self.sources {
			sources.extend(load_json::<Vec<SourceDescriptor>>(path)?);
		}
		if self.mapbox {
			sources.push(SourceDescriptor::remote(RemoteTiles::mapbox_terrain()));
		}

		let token = self.token.clone().or_else(|| std::env::var("MAPBOX_TOKEN").ok());
		Ok(sources
			.into_iter()
			.map(|source| {
				let remote = matches!(source.kind(), SourceKind::RemoteTile(_));
				match &token {
					Some(token) if remote && source.credentials().is_none() => {
						source.with_credentials(Credentials::new(token))
					},
					_ => source,
				}
			})
			.collect())
	}
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
	let file = File::open(path).map_err(|e| format!("could not open {}: {}", path.display(), e))?;
	serde_json::from_reader(BufReader::new(file)).map_err(|e| format!("could not parse {}: {}", path.display(), e).into())
}

fn parse_bounds(s: &str) -> Result<[f64; 4], String> {
	let values = s
		.split(',')
		.map(|x| x.trim().parse::<f64>().map_err(|e| format!("`{}`: {}", x, e)))
		.collect::<Result<Vec<_>, _>>()?;
	values
		.try_into()
		.map_err(|x: Vec<f64>| format!("expected 4 values, got {}", x.len()))
}

pub fn parse_point(s: &str) -> Result<Point, String> {
	parse_pair(s).map(|(x, y)| Point::new(x, y))
}

fn parse_pair(s: &str) -> Result<(f64, f64), String> {
	let (x, y) = s.split_once(',').ok_or_else(|| format!("expected `x,y`, got `{}`", s))?;
	let parse = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("`{}`: {}", v, e));
	Ok((parse(x)?, parse(y)?))
}

pub struct Size(pub usize);

impl Display for Size {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let size = self.0;
		if size < 1000 {
			write!(f, "{} B", size)
		} else if size < 1000 * 1000 {
			write!(f, "{:.2} KB", size as f64 / 1000.0)
		} else if size < 1000 * 1000 * 1000 {
			write!(f, "{:.2} MB", size as f64 / 1000.0 / 1000.0)
		} else {
			write!(f, "{:.2} GB", size as f64 / 1000.0 / 1000.0 / 1000.0)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bounds() {
		assert_eq!(parse_bounds("-1, 2.5,3,4").unwrap(), [-1.0, 2.5, 3.0, 4.0]);
		assert!(parse_bounds("1,2,3").is_err());
		assert!(parse_bounds("1,2,x,4").is_err());
	}

	#[test]
	fn point() {
		assert_eq!(parse_point("8.5,47.25").unwrap(), Point::new(8.5, 47.25));
		assert!(parse_point("8.5").is_err());
	}

	#[test]
	fn sizes() {
		assert_eq!(Size(12).to_string(), "12 B");
		assert_eq!(Size(2_500_000).to_string(), "2.50 MB");
	}
}
