use std::{
	error::Error,
	fs::File,
	io::{BufWriter, Write},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use clap::Args;
use landgen::{
	CancelToken,
	Diagnostics,
	GenerateRequest,
	Generator,
	GeographicExtent,
	HeightEncoding,
	OutputTile,
	Resampling,
	WeightmapConfig,
};
use serde::Serialize;

use crate::common::{load_json, Area, Size, Sources};

#[derive(Args)]
/// Generate landscape tiles.
pub struct Generate {
	#[clap(flatten)]
	area: Area,
	#[clap(flatten)]
	sources: Sources,
	/// The directory to write tiles to.
	#[clap(short = 'o', long = "out")]
	output: PathBuf,
	#[clap(long = "resampling")]
	resampling: Option<Resampling>,
	/// Fill holes from data within this many samples.
	#[clap(long = "fill-radius")]
	fill_radius: Option<usize>,
	/// A JSON weightmap table.
	#[clap(short = 'w', long = "weightmap")]
	weightmap: Option<PathBuf>,
}

#[derive(Serialize)]
struct Manifest<'a> {
	extent: GeographicExtent,
	resolution: f64,
	tile_size: usize,
	encoding: HeightEncoding,
	tiles: Vec<TileEntry>,
	diagnostics: &'a Diagnostics,
}

#[derive(Serialize)]
struct TileEntry {
	row: u32,
	col: u32,
	grid_row: i64,
	grid_col: i64,
	extent: GeographicExtent,
	coverage: GeographicExtent,
	heightmap: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	no_data: Option<String>,
	weightmaps: Vec<String>,
	unfilled_holes: usize,
	clamped_samples: usize,
	elevation_range: Option<(f32, f32)>,
}

pub fn generate(generate: Generate) {
	if let Err(e) = run(generate) {
		eprintln!("{}", e);
		std::process::exit(1);
	}
}

fn run(generate: Generate) -> Result<(), Box<dyn Error>> {
	let mut options = generate.area.options()?;
	if let Some(resampling) = generate.resampling {
		options.resampling = resampling;
	}
	if let Some(radius) = generate.fill_radius {
		options.hole_fill_radius = radius;
	}
	if let Some(path) = &generate.weightmap {
		options.weightmap = Some(load_json::<WeightmapConfig>(path)?);
	}
	let encoding = options.height_encoding;

	let request = GenerateRequest::new(
		generate.area.extent()?,
		generate.area.resolution,
		generate.area.tile_size,
		generate.sources.load()?,
	)
	.with_options(options);
	let total = request.plan()?.len();
	let extent = request.extent;

	std::fs::create_dir_all(&generate.output)?;
	let generator = Generator::new()?;
	let cancel = CancelToken::new();
	handle_ctrlc(cancel.clone());

	let mut tiles = Vec::with_capacity(total);
	let mut written = 0;
	let mut had_error = false;
	let mut done = 0;
	print!("\r{}/{}", done, total);
	let _ = std::io::stdout().flush();

	let diagnostics = generator.generate_with(request, cancel, |tile| {
		tracy::zone!("Write tile");
		match write_tile(&generate.output, &tile) {
			Ok((entry, bytes)) => {
				tiles.push(entry);
				written += bytes;
			},
			Err(e) => {
				println!("\nError writing tile {}, {}: {}", tile.row, tile.col, e);
				had_error = true;
			},
		}

		done += 1;
		print!("\r{}/{}", done, total);
		let _ = std::io::stdout().flush();
	})?;
	println!();

	tiles.sort_by_key(|x| (x.row, x.col));
	let manifest = Manifest {
		extent,
		resolution: generate.area.resolution,
		tile_size: generate.area.tile_size,
		encoding,
		tiles,
		diagnostics: &diagnostics,
	};
	let mut out = BufWriter::new(File::create(generate.output.join("manifest.json"))?);
	serde_json::to_writer_pretty(&mut out, &manifest)?;
	out.flush()?;

	report(&diagnostics, written, generator.cache().bytes());
	if had_error || diagnostics.cancelled {
		return Err("Not all tiles were written".into());
	}
	Ok(())
}

fn handle_ctrlc(cancel: CancelToken) {
	let handler_used = Arc::new(AtomicBool::new(false));
	let _ = ctrlc::set_handler(move || {
		if handler_used.load(Ordering::Acquire) {
			std::process::exit(1);
		}

		println!("\nFinishing up, press Ctrl + C again to exit immediately");
		handler_used.store(true, Ordering::Release);
		cancel.cancel();
	});
}

fn write_tile(dir: &Path, tile: &OutputTile) -> std::io::Result<(TileEntry, usize)> {
	let name = format!("tile_{}_{}", tile.row, tile.col);
	let mut bytes = 0;
	let mut write = |file: String, data: &[u8]| -> std::io::Result<String> {
		std::fs::write(dir.join(&file), data)?;
		bytes += data.len();
		Ok(file)
	};

	let heightmap: Vec<_> = tile.heightmap.iter().flat_map(|x| x.to_le_bytes()).collect();
	let heightmap = write(format!("{}.r16", name), &heightmap)?;

	let no_data = if tile.no_data.iter().any(|&x| x) {
		let mask: Vec<_> = tile.no_data.iter().map(|&x| if x { 255 } else { 0 }).collect();
		Some(write(format!("{}.mask", name), &mask)?)
	} else {
		None
	};

	let weightmaps = tile
		.weightmaps
		.iter()
		.map(|w| write(format!("{}_{}.raw", name, w.layer), &w.data))
		.collect::<Result<_, _>>()?;

	let entry = TileEntry {
		row: tile.row,
		col: tile.col,
		grid_row: tile.grid.row,
		grid_col: tile.grid.col,
		extent: tile.extent,
		coverage: tile.coverage,
		heightmap,
		no_data,
		weightmaps,
		unfilled_holes: tile.unfilled_holes,
		clamped_samples: tile.clamped_samples,
		elevation_range: tile.elevation_range,
	};
	Ok((entry, bytes))
}

fn report(diagnostics: &Diagnostics, written: usize, cached: usize) {
	println!(
		"Wrote {} of {} tiles ({})",
		diagnostics.tiles_emitted,
		diagnostics.tiles_planned,
		Size(written)
	);
	println!("  Cached source data: {}", Size(cached));
	if diagnostics.unfilled_holes > 0 {
		println!("  Samples without data: {}", diagnostics.unfilled_holes);
	}
	if diagnostics.clamped_samples > 0 {
		println!("  Samples outside the height encoding: {}", diagnostics.clamped_samples);
	}
	for (kind, count) in &diagnostics.errors {
		println!("  {}: {}", kind, count);
	}
	for message in &diagnostics.messages {
		log::warn!("{}", message);
	}
}
