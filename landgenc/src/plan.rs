use std::error::Error;

use clap::Args;
use landgen::{tiling::TilePlan, Point};

use crate::common::{parse_point, Area};

#[derive(Args)]
/// Show how an area is split into tiles.
pub struct Plan {
	#[clap(flatten)]
	area: Area,
	/// List every tile.
	#[clap(short = 'l', long = "list")]
	list: bool,
	/// Find the tile and pixel of an `x,y` position in the extent's CRS.
	#[clap(long = "locate", parse(try_from_str = parse_point), allow_hyphen_values = true)]
	locate: Option<Point>,
}

pub fn plan(plan: Plan) {
	if let Err(e) = run(plan) {
		eprintln!("{}", e);
		std::process::exit(1);
	}
}

fn run(plan: Plan) -> Result<(), Box<dyn Error>> {
	let options = plan.area.options()?;
	let tiles = TilePlan::new(
		plan.area.extent()?,
		plan.area.resolution,
		plan.area.tile_size,
		options.grid_origin,
	)?;
	let size = plan.area.tile_size;

	println!("Plan");
	println!("  Extent: {:?}", tiles.request());
	println!("  Tiles: {} ({} columns, {} rows)", tiles.len(), tiles.cols(), tiles.rows());
	println!(
		"  Samples: {}x{}",
		tiles.cols() as usize * size,
		tiles.rows() as usize * size
	);

	if plan.list {
		println!();
		println!("Tiles");
		for tile in tiles.tiles()? {
			println!(
				"  {}, {} (grid {}, {}): {:?}",
				tile.row, tile.col, tile.grid.row, tile.grid.col, tile.coverage
			);
		}
	}

	if let Some(point) = plan.locate {
		let georeference = tiles.georeference();
		let location = georeference.locate(point, georeference.crs)?;
		println!();
		println!(
			"({}, {}) is in grid tile {}, {} at pixel ({:.2}, {:.2})",
			point.x, point.y, location.tile.row, location.tile.col, location.pixel_x, location.pixel_y
		);
	}

	Ok(())
}
