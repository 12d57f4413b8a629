use clap::{Parser, Subcommand};

use crate::{generate::Generate, plan::Plan};
#[cfg(feature = "gdal")]
use crate::info::Info;

mod common;
mod generate;
#[cfg(feature = "gdal")]
mod info;
mod plan;

#[derive(Parser)]
struct Options {
	#[clap(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	Generate(Generate),
	Plan(Plan),
	#[cfg(feature = "gdal")]
	Info(Info),
}

fn main() {
	env_logger::init();

	let opts: Options = Options::parse();
	match opts.command {
		Command::Generate(generate) => generate::generate(generate),
		Command::Plan(plan) => plan::plan(plan),
		#[cfg(feature = "gdal")]
		Command::Info(info) => info::info(info),
	}
}
