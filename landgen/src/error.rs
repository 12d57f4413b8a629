use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = GenError> = std::result::Result<T, E>;

#[derive(Clone, Debug, Error)]
pub enum GenError {
	#[error("Unsupported CRS: {0}")]
	UnsupportedCrs(String),
	#[error("({x}, {y}) is outside the domain of {from} -> {to}")]
	ProjectionDomain { x: f64, y: f64, from: String, to: String },
	#[error("Source unavailable: {0}")]
	SourceUnavailable(String),
	#[error("Partial coverage: {0}")]
	PartialCoverage(String),
	#[error("Decode error: {0}")]
	Decode(String),
	#[error("Classification value {0} has no weightmap mapping")]
	UnmappedClassification(u16),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

impl GenError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::UnsupportedCrs(_) => ErrorKind::UnsupportedCrs,
			Self::ProjectionDomain { .. } => ErrorKind::ProjectionDomain,
			Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
			Self::PartialCoverage(_) => ErrorKind::PartialCoverage,
			Self::Decode(_) => ErrorKind::Decode,
			Self::UnmappedClassification(_) => ErrorKind::UnmappedClassification,
			Self::Config(_) => ErrorKind::Config,
		}
	}

	/// Errors that end a generation run instead of degrading a single tile.
	pub fn is_fatal(&self) -> bool { matches!(self, Self::UnsupportedCrs(_) | Self::Config(_)) }
}

impl From<std::io::Error> for GenError {
	fn from(x: std::io::Error) -> Self { Self::SourceUnavailable(x.to_string()) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorKind {
	UnsupportedCrs,
	ProjectionDomain,
	SourceUnavailable,
	PartialCoverage,
	Decode,
	UnmappedClassification,
	Config,
}

impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
		let name = match self {
			Self::UnsupportedCrs => "unsupported CRS",
			Self::ProjectionDomain => "projection domain",
			Self::SourceUnavailable => "source unavailable",
			Self::PartialCoverage => "partial coverage",
			Self::Decode => "decode",
			Self::UnmappedClassification => "unmapped classification",
			Self::Config => "configuration",
		};
		f.write_str(name)
	}
}
