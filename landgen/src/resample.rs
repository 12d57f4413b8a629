use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{crs::PixelGrid, GenError, RasterBlock};

/// A source sample counts as fully covering a cell at or above this coverage.
const FULL_COVERAGE: f64 = 1.0 - 1e-9;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
	Nearest,
	#[default]
	Bilinear,
	/// Catmull-Rom.
	Bicubic,
}

impl FromStr for Resampling {
	type Err = GenError;

	fn from_str(s: &str) -> Result<Self, GenError> {
		match s.to_ascii_lowercase().as_str() {
			"nearest" => Ok(Self::Nearest),
			"bilinear" => Ok(Self::Bilinear),
			"bicubic" => Ok(Self::Bicubic),
			_ => Err(GenError::Config(format!("unknown resampling method `{}`", s))),
		}
	}
}

fn cubic(t: f64) -> f64 {
	const A: f64 = -0.5;
	let t = t.abs();
	if t <= 1.0 {
		(A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
	} else if t < 2.0 {
		A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
	} else {
		0.0
	}
}

/// Kernel taps along one axis: pixel index and weight.
fn taps(method: Resampling, coord: f64) -> ([(i64, f64); 4], usize) {
	let mut out = [(0, 0.0); 4];
	match method {
		Resampling::Nearest => {
			out[0] = ((coord + 0.5).floor() as i64, 1.0);
			(out, 1)
		},
		Resampling::Bilinear => {
			let base = coord.floor();
			let t = coord - base;
			let base = base as i64;
			out[0] = (base, 1.0 - t);
			out[1] = (base + 1, t);
			(out, 2)
		},
		Resampling::Bicubic => {
			let base = coord.floor();
			let t = coord - base;
			let base = base as i64;
			for (i, tap) in out.iter_mut().enumerate() {
				let offset = i as i64 - 1;
				*tap = (base + offset, cubic(t - offset as f64));
			}
			(out, 4)
		},
	}
}

/// A kernel evaluation: the value over the valid taps, and the share of kernel weight they carry.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Kernel {
	pub value: f64,
	pub coverage: f64,
}

/// Evaluate the kernel at fractional pixel `(x, y)`, where integers are pixel centres.
///
/// Taps outside the block or on no-data lower the coverage.
pub fn sample(block: &RasterBlock, x: f64, y: f64, method: Resampling) -> Kernel {
	let (xs, nx) = taps(method, x);
	let (ys, ny) = taps(method, y);
	let (w, h) = (block.width() as i64, block.height() as i64);

	let (mut sum, mut weight, mut covered, mut total) = (0.0, 0.0, 0.0, 0.0);
	for &(ty, wy) in &ys[..ny] {
		for &(tx, wx) in &xs[..nx] {
			let wt = wx * wy;
			if wt == 0.0 {
				continue;
			}
			total += wt.abs();
			if tx < 0 || ty < 0 || tx >= w || ty >= h {
				continue;
			}
			if let Some(v) = block.sample(tx as usize, ty as usize) {
				sum += v as f64 * wt;
				weight += wt;
				covered += wt.abs();
			}
		}
	}

	if weight.abs() < 1e-12 || total == 0.0 {
		return Kernel {
			value: 0.0,
			coverage: 0.0,
		};
	}
	Kernel {
		value: sum / weight,
		coverage: covered / total,
	}
}

/// The class of the pixel nearest to `(x, y)`, if it has data.
pub fn sample_class(block: &RasterBlock, x: f64, y: f64) -> Option<u16> {
	nearest_pixel(block, x, y).and_then(|(tx, ty)| block.class(tx, ty))
}

/// Whether `(x, y)` lies in a valid pixel, the footprint a layer can fill on its own.
fn covers(block: &RasterBlock, x: f64, y: f64) -> bool {
	nearest_pixel(block, x, y).map_or(false, |(tx, ty)| block.sample(tx, ty).is_some())
}

fn nearest_pixel(block: &RasterBlock, x: f64, y: f64) -> Option<(usize, usize)> {
	let (tx, ty) = ((x + 0.5).floor() as i64, (y + 0.5).floor() as i64);
	if tx < 0 || ty < 0 || tx >= block.width() as i64 || ty >= block.height() as i64 {
		return None;
	}
	Some((tx as usize, ty as usize))
}

/// One source's block and where each output cell falls in it.
pub struct SourceLayer<'a> {
	pub block: &'a RasterBlock,
	pub pixels: &'a PixelGrid,
}

/// A tile's worth of samples after resampling, before synthesis.
#[derive(Clone, Debug, PartialEq)]
pub struct ResampledGrid {
	pub width: usize,
	pub height: usize,
	pub samples: Vec<f32>,
	pub valid: Vec<bool>,
	pub classes: Option<Vec<u16>>,
}

impl ResampledGrid {
	pub fn sample(&self, x: usize, y: usize) -> Option<f32> {
		let i = y * self.width + x;
		self.valid[i].then(|| self.samples[i])
	}
}

/// Resample `layers`, in priority order, onto a `width` by `height` grid.
///
/// A layer whose kernel is fully covered decides a cell by itself. Otherwise the partial contributions are
/// blended, weighted by coverage, provided they add up to full coverage. Short of that, the blend still stands
/// when the cell centre lies in a valid pixel of a contributing layer, which keeps the ring between a source's
/// edge and its outermost pixel centres. Anything else is no-data.
pub fn resample(layers: &[SourceLayer], width: usize, height: usize, method: Resampling) -> ResampledGrid {
	tracy::zone!("Resample");

	let mut samples = vec![0.0; width * height];
	let mut valid = vec![false; width * height];
	samples
		.par_chunks_mut(width)
		.zip(valid.par_chunks_mut(width))
		.enumerate()
		.for_each(|(row, (samples, valid))| {
			for col in 0..width {
				let (mut blend, mut coverage) = (0.0, 0.0);
				let mut inside = false;
				let mut value = None;
				for layer in layers {
					let Some((x, y)) = layer.pixels.get(col, row) else {
						continue;
					};
					let k = sample(layer.block, x, y, method);
					if k.coverage >= FULL_COVERAGE {
						value = Some(k.value);
						break;
					}
					if k.coverage > 0.0 {
						blend += k.value * k.coverage;
						coverage += k.coverage;
						inside |= covers(layer.block, x, y);
					}
				}
				if value.is_none() && coverage > 0.0 && (coverage >= FULL_COVERAGE || inside) {
					value = Some(blend / coverage);
				}

				if let Some(v) = value {
					samples[col] = v as f32;
					valid[col] = true;
				}
			}
		});

	let classes = layers.iter().any(|x| x.block.classes().is_some()).then(|| {
		let mut classes = vec![0; width * height];
		for row in 0..height {
			for col in 0..width {
				let i = row * width + col;
				if !valid[i] {
					continue;
				}
				classes[i] = layers
					.iter()
					.filter(|x| x.block.classes().is_some())
					.find_map(|x| x.pixels.get(col, row).and_then(|(px, py)| sample_class(x.block, px, py)))
					.unwrap_or(0);
			}
		}
		classes
	});

	ResampledGrid {
		width,
		height,
		samples,
		valid,
		classes,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{crs::grid_to_pixels, Crs, GeoTransform, GeographicExtent, SampleGrid};

	fn ramp(width: usize, height: usize) -> RasterBlock {
		let samples = (0..height)
			.flat_map(|y| (0..width).map(move |x| (2 * x + 3 * y) as f32))
			.collect();
		RasterBlock::new(
			Crs::WGS84,
			GeoTransform::north_up(0.0, height as f64, 1.0, 1.0),
			width,
			height,
			samples,
			vec![true; width * height],
			None,
		)
		.unwrap()
	}

	#[test]
	fn kernels_reproduce_linear_ramps() {
		let block = ramp(8, 8);
		for method in [Resampling::Bilinear, Resampling::Bicubic] {
			let k = sample(&block, 3.25, 4.5, method);
			assert!((k.value - (2.0 * 3.25 + 3.0 * 4.5)).abs() < 1e-9, "{:?}: {}", method, k.value);
			assert_eq!(k.coverage, 1.0);
		}
		let k = sample(&block, 3.4, 4.6, Resampling::Nearest);
		assert_eq!(k.value, 2.0 * 3.0 + 3.0 * 5.0);
	}

	#[test]
	fn coverage_drops_at_edges() {
		let block = ramp(4, 4);
		let k = sample(&block, 3.5, 1.0, Resampling::Bilinear);
		assert!((k.coverage - 0.5).abs() < 1e-12);
		assert_eq!(k.value, 2.0 * 3.0 + 3.0);
		assert_eq!(sample(&block, 10.0, 1.0, Resampling::Bilinear).coverage, 0.0);
	}

	#[test]
	fn cubic_weights_sum_to_one() {
		for t in [0.0, 0.1, 0.5, 0.9] {
			let (taps, n) = taps(Resampling::Bicubic, 5.0 + t);
			let sum: f64 = taps[..n].iter().map(|x| x.1).sum();
			assert!((sum - 1.0).abs() < 1e-12);
		}
	}

	#[test]
	fn first_fully_covering_layer_wins() {
		let low = ramp(4, 4);
		let mut high = RasterBlock::empty(Crs::WGS84, GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), 4, 4, false);
		high.paste(
			&RasterBlock::new(
				Crs::WGS84,
				GeoTransform::north_up(0.0, 4.0, 1.0, 1.0),
				2,
				4,
				vec![100.0; 8],
				vec![true; 8],
				None,
			)
			.unwrap(),
			0,
			0,
		);

		let extent = GeographicExtent::new(Crs::WGS84, 0.0, 0.0, 4.0, 4.0).unwrap();
		let grid = SampleGrid::from_extent(&extent, 1.0);
		let high_px = grid_to_pixels(&grid, Crs::WGS84, high.geo_transform()).unwrap();
		let low_px = grid_to_pixels(&grid, Crs::WGS84, low.geo_transform()).unwrap();
		let out = resample(
			&[
				SourceLayer {
					block: &high,
					pixels: &high_px,
				},
				SourceLayer {
					block: &low,
					pixels: &low_px,
				},
			],
			4,
			4,
			Resampling::Nearest,
		);

		assert_eq!(out.sample(0, 0), Some(100.0));
		assert_eq!(out.sample(1, 3), Some(100.0));
		assert_eq!(out.sample(2, 0), Some(4.0));
		assert_eq!(out.sample(3, 3), Some(15.0));
	}

	#[test]
	fn partial_layers_blend_across_a_seam() {
		// Two sources meeting at x = 2, both a ramp of the same surface.
		let full = ramp(4, 2);
		let left = full.crop(crate::raster::PixelWindow::new(0, 0, 2, 2));
		let right = full.crop(crate::raster::PixelWindow::new(2, 0, 2, 2));

		let extent = GeographicExtent::new(Crs::WGS84, 0.5, 0.0, 3.5, 2.0).unwrap();
		let grid = SampleGrid::from_extent(&extent, 1.0);
		let left_px = grid_to_pixels(&grid, Crs::WGS84, left.geo_transform()).unwrap();
		let right_px = grid_to_pixels(&grid, Crs::WGS84, right.geo_transform()).unwrap();
		let out = resample(
			&[
				SourceLayer {
					block: &left,
					pixels: &left_px,
				},
				SourceLayer {
					block: &right,
					pixels: &right_px,
				},
			],
			3,
			2,
			Resampling::Bilinear,
		);

		// The middle column sits exactly between the sources.
		assert!(out.valid.iter().all(|&x| x));
		let expected = full.sample(1, 0).unwrap() as f64 * 0.5 + full.sample(2, 0).unwrap() as f64 * 0.5;
		assert!((out.sample(1, 0).unwrap() as f64 - expected).abs() < 1e-6);
	}

	#[test]
	fn upsampling_keeps_the_outer_ring() {
		let block = ramp(4, 4);
		let extent = GeographicExtent::new(Crs::WGS84, 0.0, 0.0, 5.0, 4.0).unwrap();
		let grid = SampleGrid::from_extent(&extent, 0.5);
		let px = grid_to_pixels(&grid, Crs::WGS84, block.geo_transform()).unwrap();
		for method in [Resampling::Bilinear, Resampling::Bicubic] {
			let out = resample(
				&[SourceLayer {
					block: &block,
					pixels: &px,
				}],
				10,
				8,
				method,
			);

			for row in 0..8 {
				for col in 0..10 {
					assert_eq!(out.sample(col, row).is_some(), col < 8, "{:?} at {}, {}", method, col, row);
				}
			}
			if method == Resampling::Bilinear {
				// Renormalised over the one valid tap.
				assert_eq!(out.sample(0, 0), block.sample(0, 0));
				assert_eq!(out.sample(7, 7), block.sample(3, 3));
			}
			// Interior cells are untouched.
			let k = sample(&block, 1.25, 1.75, method);
			assert_eq!(out.sample(3, 4), Some(k.value as f32));
		}
	}

	#[test]
	fn classes_follow_nearest_valid_layer() {
		let block = RasterBlock::new(
			Crs::WGS84,
			GeoTransform::north_up(0.0, 2.0, 1.0, 1.0),
			2,
			2,
			vec![1.0; 4],
			vec![true; 4],
			Some(vec![7, 8, 9, 10]),
		)
		.unwrap();

		let extent = GeographicExtent::new(Crs::WGS84, 0.0, 0.0, 2.0, 2.0).unwrap();
		let grid = SampleGrid::from_extent(&extent, 1.0);
		let px = grid_to_pixels(&grid, Crs::WGS84, block.geo_transform()).unwrap();
		let out = resample(
			&[SourceLayer {
				block: &block,
				pixels: &px,
			}],
			2,
			2,
			Resampling::Bilinear,
		);
		assert_eq!(out.classes, Some(vec![7, 8, 9, 10]));
	}
}
