use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{resample::ResampledGrid, GenError, Result};

/// Maps elevations in metres to `u16` heightmap values: `q = round((e - offset) / scale)`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeightEncoding {
	pub offset: f64,
	pub scale: f64,
}

impl Default for HeightEncoding {
	fn default() -> Self {
		Self {
			offset: -500.0,
			scale: 0.2,
		}
	}
}

impl HeightEncoding {
	pub fn new(offset: f64, scale: f64) -> Result<Self> {
		if !offset.is_finite() || !scale.is_finite() || scale <= 0.0 {
			return Err(GenError::Config(format!(
				"invalid height encoding: offset {}, scale {}",
				offset, scale
			)));
		}
		Ok(Self { offset, scale })
	}

	/// The finest encoding that spans `min..=max`.
	pub fn fit(min: f64, max: f64) -> Result<Self> {
		if !(min <= max) {
			return Err(GenError::Config(format!("invalid elevation range {}..{}", min, max)));
		}
		let scale = if max > min { (max - min) / u16::MAX as f64 } else { 1.0 };
		Self::new(min, scale)
	}

	/// The quantized value, and whether it had to be clamped.
	pub fn quantize(&self, elevation: f64) -> (u16, bool) {
		let q = ((elevation - self.offset) / self.scale).round();
		if q.is_nan() || q < 0.0 {
			(0, true)
		} else if q > u16::MAX as f64 {
			(u16::MAX, true)
		} else {
			(q as u16, false)
		}
	}

	pub fn dequantize(&self, value: u16) -> f64 { self.offset + value as f64 * self.scale }

	/// The lowest and highest representable elevations.
	pub fn range(&self) -> (f64, f64) { (self.dequantize(0), self.dequantize(u16::MAX)) }
}

/// Per-class weights for the landscape's paint layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightmapConfig {
	pub layers: Vec<String>,
	/// Classification value to one weight per layer.
	pub classes: BTreeMap<u16, Vec<f32>>,
	/// Weights for classes missing from `classes`.
	#[serde(default)]
	pub fallback: Option<Vec<f32>>,
}

impl WeightmapConfig {
	pub fn validate(&self) -> Result<()> {
		if self.layers.is_empty() {
			return Err(GenError::Config("weightmap table has no layers".to_string()));
		}
		for (i, layer) in self.layers.iter().enumerate() {
			if self.layers[..i].contains(layer) {
				return Err(GenError::Config(format!("weightmap layer `{}` is listed twice", layer)));
			}
		}

		let rows = self
			.classes
			.iter()
			.map(|(class, w)| (Some(*class), w))
			.chain(self.fallback.iter().map(|w| (None, w)));
		for (class, weights) in rows {
			let name = class.map_or_else(|| "fallback".to_string(), |c| format!("class {}", c));
			if weights.len() != self.layers.len() {
				return Err(GenError::Config(format!(
					"{} has {} weights for {} layers",
					name,
					weights.len(),
					self.layers.len()
				)));
			}
			if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
				return Err(GenError::Config(format!("{} has a negative or non-finite weight", name)));
			}
		}
		Ok(())
	}

	pub fn weights_for(&self, class: u16) -> Result<&[f32]> {
		self.classes
			.get(&class)
			.or(self.fallback.as_ref())
			.map(|x| x.as_slice())
			.ok_or(GenError::UnmappedClassification(class))
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct Weightmap {
	pub layer: String,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Synthesized {
	pub width: usize,
	pub height: usize,
	pub heightmap: Vec<u16>,
	pub no_data: Vec<bool>,
	pub weightmaps: Vec<Weightmap>,
	pub filled_holes: usize,
	pub unfilled_holes: usize,
	pub clamped_samples: usize,
	pub elevation_range: Option<(f32, f32)>,
}

#[derive(Copy, Clone, Default)]
struct RowStats {
	filled: usize,
	unfilled: usize,
	clamped: usize,
	range: Option<(f32, f32)>,
}

impl RowStats {
	fn merge(self, other: RowStats) -> RowStats {
		RowStats {
			filled: self.filled + other.filled,
			unfilled: self.unfilled + other.unfilled,
			clamped: self.clamped + other.clamped,
			range: match (self.range, other.range) {
				(Some(a), Some(b)) => Some((a.0.min(b.0), a.1.max(b.1))),
				(a, b) => a.or(b),
			},
		}
	}
}

/// Inverse-distance (power 2) interpolation from the valid samples within `radius` cells of `(x, y)`.
pub fn inverse_distance(grid: &ResampledGrid, x: usize, y: usize, radius: usize) -> Option<f64> {
	let r = radius as i64;
	let (mut sum, mut weights) = (0.0, 0.0);
	for dy in -r..=r {
		let yy = y as i64 + dy;
		if yy < 0 || yy >= grid.height as i64 {
			continue;
		}
		for dx in -r..=r {
			let d2 = dx * dx + dy * dy;
			let xx = x as i64 + dx;
			if d2 == 0 || d2 > r * r || xx < 0 || xx >= grid.width as i64 {
				continue;
			}
			if let Some(v) = grid.sample(xx as usize, yy as usize) {
				let w = 1.0 / d2 as f64;
				sum += v as f64 * w;
				weights += w;
			}
		}
	}
	(weights > 0.0).then(|| sum / weights)
}

/// Turns resampled grids into heightmaps and weightmaps.
#[derive(Clone, Debug)]
pub struct Synthesizer {
	encoding: HeightEncoding,
	fill_radius: usize,
	weightmap: Option<WeightmapConfig>,
}

impl Synthesizer {
	pub fn new(encoding: HeightEncoding, fill_radius: usize, weightmap: Option<WeightmapConfig>) -> Result<Self> {
		HeightEncoding::new(encoding.offset, encoding.scale)?;
		if let Some(w) = &weightmap {
			w.validate()?;
		}
		Ok(Self {
			encoding,
			fill_radius,
			weightmap,
		})
	}

	pub fn encoding(&self) -> HeightEncoding { self.encoding }

	pub fn fill_radius(&self) -> usize { self.fill_radius }

	pub fn without_weightmaps(&self) -> Self {
		Self {
			weightmap: None,
			..self.clone()
		}
	}

	/// Synthesize the interior of `grid`, which carries `halo` extra samples on every side.
	///
	/// Holes are filled only from samples that were valid before filling, so the result is independent of the
	/// order cells are visited in.
	pub fn synthesize(&self, grid: &ResampledGrid, halo: usize) -> Result<Synthesized> {
		tracy::zone!("Synthesize");

		if grid.width < 2 * halo || grid.height < 2 * halo {
			return Err(GenError::Config(format!(
				"a {}x{} grid cannot carry a halo of {}",
				grid.width, grid.height, halo
			)));
		}
		let width = grid.width - 2 * halo;
		let height = grid.height - 2 * halo;
		let mut heightmap = vec![0u16; width * height];
		let mut no_data = vec![true; width * height];

		let stats = heightmap
			.par_chunks_mut(width.max(1))
			.zip(no_data.par_chunks_mut(width.max(1)))
			.enumerate()
			.map(|(row, (heights, no_data))| {
				let mut stats = RowStats::default();
				for col in 0..width {
					let (x, y) = (col + halo, row + halo);
					let elevation = match grid.sample(x, y) {
						Some(v) => Some(v as f64),
						None if self.fill_radius > 0 => {
							let filled = inverse_distance(grid, x, y, self.fill_radius);
							if filled.is_some() {
								stats.filled += 1;
							}
							filled
						},
						None => None,
					};

					let elevation = match elevation {
						Some(x) => x,
						None => {
							stats.unfilled += 1;
							continue;
						},
					};
					let (q, clamped) = self.encoding.quantize(elevation);
					heights[col] = q;
					no_data[col] = false;
					stats.clamped += clamped as usize;
					let e = elevation as f32;
					stats.range = Some(stats.range.map_or((e, e), |(lo, hi)| (lo.min(e), hi.max(e))));
				}
				stats
			})
			.reduce(RowStats::default, RowStats::merge);

		let weightmaps = match &self.weightmap {
			Some(config) => self.weightmaps(config, grid, halo, width, height)?,
			None => Vec::new(),
		};

		Ok(Synthesized {
			width,
			height,
			heightmap,
			no_data,
			weightmaps,
			filled_holes: stats.filled,
			unfilled_holes: stats.unfilled,
			clamped_samples: stats.clamped,
			elevation_range: stats.range,
		})
	}

	fn weightmaps(
		&self, config: &WeightmapConfig, grid: &ResampledGrid, halo: usize, width: usize, height: usize,
	) -> Result<Vec<Weightmap>> {
		tracy::zone!("Weightmaps");

		let mut maps: Vec<_> = config
			.layers
			.iter()
			.map(|layer| Weightmap {
				layer: layer.clone(),
				data: vec![0; width * height],
			})
			.collect();

		for row in 0..height {
			for col in 0..width {
				let i = (row + halo) * grid.width + col + halo;
				// Filled holes have no class of their own.
				if !grid.valid[i] {
					continue;
				}
				let class = grid.classes.as_ref().map_or(0, |c| c[i]);
				let weights = config.weights_for(class)?;
				for (map, &w) in maps.iter_mut().zip(weights) {
					map.data[row * width + col] = (w.clamp(0.0, 1.0) * 255.0).round() as u8;
				}
			}
		}

		Ok(maps)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn grid(width: usize, height: usize, values: Vec<Option<f32>>) -> ResampledGrid {
		ResampledGrid {
			width,
			height,
			samples: values.iter().map(|x| x.unwrap_or(0.0)).collect(),
			valid: values.iter().map(|x| x.is_some()).collect(),
			classes: None,
		}
	}

	#[test]
	fn quantize_round_trips_every_value() {
		let encodings = [
			HeightEncoding::default(),
			HeightEncoding::fit(-430.0, 8849.0).unwrap(),
			HeightEncoding::new(0.0, 1.0).unwrap(),
		];
		for e in encodings {
			for q in 0..=u16::MAX {
				assert_eq!(e.quantize(e.dequantize(q)), (q, false), "{:?}", e);
			}
		}
	}

	#[test]
	fn quantize_clamps() {
		let e = HeightEncoding::default();
		assert_eq!(e.quantize(-1000.0), (0, true));
		assert_eq!(e.quantize(20000.0), (u16::MAX, true));
		assert_eq!(e.quantize(0.0), (2500, false));
		assert_eq!(e.range(), (-500.0, -500.0 + 65535.0 * 0.2));
		assert!(HeightEncoding::new(0.0, 0.0).is_err());
	}

	#[test]
	fn fit_spans_range() {
		let e = HeightEncoding::fit(100.0, 200.0).unwrap();
		assert_eq!(e.quantize(100.0), (0, false));
		assert_eq!(e.quantize(200.0), (u16::MAX, false));
		assert!(HeightEncoding::fit(2.0, 1.0).is_err());
	}

	#[test]
	fn holes_stay_without_radius() {
		let g = grid(2, 2, vec![Some(0.0), None, None, None]);
		let out = Synthesizer::new(HeightEncoding::default(), 0, None)
			.unwrap()
			.synthesize(&g, 0)
			.unwrap();
		assert_eq!(out.unfilled_holes, 3);
		assert_eq!(out.no_data, vec![false, true, true, true]);
		assert_eq!(out.heightmap[0], 2500);
		assert_eq!(out.elevation_range, Some((0.0, 0.0)));
	}

	#[test]
	fn idw_fills_within_radius() {
		let mut values = vec![None; 25];
		values[0] = Some(10.0);
		values[2] = Some(30.0);
		let g = grid(5, 5, values);
		let out = Synthesizer::new(HeightEncoding::new(0.0, 1.0).unwrap(), 2, None)
			.unwrap()
			.synthesize(&g, 0)
			.unwrap();

		// (1, 0) is one away from both samples.
		assert_eq!(out.heightmap[1], 20);
		assert!(!out.no_data[1]);
		// (4, 4) has nothing within two cells.
		assert!(out.no_data[24]);
		assert_eq!(out.filled_holes + out.unfilled_holes, 23);
	}

	#[test]
	fn halo_is_cropped_but_feeds_fills() {
		let mut values = vec![None; 9];
		values[3] = Some(8.0);
		let g = grid(3, 3, values);
		let out = Synthesizer::new(HeightEncoding::new(0.0, 1.0).unwrap(), 1, None)
			.unwrap()
			.synthesize(&g, 1)
			.unwrap();
		assert_eq!((out.width, out.height), (1, 1));
		assert_eq!(out.heightmap, vec![8]);
		assert_eq!(out.filled_holes, 1);
	}

	#[test]
	fn weightmaps_from_classes() {
		let config = WeightmapConfig {
			layers: vec!["grass".into(), "rock".into()],
			classes: [(1, vec![1.0, 0.0]), (2, vec![0.25, 0.75])].into_iter().collect(),
			fallback: None,
		};
		let mut g = grid(2, 1, vec![Some(1.0), Some(2.0)]);
		g.classes = Some(vec![1, 2]);
		let synth = Synthesizer::new(HeightEncoding::default(), 0, Some(config)).unwrap();
		let out = synth.synthesize(&g, 0).unwrap();
		assert_eq!(out.weightmaps[0].layer, "grass");
		assert_eq!(out.weightmaps[0].data, vec![255, 64]);
		assert_eq!(out.weightmaps[1].data, vec![0, 191]);

		g.classes = Some(vec![1, 9]);
		assert!(matches!(
			synth.synthesize(&g, 0),
			Err(GenError::UnmappedClassification(9))
		));
		assert!(synth.without_weightmaps().synthesize(&g, 0).unwrap().weightmaps.is_empty());
	}

	#[test]
	fn fallback_and_validation() {
		let mut config = WeightmapConfig {
			layers: vec!["a".into()],
			classes: BTreeMap::new(),
			fallback: Some(vec![0.5]),
		};
		assert_eq!(config.weights_for(42).unwrap(), &[0.5]);
		config.classes.insert(3, vec![1.0, 0.0]);
		assert!(matches!(config.validate(), Err(GenError::Config(_))));
		config.classes.clear();
		config.layers.push("a".into());
		assert!(config.validate().is_err());
	}
}
