//! Voronoi iteration over the histogram.
//!
//! Each pass reassigns every histogram entry to its nearest palette color and
//! then moves each palette color to the weighted average of the entries
//! assigned to it, one step of k-means in the working color space.

use crate::color::PremulRgba;
use crate::hist::{HistEntry, Histogram};
use crate::mediancut::Colormap;
use crate::nearest::NearestMap;

/// Weighted color sum for one palette entry during a pass.
#[derive(Debug, Clone, Copy, Default)]
struct State {
	/// Sum of assigned colors scaled by weight
	color: [f64; 4],
	/// Sum of assigned weights
	total: f64,
}

impl State {
	/// Accumulates one histogram entry
	fn update(&mut self, color: PremulRgba, value: f64) {
		self.color[0] += f64::from(color.a) * value;
		self.color[1] += f64::from(color.r) * value;
		self.color[2] += f64::from(color.g) * value;
		self.color[3] += f64::from(color.b) * value;
		self.total += value;
	}
}

/// Moves each palette color to the average of its assigned entries. Colors
/// with nothing assigned keep their position but lose all popularity.
fn finalize(map: &mut Colormap, states: &[State]) {
	for (entry, state) in map.entries.iter_mut().zip(states) {
		if state.total > 0.0 {
			#[allow(clippy::cast_possible_truncation)]
			{
				entry.color = PremulRgba::new(
					(state.color[0] / state.total) as f32,
					(state.color[1] / state.total) as f32,
					(state.color[2] / state.total) as f32,
					(state.color[3] / state.total) as f32,
				);
			}
		}
		#[allow(clippy::cast_possible_truncation)]
		{
			entry.popularity = state.total as f32;
		}
	}
}

/// One Voronoi pass over the histogram, updating the palette in place.
///
/// Returns the weighted mean squared error of the assignment, before the
/// palette moved. `callback` sees every entry and its distance, which the
/// palette search loop uses to reweight the histogram between trials.
pub(crate) fn do_iteration(
	hist: &mut Histogram,
	map: &mut Colormap,
	min_opaque: f32,
	mut callback: Option<&mut dyn FnMut(&mut HistEntry, f32)>,
) -> f64 {
	let mut states = vec![State::default(); map.len()];
	let nearest = NearestMap::new(map);

	let mut total_diff = 0.0f64;
	for entry in &mut hist.entries {
		let (match_index, diff) = nearest.search(entry.color, min_opaque);
		total_diff += f64::from(diff) * f64::from(entry.perceptual_weight);

		states[usize::from(match_index)].update(entry.color, f64::from(entry.perceptual_weight));

		if let Some(cb) = callback.as_deref_mut() {
			cb(entry, diff);
		}
	}
	finalize(map, &states);

	total_diff / hist.total_perceptual_weight
}
