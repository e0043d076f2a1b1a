//! Accelerated nearest-palette-color search.
//!
//! Palette colors are grouped under a set of "heads" picked from a coarser
//! snapshot of the palette. A query first finds a head whose radius covers it
//! and then scans only that head's candidate list, which is much smaller than
//! the whole palette. A head's answer is only trusted when the candidate list
//! provably contains the nearest color; otherwise the search moves on, ending
//! at a catch-all head holding the full palette.

use crate::color::{self, PremulRgba, MAX_DIFF};
use crate::mediancut::Colormap;

/// One palette color reachable from a head.
#[derive(Debug, Clone)]
struct Candidate {
	/// The palette color
	color: PremulRgba,
	/// Index of the color in the full palette
	index: u8,
}

/// A cluster center with the palette colors near it.
#[derive(Debug)]
struct Head {
	/// Center of the cluster
	center: PremulRgba,
	/// Squared radius within which this head's candidates are searched
	radius: f64,
	/// Palette colors sorted by distance from the center
	candidates: Vec<Candidate>,
}

/// Nearest-color index over one palette.
#[derive(Debug)]
pub(crate) struct NearestMap {
	/// Heads in search order, ending with a catch-all head of infinite radius
	heads: Vec<Head>,
}

/// Builds one head at `center` from the `num_candidates` closest palette
/// colors. Colors deep inside the head's radius are claimed, which shrinks the
/// head budget left for the remaining centers.
fn build_head(
	center: PremulRgba,
	map: &Colormap,
	num_candidates: usize,
	claimed: &mut [bool],
	skipped: &mut usize,
) -> Head {
	let mut colors: Vec<(f32, usize)> = map
		.entries
		.iter()
		.enumerate()
		.map(|(i, entry)| (color::color_difference(center, entry.color), i))
		.collect();
	colors.sort_by(|x, y| f32::total_cmp(&x.0, &y.0));

	let num_candidates = num_candidates.min(colors.len());
	let candidates = colors[..num_candidates]
		.iter()
		.map(|&(_, i)| Candidate {
			color: map.entries[i].color,
			#[allow(clippy::cast_possible_truncation)]
			index: i as u8,
		})
		.collect();
	// /4 = /2 squared: candidates cover twice the guaranteed search radius
	let radius = f64::from(colors[num_candidates - 1].0) / 4.0;

	for &(dist, i) in &colors[..num_candidates] {
		// 1/256 is a tolerance for rounding in the difference metric
		if !claimed[i] && f64::from(dist) < radius / 4.0 - 1.0 / 256.0 {
			claimed[i] = true;
			*skipped += 1;
		}
	}

	Head { center, radius, candidates }
}

impl NearestMap {
	/// Builds the search structure for `map`. Head centers come from the
	/// palette's coarse subset when one was recorded.
	pub(crate) fn new(map: &Colormap) -> Self {
		let colors = map.len();
		let mut claimed = vec![false; colors];
		let mut skipped = 0usize;

		// cap the head count; the subset snapshot can be larger than useful
		let wanted_heads = (colors + 3) / 4;
		let centers: Vec<PremulRgba> = match &map.subset {
			Some(subset) if subset.len() <= wanted_heads => {
				subset.iter().map(|e| e.color).collect()
			}
			Some(subset) => subset[..wanted_heads].iter().map(|e| e.color).collect(),
			None => map.entries[..wanted_heads.min(colors)]
				.iter()
				.map(|e| e.color)
				.collect(),
		};

		let selected_heads = centers.len();
		let mut heads = Vec::with_capacity(selected_heads + 1);
		for (h, &center) in centers.iter().enumerate() {
			// once every color is claimed by some head, more heads are useless
			if skipped >= colors {
				break;
			}
			let num_candidates = 1 + (colors - skipped) / ((1 + selected_heads - h) / 2).max(1);
			heads.push(build_head(center, map, num_candidates, &mut claimed, &mut skipped));
		}

		// the catch-all head holds the full palette, so queries the other
		// heads cannot answer exactly still get the true nearest color
		heads.push(Head {
			center: PremulRgba::TRANSPARENT,
			radius: MAX_DIFF,
			candidates: map
				.entries
				.iter()
				.enumerate()
				.map(|(i, entry)| Candidate {
					color: entry.color,
					#[allow(clippy::cast_possible_truncation)]
					index: i as u8,
				})
				.collect(),
		});

		Self { heads }
	}

	/// Finds the palette index closest to `px` and the squared distance to it.
	///
	/// Colors more opaque than `min_opaque` are steered away from
	/// semitransparent palette entries, because IE6 renders any partial
	/// transparency as a fully transparent hole.
	pub(crate) fn search(&self, px: PremulRgba, min_opaque: f32) -> (u8, f32) {
		let iebug = px.a > min_opaque;

		for head in &self.heads {
			let headdist = f64::from(color::color_difference(px, head.center));
			if headdist > head.radius {
				continue;
			}

			let mut best_index = 0u8;
			let mut best_dist = f32::INFINITY;
			for candidate in &head.candidates {
				let mut dist = color::color_difference(px, candidate.color);
				// penalty for making holes in IE
				if iebug && candidate.color.a < 1.0 {
					dist += 1.0 / 1024.0;
				}
				if dist < best_dist {
					best_dist = dist;
					best_index = candidate.index;
				}
			}

			// every color outside the candidate list is at least twice the
			// head's radius away from the center, so by the triangle
			// inequality the match is the true nearest when it beats that
			// bound; the 1/1024 slack absorbs single-precision rounding
			let farthest = (4.0 * head.radius).sqrt();
			if f64::from(best_dist).sqrt() + headdist.sqrt() + 1.0 / 1024.0 <= farthest {
				return (best_index, best_dist);
			}
		}
		unreachable!("the catch-all head covers all queries");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::color::INTERNAL_GAMMA;
	use crate::mediancut::MapEntry;
	use palette::Srgba;
	use rand::{Rng, SeedableRng};
	use rand_xoshiro::Xoshiro256StarStar;

	fn colormap_of(colors: &[Srgba<u8>]) -> Colormap {
		Colormap {
			entries: colors
				.iter()
				.map(|&c| MapEntry {
					color: color::to_premul(INTERNAL_GAMMA, c),
					popularity: 1.0,
				})
				.collect(),
			subset: None,
		}
	}

	fn brute_force(map: &Colormap, px: PremulRgba) -> f32 {
		map.entries
			.iter()
			.map(|entry| color::color_difference(px, entry.color))
			.min_by(f32::total_cmp)
			.unwrap()
	}

	#[test]
	fn finds_exact_palette_colors() {
		let colors: Vec<_> = (0..16).map(|i| Srgba::new(i * 16, 255 - i * 8, i, 255)).collect();
		let map = colormap_of(&colors);
		let nearest = NearestMap::new(&map);

		for (i, entry) in map.entries.iter().enumerate() {
			let (found, dist) = nearest.search(entry.color, 1.0);
			assert_eq!(usize::from(found), i);
			assert_eq!(dist, 0.0);
		}
	}

	#[test]
	fn matches_brute_force_on_random_queries() {
		let mut rng = Xoshiro256StarStar::seed_from_u64(42);
		let colors: Vec<_> = (0..64)
			.map(|_| {
				Srgba::new(
					rng.gen::<u8>(),
					rng.gen::<u8>(),
					rng.gen::<u8>(),
					rng.gen_range(128..=255),
				)
			})
			.collect();
		let map = colormap_of(&colors);
		let nearest = NearestMap::new(&map);

		for _ in 0..10_000 {
			let px = color::to_premul(
				INTERNAL_GAMMA,
				Srgba::new(rng.gen(), rng.gen(), rng.gen(), rng.gen()),
			);
			let (found, dist) = nearest.search(px, 1.0);

			// the reported distance is the real distance to the returned color
			assert_eq!(dist, color::color_difference(px, map.entries[usize::from(found)].color));
			// and no other palette color is any closer
			assert_eq!(dist, brute_force(&map, px));
		}
	}

	#[test]
	fn matches_brute_force_when_heads_come_from_a_subset() {
		let mut rng = Xoshiro256StarStar::seed_from_u64(7);
		let colors: Vec<_> = (0..64)
			.map(|_| Srgba::new(rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>(), 255))
			.collect();
		let mut map = colormap_of(&colors);
		// a lopsided subset forces late heads with large radii
		map.subset = Some(
			map.entries[..8]
				.iter()
				.map(|e| MapEntry { color: e.color, popularity: 1.0 })
				.collect(),
		);
		let nearest = NearestMap::new(&map);

		for _ in 0..10_000 {
			let px = color::to_premul(
				INTERNAL_GAMMA,
				Srgba::new(rng.gen(), rng.gen(), rng.gen(), rng.gen()),
			);
			let (_, dist) = nearest.search(px, 1.0);
			assert_eq!(dist, brute_force(&map, px));
		}
	}

	#[test]
	fn opacity_penalty_prefers_opaque_entries() {
		let map = colormap_of(&[Srgba::new(128, 128, 128, 254), Srgba::new(131, 131, 131, 255)]);
		let nearest = NearestMap::new(&map);

		// opaque gray: nearer to entry 0, but entry 0 is semitransparent
		let px = color::to_premul(INTERNAL_GAMMA, Srgba::new(128, 128, 128, 255));
		let (penalized, _) = nearest.search(px, 0.95);
		assert_eq!(penalized, 1);

		let (plain, _) = nearest.search(px, 1.0);
		assert_eq!(plain, 0);
	}

	#[test]
	fn single_color_palette_always_matches() {
		let map = colormap_of(&[Srgba::new(10, 20, 30, 255)]);
		let nearest = NearestMap::new(&map);
		let px = color::to_premul(INTERNAL_GAMMA, Srgba::new(250, 250, 250, 255));
		assert_eq!(nearest.search(px, 1.0).0, 0);
	}
}
