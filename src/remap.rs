//! Remapping of image pixels to a finished palette.
//!
//! The direct remap assigns every pixel its nearest palette color; the
//! Floyd-Steinberg remap additionally diffuses the per-pixel error to
//! neighbors, modulated by the edge map so flat areas dither and edges stay
//! clean.

use crate::color::{self, PremulRgba};
use crate::mediancut::Colormap;
use crate::nearest::NearestMap;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoroshiro128PlusPlus;

/// Assigns every pixel its nearest palette entry, writing indices into
/// `indices` and returning the mean squared error over non-transparent pixels.
///
/// As a side effect the palette is moved to the centroid of the pixels each
/// entry received, one free Voronoi step at full image resolution, and entry
/// popularities are recomputed.
pub(crate) fn remap_to_palette(
	pixels: &[PremulRgba],
	indices: &mut [u8],
	map: &mut Colormap,
	min_opaque: f32,
) -> f64 {
	let nearest = NearestMap::new(map);
	let (transparent_ind, _) = nearest.search(PremulRgba::TRANSPARENT, min_opaque);

	let mut averages = vec![([0.0f64; 4], 0.0f64); map.len()];
	let mut remapped_pixels = 0u32;
	let mut remapping_error = 0.0f64;

	for (px, out) in pixels.iter().zip(indices.iter_mut()) {
		let match_index = if px.a < 1.0 / 256.0 {
			transparent_ind
		} else {
			let (match_index, diff) = nearest.search(*px, min_opaque);
			remapped_pixels += 1;
			remapping_error += f64::from(diff);
			match_index
		};

		*out = match_index;

		let (sum, total) = &mut averages[usize::from(match_index)];
		sum[0] += f64::from(px.a);
		sum[1] += f64::from(px.r);
		sum[2] += f64::from(px.g);
		sum[3] += f64::from(px.b);
		*total += 1.0;
	}

	for (entry, (sum, total)) in map.entries.iter_mut().zip(&averages) {
		if *total > 0.0 {
			#[allow(clippy::cast_possible_truncation)]
			{
				entry.color = PremulRgba::new(
					(sum[0] / total) as f32,
					(sum[1] / total) as f32,
					(sum[2] / total) as f32,
					(sum[3] / total) as f32,
				);
				entry.popularity = *total as f32;
			}
		} else {
			entry.popularity = 0.0;
		}
	}

	remapping_error / f64::from(remapped_pixels.max(1))
}

/// Squared distance from palette entry `i` to the nearest other entry
fn distance_from_closest_other_color(map: &Colormap, i: usize) -> f64 {
	let mut second_best = color::MAX_DIFF;
	for (j, other) in map.entries.iter().enumerate() {
		if i == j {
			continue;
		}
		let diff = f64::from(color::color_difference(map.entries[i].color, other.color));
		second_best = second_best.min(diff);
	}
	second_best
}

/// Remaps with Floyd-Steinberg error diffusion in boustrophedon order.
///
/// The edge map scales the dithering strength per pixel, since dithering on
/// edges creates jagged lines and noisy areas are naturally dithered; without
/// a map a constant level of 0.9 is used. When `output_is_remapped`, indices
/// already hold a direct remap and pixels that error diffusion barely moved
/// keep their current entry, which cuts visible dithering noise further.
#[allow(clippy::too_many_arguments)]
pub(crate) fn remap_floyd(
	pixels: &[PremulRgba],
	width: usize,
	indices: &mut [u8],
	map: &Colormap,
	min_opaque: f32,
	edge_map: Option<&[f32]>,
	output_is_remapped: bool,
) {
	let cols = width;
	let rows = pixels.len() / width.max(1);

	let nearest = NearestMap::new(map);
	let (transparent_ind, _) = nearest.search(PremulRgba::TRANSPARENT, min_opaque);

	let difference_tolerance: Vec<f64> = if output_is_remapped {
		// half of squared distance
		(0..map.len())
			.map(|i| distance_from_closest_other_color(map, i) / 4.0)
			.collect()
	} else {
		Vec::new()
	};

	// deterministic dithering is better for comparing results
	let mut rng = Xoroshiro128PlusPlus::seed_from_u64(12345);
	let mut noise = || (rng.gen::<f32>() - 0.5) / 255.0;
	let mut thiserr: Vec<PremulRgba> = (0..cols + 2)
		.map(|_| PremulRgba::new(noise(), noise(), noise(), noise()))
		.collect();
	let mut nexterr = vec![PremulRgba::default(); cols + 2];

	let mut fs_direction = true;
	for row in 0..rows {
		nexterr.fill(PremulRgba::default());
		let mut col = if fs_direction { 0 } else { cols - 1 };

		loop {
			let px = pixels[row * cols + col];
			let mut dither_level = edge_map.map_or(0.9, |edges| edges[row * cols + col]);

			// apply the accumulated error, clamped so it cannot build up into
			// color streaks that no palette color can compensate
			let tmp = (px + thiserr[col + 1] * dither_level).clamp();

			let ind = if tmp.a < 1.0 / 256.0 {
				transparent_ind
			} else {
				let curr_ind = indices[row * cols + col];
				let keep = output_is_remapped
					&& f64::from(color::color_difference(
						map.entries[usize::from(curr_ind)].color,
						tmp,
					)) < difference_tolerance[usize::from(curr_ind)];
				if keep {
					curr_ind
				} else {
					nearest.search(tmp, min_opaque).0
				}
			};

			indices[row * cols + col] = ind;

			let mut err = tmp - map.entries[usize::from(ind)].color;

			// outlier errors are damped instead of diffused in full, which
			// prevents stray saturated pixels popping up in flat areas
			if err.dot() > 16.0 / 256.0 / 256.0 {
				dither_level *= 0.75;
			}

			let colorimp = (3.0 + map.entries[usize::from(ind)].color.a) / 4.0 * dither_level;
			err.r *= colorimp;
			err.g *= colorimp;
			err.b *= colorimp;
			err.a *= dither_level;

			// kernel without the same-row backward term, after "Reinstating
			// Floyd-Steinberg: Improved Metrics for Quality Assessment of
			// Error Diffusion Algorithms" (Hocevar, Niger)
			if fs_direction {
				thiserr[col + 2] += err * (7.0 / 16.0);
				nexterr[col] += err * (4.0 / 16.0);
				nexterr[col + 1] += err * (5.0 / 16.0);
			} else {
				thiserr[col] += err * (7.0 / 16.0);
				nexterr[col + 1] += err * (5.0 / 16.0);
				nexterr[col + 2] += err * (4.0 / 16.0);
			}

			// remapping is done in zig-zag
			if fs_direction {
				col += 1;
				if col >= cols {
					break;
				}
			} else {
				if col == 0 {
					break;
				}
				col -= 1;
			}
		}

		std::mem::swap(&mut thiserr, &mut nexterr);
		fs_direction = !fs_direction;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::color::INTERNAL_GAMMA;
	use crate::mediancut::MapEntry;
	use palette::Srgba;

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

	fn premul(pixels: &[Srgba<u8>]) -> Vec<PremulRgba> {
		pixels.iter().map(|&px| color::to_premul(INTERNAL_GAMMA, px)).collect()
	}

	#[test]
	fn exact_image_remaps_with_zero_error() {
		let colors = [Srgba::new(255, 0, 0, 255), Srgba::new(0, 0, 255, 255)];
		let pixels = premul(&[colors[0], colors[1], colors[1], colors[0]]);
		let mut map = colormap_of(&colors);
		let mut indices = vec![0u8; 4];

		let mse = remap_to_palette(&pixels, &mut indices, &mut map, 1.0);

		assert_eq!(mse, 0.0);
		assert_eq!(indices, vec![0, 1, 1, 0]);
		assert_eq!(map.entries[0].popularity, 2.0);
		assert_eq!(map.entries[1].popularity, 2.0);
	}

	#[test]
	fn transparent_pixels_take_the_transparent_entry() {
		let colors = [Srgba::new(0, 0, 0, 0), Srgba::new(50, 60, 70, 255)];
		let pixels = premul(&[Srgba::new(99, 88, 77, 0), colors[1]]);
		let mut map = colormap_of(&colors);
		let mut indices = vec![0u8; 2];

		let mse = remap_to_palette(&pixels, &mut indices, &mut map, 1.0);

		// the transparent pixel contributes no error
		assert_eq!(mse, 0.0);
		assert_eq!(indices[0], 0);
		assert_eq!(indices[1], 1);
	}

	#[test]
	fn direct_remap_moves_palette_to_centroids() {
		let pixels = premul(&[Srgba::new(100, 0, 0, 255), Srgba::new(120, 0, 0, 255)]);
		let mut map = colormap_of(&[Srgba::new(0, 0, 0, 255)]);
		let mut indices = vec![0u8; 2];

		let _ = remap_to_palette(&pixels, &mut indices, &mut map, 1.0);

		let expected = (pixels[0].r + pixels[1].r) / 2.0;
		assert!((map.entries[0].color.r - expected).abs() < 1e-6);
	}

	#[test]
	fn dithering_flat_exact_color_stays_flat() {
		// errors start as sub-1/255 noise and the image color is in the
		// palette, so every pixel keeps that color
		let colors = [Srgba::new(0, 0, 0, 255), Srgba::new(200, 100, 50, 255)];
		let pixels = premul(&vec![colors[1]; 8 * 8]);
		let map = colormap_of(&colors);
		let mut indices = vec![0u8; 8 * 8];

		remap_floyd(&pixels, 8, &mut indices, &map, 1.0, None, false);

		assert!(indices.iter().all(|&i| i == 1));
	}

	#[test]
	fn dithering_mixes_palette_entries_for_midtones() {
		// mid gray between a black and a white palette entry dithers into a
		// mix of both
		let colors = [Srgba::new(0, 0, 0, 255), Srgba::new(255, 255, 255, 255)];
		let pixels = premul(&vec![Srgba::new(128, 128, 128, 255); 16 * 16]);
		let map = colormap_of(&colors);
		let mut indices = vec![0u8; 16 * 16];

		remap_floyd(&pixels, 16, &mut indices, &map, 1.0, None, false);

		assert!(indices.iter().any(|&i| i == 0));
		assert!(indices.iter().any(|&i| i == 1));
	}

	#[test]
	fn tolerance_keeps_existing_assignment() {
		let colors = [Srgba::new(10, 10, 10, 255), Srgba::new(240, 240, 240, 255)];
		let pixels = premul(&vec![colors[0]; 4 * 4]);
		let mut map = colormap_of(&colors);
		let mut indices = vec![0u8; 4 * 4];

		let _ = remap_to_palette(&pixels, &mut indices, &mut map, 1.0);
		remap_floyd(&pixels, 4, &mut indices, &map, 1.0, None, true);

		assert!(indices.iter().all(|&i| i == 0));
	}
}
