//! Noise and edge maps derived from the working-pixel buffer.
//!
//! The noise map marks busy, high-frequency areas where color accuracy matters
//! less, and the edge map marks straight edges where dithering would produce
//! jagged lines. Both use 0 for busy/edge and 1 for flat.

use crate::color::PremulRgba;

/// Radius of the box blur applied to the noise map
const BLUR_SIZE: usize = 3;

/// Per-pixel noise and edge maps for one image.
#[derive(Debug)]
pub(crate) struct ContrastMaps {
	/// 1 = flat area, 0 = high-frequency noise
	pub noise: Vec<f32>,
	/// 1 = flat and non-edge, 0 = edge
	pub edges: Vec<f32>,
}

/// Largest absolute component of a pixel difference
fn max_component(px: PremulRgba) -> f32 {
	f32::max(
		f32::max(px.a.abs(), px.r.abs()),
		f32::max(px.g.abs(), px.b.abs()),
	)
}

/// Blurs one axis (window width `2*size`) and writes the result transposed,
/// so calling it twice yields a 2-D blur.
fn transposing_1d_blur(src: &[f32], dst: &mut [f32], width: usize, height: usize, size: usize) {
	#[allow(clippy::cast_precision_loss)]
	let scale = 1.0 / (size as f32 * 2.0);

	for j in 0..height {
		let row = &src[j * width..(j + 1) * width];

		// accumulate the sum for pixels outside the row
		#[allow(clippy::cast_precision_loss)]
		let mut sum = row[0] * size as f32;
		for &v in &row[..size] {
			sum += v;
		}

		// blur with the left edge clamped
		for i in 0..size {
			sum -= row[0];
			sum += row[i + size];
			dst[i * height + j] = sum * scale;
		}

		for i in size..width - size {
			sum -= row[i - size];
			sum += row[i + size];
			dst[i * height + j] = sum * scale;
		}

		// blur with the right edge clamped
		for i in width - size..width {
			sum -= row[i - size];
			sum += row[width - 1];
			dst[i * height + j] = sum * scale;
		}
	}
}

/// Separable box blur, in place. A no-op on images smaller than the blur
/// window in either dimension.
pub(crate) fn blur(map: &mut [f32], tmp: &mut [f32], width: usize, height: usize, size: usize) {
	if width < 2 * size + 1 || height < 2 * size + 1 {
		return;
	}
	transposing_1d_blur(map, tmp, width, height, size);
	transposing_1d_blur(tmp, map, height, width, size);
}

/// Replaces each pixel with the maximum of its 4-connected neighborhood
fn max3(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
	minmax3(src, dst, width, height, f32::max);
}

/// Replaces each pixel with the minimum of its 4-connected neighborhood
fn min3(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
	minmax3(src, dst, width, height, f32::min);
}

/// Shared morphological pass over the 4-connected neighborhood
fn minmax3(src: &[f32], dst: &mut [f32], width: usize, height: usize, pick: fn(f32, f32) -> f32) {
	for j in 0..height {
		let row = &src[j * width..(j + 1) * width];
		let prev_row = &src[j.saturating_sub(1) * width..];
		let next_row = &src[(j + 1).min(height - 1) * width..];
		let out = &mut dst[j * width..(j + 1) * width];

		let mut curr = row[0];
		let mut next = row[0];
		for i in 0..width - 1 {
			let prev = curr;
			curr = next;
			next = row[i + 1];
			out[i] = pick(pick(pick(curr, prev), pick(next, next_row[i])), prev_row[i]);
		}
		out[width - 1] = pick(
			pick(curr, next),
			pick(next_row[width - 1], prev_row[width - 1]),
		);
	}
}

/// Builds the noise and edge maps from second differences of the image.
///
/// Noise areas are shrunk and then expanded to remove thin true edges from
/// the map, with a box blur in between to thicken what remains.
pub(crate) fn contrast_maps(pixels: &[PremulRgba], width: usize, height: usize) -> ContrastMaps {
	let mut noise = vec![0.0f32; width * height];
	let mut edges = vec![0.0f32; width * height];
	let mut tmp = vec![0.0f32; width * height];

	for y in 0..height {
		let row = &pixels[y * width..(y + 1) * width];
		let above = &pixels[y.saturating_sub(1) * width..];
		let below = &pixels[(y + 1).min(height - 1) * width..];

		let mut curr = row[0];
		let mut next = curr;
		for x in 0..width {
			let prev = curr;
			curr = next;
			next = row[(x + 1).min(width - 1)];

			// contrast is the second difference between horizontal and vertical neighbors
			let horiz = max_component(prev + next - curr * 2.0);
			let vert = max_component(above[x] + below[x] - curr * 2.0);
			let edge = f32::max(horiz, vert);
			let mut z = edge - (horiz - vert).abs() * 0.5;
			z = 1.0 - f32::max(z, f32::min(horiz, vert));
			z *= z; // noise is amplified
			z *= z;

			noise[y * width + x] = z;
			edges[y * width + x] = 1.0 - edge;
		}
	}

	max3(&noise, &mut tmp, width, height);
	max3(&tmp, &mut noise, width, height);

	blur(&mut noise, &mut tmp, width, height, BLUR_SIZE);

	max3(&noise, &mut tmp, width, height);
	min3(&tmp, &mut noise, width, height);
	min3(&noise, &mut tmp, width, height);
	min3(&tmp, &mut noise, width, height);

	min3(&edges, &mut tmp, width, height);
	max3(&tmp, &mut edges, width, height);
	for (e, &n) in edges.iter_mut().zip(&noise) {
		*e = f32::min(*e, n);
	}

	ContrastMaps { noise, edges }
}

/// Damps the dither level over runs of pixels that remapped to the same
/// palette entry, since flat already-matched regions need little dithering.
///
/// For efficiency this looks for horizontal runs and peeks one pixel
/// above/below; a full 2-D region analysis does not improve results much.
pub(crate) fn update_dither_map(indexed: &[u8], width: usize, height: usize, edges: &mut [f32]) {
	if width < 2 {
		return;
	}
	for row in 0..height {
		let mut lastpixel = indexed[row * width];
		let mut lastcol = 0usize;
		for col in 1..width {
			let px = indexed[row * width + col];

			if px != lastpixel || col == width - 1 {
				#[allow(clippy::cast_precision_loss)]
				let mut neighbor_count = 2.5 + (col - lastcol) as f32;

				for i in lastcol..col {
					if row > 0 && indexed[(row - 1) * width + i] == lastpixel {
						neighbor_count += 1.0;
					}
					if row < height - 1 && indexed[(row + 1) * width + i] == lastpixel {
						neighbor_count += 1.0;
					}
				}
				while lastcol <= col {
					edges[row * width + lastcol] *= 1.0 - 2.5 / neighbor_count;
					lastcol += 1;
				}
				lastpixel = px;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flat_image_is_all_flat() {
		let pixels = vec![PremulRgba::new(1.0, 0.25, 0.5, 0.75); 8 * 8];
		let maps = contrast_maps(&pixels, 8, 8);

		assert!(maps.noise.iter().all(|&n| (n - 1.0).abs() < 1e-6));
		assert!(maps.edges.iter().all(|&e| (e - 1.0).abs() < 1e-6));
	}

	#[test]
	fn hard_edge_is_marked() {
		// left half black, right half white
		let mut pixels = vec![PremulRgba::new(1.0, 0.0, 0.0, 0.0); 16 * 16];
		for y in 0..16 {
			for x in 8..16 {
				pixels[y * 16 + x] = PremulRgba::new(1.0, 1.0, 1.0, 1.0);
			}
		}
		let maps = contrast_maps(&pixels, 16, 16);

		// columns next to the boundary score as edges, far columns stay flat
		for y in 0..16 {
			assert!(maps.edges[y * 16 + 8] < 0.5);
			assert!(maps.edges[y * 16] > 0.9);
		}
	}

	#[test]
	fn blur_is_identity_on_small_images() {
		let original: Vec<f32> = (0u8..12).map(f32::from).collect();
		let mut map = original.clone();
		let mut tmp = vec![0.0f32; 12];
		// 4x3 is smaller than the 7-pixel blur window in both dimensions
		blur(&mut map, &mut tmp, 4, 3, BLUR_SIZE);
		assert_eq!(map, original);
	}

	#[test]
	fn blur_averages_large_flat_image() {
		let mut map = vec![0.5f32; 10 * 10];
		let mut tmp = vec![0.0f32; 10 * 10];
		blur(&mut map, &mut tmp, 10, 10, BLUR_SIZE);
		// 2*size window normalization makes flat regions keep their value
		for &v in &map {
			assert!((v - 0.5).abs() < 1e-4);
		}
	}

	#[test]
	fn dither_map_damps_long_runs() {
		let width = 8;
		let indexed = vec![7u8; width * 4];
		let mut edges = vec![1.0f32; width * 4];
		update_dither_map(&indexed, width, 4, &mut edges);

		for &e in &edges {
			assert!(e < 1.0);
		}
	}
}
