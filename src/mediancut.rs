//! Variance-weighted median-cut palette builder.
//!
//! Based on Paul Heckbert's "Color Image Quantization for Frame Buffer
//! Display" (SIGGRAPH 1982), with weighted boxes: each subdivision balances
//! popularity and variance instead of splitting purely by pixel count, and a
//! weighted median is used as the expected value rather than the mean.

use crate::color::{self, PremulRgba};
use crate::hist::{HistEntry, Histogram};
use std::ops::Range;

/// One output color slot.
#[derive(Debug, Clone)]
pub(crate) struct MapEntry {
	/// The palette color in the working space
	pub color: PremulRgba,
	/// Total perceptual weight of the histogram entries this color stands for
	pub popularity: f32,
}

/// An ordered palette of working-space colors.
#[derive(Debug, Clone)]
pub(crate) struct Colormap {
	/// The palette entries
	pub entries: Vec<MapEntry>,
	/// Smaller representative palette remembered for fast nearest-color search
	pub subset: Option<Vec<MapEntry>>,
}

impl Colormap {
	/// Number of colors in the palette
	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}
}

/// A contiguous partition of the histogram during one median-cut run.
#[derive(Debug, Clone)]
struct MBox {
	/// Range of histogram entries covered by this box
	range: Range<usize>,
	/// Representative (weighted average) color
	color: PremulRgba,
	/// Weighted per-channel variance
	variance: PremulRgba,
	/// Total adjusted weight
	sum: f64,
	/// Cached total error; negative means stale
	total_error: f64,
}

impl MBox {
	/// Number of histogram entries in the box
	fn colors(&self) -> usize {
		self.range.len()
	}
}

/// Weighted average color of a set of histogram entries.
///
/// Colors far from neutral gray get extra weight, which resists desaturation
/// of images and fading of whites. If the box contains an effectively opaque
/// color and the average is at least `min_opaque`, opacity is snapped to 1 so
/// anti-IE6 rounding survives averaging.
fn averaged_color(entries: &[HistEntry], min_opaque: f32) -> PremulRgba {
	let mut csum = [0.0f64; 4];
	let mut sum = 0.0f64;
	let mut maxa = 0.0f32;
	for entry in entries {
		let px = entry.color;
		let dr = 0.5 - px.r;
		let dg = 0.5 - px.g;
		let db = 0.5 - px.b;
		let weight = f64::from((1.0 + dr * dr + dg * dg + db * db) * entry.adjusted_weight);
		sum += weight;
		csum[0] += f64::from(px.a) * weight;
		csum[1] += f64::from(px.r) * weight;
		csum[2] += f64::from(px.g) * weight;
		csum[3] += f64::from(px.b) * weight;

		maxa = maxa.max(px.a);
	}

	if sum == 0.0 {
		sum = 1.0;
	}
	#[allow(clippy::cast_possible_truncation)]
	let mut avg = PremulRgba::new(
		(csum[0] / sum) as f32,
		(csum[1] / sum) as f32,
		(csum[2] / sum) as f32,
		(csum[3] / sum) as f32,
	);

	if avg.a >= min_opaque && maxa >= 255.0 / 256.0 {
		avg.a = 1.0;
	}
	avg
}

/// Weighted per-channel variance of a box, used to decide which channel to
/// split by. Differences already below one 8-bit step are discounted.
fn box_variance(entries: &[HistEntry], mean: PremulRgba) -> PremulRgba {
	let good_enough = PremulRgba::new(2.0 / 256.0, 1.0 / 256.0, 1.0 / 256.0, 1.0 / 256.0);
	let mut variance = PremulRgba::default();
	for entry in entries {
		let diff = mean - entry.color;
		let mut sq = PremulRgba::new(
			diff.a * diff.a,
			diff.r * diff.r,
			diff.g * diff.g,
			diff.b * diff.b,
		);
		if sq.a < good_enough.a * good_enough.a {
			sq.a *= 0.5;
		}
		if sq.r < good_enough.r * good_enough.r {
			sq.r *= 0.5;
		}
		if sq.g < good_enough.g * good_enough.g {
			sq.g *= 0.5;
		}
		if sq.b < good_enough.b * good_enough.b {
			sq.b *= 0.5;
		}
		variance += sq * entry.adjusted_weight;
	}
	PremulRgba::new(
		variance.a * 4.0 / 16.0,
		variance.r * 7.0 / 16.0,
		variance.g * 9.0 / 16.0,
		variance.b * 5.0 / 16.0,
	)
}

/// Split weight of a histogram entry relative to the box median: colors near
/// the median get near-zero weight, disabling splits that would not help.
fn split_weight(median: PremulRgba, entry: &HistEntry) -> f32 {
	let mut diff = color::color_difference(median, entry.color);
	// if the color is "good enough", don't split further
	if diff < 1.0 / 256.0 / 256.0 {
		diff /= 2.0;
	}
	diff.sqrt() * ((1.0 + entry.adjusted_weight).sqrt() - 1.0)
}

/// Median-of-three pivot index for larger partitions
fn qsort_pivot(items: &[HistEntry]) -> usize {
	let len = items.len();
	if len < 32 {
		return len / 2;
	}

	let (ai, bi, ci) = (8, len / 2, len - 1);
	let (a, b, c) = (items[ai].sort_value, items[bi].sort_value, items[ci].sort_value);
	if a < b {
		if b < c {
			bi
		} else if a < c {
			ci
		} else {
			ai
		}
	} else if b > c {
		bi
	} else if a < c {
		ai
	} else {
		ci
	}
}

/// Partitions by `sort_value` descending, returning the pivot's final index.
/// Ties are broken by first-encountered order of the partition scheme, which
/// keeps repeated median-cut trials deterministic.
fn qsort_partition(items: &mut [HistEntry]) -> usize {
	let len = items.len();
	let mut l = 1;
	let mut r = len;
	if len >= 8 {
		items.swap(0, qsort_pivot(items));
	}

	let pivot_value = items[0].sort_value;
	while l < r {
		if items[l].sort_value >= pivot_value {
			l += 1;
		} else {
			loop {
				r -= 1;
				if !(l < r && items[r].sort_value <= pivot_value) {
					break;
				}
			}
			items.swap(l, r);
		}
	}
	l -= 1;
	items.swap(0, l);
	l
}

/// Quickselect-style partial sort: fully orders only the elements whose final
/// position falls inside `want`, leaving everything else merely partitioned.
fn sort_range(items: &mut [HistEntry], want: Range<usize>) {
	let mut stack = vec![0..items.len()];
	while let Some(range) = stack.pop() {
		if range.len() < 2 {
			continue;
		}
		let l = range.start + qsort_partition(&mut items[range.clone()]);
		let r = l + 1;

		if want.end > range.start && l >= want.start && l > range.start {
			stack.push(range.start..l);
		}
		if range.end > r && r < want.end && range.end > want.start {
			stack.push(r..range.end);
		}
	}
}

/// Partitions until the running sum of split weights crosses `halfvar`,
/// sorting only the prefix that the crossing point falls into.
///
/// Returns the index of the entry at which the sum first exceeds `halfvar`,
/// or `None` when the crossing lands past the ordered region; the caller
/// clamps the break index either way.
fn sort_halfvar(
	items: &mut [HistEntry],
	mut start: usize,
	end: usize,
	lowervar: &mut f64,
	halfvar: f64,
) -> Option<usize> {
	loop {
		let l = qsort_partition(&mut items[start..end]);
		let r = l + 1;

		// if the sum of the left side stays below half, it needs no sorting
		let mut t = 0;
		let mut tmpsum = *lowervar;
		while t <= l && tmpsum < halfvar {
			tmpsum += f64::from(items[start + t].color_weight);
			t += 1;
		}

		if tmpsum < halfvar {
			*lowervar = tmpsum;
		} else if l > 0 {
			if let Some(found) = sort_halfvar(items, start, start + l, lowervar, halfvar) {
				return Some(found);
			}
		} else {
			// left recursion bottoms out here, visiting entries in sorted order
			*lowervar += f64::from(items[start].color_weight);
			if *lowervar > halfvar {
				return Some(start);
			}
		}

		if end > start + r {
			start += r;
		} else {
			// the element at the range end is the enclosing partition's
			// pivot; the outermost frame has no element there
			if end < items.len() {
				*lowervar += f64::from(items[end].color_weight);
				if *lowervar > halfvar {
					return Some(end);
				}
			}
			return None;
		}
	}
}

/// Weighted median color of a box, sorting only the region around the median.
fn get_median(items: &mut [HistEntry]) -> PremulRgba {
	let median_start = (items.len() - 1) / 2;
	let odd = items.len() & 1 == 1;

	sort_range(items, median_start..median_start + if odd { 1 } else { 2 });

	if odd {
		items[median_start].color
	} else {
		averaged_color(&items[median_start..median_start + 2], 1.0)
	}
}

/// Ranks the box's channels by variance, assigns composite sort keys, and
/// computes every entry's split weight. Returns half the box's total split
/// weight, the point at which the box will be divided.
fn prepare_sort(bx: &MBox, items: &mut [HistEntry]) -> f64 {
	// alpha is channel 0, colors are 1..=3
	let mut channels = [
		(1usize, bx.variance.r),
		(2usize, bx.variance.g),
		(3usize, bx.variance.b),
		(0usize, bx.variance.a),
	];
	channels.sort_by(|x, y| f32::total_cmp(&y.1, &x.1));

	for entry in items.iter_mut() {
		// Only the first channel really matters: when median cut runs many
		// times with different histogram weights, sort randomness must not
		// influence the outcome.
		let first = f64::from(entry.color.channel(channels[0].0));
		let rest = f64::from(entry.color.channel(channels[2].0))
			+ f64::from(entry.color.channel(channels[1].0)) / 2.0
			+ f64::from(entry.color.channel(channels[3].0)) / 4.0;
		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		{
			entry.sort_value = ((first * 65535.0) as u64) << 16 | (rest * 65535.0) as u64;
		}
	}

	let median = get_median(items);

	let mut totalvar = 0.0f64;
	for entry in items.iter_mut() {
		entry.color_weight = split_weight(median, entry);
		totalvar += f64::from(entry.color_weight);
	}
	totalvar / 2.0
}

/// Index of the best box to split next, or `None` when no box has two or
/// more colors left. Only the maximum variance matters, because that is the
/// channel the box would be split by.
fn best_splittable_box(boxes: &[MBox]) -> Option<usize> {
	let mut best = None;
	let mut maxsum = 0.0f64;
	for (i, bx) in boxes.iter().enumerate() {
		if bx.colors() < 2 {
			continue;
		}
		let cv = bx.variance.r.max(bx.variance.g).max(bx.variance.b);
		let thissum = bx.sum * f64::from(bx.variance.a.max(cv));
		if thissum > maxsum {
			maxsum = thissum;
			best = Some(i);
		}
	}
	best
}

/// Representative color and popularity for every box
fn colormap_from_boxes(boxes: &[MBox], entries: &[HistEntry]) -> Vec<MapEntry> {
	boxes
		.iter()
		.map(|bx| MapEntry {
			color: bx.color,
			popularity: entries[bx.range.clone()]
				.iter()
				.map(|e| e.perceptual_weight)
				.sum(),
		})
		.collect()
}

/// Boosts each entry's adjusted weight by its distance to the final palette
/// color, so poorly matched colors pull harder on the next trial.
fn adjust_histogram(entries: &mut [HistEntry], boxes: &[MBox]) {
	for bx in boxes {
		let pc = bx.color;
		for entry in &mut entries[bx.range.clone()] {
			entry.adjusted_weight *=
				(1.0 + color::color_difference(pc, entry.color) / 2.0).sqrt();
		}
	}
}

/// Total weighted error of one box against its representative color
fn box_error(bx: &MBox, entries: &[HistEntry]) -> f64 {
	entries[bx.range.clone()]
		.iter()
		.map(|e| {
			f64::from(color::color_difference(bx.color, e.color)) * f64::from(e.perceptual_weight)
		})
		.sum()
}

/// Checks whether the palette error is already provably below the target,
/// computing each box's error lazily and only when the cheap pass fails.
fn total_box_error_below_target(target_mse: f64, boxes: &mut [MBox], hist: &Histogram) -> bool {
	let target = target_mse * hist.total_perceptual_weight;

	let mut total = 0.0f64;
	for bx in boxes.iter() {
		if bx.total_error >= 0.0 {
			total += bx.total_error;
		}
		if total > target {
			return false;
		}
	}

	for bx in boxes.iter_mut() {
		if bx.total_error < 0.0 {
			bx.total_error = box_error(bx, &hist.entries);
			total += bx.total_error;
		}
		if total > target {
			return false;
		}
	}

	true
}

/// Builds a new box over `range`, computing its representative color,
/// variance, and weight sum.
fn make_box(entries: &[HistEntry], range: Range<usize>, min_opaque: f32) -> MBox {
	let slice = &entries[range.clone()];
	let color = averaged_color(slice, min_opaque);
	MBox {
		color,
		variance: box_variance(slice, color),
		sum: slice.iter().map(|e| f64::from(e.adjusted_weight)).sum(),
		total_error: -1.0,
		range,
	}
}

/// Runs the median cut, producing at most `newcolors` palette entries.
///
/// Splitting stops early when the lazily accumulated palette error falls
/// below `target_mse` or when no box has two colors left; producing fewer
/// colors than requested is not an error. As a side effect the histogram's
/// adjusted weights are boosted by the remaining per-entry error, which
/// feeds the next search-loop trial.
pub(crate) fn mediancut(
	hist: &mut Histogram,
	min_opaque: f32,
	newcolors: usize,
	target_mse: f64,
) -> Colormap {
	let mut boxes = Vec::with_capacity(newcolors);
	boxes.push(make_box(&hist.entries, 0..hist.entries.len(), min_opaque));

	// remember a smaller palette snapshot for fast nearest-color searching
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let subset_size = (newcolors as f64).powf(0.7).ceil() as usize;
	let mut subset = None;

	while boxes.len() < newcolors {
		if boxes.len() == subset_size {
			subset = Some(colormap_from_boxes(&boxes, &hist.entries));
		}

		let Some(bi) = best_splittable_box(&boxes) else {
			break; // ran out of colors
		};

		let range = boxes[bi].range.clone();
		let clrs = range.len();

		let halfvar = prepare_sort(&boxes[bi], &mut hist.entries[range.clone()]);
		let mut lowervar = 0.0f64;
		let break_p = sort_halfvar(
			&mut hist.entries[range.clone()],
			0,
			clrs,
			&mut lowervar,
			halfvar,
		);
		// the crossing point lands one past where the box should break; keep
		// the historical clamp to colors-1 rather than re-deriving it
		let break_at = break_p.map_or(clrs - 1, |p| usize::min(clrs - 1, p + 1));

		let lower = range.start..range.start + break_at;
		let upper = range.start + break_at..range.end;
		boxes[bi] = make_box(&hist.entries, lower, min_opaque);
		boxes.push(make_box(&hist.entries, upper, min_opaque));

		if total_box_error_below_target(target_mse, &mut boxes, hist) {
			break;
		}
	}

	let map = Colormap {
		entries: colormap_from_boxes(&boxes, &hist.entries),
		subset,
	};
	adjust_histogram(&mut hist.entries, &boxes);
	map
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::color::INTERNAL_GAMMA;
	use crate::hist;
	use palette::Srgba;

	fn histogram_of(colors: &[Srgba<u8>], repeat: usize) -> Histogram {
		let pixels: Vec<_> = colors
			.iter()
			.flat_map(|&c| std::iter::repeat(c).take(repeat))
			.collect();
		hist::build(&pixels, INTERNAL_GAMMA, 1 << 17, 0, None)
	}

	#[test]
	fn single_color_yields_single_entry() {
		let mut hist = histogram_of(&[Srgba::new(90, 120, 180, 255)], 4);
		let map = mediancut(&mut hist, 1.0, 16, 0.0);

		assert_eq!(map.len(), 1);
		assert_eq!(map.entries[0].popularity, 4.0);
	}

	#[test]
	fn distinct_colors_get_distinct_entries() {
		let colors = [
			Srgba::new(255, 0, 0, 255),
			Srgba::new(0, 255, 0, 255),
			Srgba::new(0, 0, 255, 255),
			Srgba::new(255, 255, 255, 255),
		];
		let mut hist = histogram_of(&colors, 3);
		let map = mediancut(&mut hist, 1.0, 4, 0.0);

		assert_eq!(map.len(), 4);
		// every box holds exactly one color, so each representative is exact
		for entry in &map.entries {
			let exact = hist
				.entries
				.iter()
				.any(|h| color::color_difference(h.color, entry.color) < 1e-10);
			assert!(exact);
		}
	}

	#[test]
	fn never_produces_more_than_requested() {
		let colors: Vec<_> = (0..64).map(|i| Srgba::new(i * 4, 255 - i * 2, i, 255)).collect();
		let mut hist = histogram_of(&colors, 1);
		let map = mediancut(&mut hist, 1.0, 8, 0.0);

		assert!(map.len() <= 8);
		assert!(map.len() > 1);
	}

	#[test]
	fn subset_palette_is_recorded() {
		let colors: Vec<_> = (0..32).map(|i| Srgba::new(i * 8, i * 3, 255 - i, 255)).collect();
		let mut hist = histogram_of(&colors, 1);
		let map = mediancut(&mut hist, 1.0, 32, 0.0);

		// ceil(32^0.7) = 12
		let subset = map.subset.expect("subset snapshot");
		assert_eq!(subset.len(), 12);
	}

	#[test]
	fn feedback_boosts_adjusted_weights() {
		let colors: Vec<_> = (0..16).map(|i| Srgba::new(i * 16, 0, 0, 255)).collect();
		let mut hist = histogram_of(&colors, 1);
		let before: Vec<f32> = hist.entries.iter().map(|e| e.adjusted_weight).collect();
		let _ = mediancut(&mut hist, 1.0, 4, 0.0);

		for (entry, before) in hist.entries.iter().zip(before) {
			assert!(entry.adjusted_weight >= before);
		}
	}

	#[test]
	fn partial_sort_orders_requested_region() {
		let colors: Vec<_> = (0..33).map(|i| Srgba::new(i * 7, i, 255 - i, 255)).collect();
		let mut hist = histogram_of(&colors, 1);
		let n = hist.entries.len();
		for (i, entry) in hist.entries.iter_mut().enumerate() {
			entry.sort_value = (i as u64 * 7919) % 101;
		}

		sort_range(&mut hist.entries, 10..16);

		let keys: Vec<u64> = hist.entries.iter().map(|e| e.sort_value).collect();
		// requested region is internally ordered (descending keys)
		for i in 10..15 {
			assert!(keys[i] >= keys[i + 1]);
		}
		// and correctly partitioned against both sides
		let region_max = *keys[10..16].iter().max().unwrap();
		let region_min = *keys[10..16].iter().min().unwrap();
		assert!(keys[..10].iter().all(|&k| k >= region_max));
		assert!(keys[16..n].iter().all(|&k| k <= region_min));
	}
}
