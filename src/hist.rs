//! Posterizing histogram of the distinct colors in an image.

use crate::color::{self, PremulRgba};
use log::debug;
use palette::Srgba;

/// Number of buckets in the open hash table
const HASH_SIZE: usize = 16381;

/// One distinct posterized color observed in the image.
#[derive(Debug, Clone)]
pub(crate) struct HistEntry {
	/// The color in the working space
	pub color: PremulRgba,
	/// Number of contributing pixels, weighted by area importance
	pub perceptual_weight: f32,
	/// Perceptual weight tweaked across search-loop trials to steer the median cut
	pub adjusted_weight: f32,
	/// Split weight, valid only while its box is being partitioned
	pub color_weight: f32,
	/// Composite sort key, valid only while its box is being partitioned
	pub sort_value: u64,
}

/// All distinct colors of one image with their weights.
#[derive(Debug)]
pub(crate) struct Histogram {
	/// Entries in hash-table order
	pub entries: Vec<HistEntry>,
	/// Sum of all perceptual weights
	pub total_perceptual_weight: f64,
}

/// One hash bucket. The first two colors are stored inline so that most
/// buckets never allocate an overflow array.
#[derive(Clone, Default)]
struct Bucket {
	/// Number of distinct colors in this bucket
	used: u32,
	/// First inline color (packed) and its weight
	color1: u32,
	/// Weight of `color1`
	weight1: f32,
	/// Second inline color (packed) and its weight
	color2: u32,
	/// Weight of `color2`
	weight2: f32,
	/// Colors beyond the first two
	other: Vec<(u32, f32)>,
}

/// Packs an 8-bit color into one word, discarding `ignorebits` low bits per
/// channel by replicating each channel's high bits into its low bits.
fn pack(px: Srgba<u8>, ignorebits: u32) -> u32 {
	// seven ignored bits leave one bit per channel, 16 colors at most
	let ignorebits = ignorebits.min(7);
	let mask = (0xFFu32 >> ignorebits) << ignorebits;
	let hmask = (0xFFu32 >> ignorebits) ^ 0xFF;
	let posterize = mask << 24 | mask << 16 | mask << 8 | mask;
	let posterize_high = hmask << 24 | hmask << 16 | hmask << 8 | hmask;

	let word = u32::from(px.red)
		| u32::from(px.green) << 8
		| u32::from(px.blue) << 16
		| u32::from(px.alpha) << 24;
	(word & posterize) | ((word & posterize_high) >> (8 - ignorebits))
}

/// Unpacks a packed color back to its 8-bit components
#[allow(clippy::cast_possible_truncation)]
fn unpack(word: u32) -> Srgba<u8> {
	Srgba::new(word as u8, (word >> 8) as u8, (word >> 16) as u8, (word >> 24) as u8)
}

/// One pass over the image: counts posterized colors into the hash table.
///
/// Returns `None` when more than `max_colors` distinct colors are found,
/// which tells the caller to posterize harder and try again.
fn compute(
	pixels: &[Srgba<u8>],
	gamma: f64,
	max_colors: usize,
	ignorebits: u32,
	importance: Option<&[f32]>,
) -> Option<Histogram> {
	let mut buckets = vec![Bucket::default(); HASH_SIZE];
	let mut colors = 0usize;

	for (i, &px) in pixels.iter().enumerate() {
		let boost = importance.map_or(1.0, |imp| 0.5 + imp[i]);

		// every fully transparent pixel lands in one canonical bucket,
		// regardless of its meaningless RGB values
		let (key, hash) = if px.alpha == 0 {
			(0, 0)
		} else {
			let key = pack(px, ignorebits);
			(key, key as usize % HASH_SIZE)
		};

		let bucket = &mut buckets[hash];
		if bucket.used >= 1 && bucket.color1 == key {
			bucket.weight1 += boost;
			continue;
		}
		if bucket.used >= 2 && bucket.color2 == key {
			bucket.weight2 += boost;
			continue;
		}
		if let Some(entry) = bucket.other.iter_mut().find(|(c, _)| *c == key) {
			entry.1 += boost;
			continue;
		}

		// a color not seen before; the cap applies no matter where it lands
		colors += 1;
		if colors > max_colors {
			return None;
		}
		if bucket.used == 0 {
			bucket.color1 = key;
			bucket.weight1 = boost;
		} else if bucket.used == 1 {
			bucket.color2 = key;
			bucket.weight2 = boost;
		} else {
			bucket.other.push((key, boost));
		}
		bucket.used += 1;
	}

	let mut entries = Vec::with_capacity(colors);
	let mut total = 0.0f64;
	let mut push = |key: u32, weight: f32| {
		entries.push(HistEntry {
			color: color::to_premul(gamma, unpack(key)),
			perceptual_weight: weight,
			adjusted_weight: weight,
			color_weight: 0.0,
			sort_value: 0,
		});
		total += f64::from(weight);
	};
	for bucket in &buckets {
		if bucket.used >= 1 {
			push(bucket.color1, bucket.weight1);
		}
		if bucket.used >= 2 {
			push(bucket.color2, bucket.weight2);
		}
		for &(key, weight) in &bucket.other {
			push(key, weight);
		}
	}

	Some(Histogram {
		entries,
		total_perceptual_weight: total,
	})
}

/// Builds the histogram, posterizing more aggressively whenever the distinct
/// color count exceeds `max_colors`. The backoff is bounded because each extra
/// ignored bit shrinks the space of representable colors.
pub(crate) fn build(
	pixels: &[Srgba<u8>],
	gamma: f64,
	max_colors: usize,
	mut ignorebits: u32,
	importance: Option<&[f32]>,
) -> Histogram {
	debug!("making histogram");
	loop {
		if let Some(hist) = compute(pixels, gamma, max_colors, ignorebits, importance) {
			debug!("{} colors found", hist.entries.len());
			return hist;
		}
		ignorebits += 1;
		debug!("too many colors! scaling colors to improve clustering");
	}
}
