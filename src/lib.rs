//! Quantizes 32-bit RGBA images down to palettes of at most 256 colors.
//!
//! The palette is found with a variance-weighted median cut over a posterized
//! color histogram, then refined with Voronoi (k-means) iterations, and the
//! image is remapped either directly or with Floyd-Steinberg dithering that is
//! damped on edges and in flat areas.
//!
//! All colors are handled premultiplied by alpha in a gamma-normalized working
//! space, so semitransparent images quantize without fringing.
//!
//! # Examples
//!
//! ```
//! use palquant::{quantize, Options, Srgba, SRGB_GAMMA};
//!
//! let pixels = vec![Srgba::new(255u8, 0, 0, 255); 16];
//! let image = quantize(&pixels, 4, 4, SRGB_GAMMA, &Options::default())?;
//!
//! assert!(image.palette.len() <= 256);
//! assert_eq!(image.indices.len(), 16);
//! # Ok::<(), palquant::QuantizeError>(())
//! ```

#![deny(unsafe_code)]
#![warn(clippy::pedantic, clippy::cargo)]
#![warn(clippy::use_debug, clippy::dbg_macro, clippy::todo, clippy::unimplemented)]
#![warn(clippy::unwrap_used, clippy::unwrap_in_result)]
#![warn(clippy::unneeded_field_pattern, clippy::rest_pat_in_fully_bound_structs)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::str_to_string, clippy::string_to_string, clippy::string_slice)]
#![warn(missing_docs, clippy::missing_docs_in_private_items, rustdoc::all)]
#![warn(clippy::float_cmp_const, clippy::lossy_float_literal)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unreadable_literal)]

use log::{debug, info};
use std::borrow::Cow;
use thiserror::Error;

mod color;
mod contrast;
mod hist;
mod kmeans;
mod mediancut;
mod nearest;
mod remap;

use color::{PremulRgba, INTERNAL_GAMMA, MAX_DIFF};
use hist::{HistEntry, Histogram};
use mediancut::{mediancut, Colormap};

pub use palette::Srgba;

/// Gamma of images prepared for the web; the default for 8-bit sRGB input.
pub const SRGB_GAMMA: f64 = 1.0 / 2.2;

/// Settings controlling quality, speed, and output layout of the quantization.
#[derive(Debug, Clone)]
pub struct Options {
	/// Maximum number of palette entries, `2..=256`
	pub max_colors: u32,
	/// Remap with Floyd-Steinberg dithering
	pub dither: bool,
	/// Mean squared error the palette search aims for; `0.0` aims for the
	/// best quality the color count permits
	pub target_mse: f64,
	/// Mean squared error above which quantization fails instead of
	/// returning a bad-looking image
	pub max_mse: Option<f64>,
	/// Alpha level above which colors are nudged to full opacity, working
	/// around IE6 rendering any partial transparency as a hole; `1.0`
	/// disables the workaround
	pub min_opaque_alpha: f32,
	/// Place transparent colors at the end of the palette instead of the
	/// beginning
	pub transparent_last: bool,
	/// Quality/speed trade-off, `1..=10`; higher is faster and worse
	pub speed: u32,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			max_colors: 256,
			dither: true,
			target_mse: 0.0,
			max_mse: None,
			min_opaque_alpha: 1.0,
			transparent_last: false,
			speed: 3,
		}
	}
}

impl Options {
	/// Checks every setting against its supported range
	fn validate(&self) -> Result<(), QuantizeError> {
		if !(2..=256).contains(&self.max_colors) {
			return Err(QuantizeError::InvalidColorCount(self.max_colors));
		}
		if !(1..=10).contains(&self.speed) {
			return Err(QuantizeError::InvalidSpeed(self.speed));
		}
		// zero (and NaN) would corrupt the alpha ramp in modify_alpha
		if !(self.min_opaque_alpha > 0.0 && self.min_opaque_alpha <= 1.0) {
			return Err(QuantizeError::InvalidOpaqueAlpha(self.min_opaque_alpha));
		}
		let max = self.max_mse.unwrap_or(MAX_DIFF);
		if self.target_mse > max {
			return Err(QuantizeError::InvalidMseTarget { target: self.target_mse, max });
		}
		Ok(())
	}
}

/// A quantized image: its palette and one palette index per input pixel.
#[derive(Debug, Clone)]
pub struct QuantizedImage {
	/// Width in pixels
	pub width: u32,
	/// Height in pixels
	pub height: u32,
	/// The palette, transparent entries grouped per [`Options::transparent_last`]
	pub palette: Vec<Srgba<u8>>,
	/// Palette index of every pixel in row-major order
	pub indices: Vec<u8>,
	/// Number of palette entries that are not fully opaque
	pub transparent_entries: usize,
	/// Mean squared error of the remapping, when it was measured
	pub mse: Option<f64>,
}

/// Reasons quantization can fail.
#[derive(Debug, Error)]
pub enum QuantizeError {
	/// The image cannot be represented within [`Options::max_mse`]
	#[error("quantization error (MSE {mse:.4}) exceeded the allowed maximum")]
	QualityTooLow {
		/// The mean squared error that was achieved
		mse: f64,
	},
	/// [`Options::max_colors`] outside `2..=256`
	#[error("palette size {0} is outside the supported range 2..=256")]
	InvalidColorCount(u32),
	/// [`Options::speed`] outside `1..=10`
	#[error("speed {0} is outside the supported range 1..=10")]
	InvalidSpeed(u32),
	/// Gamma must be a positive finite number
	#[error("gamma {0} is not a positive finite number")]
	InvalidGamma(f64),
	/// [`Options::min_opaque_alpha`] outside `(0, 1]`
	#[error("minimum opaque alpha {0} is outside the supported range (0, 1]")]
	InvalidOpaqueAlpha(f32),
	/// [`Options::target_mse`] above [`Options::max_mse`]
	#[error("target MSE {target} exceeds the maximum MSE {max}")]
	InvalidMseTarget {
		/// The requested target
		target: f64,
		/// The configured maximum
		max: f64,
	},
	/// The pixel buffer does not match the given dimensions
	#[error("pixel buffer of {len} pixels does not match {width}x{height}")]
	BadDimensions {
		/// Width passed in
		width: u32,
		/// Height passed in
		height: u32,
		/// Length of the pixel slice
		len: usize,
	},
	/// The indexed output buffer could not be allocated
	#[error("not enough memory for the indexed image")]
	OutOfMemory,
}

/// Converts a 0-100 quality level to the mean squared error it corresponds
/// to, on a curve fudged to be roughly similar to libjpeg's quality scale.
/// Quality 0 maps to an unlimited error.
#[must_use]
pub fn quality_to_mse(quality: u8) -> f64 {
	if quality == 0 {
		return MAX_DIFF;
	}
	let quality = f64::from(quality.min(100));
	1.1 / (210.0 + quality).powf(1.2) * (100.1 - quality) / 100.0
}

/// Raises the opacity of almost-opaque pixels to full.
///
/// IE6 renders colors with even the slightest transparency as completely
/// transparent; making nearly opaque colors fully opaque avoids the holes. The
/// opacity is raised on a linear ramp so no visible step appears.
fn modify_alpha(pixels: &mut [Srgba<u8>], gamma: f64, min_opaque: f32) {
	let almost_opaque = min_opaque * 169.0 / 256.0;
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let almost_opaque_int = (almost_opaque * 255.0) as u8;

	info!("working around IE6 bug by making image less transparent");
	for px8 in pixels {
		if px8.alpha >= almost_opaque_int {
			let mut px = color::to_premul(gamma, *px8);
			let al = almost_opaque
				+ (px.a - almost_opaque) * (1.0 - almost_opaque) / (min_opaque - almost_opaque);
			px.a = al.min(1.0);
			*px8 = color::to_srgba(gamma, px);
		}
	}
}

/// Boosts poorly matched histogram entries between palette search trials
fn adjust_histogram_callback(entry: &mut HistEntry, diff: f32) {
	entry.adjusted_weight = (entry.perceptual_weight + entry.adjusted_weight) * (1.0 + diff).sqrt();
}

/// Repeats the median cut with different histogram weights to find the
/// palette with the least error.
///
/// `trials` controls how long the search takes; zero or less keeps the first
/// palette and skips error measurement entirely. Returns the best palette and
/// its error, when one was measured.
fn find_best_palette(
	hist: &mut Histogram,
	mut reqcolors: usize,
	min_opaque: f32,
	target_mse: f64,
	mut trials: i32,
) -> (Colormap, Option<f64>) {
	let mut best: Option<Colormap> = None;
	let mut least_error = 0.0f64;
	// Voronoi iteration improves quality above what the median cut aims for;
	// overshooting the target compensates, making the median cut aim worse
	let mut overshoot = if trials > 0 { 1.05 } else { 1.0 };

	loop {
		debug!("selecting colors");
		let mut newmap = mediancut(hist, min_opaque, reqcolors, target_mse * overshoot);
		if let Some(subset) = &mut newmap.subset {
			// the nearest-color search seeds its cluster heads from the
			// front of the subset, in ascending popularity order
			subset.sort_by(|x, y| f32::total_cmp(&x.popularity, &y.popularity));
		}

		if trials <= 0 {
			return (newmap, None);
		}

		// measuring the error doubles as one free Voronoi step, and the
		// callback reweights the histogram toward poorly matched colors
		let first_run_of_target_mse = best.is_none() && target_mse > 0.0;
		let mut callback = adjust_histogram_callback;
		let total_error = kmeans::do_iteration(
			hist,
			&mut newmap,
			min_opaque,
			if first_run_of_target_mse { None } else { Some(&mut callback) },
		);

		// goal is to increase quality, or to reduce the number of colors used
		// if quality is already good enough
		if best.is_none()
			|| total_error < least_error
			|| (total_error <= target_mse && newmap.len() < reqcolors)
		{
			if total_error < target_mse && total_error > 0.0 {
				overshoot = (overshoot * 1.25).min(target_mse / total_error);
			}
			least_error = total_error;
			// keep a reduced color count, with one extra color of wiggle room
			// in case quality can still improve
			reqcolors = reqcolors.min(newmap.len() + 1);
			best = Some(newmap);
			// asymptotic improvement could make it go on forever
			trials -= 1;
		} else {
			overshoot = 1.0;
			trials -= 6;
			// if the error is really bad it is unlikely to improve, end sooner
			if total_error > least_error * 4.0 {
				trials -= 3;
			}
		}

		if trials <= 0 {
			break;
		}
	}

	let Some(map) = best else {
		unreachable!("at least one trial ran");
	};
	(map, Some(least_error))
}

/// Groups transparent palette entries at one end and orders each group by
/// ascending popularity, which makes indexed PNGs slightly more compressible.
/// Returns the number of entries that are not fully opaque.
fn sort_palette(map: &mut Colormap, transparent_last: bool) -> usize {
	let group = |e: &mediancut::MapEntry| u8::from((e.color.a < 1.0) == transparent_last);
	map.entries.sort_by(|x, y| {
		group(x)
			.cmp(&group(y))
			.then(f32::total_cmp(&x.popularity, &y.popularity))
	});
	map.entries.iter().filter(|e| e.color.a < 1.0).count()
}

/// Rounds the palette to 8 bits per channel and feeds the rounded values back
/// into the working palette, so dithering measures error against the colors
/// the output will actually contain.
fn finalize_palette(map: &mut Colormap) -> Vec<Srgba<u8>> {
	map.entries
		.iter_mut()
		.map(|entry| {
			let px = color::to_srgba(INTERNAL_GAMMA, entry.color);
			entry.color = color::to_premul(INTERNAL_GAMMA, px);
			px
		})
		.collect()
}

/// Quantizes an RGBA image to an indexed image with a palette of at most
/// [`Options::max_colors`] colors.
///
/// `pixels` is the image in row-major order and `gamma` its transfer curve
/// exponent, [`SRGB_GAMMA`] for ordinary 8-bit sRGB input.
///
/// # Errors
///
/// Fails when the options or dimensions are invalid, when the result would be
/// worse than [`Options::max_mse`], or when the output cannot be allocated.
pub fn quantize(
	pixels: &[Srgba<u8>],
	width: u32,
	height: u32,
	gamma: f64,
	options: &Options,
) -> Result<QuantizedImage, QuantizeError> {
	options.validate()?;
	if !gamma.is_finite() || gamma <= 0.0 {
		return Err(QuantizeError::InvalidGamma(gamma));
	}
	let (cols, rows) = (width as usize, height as usize);
	let len = cols * rows;
	if width == 0 || height == 0 || pixels.len() != len {
		return Err(QuantizeError::BadDimensions { width, height, len: pixels.len() });
	}

	let speed = options.speed;
	let min_opaque = options.min_opaque_alpha;
	let max_mse = options.max_mse.unwrap_or(MAX_DIFF);

	let mut pixels = Cow::Borrowed(pixels);
	if min_opaque <= 254.0 / 255.0 {
		modify_alpha(pixels.to_mut(), gamma, min_opaque);
	}

	let input: Vec<PremulRgba> = pixels.iter().map(|&px| color::to_premul(gamma, px)).collect();

	// color accuracy in noisy areas matters less, so the noise map feeds the
	// histogram as an importance map; the edge map steers dithering later
	let mut maps = if speed < 8 && width >= 4 && height >= 4 {
		Some(contrast::contrast_maps(&input, cols, rows))
	} else {
		None
	};

	let ignorebits = u32::from(speed > 7);
	let max_hist_colors = (1usize << 17) + (1usize << 18) * (10 - speed as usize);
	let mut hist = hist::build(
		&pixels,
		gamma,
		max_hist_colors,
		ignorebits,
		maps.as_ref().map(|m| m.noise.as_slice()),
	);

	#[allow(clippy::cast_possible_wrap)]
	let trials = 56 - 9 * speed as i32;
	let (mut map, mut palette_error) = find_best_palette(
		&mut hist,
		options.max_colors as usize,
		min_opaque,
		options.target_mse,
		trials,
	);

	// Voronoi iteration approaches a local minimum for the palette
	let mut iterations = {
		let i = 8u32.saturating_sub(speed);
		i + i * i / 2
	};
	if iterations == 0 && palette_error.is_none() && max_mse < MAX_DIFF {
		// otherwise the total error is never measured and the limit can't work
		iterations = 1;
	}
	if iterations > 0 {
		debug!("moving colormap towards local minimum");
		let iteration_limit = 1.0 / f64::from(1u32 << (23 - speed));
		let mut previous_error = MAX_DIFF;
		let mut i = 0;
		while i < iterations {
			let err = kmeans::do_iteration(&mut hist, &mut map, min_opaque, None);
			palette_error = Some(err);

			if (previous_error - err).abs() < iteration_limit {
				break;
			}
			if err > max_mse * 1.5 {
				// probably hopeless
				if err > max_mse * 3.0 {
					break; // definitely hopeless
				}
				iterations += 1;
			}
			previous_error = err;
			i += 1;
		}
	}

	if let Some(err) = palette_error {
		if err > max_mse {
			info!(
				"image degradation MSE={:.3} exceeded limit of {:.3}",
				err * 65536.0,
				max_mse * 65536.0
			);
			return Err(QuantizeError::QualityTooLow { mse: err });
		}
	}

	let mut indices = Vec::new();
	indices
		.try_reserve_exact(len)
		.map_err(|_| QuantizeError::OutOfMemory)?;
	indices.resize(len, 0u8);

	let transparent_entries = sort_palette(&mut map, options.transparent_last);

	debug!("mapping image to new colors");
	let use_dither_map = options.dither && speed < 6;

	if !options.dither || use_dither_map {
		// without dithering this is the final remapping; before dithering it
		// finds the areas that require dithering at all
		let remapping_error = remap::remap_to_palette(&input, &mut indices, &mut map, min_opaque);

		// the error measured on a dithered image would be absurd, so the
		// non-dithered value is reported; the palette error is preferred
		// since its perceptual weighting correlates better with quality
		if palette_error.is_none() {
			palette_error = Some(remapping_error);
		}

		if use_dither_map {
			if let Some(maps) = maps.as_mut() {
				contrast::update_dither_map(&indices, cols, rows, &mut maps.edges);
			}
		}
	}

	if let Some(err) = palette_error {
		debug!("MSE={:.3}", err * 65536.0);
	}

	// remapping above was the last chance for a Voronoi step, hence the
	// palette is only rounded to 8 bits afterwards
	let palette = finalize_palette(&mut map);

	if options.dither {
		remap::remap_floyd(
			&input,
			cols,
			&mut indices,
			&map,
			min_opaque,
			maps.as_ref().map(|m| m.edges.as_slice()),
			use_dither_map,
		);
	}

	Ok(QuantizedImage {
		width,
		height,
		palette,
		indices,
		transparent_entries,
		mse: palette_error,
	})
}
