//! End-to-end tests of the quantization pipeline.

use palquant::{quantize, Options, QuantizeError, Srgba, SRGB_GAMMA};

/// Reconstructs the RGBA image a quantization result encodes
fn decode(image: &palquant::QuantizedImage) -> Vec<Srgba<u8>> {
	image
		.indices
		.iter()
		.map(|&i| image.palette[usize::from(i)])
		.collect()
}

/// Options with dithering off, for byte-exact comparisons
fn no_dither() -> Options {
	Options { dither: false, ..Options::default() }
}

#[test]
fn output_is_well_formed() {
	let pixels: Vec<_> = (0u32..32 * 32)
		.map(|i| {
			Srgba::new(
				(i * 7 % 256) as u8,
				(i * 13 % 256) as u8,
				(i / 4 % 256) as u8,
				255,
			)
		})
		.collect();

	let image = quantize(&pixels, 32, 32, SRGB_GAMMA, &Options::default()).unwrap();

	assert_eq!(image.width, 32);
	assert_eq!(image.height, 32);
	assert_eq!(image.indices.len(), 32 * 32);
	assert!(!image.palette.is_empty() && image.palette.len() <= 256);
	assert!(image.indices.iter().all(|&i| usize::from(i) < image.palette.len()));
	assert!(image.transparent_entries <= image.palette.len());
	let mse = image.mse.expect("error is measured at the default speed");
	assert!(mse.is_finite() && mse >= 0.0);
}

#[test]
fn few_distinct_opaque_colors_roundtrip_exactly() {
	let colors: Vec<_> = (0u8..16).map(|i| Srgba::new(i * 16, 255 - i * 8, i * 3, 255)).collect();
	let pixels: Vec<_> = (0..8 * 8).map(|i| colors[i % colors.len()]).collect();

	let image = quantize(&pixels, 8, 8, SRGB_GAMMA, &no_dither()).unwrap();

	assert_eq!(image.mse, Some(0.0));
	assert_eq!(decode(&image), pixels);
}

#[test]
fn requantizing_quantized_output_is_lossless() {
	let pixels: Vec<_> = (0..30 * 10)
		.map(|i| Srgba::new((i % 256) as u8, (i / 256) as u8, 128, 255))
		.collect();

	let first = quantize(&pixels, 30, 10, SRGB_GAMMA, &no_dither()).unwrap();
	let second = quantize(&decode(&first), 30, 10, SRGB_GAMMA, &no_dither()).unwrap();

	assert_eq!(second.mse, Some(0.0));
	assert_eq!(decode(&second), decode(&first));
}

#[test]
fn dithering_a_flat_image_conserves_it() {
	let pixels = vec![Srgba::new(180, 90, 45, 255); 16 * 16];
	let image = quantize(&pixels, 16, 16, SRGB_GAMMA, &Options::default()).unwrap();

	assert_eq!(decode(&image), pixels);
}

#[test]
fn near_palette_size_images_stay_accurate() {
	// an even 8x8x4 lattice through the RGB cube, 44 of its points doubled
	// with a one-step blue twin: 300 distinct colors squeezed into 256
	// entries, where merging each twin pair costs almost nothing
	let mut colors = Vec::new();
	for r in 0..8u8 {
		for g in 0..8u8 {
			for b in 0..4u8 {
				colors.push(Srgba::new(r * 36, g * 36, b * 85, 255));
			}
		}
	}
	for i in 0..44 {
		let twin = colors[i * 5];
		colors.push(Srgba::new(twin.red, twin.green, twin.blue ^ 1, 255));
	}
	let pixels: Vec<_> = (0..256 * 256).map(|i| colors[i % colors.len()]).collect();

	let image = quantize(&pixels, 256, 256, SRGB_GAMMA, &no_dither()).unwrap();

	assert!(image.palette.len() <= 256);
	assert!(image.mse.unwrap() < 0.01);
}

#[test]
fn single_pixel_image_quantizes() {
	let pixels = vec![Srgba::new(1, 2, 3, 255)];
	let image = quantize(&pixels, 1, 1, SRGB_GAMMA, &Options::default()).unwrap();

	assert_eq!(image.palette.len(), 1);
	assert_eq!(decode(&image), pixels);
}

#[test]
fn fully_transparent_image_collapses_to_one_entry() {
	let pixels: Vec<_> = (0u8..64).map(|i| Srgba::new(i, i * 2, i * 3, 0)).collect();
	let image = quantize(&pixels, 8, 8, SRGB_GAMMA, &Options::default()).unwrap();

	assert_eq!(image.palette.len(), 1);
	assert_eq!(image.palette[0].alpha, 0);
	assert_eq!(image.transparent_entries, 1);
	assert!(image.indices.iter().all(|&i| i == 0));
}

#[test]
fn two_color_budget_splits_black_and_white() {
	let pixels: Vec<_> = (0..8 * 8)
		.map(|i| {
			if i % 2 == 0 {
				Srgba::new(0, 0, 0, 255)
			} else {
				Srgba::new(255, 255, 255, 255)
			}
		})
		.collect();
	let options = Options { max_colors: 2, ..no_dither() };

	let image = quantize(&pixels, 8, 8, SRGB_GAMMA, &options).unwrap();

	assert_eq!(image.palette.len(), 2);
	assert_eq!(image.mse, Some(0.0));
	assert_eq!(decode(&image), pixels);
}

#[test]
fn unreachable_quality_limit_fails() {
	let pixels: Vec<_> = (0u32..16 * 16)
		.map(|i| Srgba::new((i * 37 % 256) as u8, (i * 101 % 256) as u8, (i * 17 % 256) as u8, 255))
		.collect();
	let options = Options {
		max_colors: 4,
		max_mse: Some(1e-8),
		..Options::default()
	};

	let result = quantize(&pixels, 16, 16, SRGB_GAMMA, &options);

	assert!(matches!(result, Err(QuantizeError::QualityTooLow { .. })));
}

#[test]
fn every_speed_setting_produces_valid_output() {
	let pixels: Vec<_> = (0..16 * 16)
		.map(|i| Srgba::new((i % 256) as u8, (i / 2 % 256) as u8, 99, 255))
		.collect();

	for speed in 1..=10 {
		let options = Options { speed, ..Options::default() };
		let image = quantize(&pixels, 16, 16, SRGB_GAMMA, &options).unwrap();
		assert!(image.indices.iter().all(|&i| usize::from(i) < image.palette.len()));
	}
}

#[test]
fn dithered_gradient_uses_more_of_the_palette() {
	// a smooth gradient crushed into 8 colors shows banding undithered;
	// dithering should spread indices across band boundaries
	let pixels: Vec<_> = (0..64 * 16)
		.map(|i| {
			let g = (i % 64 * 4) as u8;
			Srgba::new(g, g, g, 255)
		})
		.collect();
	let options = Options { max_colors: 8, ..Options::default() };

	let image = quantize(&pixels, 64, 16, SRGB_GAMMA, &options).unwrap();

	// any row should touch several palette entries
	for row in 0..16 {
		let row_indices = &image.indices[row * 64..(row + 1) * 64];
		let mut seen: Vec<u8> = row_indices.to_vec();
		seen.sort_unstable();
		seen.dedup();
		assert!(seen.len() >= 2);
	}
}
