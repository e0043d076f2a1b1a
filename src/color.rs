//! The premultiplied working color space and the perceptual difference metric.

use palette::Srgba;
use std::ops::{Add, AddAssign, Mul, Sub};

/// Gamma of the internal working color space, chosen to match typical display response.
pub(crate) const INTERNAL_GAMMA: f64 = 1.0 / 2.2;

/// A color difference larger than any two representable colors can produce.
pub(crate) const MAX_DIFF: f64 = 1e20;

/// One color in the premultiplied, gamma-normalized working space.
///
/// All components are in `0.0..=1.0` and the color channels are pre-scaled
/// by alpha, so blending semitransparent colors is plain linear addition.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct PremulRgba {
	/// Alpha in `0.0..=1.0`
	pub a: f32,
	/// Red, premultiplied by alpha
	pub r: f32,
	/// Green, premultiplied by alpha
	pub g: f32,
	/// Blue, premultiplied by alpha
	pub b: f32,
}

impl PremulRgba {
	/// The canonical fully transparent color
	pub(crate) const TRANSPARENT: Self = Self { a: 0.0, r: 0.0, g: 0.0, b: 0.0 };

	/// Create a working pixel from raw components
	pub(crate) const fn new(a: f32, r: f32, g: f32, b: f32) -> Self {
		Self { a, r, g, b }
	}

	/// Component by index: 0 = alpha, 1 = red, 2 = green, 3 = blue
	pub(crate) fn channel(self, index: usize) -> f32 {
		match index {
			0 => self.a,
			1 => self.r,
			2 => self.g,
			3 => self.b,
			_ => unreachable!("channel index out of range"),
		}
	}

	/// Clamp every component to `0.0..=1.0`
	pub(crate) fn clamp(self) -> Self {
		Self {
			a: self.a.clamp(0.0, 1.0),
			r: self.r.clamp(0.0, 1.0),
			g: self.g.clamp(0.0, 1.0),
			b: self.b.clamp(0.0, 1.0),
		}
	}

	/// Sum of squared components
	pub(crate) fn dot(self) -> f32 {
		self.a * self.a + self.r * self.r + self.g * self.g + self.b * self.b
	}
}

impl Add for PremulRgba {
	type Output = Self;

	fn add(self, other: Self) -> Self {
		Self {
			a: self.a + other.a,
			r: self.r + other.r,
			g: self.g + other.g,
			b: self.b + other.b,
		}
	}
}

impl AddAssign for PremulRgba {
	fn add_assign(&mut self, other: Self) {
		*self = *self + other;
	}
}

impl Sub for PremulRgba {
	type Output = Self;

	fn sub(self, other: Self) -> Self {
		Self {
			a: self.a - other.a,
			r: self.r - other.r,
			g: self.g - other.g,
			b: self.b - other.b,
		}
	}
}

impl Mul<f32> for PremulRgba {
	type Output = Self;

	fn mul(self, v: f32) -> Self {
		Self {
			a: self.a * v,
			r: self.r * v,
			g: self.g * v,
			b: self.b * v,
		}
	}
}

/// Converts an 8-bit color with the given source gamma to the internal gamma
/// and premultiplies it by alpha.
pub(crate) fn to_premul(gamma: f64, px: Srgba<u8>) -> PremulRgba {
	let a = f32::from(px.alpha) / 255.0;
	let mut r = f32::from(px.red) / 255.0;
	let mut g = f32::from(px.green) / 255.0;
	let mut b = f32::from(px.blue) / 255.0;

	#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
	if gamma != INTERNAL_GAMMA {
		let exp = (INTERNAL_GAMMA / gamma) as f32;
		r = r.powf(exp);
		g = g.powf(exp);
		b = b.powf(exp);
	}

	PremulRgba::new(a, r * a, g * a, b * a)
}

/// Converts a working pixel back to 8-bit color with the given target gamma.
pub(crate) fn to_srgba(gamma: f64, px: PremulRgba) -> Srgba<u8> {
	if px.a < 1.0 / 256.0 {
		return Srgba::new(0, 0, 0, 0);
	}

	let mut r = px.r / px.a;
	let mut g = px.g / px.a;
	let mut b = px.b / px.a;

	#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
	if gamma != INTERNAL_GAMMA {
		let exp = (gamma / INTERNAL_GAMMA) as f32;
		r = r.powf(exp);
		g = g.powf(exp);
		b = b.powf(exp);
	}

	// 256, because values are in range 1..255.9999… rounded down
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let to_byte = |v: f32| (v * 256.0).clamp(0.0, 255.0) as u8;
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let alpha = (px.a * 256.0).min(255.0) as u8;

	Srgba::new(to_byte(r), to_byte(g), to_byte(b), alpha)
}

/// Squared difference of one color channel under the worse of two blend assumptions.
///
/// Premultiplied alpha and backgrounds of 0 and 1 shorten the formula:
/// `black` is the difference composited on black, `white` on white.
fn channel_difference(x: f32, y: f32, dalpha: f32) -> f32 {
	let black = x - y;
	let white = black + dalpha;
	f32::max(black * black, white * white)
}

/// Perceptual squared distance between two working pixels.
///
/// Each color channel contributes the worse of its blended-on-black and
/// blended-on-white squared differences, since the compositing background is
/// unknown. The alpha difference is weighted twice as heavily as a color channel.
pub(crate) fn color_difference(px: PremulRgba, py: PremulRgba) -> f32 {
	let dalpha = py.a - px.a;
	channel_difference(px.r, py.r, dalpha)
		+ channel_difference(px.g, py.g, dalpha)
		+ channel_difference(px.b, py.b, dalpha)
		+ 2.0 * dalpha * dalpha
}
