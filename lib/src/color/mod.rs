//! RGBA colors and perceptual color distance.
//!
//! Filament and AMS slot colors arrive as `#RRGGBB` or `#RRGGBBAA` hex
//! strings. Matching a filament against the materials loaded in the printer
//! uses the CIEDE2000 difference of the two colors in CIE L*a*b* space.

use palette::color_difference::Ciede2000;
use palette::white_point::D65;
use palette::{FromColor, Lab, Srgb};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a hex color string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ColorParseError {
    /// The string does not start with `#`.
    #[error("Color '{0}' must start with '#'")]
    MissingHash(String),

    /// The string is neither 7 nor 9 characters long.
    #[error("Color '{0}' must have 6 or 8 hex digits")]
    InvalidLength(String),

    /// A channel is not valid hexadecimal.
    #[error("Color '{0}' contains invalid hex digits")]
    InvalidDigit(String),
}

/// An 8-bit RGBA color.
///
/// Ordering is lexicographic over `(r, g, b, a)`, which lets colors act as
/// part of a sort key when grouping equivalent AMS slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    /// Create an opaque color.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Create a color with an explicit alpha channel.
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#RRGGBB` or `#RRGGBBAA`.
    pub fn from_hex(hex: &str) -> Result<Self, ColorParseError> {
        let digits = hex
            .strip_prefix('#')
            .ok_or_else(|| ColorParseError::MissingHash(hex.to_string()))?;
        if digits.len() != 6 && digits.len() != 8 {
            return Err(ColorParseError::InvalidLength(hex.to_string()));
        }
        if !digits.is_ascii() {
            return Err(ColorParseError::InvalidDigit(hex.to_string()));
        }

        let channel = |start: usize| {
            u8::from_str_radix(&digits[start..start + 2], 16)
                .map_err(|_| ColorParseError::InvalidDigit(hex.to_string()))
        };

        let a = if digits.len() == 8 { channel(6)? } else { 255 };
        Ok(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a,
        })
    }

    /// Lower-case hex representation, optionally including alpha.
    pub fn to_hex_str(&self, include_alpha: bool) -> String {
        if include_alpha {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        } else {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        }
    }

    fn to_lab(self) -> Lab<D65, f32> {
        let srgb = Srgb::new(
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
        );
        Lab::from_color(srgb)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::rgb(0, 0, 0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let include_alpha = self.a != 255;
        write!(f, "{}", self.to_hex_str(include_alpha))
    }
}

impl FromStr for Color {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Color {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_hex_str(true)
    }
}

/// Perceptual distance between two colors (CIEDE2000, alpha ignored).
///
/// Identical colors have distance 0; the result is never negative.
pub fn color_distance(a: &Color, b: &Color) -> f64 {
    if a.r == b.r && a.g == b.g && a.b == b.b {
        return 0.0;
    }
    let diff = a.to_lab().difference(b.to_lab()) as f64;
    diff.max(0.0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rgb_hex() {
        let color = Color::from_hex("#FF8000").unwrap();
        assert_eq!(color, Color::rgb(255, 128, 0));
        assert_eq!(color.a, 255);
    }

    #[test]
    fn test_parse_rgba_hex() {
        let color: Color = "#00ff0080".parse().unwrap();
        assert_eq!(color, Color::rgba(0, 255, 0, 128));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Color::from_hex("FF0000"),
            Err(ColorParseError::MissingHash(_))
        ));
        assert!(matches!(
            Color::from_hex("#FF00"),
            Err(ColorParseError::InvalidLength(_))
        ));
        assert!(matches!(
            Color::from_hex("#GG0000"),
            Err(ColorParseError::InvalidDigit(_))
        ));
    }

    #[test]
    fn test_hex_output() {
        let color = Color::rgba(0x12, 0xab, 0x00, 0xff);
        assert_eq!(color.to_hex_str(false), "#12ab00");
        assert_eq!(color.to_hex_str(true), "#12ab00ff");
        assert_eq!(color.to_string(), "#12ab00");
        assert_eq!(Color::rgba(1, 2, 3, 4).to_string(), "#01020304");
    }

    #[test]
    fn test_ordering_is_channel_lexicographic() {
        assert!(Color::rgb(0, 255, 255) < Color::rgb(1, 0, 0));
        assert!(Color::rgba(5, 5, 5, 0) < Color::rgba(5, 5, 5, 1));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let json = serde_json::to_string(&Color::rgb(255, 0, 0)).unwrap();
        assert_eq!(json, "\"#ff0000ff\"");
        let parsed: Color = serde_json::from_str("\"#0000FF\"").unwrap();
        assert_eq!(parsed, Color::rgb(0, 0, 255));
        assert!(serde_json::from_str::<Color>("\"blue\"").is_err());
    }

    #[test]
    fn test_color_distance() {
        let red = Color::rgb(255, 0, 0);
        let dark_red = Color::rgb(230, 10, 10);
        let blue = Color::rgb(0, 0, 255);

        assert_eq!(color_distance(&red, &red), 0.0);
        assert_eq!(color_distance(&red, &Color::rgba(255, 0, 0, 0)), 0.0);

        let near = color_distance(&red, &dark_red);
        let far = color_distance(&red, &blue);
        assert!(near > 0.0);
        assert!(near < 20.0, "similar reds should be close, got {}", near);
        assert!(far > near);
        assert!((color_distance(&blue, &red) - far).abs() < 1e-3);
    }
}
