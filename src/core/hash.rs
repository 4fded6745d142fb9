use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Side length of the square every image is stretched to before hashing.
pub const NORMALIZED_SIZE: u32 = 256;

/// Cells per side of the averaging grid; the fingerprint has `HASH_GRID²` bits.
pub const HASH_GRID: u32 = 16;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Failed to fetch image {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Invalid fingerprint encoding")]
    InvalidEncoding,
}

/// Fixed-length binary fingerprint of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(ImageHash);

impl Fingerprint {
    pub fn bit_len(&self) -> usize {
        self.0.as_bytes().len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        self.0.to_base64()
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HashError> {
        ImageHash::from_base64(encoded)
            .map(Self)
            .map_err(|_| HashError::InvalidEncoding)
    }

    /// Fraction of differing bits. Fingerprints of different lengths are
    /// maximally distant.
    pub fn distance(&self, other: &Fingerprint) -> f64 {
        let bits = self.bit_len();
        if bits == 0 || bits != other.bit_len() {
            return 1.0;
        }
        self.0.dist(&other.0) as f64 / bits as f64
    }
}

/// `1 - normalized Hamming distance`. A missing fingerprint on either side
/// counts as a full mismatch.
pub fn similarity(a: Option<&Fingerprint>, b: Option<&Fingerprint>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => 1.0 - a.distance(b),
        _ => 0.0,
    }
}

/// Average-hash engine: stretch to a fixed square, then one bit per grid
/// cell recording whether its luminance is above the image mean.
#[derive(Debug, Clone)]
pub struct PerceptualHasher {
    normalized_size: u32,
    grid: u32,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        Self {
            normalized_size: NORMALIZED_SIZE,
            grid: HASH_GRID,
        }
    }

    /// Hash raw encoded image bytes (any format the `image` crate can sniff).
    pub fn hash_bytes(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
        let img = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?;
        Ok(self.hash_image(&img))
    }

    pub fn hash_path(&self, path: &Path) -> Result<Fingerprint, HashError> {
        let img = ImageReader::open(path)?.decode()?;
        Ok(self.hash_image(&img))
    }

    pub fn hash_image(&self, img: &DynamicImage) -> Fingerprint {
        // Stretch, not fit: aspect ratio is not preserved.
        let normalized = img.resize_exact(
            self.normalized_size,
            self.normalized_size,
            FilterType::Triangle,
        );
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .hash_size(self.grid, self.grid)
            .to_hasher();
        Fingerprint(hasher.hash_image(&normalized))
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    /// Deterministic test pattern: a block checkerboard with a diagonal
    /// gradient, optionally inverted.
    pub(crate) fn pattern(width: u32, height: u32, inverted: bool) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let cell = ((x * 4 / width) + (y * 4 / height)) % 2 == 0;
            let on = cell != inverted;
            let shade = if on { 230u8 } else { 20u8 };
            Rgb([shade, shade.saturating_sub((x % 7) as u8), shade])
        });
        DynamicImage::ImageRgb8(img)
    }

    pub(crate) fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_fingerprint_length() {
        let hasher = PerceptualHasher::new();
        let fp = hasher.hash_image(&pattern(64, 64, false));
        assert_eq!(fp.bit_len(), 256);
    }

    #[test]
    fn test_hash_is_idempotent() {
        let hasher = PerceptualHasher::new();
        let bytes = encode(&pattern(300, 200, false), ImageFormat::Png);

        let first = hasher.hash_bytes(&bytes).unwrap();
        let second = hasher.hash_bytes(&bytes).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.to_base64(), second.to_base64());
    }

    #[test]
    fn test_resized_recompressed_copy_is_near_match() {
        let hasher = PerceptualHasher::new();
        let original = pattern(400, 300, false);
        let copy = original.resize_exact(123, 91, FilterType::Nearest);

        let a = hasher
            .hash_bytes(&encode(&original, ImageFormat::Png))
            .unwrap();
        let b = hasher.hash_bytes(&encode(&copy, ImageFormat::Jpeg)).unwrap();

        assert!(similarity(Some(&a), Some(&b)) >= 0.5);
    }

    #[test]
    fn test_inverted_image_is_not_a_match() {
        let hasher = PerceptualHasher::new();
        let a = hasher.hash_image(&pattern(256, 256, false));
        let b = hasher.hash_image(&pattern(256, 256, true));

        assert!(similarity(Some(&a), Some(&b)) < 0.5);
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let hasher = PerceptualHasher::new();
        let result = hasher.hash_bytes(b"definitely not an image");
        assert!(matches!(result, Err(HashError::Decode(_))));
    }

    #[test]
    fn test_missing_fingerprint_scores_zero() {
        let hasher = PerceptualHasher::new();
        let fp = hasher.hash_image(&pattern(32, 32, false));

        assert_eq!(similarity(Some(&fp), None), 0.0);
        assert_eq!(similarity(None, Some(&fp)), 0.0);
        assert_eq!(similarity(Some(&fp), Some(&fp)), 1.0);
    }

    #[test]
    fn test_base64_roundtrip_preserves_distance() {
        let hasher = PerceptualHasher::new();
        let fp = hasher.hash_image(&pattern(80, 80, false));
        let decoded = Fingerprint::from_base64(&fp.to_base64()).unwrap();
        assert_eq!(fp.distance(&decoded), 0.0);
    }

    #[test]
    fn test_garbled_fingerprint_is_rejected() {
        assert!(matches!(
            Fingerprint::from_base64("not a fingerprint!"),
            Err(HashError::InvalidEncoding)
        ));
    }
}
