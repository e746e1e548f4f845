use image::{DynamicImage, ImageReader};
use std::path::Path;

/// Turns a file path into a raster. `None` means the file is missing or not
/// an image format we can read.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Option<DynamicImage>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageDecoder;

impl ImageDecoder for FileImageDecoder {
    fn decode(&self, path: &Path) -> Option<DynamicImage> {
        let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::debug!("Cannot open {:?}: {}", path, e);
                return None;
            }
        };

        match reader.decode() {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::debug!("Cannot decode {:?}: {}", path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_decode_png() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("red.png");
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 4, Rgb([255, 0, 0])).save(&path)?;

        let image = FileImageDecoder.decode(&path).ok_or("decode failed")?;

        assert_eq!((image.width(), image.height()), (8, 4));

        Ok(())
    }

    #[test]
    fn test_missing_and_corrupt_files_decode_to_none() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let corrupt = tmp.path().join("corrupt.jpg");
        std::fs::write(&corrupt, b"definitely not a jpeg")?;

        assert!(FileImageDecoder.decode(&tmp.path().join("absent.jpg")).is_none());
        assert!(FileImageDecoder.decode(&corrupt).is_none());

        Ok(())
    }
}
