//! Batch enrollment from a folder of labeled images.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::store::{Storage, StorageError};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("cannot read folder {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Outcome of importing one folder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Encodings stored (an image may contribute several).
    pub stored: usize,
    /// Images with no detectable face.
    pub no_face: Vec<PathBuf>,
    /// Files that could not be decoded or analyzed.
    pub failed: Vec<PathBuf>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Encode every image in `dir` and store each detected face under `name`.
///
/// The name is stored verbatim. Files are visited in name order.
pub fn import_folder(
    storage: &Storage,
    analyzer: &mut dyn FaceAnalyzer,
    dir: &Path,
    name: &str,
) -> Result<ImportReport, ImportError> {
    let read_err = |source| ImportError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    paths.retain(|p| p.is_file() && is_image(p));
    paths.sort();

    let faces = storage.faces();
    let mut report = ImportReport::default();

    for path in paths {
        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                report.failed.push(path);
                continue;
            }
        };

        let detected = match analyzer.analyze(&image) {
            Ok(detected) => detected,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "analysis failed");
                report.failed.push(path);
                continue;
            }
        };

        if detected.is_empty() {
            tracing::info!(path = %path.display(), "no faces found");
            report.no_face.push(path);
            continue;
        }

        for face in &detected {
            faces.insert(name, &face.embedding)?;
            report.stored += 1;
        }
        tracing::info!(name, path = %path.display(), faces = detected.len(), "stored faces from image");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DetectedFace, Embedding};
    use image::RgbImage;

    /// Reports one face per red-channel decile of the first pixel.
    struct PixelAnalyzer;

    impl FaceAnalyzer for PixelAnalyzer {
        fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            let red = image.get_pixel(0, 0)[0];
            Ok((0..red / 100)
                .map(|i| DetectedFace {
                    bbox: BoundingBox { x: 0, y: 0, width: 1, height: 1 },
                    embedding: Embedding::new(vec![i as f64]),
                })
                .collect())
        }
    }

    fn write_png(dir: &Path, file: &str, red: u8) {
        RgbImage::from_pixel(4, 4, image::Rgb([red, 0, 0]))
            .save_with_format(dir.join(file), image::ImageFormat::Png)
            .unwrap();
    }

    #[test]
    fn test_extension_filter() {
        assert!(is_image(Path::new("a.JPG")));
        assert!(is_image(Path::new("a.jpG")));
        assert!(is_image(Path::new("a.png")));
        assert!(!is_image(Path::new("a.gif")));
        assert!(!is_image(Path::new("README")));
    }

    #[test]
    fn test_import_stores_every_face() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("noah");
        std::fs::create_dir(&images).unwrap();
        write_png(&images, "one.png", 150); // 1 face
        write_png(&images, "two.PNG", 250); // 2 faces
        write_png(&images, "none.png", 10); // no face
        std::fs::write(images.join("notes.txt"), "ignored").unwrap();
        std::fs::write(images.join("broken.jpg"), "not an image").unwrap();

        let storage = Storage::open_in_memory(&dir.path().join("logs.txt")).unwrap();
        let report = import_folder(&storage, &mut PixelAnalyzer, &images, "Noah Johnson").unwrap();

        assert_eq!(report.stored, 3);
        assert_eq!(report.no_face, vec![images.join("none.png")]);
        assert_eq!(report.failed, vec![images.join("broken.jpg")]);
        assert_eq!(
            storage.faces().names().unwrap(),
            vec![("Noah Johnson".to_string(), 3)]
        );
    }

    #[test]
    fn test_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open_in_memory(&dir.path().join("logs.txt")).unwrap();
        let err = import_folder(&storage, &mut PixelAnalyzer, &dir.path().join("absent"), "X").unwrap_err();
        assert!(matches!(err, ImportError::ReadDir { .. }));
    }
}
