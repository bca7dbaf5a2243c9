//! Identity gallery: one labeled reference embedding per known person.
//!
//! The gallery is built once per session and never mutated by the
//! recognition loop. Insertion order is preserved and decides ties in
//! [`Matcher::find_match`](crate::matcher::Matcher::find_match).

use crate::analyzer::FaceAnalyzer;
use crate::types::{Embedding, Identity};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

const REFERENCE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("reference image directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("failed to read reference directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate label {0:?}, keeping the first reference")]
    DuplicateLabel(String),
    #[error("embedding dimension {actual} does not match gallery dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("empty embedding for label {0:?}")]
    EmptyEmbedding(String),
}

/// Why a reference image did not make it into the gallery.
#[derive(Error, Debug)]
pub enum SkipReason {
    #[error("unreadable image: {0}")]
    Unreadable(String),
    #[error("no face found")]
    NoFace,
    #[error("face analysis failed: {0}")]
    Analyzer(String),
    #[error(transparent)]
    Rejected(#[from] GalleryError),
}

#[derive(Debug)]
pub struct SkippedReference {
    pub label: String,
    pub reason: SkipReason,
}

/// Outcome of a gallery load: the gallery plus every reference that was skipped.
#[derive(Debug)]
pub struct GalleryLoad {
    pub gallery: Gallery,
    pub skipped: Vec<SkippedReference>,
}

/// Ordered set of known identities with a fixed embedding dimensionality.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    /// Build a gallery from labeled reference images.
    ///
    /// The highest-confidence face of each image becomes that label's
    /// embedding. Images without a face, duplicate labels and embeddings of
    /// the wrong dimensionality are skipped with a warning; none of these
    /// are fatal.
    pub fn load<I>(references: I, analyzer: &mut dyn FaceAnalyzer) -> GalleryLoad
    where
        I: IntoIterator<Item = (String, RgbImage)>,
    {
        let mut gallery = Gallery::default();
        let mut skipped = Vec::new();

        for (label, image) in references {
            if gallery.contains(&label) {
                tracing::warn!(label = %label, "duplicate reference label, keeping first");
                skipped.push(SkippedReference {
                    reason: GalleryError::DuplicateLabel(label.clone()).into(),
                    label,
                });
                continue;
            }

            let faces = match analyzer.analyze(&image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "face analysis failed on reference image, skipping");
                    skipped.push(SkippedReference { label, reason: SkipReason::Analyzer(e.to_string()) });
                    continue;
                }
            };

            // Analyzer output is sorted by confidence; the first face is the primary one.
            let Some(primary) = faces.into_iter().next() else {
                tracing::warn!(label = %label, "no face found in reference image, skipping");
                skipped.push(SkippedReference { label, reason: SkipReason::NoFace });
                continue;
            };

            match gallery.insert(&label, primary.embedding) {
                Ok(()) => tracing::info!(label = %label, "registered identity"),
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "reference rejected");
                    skipped.push(SkippedReference { label, reason: e.into() });
                }
            }
        }

        tracing::info!(
            registered = gallery.len(),
            skipped = skipped.len(),
            "gallery loaded"
        );

        GalleryLoad { gallery, skipped }
    }

    /// Build a gallery from every image file in `dir`, labeled by file stem.
    ///
    /// Files are visited in name order so gallery order is reproducible.
    pub fn load_dir(dir: &Path, analyzer: &mut dyn FaceAnalyzer) -> Result<GalleryLoad, GalleryError> {
        if !dir.is_dir() {
            return Err(GalleryError::DirectoryNotFound(dir.display().to_string()));
        }

        let read_err = |source| GalleryError::ReadDir {
            path: dir.display().to_string(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| REFERENCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if path.is_file() && supported {
                paths.push(path);
            }
        }
        paths.sort();

        let mut unreadable = Vec::new();
        let mut references = Vec::with_capacity(paths.len());
        for path in paths {
            let label = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            match image::open(&path) {
                Ok(img) => references.push((label, img.to_rgb8())),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not read reference image");
                    unreadable.push(SkippedReference { label, reason: SkipReason::Unreadable(e.to_string()) });
                }
            }
        }

        let mut load = Self::load(references, analyzer);
        unreadable.append(&mut load.skipped);
        load.skipped = unreadable;
        Ok(load)
    }

    /// Add an identity, enforcing unique labels and constant dimensionality.
    pub fn insert(&mut self, name: &str, embedding: Embedding) -> Result<(), GalleryError> {
        if embedding.values.is_empty() {
            return Err(GalleryError::EmptyEmbedding(name.to_string()));
        }
        if self.contains(name) {
            return Err(GalleryError::DuplicateLabel(name.to_string()));
        }
        if let Some(expected) = self.dim() {
            if embedding.dim() != expected {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }
        self.identities.push(Identity {
            name: name.to_string(),
            embedding,
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.iter().any(|i| i.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.identities.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.name.as_str())
    }

    /// Embedding dimensionality shared by every entry, if any.
    pub fn dim(&self) -> Option<usize> {
        self.identities.first().map(|i| i.embedding.dim())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
