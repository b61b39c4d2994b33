//! Validated enrollment of new identities.

use crate::store::{FaceStore, StorageError};
use crate::types::Embedding;
use image::{ImageFormat, RgbImage};
use std::path::PathBuf;
use thiserror::Error;

/// Maximum length of an identity name, in characters.
pub const MAX_NAME_LEN: usize = 20;

/// A rejected name. Always recoverable: the operator is asked again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name is too long ({len} characters, limit {MAX_NAME_LEN})")]
    TooLong { len: usize },
    #[error("name can only contain letters, numbers, spaces, underscores, and hyphens")]
    InvalidCharacters,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    Invalid(#[from] NameError),
    #[error("the name '{0}' already exists")]
    Duplicate(String),
    #[error("no unknown face in the current frame")]
    NoCandidate,
    #[error("recognition session ended before enrollment completed")]
    SessionAborted,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EnrollError {
    /// Whether the operator can simply retry with another name or frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EnrollError::Invalid(_) | EnrollError::Duplicate(_) | EnrollError::NoCandidate
        )
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-')
}

/// Capitalize the first letter of every word and lowercase the rest.
///
/// A word starts at any letter not preceded by another letter, so
/// `"mary-jane o_neil"` becomes `"Mary-Jane O_Neil"`.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_letter = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_letter = true;
        } else {
            out.push(c);
            prev_letter = false;
        }
    }
    out
}

/// Trim, check length and charset, then title-case.
pub fn normalize_name(raw: &str) -> Result<String, NameError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NameError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_NAME_LEN {
        return Err(NameError::TooLong { len });
    }
    if !trimmed.chars().all(is_allowed_char) {
        return Err(NameError::InvalidCharacters);
    }
    Ok(title_case(trimmed))
}

fn strip_forbidden(name: &str) -> String {
    name.chars()
        .filter(|&c| is_allowed_char(c))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Creates identities: validates the name, saves the frame image and
/// appends the encoding to the face store.
#[derive(Debug, Clone)]
pub struct EnrollmentController {
    faces_dir: PathBuf,
}

impl EnrollmentController {
    pub fn new(faces_dir: impl Into<PathBuf>) -> Self {
        Self {
            faces_dir: faces_dir.into(),
        }
    }

    /// Validate `raw_name` against `store` without writing anything.
    pub fn validate(&self, store: &FaceStore<'_>, raw_name: &str) -> Result<String, EnrollError> {
        let name = normalize_name(raw_name)?;
        if store.name_exists(&name)? {
            return Err(EnrollError::Duplicate(name));
        }
        Ok(strip_forbidden(&name))
    }

    /// Enroll `embedding` under `raw_name`, saving `image` as `<faces_dir>/<name>.jpg`.
    ///
    /// Returns the stored name. The caller must reload its registry.
    pub fn enroll(
        &self,
        store: &FaceStore<'_>,
        raw_name: &str,
        image: &RgbImage,
        embedding: &Embedding,
    ) -> Result<String, EnrollError> {
        let name = self.validate(store, raw_name)?;

        std::fs::create_dir_all(&self.faces_dir)
            .map_err(|e| StorageError::io(&self.faces_dir, e))?;
        let path = self.image_path(&name);
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| StorageError::Image {
                path: path.clone(),
                source,
            })?;

        if let Err(e) = store.insert(&name, embedding) {
            if let Err(rm) = std::fs::remove_file(&path) {
                tracing::warn!(image = %path.display(), error = %rm, "failed to remove image of failed enrollment");
            }
            return Err(e.into());
        }
        tracing::info!(name = %name, image = %path.display(), "identity enrolled");
        Ok(name)
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.faces_dir.join(format!("{name}.jpg"))
    }
}
