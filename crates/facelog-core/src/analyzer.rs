//! Face detection/encoding capability.
//!
//! The detector and encoder are not implemented here. [`FaceAnalyzer`] is the
//! seam: given an RGB image, return every face's bounding box and encoding.
//! [`CommandAnalyzer`] bridges to an external helper process that speaks
//! newline-delimited JSON over stdin/stdout.

use crate::types::{BoundingBox, DetectedFace, Embedding};
use base64::Engine;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("failed to spawn analyzer {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("analyzer pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("analyzer exited")]
    Exited,
    #[error("malformed analyzer response: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("analyzer reported: {0}")]
    Remote(String),
}

impl AnalyzerError {
    /// Whether the analyzer can still serve further frames.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalyzerError::Spawn { .. } | AnalyzerError::Io(_) | AnalyzerError::Exited
        )
    }
}

/// Produces zero or more (bounding box, encoding) pairs for an image.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    width: u32,
    height: u32,
    /// Base64 of packed RGB8 pixels.
    rgb: &'a str,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    faces: Vec<WireFace>,
    #[serde(default)]
    error: Option<String>,
}

/// Face location in `top, right, bottom, left` order plus its encoding.
#[derive(Deserialize)]
struct WireFace {
    top: u32,
    right: u32,
    bottom: u32,
    left: u32,
    encoding: Vec<f64>,
}

impl From<WireFace> for DetectedFace {
    fn from(face: WireFace) -> Self {
        DetectedFace {
            bbox: BoundingBox::from_edges(face.top, face.right, face.bottom, face.left),
            embedding: Embedding::new(face.encoding),
        }
    }
}

fn parse_response(line: &str) -> Result<Vec<DetectedFace>, AnalyzerError> {
    let response: AnalyzeResponse = serde_json::from_str(line)?;
    if let Some(error) = response.error {
        return Err(AnalyzerError::Remote(error));
    }
    Ok(response.faces.into_iter().map(DetectedFace::from).collect())
}

/// Analyzer backed by a long-lived helper process.
pub struct CommandAnalyzer {
    command: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CommandAnalyzer {
    /// Spawn `command` (split on whitespace into program and arguments).
    pub fn spawn(command: &str) -> Result<Self, AnalyzerError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| AnalyzerError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| AnalyzerError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(AnalyzerError::Exited);
        };

        tracing::info!(command, pid = child.id(), "analyzer started");
        Ok(Self {
            command: command.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl FaceAnalyzer for CommandAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let rgb = base64::engine::general_purpose::STANDARD.encode(image.as_raw());
        let request = AnalyzeRequest {
            width: image.width(),
            height: image.height(),
            rgb: &rgb,
        };
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        self.stdin.write_all(&payload)?;
        self.stdin.flush()?;

        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(AnalyzerError::Exited);
        }
        parse_response(line.trim_end())
    }
}

impl Drop for CommandAnalyzer {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(command = %self.command, error = %e, "analyzer already exited");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_faces() {
        let line = r#"{"faces":[{"top":10,"right":60,"bottom":90,"left":20,"encoding":[0.5,-0.25]}]}"#;
        let faces = parse_response(line).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox { x: 20, y: 10, width: 40, height: 80 });
        assert_eq!(faces[0].embedding.values, vec![0.5, -0.25]);
    }

    #[test]
    fn test_parse_no_faces() {
        assert!(parse_response(r#"{"faces":[]}"#).unwrap().is_empty());
        assert!(parse_response("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_remote_error() {
        let err = parse_response(r#"{"error":"bad image"}"#).unwrap_err();
        assert!(matches!(err, AnalyzerError::Remote(ref m) if m == "bad image"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_response("not json").unwrap_err();
        assert!(matches!(err, AnalyzerError::Protocol(_)));
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = CommandAnalyzer::spawn("/nonexistent/facelog-encoder --model x").err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_spawn_empty_command() {
        assert!(matches!(
            CommandAnalyzer::spawn("   ").err().unwrap(),
            AnalyzerError::Spawn { .. }
        ));
    }
}
