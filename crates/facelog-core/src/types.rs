
/// Bounding box for a detected face, in pixel coordinates of the analyzed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Build a box from `top, right, bottom, left` edges, the order face
    /// analyzers usually report locations in.
    pub fn from_edges(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            x: left,
            y: top,
            width: right.saturating_sub(left),
            height: bottom.saturating_sub(top),
        }
    }
}

/// Fixed-length face feature vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Vectors of different length are never comparable and yield
    /// `f64::INFINITY`, so they can never fall inside a tolerance.
    pub fn distance(&self, other: &Embedding) -> f64 {
        if self.values.len() != other.values.len() {
            return f64::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Little-endian 8-byte float encoding used for the `faces.encoding` blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`to_bytes`](Self::to_bytes).
    /// Returns `None` if the length is not a multiple of 8.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(chunk);
                f64::from_le_bytes(arr)
            })
            .collect();
        Some(Self { values })
    }
}

/// One face produced by the analysis capability for a frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// An enrolled (name, encoding) row.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
}

/// In-memory snapshot of the face store, in storage order.
///
/// Rebuilt wholesale from storage whenever an identity is enrolled.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    faces: Vec<KnownFace>,
}

impl Registry {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownFace> {
        self.faces.iter()
    }
}

/// Outcome of identifying a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    Known { name: String, distance: f64 },
    Unknown,
}

/// Strategy for identifying a query embedding against the registry.
pub trait Matcher {
    fn identify(&self, query: &Embedding, registry: &Registry) -> Identification;
}

/// Euclidean-distance matcher with first-match semantics.
///
/// The first registry entry within `tolerance` wins, even when a later
/// entry is closer. Registry order is storage insertion order.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f64,
}

impl EuclideanMatcher {
    pub const DEFAULT_TOLERANCE: f64 = 0.5;

    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOLERANCE)
    }
}

impl Matcher for EuclideanMatcher {
    fn identify(&self, query: &Embedding, registry: &Registry) -> Identification {
        registry
            .iter()
            .find_map(|known| {
                let distance = query.distance(&known.embedding);
                (distance <= self.tolerance).then(|| Identification::Known {
                    name: known.name.clone(),
                    distance,
                })
            })
            .unwrap_or(Identification::Unknown)
    }
}
