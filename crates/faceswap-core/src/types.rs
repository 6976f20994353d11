use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face identity embedding (512-dimensional for ArcFace), L2-normalized.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw model output, scaling it to unit length.
    ///
    /// A zero vector is kept as-is.
    pub fn normalized(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }
}

/// Which of the two uploads an image plays in a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceRole {
    Source,
    Target,
}

impl FaceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            FaceRole::Source => "source",
            FaceRole::Target => "target",
        }
    }
}

impl fmt::Display for FaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Map a declared MIME type (`image/jpeg`, `image/jpg`, `image/png`).
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    /// Map a file extension (`jpg`, `jpeg`, `png`), case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    /// Identify the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::Png => Some(ImageFormat::Png),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UploadError {
    #[error("{role} upload is empty")]
    Empty { role: FaceRole },
    #[error("{role} upload has unsupported type {declared}; only JPEG and PNG are accepted")]
    UnsupportedType { role: FaceRole, declared: String },
    #[error("{role} upload is not a valid JPEG or PNG image")]
    InvalidContent { role: FaceRole },
}

/// Raw bytes of one uploaded image, owned by the request that received it.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub role: FaceRole,
    pub format: ImageFormat,
    /// File name supplied by the client, if any.
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedImage {
    /// Validate an upload against the accepted formats.
    ///
    /// The declared MIME type wins when present; otherwise the file name's
    /// extension is used. Either way the content itself must be JPEG or PNG.
    /// A generic `application/octet-stream` declaration defers to the content.
    pub fn from_upload(
        role: FaceRole,
        file_name: Option<String>,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<Self, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty { role });
        }

        let declared = match content_type {
            Some(mime) if !is_generic_mime(mime) => Some(
                ImageFormat::from_mime(mime).ok_or_else(|| UploadError::UnsupportedType {
                    role,
                    declared: mime.to_string(),
                })?,
            ),
            _ => match file_name.as_deref().and_then(extension_of) {
                Some(ext) => Some(ImageFormat::from_extension(ext).ok_or_else(|| {
                    UploadError::UnsupportedType {
                        role,
                        declared: format!(".{ext}"),
                    }
                })?),
                None => None,
            },
        };

        let sniffed = ImageFormat::sniff(&bytes).ok_or(UploadError::InvalidContent { role })?;
        if let Some(declared) = declared {
            if declared != sniffed {
                tracing::debug!(
                    %role,
                    ?declared,
                    ?sniffed,
                    "declared upload format differs from content; using content"
                );
            }
        }

        Ok(Self {
            role,
            format: sniffed,
            file_name,
            bytes,
        })
    }

    /// Build an upload from bytes already known to be an image (e.g. read from disk).
    pub fn from_bytes(role: FaceRole, bytes: Vec<u8>) -> Result<Self, UploadError> {
        Self::from_upload(role, None, None, bytes)
    }
}

fn is_generic_mime(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or("").trim();
    essence.is_empty() || essence.eq_ignore_ascii_case("application/octet-stream")
}

fn extension_of(name: &str) -> Option<&str> {
    std::path::Path::new(name).extension()?.to_str()
}
