// ============================================================================
// Playground session: worker source, uploaded image and image count
// ============================================================================

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::canvas::RasterBuffer;
use crate::io::MAX_IMAGE_DIMENSION;
use crate::worker::DEFAULT_IMAGE_COUNT;

/// Magic header for session files (version 1)
const SESSION_MAGIC: &[u8; 8] = b"PXPLAY01";

/// Error type for session file operations
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::Serialize(e) => write!(f, "Serialization error: {}", e),
            SessionError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for SessionError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SessionError::Serialize(e.to_string())
    }
}

/// Everything needed to resume where the user left off.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Worker script text as last edited.
    pub source: String,
    /// Last uploaded image; `None` until one is supplied.
    pub image: Option<RasterBuffer>,
    /// Raw text of the image-count control.
    pub image_count: String,
    /// Display name (derived from path or "Untitled")
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub is_dirty: bool,
}

impl Session {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            image: None,
            image_count: DEFAULT_IMAGE_COUNT.to_string(),
            name: "Untitled".to_string(),
            path: None,
            is_dirty: false,
        }
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
        self.is_dirty = true;
    }

    pub fn set_image(&mut self, image: Option<RasterBuffer>) {
        self.image = image;
        self.is_dirty = true;
    }

    pub fn set_image_count(&mut self, raw: impl Into<String>) {
        self.image_count = raw.into();
        self.is_dirty = true;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Write the session to `path` and mark it clean.
    pub fn save(&mut self, path: &Path) -> Result<(), SessionError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(SESSION_MAGIC)?;
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.is_dirty = false;
        crate::log_info!("Session {} saved to {}", self.id, path.display());
        Ok(())
    }

    /// Load a session file, validating the header and stored image.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SESSION_MAGIC {
            return Err(SessionError::InvalidFormat(
                "not a PixelPlay session file".to_string(),
            ));
        }

        let mut session: Session = bincode::deserialize_from(&mut reader)?;
        if let Some(image) = &session.image {
            validate_image(image)?;
        }
        session.path = Some(path.to_path_buf());
        session.update_name_from_path();
        session.is_dirty = false;
        crate::log_info!("Session {} loaded from {}", session.id, path.display());
        Ok(session)
    }

    fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown".to_string());
        }
    }
}

fn validate_image(image: &RasterBuffer) -> Result<(), SessionError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || w > MAX_IMAGE_DIMENSION || h > MAX_IMAGE_DIMENSION {
        return Err(SessionError::InvalidFormat(format!(
            "stored image dimensions {}x{} out of range",
            w, h
        )));
    }
    // Deserialization bypasses the constructor's length check.
    RasterBuffer::from_raw(w, h, image.data().to_vec())
        .map_err(|e| SessionError::InvalidFormat(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pixelplay_session_{}_{}", std::process::id(), name))
    }

    #[test]
    fn save_and_load_preserves_content() {
        let mut session = Session::new("fn onmessage(e) { }");
        session.set_image(Some(RasterBuffer::filled(3, 3, [1, 2, 3, 255])));
        session.set_image_count("7");
        assert!(session.display_title().ends_with('*'));

        let path = temp_path("roundtrip.pps");
        session.save(&path).unwrap();
        assert!(!session.is_dirty);

        let loaded = Session::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.source, session.source);
        assert_eq!(loaded.image, session.image);
        assert_eq!(loaded.image_count, "7");
        assert_eq!(loaded.name, path.file_name().unwrap().to_string_lossy());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let path = temp_path("bad.pps");
        std::fs::write(&path, b"NOTASESSIONFILE").unwrap();
        let err = Session::load(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(err, SessionError::InvalidFormat(_)));
    }

    #[test]
    fn new_session_uses_default_image_count() {
        let session = Session::new("");
        assert_eq!(session.image_count, "5");
        assert!(session.image.is_none());
        assert_eq!(session.display_title(), "Untitled");
    }
}
