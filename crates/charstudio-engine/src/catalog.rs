use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use charstudio_contracts::{
    Character, CharacterUpdate, GenerationError, NewCharacter, Pose, Session,
};
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;

use crate::images::{extension_of, materialize, mime_for_extension};
use crate::ports::{character_object_path, Backend, CHARACTER_BUCKET};

pub const MAX_REFERENCE_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Reference art attached to a character.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ReferenceImage {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read reference image {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self { file_name, bytes })
    }

    /// Extension and media type, once the image passes the upload rules.
    fn validate(&self) -> Result<(String, &'static str), GenerationError> {
        let Some((extension, content_type)) = extension_of(&self.file_name)
            .and_then(|ext| mime_for_extension(&ext).map(|mime| (ext, mime)))
        else {
            return Err(GenerationError::validation("Please select an image file"));
        };
        if self.bytes.is_empty() {
            return Err(GenerationError::validation("Image file is empty"));
        }
        if self.bytes.len() > MAX_REFERENCE_IMAGE_BYTES {
            return Err(GenerationError::validation("Image must be under 5MB"));
        }
        Ok((extension, content_type))
    }
}

/// Character and pose bookkeeping over the service ports.
#[derive(Clone)]
pub struct Catalog {
    backend: Backend,
    http: HttpClient,
}

impl Catalog {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            http: HttpClient::new(),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Client used to fetch stored images.
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// The signed-in session, or `Unauthenticated`.
    pub fn require_session(&self) -> Result<Session, GenerationError> {
        match self.backend.identity.current_session() {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(GenerationError::Unauthenticated),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "session lookup failed");
                Err(GenerationError::Unauthenticated)
            }
        }
    }

    pub fn create_character(
        &self,
        name: &str,
        reference: Option<&ReferenceImage>,
    ) -> Result<Character, GenerationError> {
        let session = self.require_session()?;
        let name = required_name(name)?;
        let reference_image_url = match reference {
            Some(image) => Some(self.upload_reference(&name, image)?),
            None => None,
        };
        let character = self
            .backend
            .store
            .insert_character(&NewCharacter {
                name,
                user_id: session.user_id().to_string(),
                reference_image_url,
            })
            .map_err(GenerationError::Persistence)?;
        tracing::info!(character_id = %character.id, name = %character.name, "character created");
        Ok(character)
    }

    /// Renames a character and optionally replaces its reference art. The
    /// existing reference URL is kept when no new image is given.
    pub fn update_character(
        &self,
        id: &str,
        name: &str,
        reference: Option<&ReferenceImage>,
    ) -> Result<Character, GenerationError> {
        let id = required_id(id, "Please select a character")?;
        let name = required_name(name)?;
        let existing = self.character(id)?;
        let reference_image_url = match reference {
            Some(image) => Some(self.upload_reference(&name, image)?),
            None => existing.reference_image_url,
        };
        self.backend
            .store
            .update_character(
                id,
                &CharacterUpdate {
                    name,
                    reference_image_url,
                },
            )
            .map_err(GenerationError::Persistence)
    }

    /// Deletes the character's poses, then the character.
    pub fn delete_character(&self, id: &str) -> Result<(), GenerationError> {
        let id = required_id(id, "Please select a character")?;
        self.backend
            .store
            .delete_poses_for_character(id)
            .map_err(GenerationError::Persistence)?;
        self.backend
            .store
            .delete_character(id)
            .map_err(GenerationError::Persistence)?;
        tracing::info!(character_id = id, "character deleted");
        Ok(())
    }

    pub fn delete_pose(&self, id: &str) -> Result<(), GenerationError> {
        let id = required_id(id, "Please select a pose")?;
        self.backend
            .store
            .delete_pose(id)
            .map_err(GenerationError::Persistence)
    }

    /// Fetches a pose image. Returns the file name to save it under
    /// (`<pose name>.png`) and the image bytes.
    pub fn download_pose(&self, id: &str) -> Result<(String, Vec<u8>), GenerationError> {
        let id = required_id(id, "Please select a pose")?;
        let pose = self
            .list_poses()?
            .into_iter()
            .find(|pose| pose.id == id)
            .ok_or_else(|| GenerationError::validation(format!("pose '{id}' not found")))?;
        let bytes = materialize(&pose.image_url, &self.http)
            .with_context(|| format!("failed to download pose '{id}'"))
            .map_err(GenerationError::Storage)?;
        tracing::info!(pose_id = id, bytes = bytes.len(), "pose downloaded");
        Ok((format!("{}.png", pose.name), bytes))
    }

    pub fn character(&self, id: &str) -> Result<Character, GenerationError> {
        match self.backend.store.get_character(id) {
            Ok(Some(character)) => Ok(character),
            Ok(None) => Err(GenerationError::validation(format!(
                "character '{id}' not found"
            ))),
            Err(err) => Err(GenerationError::Persistence(err)),
        }
    }

    pub fn list_characters(&self) -> Result<Vec<Character>, GenerationError> {
        self.backend
            .store
            .list_characters()
            .map_err(GenerationError::Persistence)
    }

    pub fn list_poses(&self) -> Result<Vec<Pose>, GenerationError> {
        self.backend
            .store
            .list_poses()
            .map_err(GenerationError::Persistence)
    }

    fn upload_reference(
        &self,
        name: &str,
        image: &ReferenceImage,
    ) -> Result<String, GenerationError> {
        let (extension, content_type) = image.validate()?;
        let path = character_object_path(name, &extension, Utc::now().timestamp_millis());
        self.backend
            .storage
            .upload(CHARACTER_BUCKET, &path, &image.bytes, content_type, true)
            .map_err(GenerationError::Storage)?;
        Ok(self.backend.storage.public_url(CHARACTER_BUCKET, &path))
    }
}

fn required_id<'a>(id: &'a str, message: &str) -> Result<&'a str, GenerationError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::validation(message));
    }
    Ok(trimmed)
}

fn required_name(name: &str) -> Result<String, GenerationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::validation("Character name is required"));
    }
    Ok(trimmed.to_string())
}
