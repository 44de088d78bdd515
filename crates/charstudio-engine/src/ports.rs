//! Service ports the pipeline depends on. Backends implement all three.

use std::sync::Arc;

use anyhow::Result;
use charstudio_contracts::{
    Character, CharacterUpdate, Genre, NewCharacter, NewPose, Pose, Session,
};

pub const POSE_BUCKET: &str = "generated-poses";
pub const CHARACTER_BUCKET: &str = "character-references";

pub trait ObjectStorage: Send + Sync {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Row access for the `characters` and `poses` tables. Listings are newest
/// first.
pub trait DataStore: Send + Sync {
    fn insert_character(&self, row: &NewCharacter) -> Result<Character>;
    fn get_character(&self, id: &str) -> Result<Option<Character>>;
    fn list_characters(&self) -> Result<Vec<Character>>;
    fn update_character(&self, id: &str, update: &CharacterUpdate) -> Result<Character>;
    fn delete_character(&self, id: &str) -> Result<()>;

    fn insert_pose(&self, row: &NewPose) -> Result<Pose>;
    /// Poses with their owning character attached.
    fn list_poses(&self) -> Result<Vec<Pose>>;
    fn delete_pose(&self, id: &str) -> Result<()>;
    fn delete_poses_for_character(&self, character_id: &str) -> Result<()>;
}

pub trait IdentityProvider: Send + Sync {
    /// `None` when the provider wants the address confirmed before issuing a
    /// session.
    fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>>;
    fn sign_in(&self, email: &str, password: &str) -> Result<Session>;
    fn sign_out(&self) -> Result<()>;
    fn current_session(&self) -> Result<Option<Session>>;
}

/// The three service ports, passed explicitly into the studio.
#[derive(Clone)]
pub struct Backend {
    pub storage: Arc<dyn ObjectStorage>,
    pub store: Arc<dyn DataStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl Backend {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        store: Arc<dyn DataStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            storage,
            store,
            identity,
        }
    }

    /// One value serving all three ports.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: ObjectStorage + DataStore + IdentityProvider + 'static,
    {
        Self {
            storage: backend.clone(),
            store: backend.clone(),
            identity: backend,
        }
    }
}

pub fn pose_object_path(character_name: &str, genre: Genre, unix_millis: i64) -> String {
    format!("poses/{character_name}-{}-{unix_millis}.png", genre.as_str())
}

pub fn character_object_path(character_name: &str, extension: &str, unix_millis: i64) -> String {
    format!("characters/{character_name}-{unix_millis}.{extension}")
}
