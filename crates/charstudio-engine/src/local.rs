//! Directory-backed implementation of the service ports.
//!
//! Layout under the root:
//! - `storage/<bucket>/<path>` uploaded objects
//! - `catalog.json` character and pose rows plus local accounts
//! - `session.json` the signed-in session, if any
//!
//! Rows are scoped to the signed-in account the way row-level security
//! scopes them on Supabase: other accounts' characters and poses are
//! invisible, and writes against them fail or touch nothing.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use charstudio_contracts::{
    Character, CharacterUpdate, NewCharacter, NewPose, Pose, Session, User,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ports::{DataStore, IdentityProvider, ObjectStorage};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    characters: Vec<Character>,
    #[serde(default)]
    poses: Vec<Pose>,
    #[serde(default)]
    accounts: Vec<LocalAccount>,
}

impl Catalog {
    fn owns(&self, viewer: Option<&str>, character_id: &str) -> bool {
        viewer.is_some_and(|viewer| {
            self.characters
                .iter()
                .any(|row| row.id == character_id && row.user_id == viewer)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalAccount {
    user_id: String,
    email: String,
    password_sha256: String,
}

pub struct LocalBackend {
    root: PathBuf,
    lock: Mutex<()>,
}

impl LocalBackend {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory {}", root.display()))?;
        let root = fs::canonicalize(&root)
            .with_context(|| format!("failed to resolve state directory {}", root.display()))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    fn session_path(&self) -> PathBuf {
        self.root.join("session.json")
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if bucket.trim().is_empty() || bucket.contains(['/', '\\']) || !safe {
            bail!("invalid object location '{bucket}/{path}'");
        }
        Ok(self.root.join("storage").join(bucket).join(relative))
    }

    fn read_catalog(&self) -> Result<Catalog> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(Catalog::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid catalog {}", path.display()))
    }

    fn write_catalog(&self, catalog: &Catalog) -> Result<()> {
        let path = self.catalog_path();
        let body = serde_json::to_string_pretty(catalog)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Read-modify-write of the catalog under the backend lock.
    fn update<T>(&self, apply: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("local backend lock poisoned"))?;
        let mut catalog = self.read_catalog()?;
        let out = apply(&mut catalog)?;
        self.write_catalog(&catalog)?;
        Ok(out)
    }

    /// User id of the signed-in account.
    fn viewer(&self) -> Result<Option<String>> {
        Ok(self.current_session()?.map(|session| session.user.id))
    }

    fn snapshot(&self) -> Result<Catalog> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("local backend lock poisoned"))?;
        self.read_catalog()
    }

    fn store_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path();
        fs::write(&path, serde_json::to_string_pretty(session)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn issue_session(&self, account: &LocalAccount) -> Result<Session> {
        let session = Session {
            access_token: uuid::Uuid::new_v4().to_string(),
            refresh_token: None,
            expires_at: None,
            user: User {
                id: account.user_id.clone(),
                email: Some(account.email.clone()),
            },
        };
        self.store_session(&session)?;
        Ok(session)
    }
}

/// Stable local user id for an e-mail address.
pub fn local_user_id(email: &str) -> String {
    let digest = Sha256::digest(normalize_email(email).as_bytes());
    format!("local-{}", &hex::encode(digest)[..24])
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn password_digest(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_email(email).as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn newest_first<T>(rows: &[T], created_at: impl Fn(&T) -> chrono::DateTime<Utc>) -> Vec<T>
where
    T: Clone,
{
    let mut out: Vec<T> = rows.iter().rev().cloned().collect();
    out.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    out
}

impl ObjectStorage for LocalBackend {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        if !upsert && target.exists() {
            bail!("The resource already exists ({bucket}/{path})");
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write object {}", target.display()))?;
        tracing::debug!(bucket, path, bytes = bytes.len(), "stored local object");
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        let location = self.root.join("storage").join(bucket).join(path);
        reqwest::Url::from_file_path(&location)
            .map(String::from)
            .unwrap_or_else(|_| format!("file://{}", location.display()))
    }
}

impl DataStore for LocalBackend {
    fn insert_character(&self, row: &NewCharacter) -> Result<Character> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            if viewer.as_deref() != Some(row.user_id.as_str()) {
                bail!("new row violates row-level security policy for table \"characters\"");
            }
            let character = Character {
                id: uuid::Uuid::new_v4().to_string(),
                name: row.name.clone(),
                user_id: row.user_id.clone(),
                reference_image_url: row.reference_image_url.clone(),
                created_at: Utc::now(),
            };
            catalog.characters.push(character.clone());
            Ok(character)
        })
    }

    fn get_character(&self, id: &str) -> Result<Option<Character>> {
        let viewer = self.viewer()?;
        let catalog = self.snapshot()?;
        Ok(catalog
            .characters
            .into_iter()
            .find(|row| row.id == id && viewer.as_deref() == Some(row.user_id.as_str())))
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let viewer = self.viewer()?;
        let catalog = self.snapshot()?;
        let owned: Vec<Character> = catalog
            .characters
            .into_iter()
            .filter(|row| viewer.as_deref() == Some(row.user_id.as_str()))
            .collect();
        Ok(newest_first(&owned, |row| row.created_at))
    }

    fn update_character(&self, id: &str, update: &CharacterUpdate) -> Result<Character> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            let Some(row) = catalog
                .characters
                .iter_mut()
                .find(|row| row.id == id && viewer.as_deref() == Some(row.user_id.as_str()))
            else {
                bail!("character '{id}' not found");
            };
            row.name = update.name.clone();
            row.reference_image_url = update.reference_image_url.clone();
            Ok(row.clone())
        })
    }

    fn delete_character(&self, id: &str) -> Result<()> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            if !catalog.owns(viewer.as_deref(), id) {
                return Ok(());
            }
            if catalog.poses.iter().any(|pose| pose.character_id == id) {
                bail!(
                    "update or delete on table \"characters\" violates foreign key constraint on table \"poses\""
                );
            }
            catalog.characters.retain(|row| row.id != id);
            Ok(())
        })
    }

    fn insert_pose(&self, row: &NewPose) -> Result<Pose> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            if !catalog
                .characters
                .iter()
                .any(|character| character.id == row.character_id)
            {
                bail!(
                    "insert or update on table \"poses\" violates foreign key constraint (character '{}')",
                    row.character_id
                );
            }
            if !catalog.owns(viewer.as_deref(), &row.character_id) {
                bail!("new row violates row-level security policy for table \"poses\"");
            }
            let pose = Pose {
                id: uuid::Uuid::new_v4().to_string(),
                character_id: row.character_id.clone(),
                name: row.name.clone(),
                genre: row.genre,
                image_url: row.image_url.clone(),
                has_background_removed: row.has_background_removed,
                created_at: Utc::now(),
                character: None,
            };
            catalog.poses.push(pose.clone());
            Ok(pose)
        })
    }

    fn list_poses(&self) -> Result<Vec<Pose>> {
        let viewer = self.viewer()?;
        let catalog = self.snapshot()?;
        let owned: Vec<Pose> = catalog
            .poses
            .iter()
            .filter(|pose| catalog.owns(viewer.as_deref(), &pose.character_id))
            .cloned()
            .collect();
        let mut poses = newest_first(&owned, |row| row.created_at);
        for pose in &mut poses {
            pose.character = catalog
                .characters
                .iter()
                .find(|character| character.id == pose.character_id)
                .cloned();
        }
        Ok(poses)
    }

    fn delete_pose(&self, id: &str) -> Result<()> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            let Some(character_id) = catalog
                .poses
                .iter()
                .find(|row| row.id == id)
                .map(|row| row.character_id.clone())
            else {
                return Ok(());
            };
            if catalog.owns(viewer.as_deref(), &character_id) {
                catalog.poses.retain(|row| row.id != id);
            }
            Ok(())
        })
    }

    fn delete_poses_for_character(&self, character_id: &str) -> Result<()> {
        let viewer = self.viewer()?;
        self.update(|catalog| {
            if catalog.owns(viewer.as_deref(), character_id) {
                catalog.poses.retain(|row| row.character_id != character_id);
            }
            Ok(())
        })
    }
}

impl IdentityProvider for LocalBackend {
    fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>> {
        if normalize_email(email).is_empty() || password.is_empty() {
            bail!("email and password are required");
        }
        let account = self.update(|catalog| {
            let normalized = normalize_email(email);
            if catalog
                .accounts
                .iter()
                .any(|account| account.email == normalized)
            {
                bail!("User already registered");
            }
            let account = LocalAccount {
                user_id: local_user_id(email),
                email: normalized,
                password_sha256: password_digest(email, password),
            };
            catalog.accounts.push(account.clone());
            Ok(account)
        })?;
        self.issue_session(&account).map(Some)
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let catalog = self.snapshot()?;
        let normalized = normalize_email(email);
        let digest = password_digest(email, password);
        let Some(account) = catalog
            .accounts
            .iter()
            .find(|account| account.email == normalized && account.password_sha256 == digest)
        else {
            bail!("Invalid login credentials");
        };
        self.issue_session(account)
    }

    fn sign_out(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn current_session(&self) -> Result<Option<Session>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let session: Session = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session file {}", path.display()))?;
        if session.is_expired() {
            return Ok(None);
        }
        Ok(Some(session))
    }
}
