//! Service ports over the Supabase REST surface (GoTrue auth, PostgREST rows,
//! Storage objects). The signed-in session is kept in a local JSON file.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use charstudio_contracts::{
    Character, CharacterUpdate, NewCharacter, NewPose, Pose, Session, User,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::images::truncate_text;
use crate::ports::{DataStore, IdentityProvider, ObjectStorage};

const CHARACTERS_TABLE: &str = "characters";
const POSES_TABLE: &str = "poses";
const NEWEST_FIRST: &str = "created_at.desc";

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().trim_end_matches('/').to_string(),
            key: key.into().trim().to_string(),
        }
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_KEY`.
    pub fn from_env() -> Result<Self> {
        let Some(url) = non_empty_env("SUPABASE_URL") else {
            bail!("SUPABASE_URL missing");
        };
        let Some(key) = non_empty_env("SUPABASE_KEY") else {
            bail!("SUPABASE_KEY missing");
        };
        Ok(Self::new(url, key))
    }
}

pub struct SupabaseBackend {
    config: SupabaseConfig,
    session_path: PathBuf,
    http: HttpClient,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig, session_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            session_path: session_path.into(),
            http: HttpClient::new(),
        }
    }

    #[cfg(test)]
    fn with_http(mut self, http: HttpClient) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url, path.trim_start_matches('/'))
    }

    fn object_url(&self, prefix: &str, bucket: &str, path: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint(prefix))
            .with_context(|| format!("invalid SUPABASE_URL '{}'", self.config.url))?;
        {
            let Ok(mut segments) = url.path_segments_mut() else {
                bail!("SUPABASE_URL cannot be used as a base ({})", self.config.url);
            };
            segments.pop_if_empty().push(bucket);
            for part in path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    /// Bearer token for row and object requests: the user's access token when
    /// signed in, the project key otherwise.
    fn bearer(&self) -> String {
        match self.current_session() {
            Ok(Some(session)) => session.access_token,
            _ => self.config.key.clone(),
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.config.key)
            .bearer_auth(self.bearer())
    }

    fn read_session_file(&self) -> Result<Option<Session>> {
        if !self.session_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.session_path)
            .with_context(|| format!("failed to read {}", self.session_path.display()))?;
        let session: Session = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session file {}", self.session_path.display()))?;
        Ok(Some(session))
    }

    fn store_session(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.session_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.session_path, serde_json::to_string_pretty(session)?)
            .with_context(|| format!("failed to write {}", self.session_path.display()))
    }

    fn clear_session(&self) -> Result<()> {
        if self.session_path.exists() {
            fs::remove_file(&self.session_path)
                .with_context(|| format!("failed to remove {}", self.session_path.display()))?;
        }
        Ok(())
    }

    fn auth_request(&self, path: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint(path);
        let response = self
            .http
            .post(&endpoint)
            .header("apikey", &self.config.key)
            .json(payload)
            .send()
            .with_context(|| format!("Supabase auth request failed ({endpoint})"))?;
        response_json_or_error("Supabase auth", response)
    }

    fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let payload = self.auth_request(
            "auth/v1/token?grant_type=refresh_token",
            &json!({ "refresh_token": refresh_token }),
        )?;
        let Some(session) = parse_session(&payload)? else {
            bail!("Supabase refresh returned no session");
        };
        self.store_session(&session)?;
        Ok(session)
    }

    fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        let endpoint = self.endpoint(&format!("rest/v1/{table}"));
        let response = self
            .authorized(self.http.get(&endpoint))
            .query(query)
            .send()
            .with_context(|| format!("Supabase select failed ({table})"))?;
        let payload = response_json_or_error("Supabase", response)?;
        serde_json::from_value(payload)
            .with_context(|| format!("Supabase returned unexpected {table} rows"))
    }

    fn insert_row<B: Serialize, T: DeserializeOwned>(&self, table: &str, row: &B) -> Result<T> {
        let endpoint = self.endpoint(&format!("rest/v1/{table}"));
        let response = self
            .authorized(self.http.post(&endpoint))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .with_context(|| format!("Supabase insert failed ({table})"))?;
        first_row(table, response_json_or_error("Supabase", response)?)
    }

    fn delete_where(&self, table: &str, column: &str, value: &str) -> Result<()> {
        let endpoint = self.endpoint(&format!("rest/v1/{table}"));
        let response = self
            .authorized(self.http.delete(&endpoint))
            .query(&[(column, format!("eq.{value}"))])
            .send()
            .with_context(|| format!("Supabase delete failed ({table})"))?;
        ensure_success("Supabase", response)
    }
}

impl ObjectStorage for SupabaseBackend {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let url = self.object_url("storage/v1/object", bucket, path)?;
        let response = self
            .authorized(self.http.post(url))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("Supabase storage upload failed ({bucket}/{path})"))?;
        ensure_success("Supabase storage", response)
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        match self.object_url("storage/v1/object/public", bucket, path) {
            Ok(url) => url.to_string(),
            Err(_) => self.endpoint(&format!("storage/v1/object/public/{bucket}/{path}")),
        }
    }
}

impl DataStore for SupabaseBackend {
    fn insert_character(&self, row: &NewCharacter) -> Result<Character> {
        self.insert_row(CHARACTERS_TABLE, row)
    }

    fn get_character(&self, id: &str) -> Result<Option<Character>> {
        let rows: Vec<Character> = self.select(
            CHARACTERS_TABLE,
            &[("select", "*".to_string()), ("id", format!("eq.{id}"))],
        )?;
        Ok(rows.into_iter().next())
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        self.select(
            CHARACTERS_TABLE,
            &[
                ("select", "*".to_string()),
                ("order", NEWEST_FIRST.to_string()),
            ],
        )
    }

    fn update_character(&self, id: &str, update: &CharacterUpdate) -> Result<Character> {
        let endpoint = self.endpoint(&format!("rest/v1/{CHARACTERS_TABLE}"));
        let response = self
            .authorized(self.http.patch(&endpoint))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(update)
            .send()
            .with_context(|| format!("Supabase update failed ({CHARACTERS_TABLE})"))?;
        first_row(CHARACTERS_TABLE, response_json_or_error("Supabase", response)?)
            .with_context(|| format!("character '{id}' not updated"))
    }

    fn delete_character(&self, id: &str) -> Result<()> {
        self.delete_where(CHARACTERS_TABLE, "id", id)
    }

    fn insert_pose(&self, row: &NewPose) -> Result<Pose> {
        self.insert_row(POSES_TABLE, row)
    }

    fn list_poses(&self) -> Result<Vec<Pose>> {
        self.select(
            POSES_TABLE,
            &[
                ("select", "*,characters(*)".to_string()),
                ("order", NEWEST_FIRST.to_string()),
            ],
        )
    }

    fn delete_pose(&self, id: &str) -> Result<()> {
        self.delete_where(POSES_TABLE, "id", id)
    }

    fn delete_poses_for_character(&self, character_id: &str) -> Result<()> {
        self.delete_where(POSES_TABLE, "character_id", character_id)
    }
}

impl IdentityProvider for SupabaseBackend {
    fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>> {
        let payload = self.auth_request(
            "auth/v1/signup",
            &json!({ "email": email.trim(), "password": password }),
        )?;
        let session = parse_session(&payload)?;
        match &session {
            Some(session) => self.store_session(session)?,
            None => tracing::info!(email = email.trim(), "sign-up pending e-mail confirmation"),
        }
        Ok(session)
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let payload = self.auth_request(
            "auth/v1/token?grant_type=password",
            &json!({ "email": email.trim(), "password": password }),
        )?;
        let Some(session) = parse_session(&payload)? else {
            bail!("Supabase sign-in returned no session");
        };
        self.store_session(&session)?;
        Ok(session)
    }

    fn sign_out(&self) -> Result<()> {
        if let Some(session) = self.read_session_file()? {
            let endpoint = self.endpoint("auth/v1/logout");
            let outcome = self
                .http
                .post(&endpoint)
                .header("apikey", &self.config.key)
                .bearer_auth(&session.access_token)
                .send()
                .with_context(|| format!("Supabase logout failed ({endpoint})"))
                .and_then(|response| ensure_success("Supabase auth", response));
            if let Err(err) = outcome {
                // the local session is dropped either way
                tracing::warn!(error = %format!("{err:#}"), "remote sign-out failed");
            }
        }
        self.clear_session()
    }

    fn current_session(&self) -> Result<Option<Session>> {
        let Some(session) = self.read_session_file()? else {
            return Ok(None);
        };
        if !session.is_expired() {
            return Ok(Some(session));
        }
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Ok(None);
        };
        match self.refresh(refresh_token) {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "session refresh failed");
                Ok(None)
            }
        }
    }
}

/// Session from a GoTrue token payload. `None` when the payload carries only
/// a user (sign-up awaiting confirmation).
fn parse_session(payload: &Value) -> Result<Option<Session>> {
    let Some(access_token) = payload
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
    else {
        return Ok(None);
    };
    let Some(user) = payload.get("user") else {
        bail!("Supabase session payload has no user");
    };
    let user: User =
        serde_json::from_value(user.clone()).context("Supabase returned an invalid user")?;
    let expires_at = payload
        .get("expires_at")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .or_else(|| {
            payload
                .get("expires_in")
                .and_then(Value::as_i64)
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs))
        });
    Ok(Some(Session {
        access_token: access_token.to_string(),
        refresh_token: payload
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expires_at,
        user,
    }))
}

fn first_row<T: DeserializeOwned>(table: &str, payload: Value) -> Result<T> {
    let row = match payload {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Object(_) => Some(payload),
        _ => None,
    };
    let Some(row) = row else {
        bail!("Supabase returned no {table} row");
    };
    serde_json::from_value(row).with_context(|| format!("Supabase returned an unexpected {table} row"))
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            error_message(&body)
        );
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn ensure_success(provider: &str, response: HttpResponse) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().unwrap_or_default();
    bail!(
        "{provider} request failed ({}): {}",
        status.as_u16(),
        error_message(&body)
    )
}

/// Best human-readable message from a Supabase error body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        ["msg", "message", "error_description", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
    });
    truncate_text(message.unwrap_or(body).trim(), 512)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use charstudio_contracts::{Character, NewCharacter, Session, User};
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{error_message, first_row, parse_session, SupabaseBackend, SupabaseConfig};
    use crate::ports::{DataStore, IdentityProvider, ObjectStorage};
    use crate::test_support::{loopback_client, StubReply, StubServer};

    fn backend(dir: &std::path::Path) -> SupabaseBackend {
        SupabaseBackend::new(
            SupabaseConfig::new("https://project.supabase.test/", "anon-key"),
            dir.join("session.json"),
        )
    }

    #[test]
    fn public_url_encodes_object_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let url = backend(temp.path()).public_url("generated-poses", "poses/Rin Blue-action-1.png");
        assert_eq!(
            url,
            "https://project.supabase.test/storage/v1/object/public/generated-poses/poses/Rin%20Blue-action-1.png"
        );
        Ok(())
    }

    #[test]
    fn token_payload_becomes_session() -> anyhow::Result<()> {
        let payload = json!({
            "access_token": "jwt",
            "refresh_token": "refresh",
            "expires_at": 1_900_000_000_i64,
            "user": { "id": "u-1", "email": "rin@example.com", "aud": "authenticated" }
        });
        let session = parse_session(&payload)?;
        assert_eq!(
            session.as_ref().map(|session| session.user_id()),
            Some("u-1")
        );
        assert_eq!(
            session.as_ref().and_then(|session| session.refresh_token.as_deref()),
            Some("refresh")
        );
        assert!(session.as_ref().and_then(|session| session.expires_at).is_some());
        Ok(())
    }

    #[test]
    fn unconfirmed_signup_has_no_session() -> anyhow::Result<()> {
        let payload = json!({ "id": "u-1", "email": "rin@example.com", "confirmation_sent_at": "now" });
        assert!(parse_session(&payload)?.is_none());
        Ok(())
    }

    #[test]
    fn expired_session_without_refresh_token_is_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let expired = Session {
            access_token: "jwt".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() - Duration::minutes(5)),
            user: User {
                id: "u-1".to_string(),
                email: None,
            },
        };
        std::fs::write(temp.path().join("session.json"), serde_json::to_string(&expired)?)?;
        assert!(backend(temp.path()).current_session()?.is_none());
        Ok(())
    }

    #[test]
    fn stored_session_is_returned_while_valid() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let valid = Session {
            access_token: "jwt".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            user: User {
                id: "u-1".to_string(),
                email: Some("rin@example.com".to_string()),
            },
        };
        std::fs::write(temp.path().join("session.json"), serde_json::to_string(&valid)?)?;
        assert_eq!(backend(temp.path()).current_session()?, Some(valid));
        Ok(())
    }

    #[test]
    fn first_row_accepts_representation_arrays() -> anyhow::Result<()> {
        let payload = json!([{
            "id": "c-1",
            "name": "Rin",
            "user_id": "u-1",
            "reference_image_url": null,
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        }]);
        let row: Character = first_row("characters", payload)?;
        assert_eq!(row.name, "Rin");
        assert!(first_row::<Character>("characters", json!([])).is_err());
        Ok(())
    }

    #[test]
    fn error_message_prefers_structured_fields() {
        assert_eq!(
            error_message(r#"{"code":"23503","message":"violates foreign key constraint"}"#),
            "violates foreign key constraint"
        );
        assert_eq!(
            error_message(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#),
            "Invalid login credentials"
        );
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    fn stub_backend(server: &StubServer, dir: &std::path::Path) -> anyhow::Result<SupabaseBackend> {
        Ok(SupabaseBackend::new(
            SupabaseConfig::new(server.base(), "anon-key"),
            dir.join("session.json"),
        )
        .with_http(loopback_client()?))
    }

    #[test]
    fn upload_sends_upsert_and_project_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let server = StubServer::start(vec![StubReply::json(
            200,
            &json!({ "Key": "generated-poses/poses/Rin Blue-combat-1.png" }),
        )])?;
        stub_backend(&server, temp.path())?.upload(
            "generated-poses",
            "poses/Rin Blue-combat-1.png",
            b"png-bytes",
            "image/png",
            true,
        )?;

        let requests = server.finish()?;
        assert_eq!(requests.len(), 1);
        let upload = &requests[0];
        assert_eq!(upload.method, "POST");
        assert_eq!(
            upload.path(),
            "/storage/v1/object/generated-poses/poses/Rin%20Blue-combat-1.png"
        );
        assert_eq!(upload.header("x-upsert"), Some("true"));
        assert_eq!(upload.header("content-type"), Some("image/png"));
        assert_eq!(upload.header("apikey"), Some("anon-key"));
        assert_eq!(upload.header("authorization"), Some("Bearer anon-key"));
        assert_eq!(upload.body, b"png-bytes".to_vec());
        Ok(())
    }

    #[test]
    fn row_requests_use_postgrest_conventions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let signed_in = Session {
            access_token: "user-jwt".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
            user: User {
                id: "u-1".to_string(),
                email: None,
            },
        };
        std::fs::write(temp.path().join("session.json"), serde_json::to_string(&signed_in)?)?;
        let server = StubServer::start(vec![
            StubReply::json(
                201,
                &json!([{
                    "id": "c-1",
                    "name": "Rin",
                    "user_id": "u-1",
                    "reference_image_url": null,
                    "created_at": "2024-05-01T10:00:00+00:00"
                }]),
            ),
            StubReply::new(204, "text/plain", ""),
            StubReply::json(200, &json!([])),
        ])?;
        let backend = stub_backend(&server, temp.path())?;

        let created = backend.insert_character(&NewCharacter {
            name: "Rin".to_string(),
            user_id: "u-1".to_string(),
            reference_image_url: None,
        })?;
        backend.delete_poses_for_character("c-1")?;
        let poses = backend.list_poses()?;

        assert_eq!(created.id, "c-1");
        assert!(poses.is_empty());
        let requests = server.finish()?;
        assert_eq!(requests.len(), 3);

        let insert = &requests[0];
        assert_eq!(insert.method, "POST");
        assert_eq!(insert.path(), "/rest/v1/characters");
        assert_eq!(insert.header("prefer"), Some("return=representation"));
        assert_eq!(insert.header("authorization"), Some("Bearer user-jwt"));
        assert_eq!(insert.header("apikey"), Some("anon-key"));
        let body = insert.json()?;
        assert_eq!(body["name"], "Rin");
        assert_eq!(body["user_id"], "u-1");

        let delete = &requests[1];
        assert_eq!(delete.method, "DELETE");
        assert_eq!(delete.path(), "/rest/v1/poses");
        assert_eq!(
            delete.query()?,
            vec![("character_id".to_string(), "eq.c-1".to_string())]
        );

        let list = &requests[2];
        assert_eq!(list.method, "GET");
        assert_eq!(list.path(), "/rest/v1/poses");
        assert_eq!(
            list.query()?,
            vec![
                ("select".to_string(), "*,characters(*)".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
            ]
        );
        Ok(())
    }
}
