pub mod background;
pub mod catalog;
pub mod images;
pub mod local;
pub mod ports;
pub mod supabase;
pub mod synthesis;
#[cfg(test)]
mod test_support;

use charstudio_contracts::events::{EventPayload, EventWriter};
use charstudio_contracts::progress::{ProgressSink, ProgressTracker, ProgressUpdate, Stage};
use charstudio_contracts::prompt::{build_pose_prompt, truncate_prompt, MAX_PROMPT_CHARS};
use charstudio_contracts::{Character, GenerationError, Genre, NewPose, Pose};
use chrono::Utc;
use serde_json::Value;

use crate::background::BackgroundRemover;
use crate::images::{error_chain_text, materialize};
use crate::ports::{pose_object_path, POSE_BUCKET};
use crate::synthesis::SynthesisClient;

pub use crate::catalog::{Catalog, ReferenceImage, MAX_REFERENCE_IMAGE_BYTES};
pub use crate::ports::Backend;

#[derive(Debug, Clone)]
pub struct PoseRequest {
    pub character_id: String,
    pub genre: Genre,
    pub description: String,
    pub remove_background: bool,
}

/// Runs the pose pipeline: synthesize, convert, optionally strip the
/// background, upload, insert the row.
pub struct PoseStudio {
    catalog: Catalog,
    synthesis: SynthesisClient,
    remover: Box<dyn BackgroundRemover>,
    events: Option<EventWriter>,
}

impl PoseStudio {
    pub fn new(
        catalog: Catalog,
        synthesis: SynthesisClient,
        remover: Box<dyn BackgroundRemover>,
    ) -> Self {
        Self {
            catalog,
            synthesis,
            remover,
            events: None,
        }
    }

    /// Record lifecycle events through `events`, one generation id per run.
    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn generate(
        &self,
        request: &PoseRequest,
        progress: &mut dyn ProgressSink,
    ) -> Result<Pose, GenerationError> {
        let events = self
            .events
            .as_ref()
            .map(|writer| writer.for_generation(uuid::Uuid::new_v4().to_string()));

        let mut payload = EventPayload::new();
        payload.insert(
            "character_id".to_string(),
            Value::String(request.character_id.clone()),
        );
        payload.insert(
            "genre".to_string(),
            Value::String(request.genre.as_str().to_string()),
        );
        payload.insert(
            "remove_background".to_string(),
            Value::Bool(request.remove_background),
        );
        payload.insert(
            "models".to_string(),
            Value::Array(
                self.synthesis
                    .candidates()
                    .iter()
                    .map(|name| Value::String(name.clone()))
                    .collect(),
            ),
        );
        payload.insert(
            "transport".to_string(),
            Value::String(self.synthesis.transport_name().to_string()),
        );
        emit(events.as_ref(), "generation_started", payload);

        let mut fanout = Fanout {
            caller: progress,
            events: events.as_ref(),
        };
        let outcome = self.run(request, events.as_ref(), &mut fanout);

        match &outcome {
            Ok(pose) => {
                let mut payload = EventPayload::new();
                payload.insert("pose_id".to_string(), Value::String(pose.id.clone()));
                payload.insert(
                    "image_url".to_string(),
                    Value::String(pose.image_url.clone()),
                );
                payload.insert(
                    "has_background_removed".to_string(),
                    Value::Bool(pose.has_background_removed),
                );
                emit(events.as_ref(), "pose_created", payload);
                tracing::info!(pose_id = %pose.id, character_id = %pose.character_id, "pose created");
            }
            Err(err) => {
                let mut payload = EventPayload::new();
                payload.insert("error_kind".to_string(), Value::String(err.kind().to_string()));
                payload.insert("error".to_string(), Value::String(err.to_string()));
                emit(events.as_ref(), "generation_failed", payload);
                tracing::warn!(kind = err.kind(), error = %err, "pose generation failed");
            }
        }
        outcome
    }

    fn run(
        &self,
        request: &PoseRequest,
        events: Option<&EventWriter>,
        sink: &mut dyn ProgressSink,
    ) -> Result<Pose, GenerationError> {
        self.catalog.require_session()?;
        if request.character_id.trim().is_empty() {
            return Err(GenerationError::validation("Please select a character"));
        }
        let description = request.description.trim();
        if description.is_empty() {
            return Err(GenerationError::validation("Pose description is required"));
        }
        let character = self.catalog.character(&request.character_id)?;

        let mut tracker = ProgressTracker::new(sink);
        tracker.enter(Stage::Synthesis);

        let prompt = truncate_prompt(
            &build_pose_prompt(&character.name, description, request.genre),
            MAX_PROMPT_CHARS,
        );
        tracker.within(Stage::Synthesis, 0.25);
        let synthesized = self.synthesis.synthesize(&prompt)?;
        tracker.enter(Stage::Conversion);

        let mut payload = EventPayload::new();
        payload.insert("model".to_string(), Value::String(synthesized.model.clone()));
        payload.insert("retried".to_string(), Value::Bool(synthesized.retried));
        emit(events, "synthesis_succeeded", payload);

        let mut bytes = materialize(&synthesized.data_uri, self.catalog.http()).map_err(|err| {
            GenerationError::Synthesis {
                last_error: error_chain_text(&err, 1024),
            }
        })?;
        tracker.within(Stage::Conversion, 1.0);

        if request.remove_background {
            tracker.enter(Stage::BackgroundRemoval);
            tracing::info!(remover = self.remover.name(), "removing background");
            bytes = self
                .remover
                .remove_background(&bytes, &mut |fraction| {
                    tracker.within(Stage::BackgroundRemoval, fraction)
                })
                .map_err(GenerationError::PostProcessing)?;
        }

        tracker.enter(Stage::Upload);
        let image_url = self.upload_pose(&character, request.genre, &bytes)?;

        tracker.enter(Stage::Persistence);
        let pose = self
            .catalog
            .backend()
            .store
            .insert_pose(&NewPose {
                character_id: character.id.clone(),
                name: request.genre.pose_name(),
                genre: Some(request.genre),
                image_url,
                has_background_removed: request.remove_background,
            })
            .map_err(GenerationError::Persistence)?;
        tracker.finish();
        Ok(pose)
    }

    fn upload_pose(
        &self,
        character: &Character,
        genre: Genre,
        bytes: &[u8],
    ) -> Result<String, GenerationError> {
        let storage = &self.catalog.backend().storage;
        let path = pose_object_path(&character.name, genre, Utc::now().timestamp_millis());
        storage
            .upload(POSE_BUCKET, &path, bytes, "image/png", true)
            .map_err(GenerationError::Storage)?;
        Ok(storage.public_url(POSE_BUCKET, &path))
    }
}

/// Forwards progress to the caller and, as `generation_progress`, to the event log.
struct Fanout<'a, 'e> {
    caller: &'a mut dyn ProgressSink,
    events: Option<&'e EventWriter>,
}

impl ProgressSink for Fanout<'_, '_> {
    fn report(&mut self, update: &ProgressUpdate) {
        self.caller.report(update);
        if self.events.is_none() {
            return;
        }
        let payload = match serde_json::to_value(update) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => EventPayload::new(),
            Err(err) => {
                tracing::warn!(error = %err, "progress update not serializable");
                return;
            }
        };
        emit(self.events, "generation_progress", payload);
    }
}

fn emit(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.emit(event_type, payload) {
        tracing::warn!(event = event_type, error = %format!("{err:#}"), "event write failed");
    }
}
