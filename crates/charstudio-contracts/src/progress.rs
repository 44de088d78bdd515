//! Single 0-100 progress signal spanning the generation stages.
//!
//! Each stage owns a fixed slice of the bar. Stages with their own internal
//! progress (background removal) report a fraction that is scaled into the
//! slice. Reported values never go backwards.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Synthesis,
    Conversion,
    BackgroundRemoval,
    Upload,
    Persistence,
    Done,
}

impl Stage {
    /// Start and end percentage of the stage's slice.
    pub fn range(&self) -> (f64, f64) {
        match self {
            Stage::Synthesis => (0.0, 40.0),
            Stage::Conversion => (40.0, 55.0),
            Stage::BackgroundRemoval => (55.0, 80.0),
            Stage::Upload => (80.0, 90.0),
            Stage::Persistence => (90.0, 100.0),
            Stage::Done => (100.0, 100.0),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Synthesis => "Generating image with AI...",
            Stage::Conversion => "Processing image...",
            Stage::BackgroundRemoval => "Removing background (30-60 seconds)...",
            Stage::Upload => "Uploading to cloud storage...",
            Stage::Persistence => "Saving to database...",
            Stage::Done => "Done!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub percent: f64,
    pub message: String,
}

pub trait ProgressSink {
    fn report(&mut self, update: &ProgressUpdate);
}

impl ProgressSink for Vec<ProgressUpdate> {
    fn report(&mut self, update: &ProgressUpdate) {
        self.push(update.clone());
    }
}

/// Maps stage-local progress onto the overall bar and forwards it to a sink.
pub struct ProgressTracker<'a> {
    sink: &'a mut dyn ProgressSink,
    last_percent: f64,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            sink,
            last_percent: 0.0,
        }
    }

    /// Report the start of `stage`.
    pub fn enter(&mut self, stage: Stage) {
        self.within(stage, 0.0);
    }

    /// Report `fraction` (0-1) of the way through `stage`.
    pub fn within(&mut self, stage: Stage, fraction: f64) {
        let (start, end) = stage.range();
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.emit(stage, start + (end - start) * fraction);
    }

    pub fn finish(&mut self) {
        self.enter(Stage::Done);
    }

    fn emit(&mut self, stage: Stage, percent: f64) {
        let percent = percent.max(self.last_percent);
        self.last_percent = percent;
        self.sink.report(&ProgressUpdate {
            stage,
            percent,
            message: stage.label().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{ProgressTracker, ProgressUpdate, Stage};

    #[test]
    fn tracker_scales_fraction_into_stage_slice() {
        let mut updates: Vec<ProgressUpdate> = Vec::new();
        {
            let mut tracker = ProgressTracker::new(&mut updates);
            tracker.enter(Stage::BackgroundRemoval);
            tracker.within(Stage::BackgroundRemoval, 0.5);
            tracker.within(Stage::BackgroundRemoval, 1.0);
        }
        let percents: Vec<f64> = updates.iter().map(|update| update.percent).collect();
        assert_eq!(percents, vec![55.0, 67.5, 80.0]);
        assert_eq!(updates[0].message, "Removing background (30-60 seconds)...");
    }

    #[test]
    fn tracker_never_reports_backwards() {
        let mut updates: Vec<ProgressUpdate> = Vec::new();
        {
            let mut tracker = ProgressTracker::new(&mut updates);
            tracker.within(Stage::BackgroundRemoval, 0.8);
            tracker.within(Stage::BackgroundRemoval, 0.2);
            tracker.enter(Stage::Conversion);
            tracker.within(Stage::BackgroundRemoval, f64::NAN);
            tracker.finish();
        }
        let percents: Vec<f64> = updates.iter().map(|update| update.percent).collect();
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(percents.last().copied(), Some(100.0));
        assert_eq!(updates.last().map(|update| update.stage), Some(Stage::Done));
    }
}
