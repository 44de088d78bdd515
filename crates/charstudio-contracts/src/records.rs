use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pose style tag. Stored lower-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Genre {
    Action,
    Standing,
    Running,
    Combat,
    Stealth,
    Cinematic,
}

impl Genre {
    pub const ALL: [Genre; 6] = [
        Genre::Action,
        Genre::Standing,
        Genre::Running,
        Genre::Combat,
        Genre::Stealth,
        Genre::Cinematic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Genre::Action => "action",
            Genre::Standing => "standing",
            Genre::Running => "running",
            Genre::Combat => "combat",
            Genre::Stealth => "stealth",
            Genre::Cinematic => "cinematic",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Genre::Action => "Action",
            Genre::Standing => "Standing",
            Genre::Running => "Running",
            Genre::Combat => "Combat",
            Genre::Stealth => "Stealth",
            Genre::Cinematic => "Cinematic",
        }
    }

    /// Display name given to poses of this genre, e.g. "Action Pose".
    pub fn pose_name(&self) -> String {
        format!("{} Pose", self.label())
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Genre {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Genre::ALL
            .iter()
            .copied()
            .find(|genre| genre.as_str() == normalized)
            .ok_or_else(|| {
                let known = Genre::ALL
                    .iter()
                    .map(Genre::as_str)
                    .collect::<Vec<&str>>()
                    .join(", ");
                format!("Unknown genre '{}' (expected one of: {known}).", raw.trim())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: String,
    pub reference_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub id: String,
    pub character_id: String,
    pub name: String,
    pub genre: Option<Genre>,
    pub image_url: String,
    #[serde(default)]
    pub has_background_removed: bool,
    pub created_at: DateTime<Utc>,
    /// Owning character, present when the row was selected with a join.
    #[serde(
        rename = "characters",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub character: Option<Character>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCharacter {
    pub name: String,
    pub user_id: String,
    pub reference_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterUpdate {
    pub name: String,
    pub reference_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPose {
    pub character_id: String,
    pub name: String,
    pub genre: Option<Genre>,
    pub image_url: String,
    pub has_background_removed: bool,
}
