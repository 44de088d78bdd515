pub mod error;
pub mod events;
pub mod models;
pub mod progress;
pub mod prompt;
pub mod records;
pub mod session;

pub use error::GenerationError;
pub use records::{Character, CharacterUpdate, Genre, NewCharacter, NewPose, Pose};
pub use session::{Session, User};
