// Shared types for the world-sql storage substrate

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Result, WorldError};
pub use ids::{
    new_chunk_id, new_event_id, new_hook_id, new_message_id, new_run_id, new_step_id,
};
pub use types::*;
