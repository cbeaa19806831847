//! Prefixed, monotonic ULID identifiers
//!
//! Every persistent entity is keyed by a ULID carrying a short type prefix
//! (`wrun_01J...`). ULIDs are time-prefixed, so lexicographic order is
//! compatible with creation order, which is what the pagination cursors and
//! the stream reader rely on. A process-wide monotonic generator guarantees
//! that two ids minted in the same millisecond still sort in mint order.

use std::sync::{LazyLock, Mutex};

use ulid::{Generator, Ulid};

/// Id prefix for workflow runs
pub const RUN_PREFIX: &str = "wrun_";
/// Id prefix for steps
pub const STEP_PREFIX: &str = "wstp_";
/// Id prefix for events
pub const EVENT_PREFIX: &str = "wevt_";
/// Id prefix for hooks
pub const HOOK_PREFIX: &str = "whook_";
/// Id prefix for stream chunks
pub const CHUNK_PREFIX: &str = "chnk_";
/// Id prefix for queued messages
pub const MESSAGE_PREFIX: &str = "msg_";

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

fn mint(prefix: &str) -> String {
    let ulid = {
        let mut gen = GENERATOR.lock().unwrap();
        // The generator only errors when the random component overflows
        // within a single millisecond; a fresh ULID keeps ids flowing.
        gen.generate().unwrap_or_else(|_| Ulid::new())
    };
    format!("{prefix}{ulid}")
}

/// Mint a run id (`wrun_<ulid>`)
pub fn new_run_id() -> String {
    mint(RUN_PREFIX)
}

/// Mint a step id (`wstp_<ulid>`)
pub fn new_step_id() -> String {
    mint(STEP_PREFIX)
}

/// Mint an event id (`wevt_<ulid>`)
pub fn new_event_id() -> String {
    mint(EVENT_PREFIX)
}

/// Mint a hook id (`whook_<ulid>`)
pub fn new_hook_id() -> String {
    mint(HOOK_PREFIX)
}

/// Mint a stream chunk id (`chnk_<ulid>`)
pub fn new_chunk_id() -> String {
    mint(CHUNK_PREFIX)
}

/// Mint a queue message id (`msg_<ulid>`)
pub fn new_message_id() -> String {
    mint(MESSAGE_PREFIX)
}
