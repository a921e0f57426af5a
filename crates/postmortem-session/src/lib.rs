//! Session namespaces, storage paths and file helpers

mod io;
mod paths;
mod session;
mod tokens;

pub use io::{append_jsonl, atomic_write, read_json, read_jsonl, write_json};
pub use paths::{Paths, HOME_ENV};
pub use session::{
    session_id, RetentionPolicy, Session, SessionError, SessionInfo, SessionManager,
    SessionMetadata,
};
pub use tokens::{estimate_tokens, truncate_to_tokens};
