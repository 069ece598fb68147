//! Crash-safe persisted JSON state, session-scoped or legacy-scoped.
//!
//! Each mode owns two addressable slots under `{dir}/state/`: a legacy slot
//! keyed by mode only (`{mode}.json`) and a session slot keyed by mode and
//! session id (`{mode}.{session}.json`). Payloads are wrapped in a `_meta`
//! envelope on disk; readers strip it and tolerate pre-envelope files.
//!
//! These are leaf utilities: recoverable failures are reported as `false` /
//! `None`, never as errors, so callers can treat missing state as absent.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

const META_KEY: &str = "_meta";
const OWNER_KEY: &str = "session_id";

/// Resolve the on-disk slot for `(mode, session)`.
pub fn state_path(dir: &Path, mode: &str, session: Option<&str>) -> PathBuf {
    let file = match session {
        Some(session) => format!("{mode}.{session}.json"),
        None => format!("{mode}.json"),
    };
    dir.join("state").join(file)
}

/// Atomically persist `state` for `(mode, session)`.
///
/// The payload is wrapped in `{ ..., "_meta": { written_at, mode } }`, written
/// to a temp file, then renamed over the target, so a reader can never
/// observe a partial file. Returns `false` on any failure.
pub fn write_state<T: Serialize>(dir: &Path, mode: &str, state: &T, session: Option<&str>) -> bool {
    if !valid_component(mode) || !session.map_or(true, valid_component) {
        warn!(mode, ?session, "refusing state write with path-unsafe name");
        return false;
    }
    let path = state_path(dir, mode, session);
    let payload = match serde_json::to_value(state) {
        Ok(value) => value,
        Err(err) => {
            warn!(mode, err = %err, "state not serializable");
            return false;
        }
    };
    let enveloped = envelope(payload, mode);

    let Some(parent) = path.parent() else {
        return false;
    };
    if let Err(err) = fs::create_dir_all(parent) {
        warn!(dir = %parent.display(), err = %err, "create state directory failed");
        return false;
    }

    let mut buf = match serde_json::to_string_pretty(&enveloped) {
        Ok(buf) => buf,
        Err(err) => {
            warn!(mode, err = %err, "serialize state failed");
            return false;
        }
    };
    buf.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    if let Err(err) = fs::write(&tmp_path, &buf) {
        warn!(path = %tmp_path.display(), err = %err, "write temp state failed");
        return false;
    }
    if let Err(err) = fs::rename(&tmp_path, &path) {
        warn!(path = %path.display(), err = %err, "replace state failed");
        return false;
    }
    debug!(mode, ?session, path = %path.display(), "state written");
    true
}

/// Read the state for `(mode, session)`, stripping the `_meta` envelope.
///
/// When `session` is given, only the session slot is consulted; there is no
/// fallback to the legacy slot, so a fresh session can never observe stale
/// cross-session state. Missing or unparseable files yield `None`.
pub fn read_state(dir: &Path, mode: &str, session: Option<&str>) -> Option<Value> {
    let path = state_path(dir, mode, session);
    let contents = fs::read_to_string(&path).ok()?;
    let mut value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unparseable state file");
            return None;
        }
    };
    if let Some(object) = value.as_object_mut() {
        // Pre-envelope files have no _meta key and pass through unchanged.
        object.remove(META_KEY);
    }
    Some(value)
}

/// Delete the state slot for `(mode, session)`.
///
/// When `session` is given, additionally performs ghost-legacy cleanup: a
/// legacy file for the same mode is removed only if it is unowned (no
/// `session_id` field) or owned by this same session. A legacy file owned by
/// a different session must survive untouched. Returns `false` only when a
/// deletion that should have happened failed.
pub fn clear_state(dir: &Path, mode: &str, session: Option<&str>) -> bool {
    let path = state_path(dir, mode, session);
    let mut ok = remove_if_present(&path);

    if let Some(session) = session {
        let legacy_path = state_path(dir, mode, None);
        if legacy_owner_allows_cleanup(&legacy_path, session) {
            ok &= remove_if_present(&legacy_path);
        }
    }
    ok
}

fn envelope(payload: Value, mode: &str) -> Value {
    let meta = serde_json::json!({
        "written_at": Utc::now().to_rfc3339(),
        "mode": mode,
    });
    match payload {
        Value::Object(mut object) => {
            object.insert(META_KEY.to_string(), meta);
            Value::Object(object)
        }
        // Non-object payloads cannot carry the envelope; readers tolerate
        // its absence.
        other => other,
    }
}

fn legacy_owner_allows_cleanup(legacy_path: &Path, session: &str) -> bool {
    let contents = match fs::read_to_string(legacy_path) {
        Ok(contents) => contents,
        Err(_) => return false,
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(value) => match value.get(OWNER_KEY).and_then(Value::as_str) {
            Some(owner) => owner == session,
            None => true,
        },
        // An unparseable legacy file is a ghost with no provable owner.
        Err(_) => true,
    }
}

fn remove_if_present(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "state file removed");
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "remove state file failed");
            false
        }
    }
}

fn valid_component(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\', '.'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_read_strips_meta() {
        let temp = tempfile::tempdir().expect("tempdir");
        let payload = json!({ "cursor": 7, "notes": ["a", "b"] });

        assert!(write_state(temp.path(), "team-pipeline", &payload, None));
        let loaded = read_state(temp.path(), "team-pipeline", None).expect("state");
        assert_eq!(loaded, payload);

        let raw = fs::read_to_string(state_path(temp.path(), "team-pipeline", None))
            .expect("read raw");
        let on_disk: Value = serde_json::from_str(&raw).expect("parse raw");
        assert_eq!(on_disk[META_KEY]["mode"], "team-pipeline");
        assert!(on_disk[META_KEY]["written_at"].is_string());
    }

    #[test]
    fn session_read_never_falls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write_state(temp.path(), "plan", &json!({"legacy": true}), None));
        assert!(write_state(
            temp.path(),
            "plan",
            &json!({"other": true}),
            Some("session-b")
        ));

        assert!(read_state(temp.path(), "plan", Some("session-a")).is_none());
        let legacy = read_state(temp.path(), "plan", None).expect("legacy");
        assert_eq!(legacy, json!({"legacy": true}));
    }

    #[test]
    fn pre_envelope_files_pass_through_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path(), "plan", None);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, r#"{"old":"format"}"#).expect("write");

        let loaded = read_state(temp.path(), "plan", None).expect("state");
        assert_eq!(loaded, json!({"old": "format"}));
    }

    #[test]
    fn unparseable_file_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path(), "plan", None);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");

        assert!(read_state(temp.path(), "plan", None).is_none());
    }

    #[test]
    fn stray_temp_file_is_overwritten_by_next_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path(), "plan", None);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path.with_extension("json.tmp"), "{partial").expect("write temp");

        assert!(write_state(temp.path(), "plan", &json!({"v": 1}), None));
        assert_eq!(
            read_state(temp.path(), "plan", None).expect("state"),
            json!({"v": 1})
        );
    }

    #[test]
    fn clear_deletes_session_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write_state(
            temp.path(),
            "plan",
            &json!({"v": 1}),
            Some("s1")
        ));
        assert!(clear_state(temp.path(), "plan", Some("s1")));
        assert!(read_state(temp.path(), "plan", Some("s1")).is_none());
    }

    #[test]
    fn clear_reaps_unowned_legacy_ghost() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write_state(temp.path(), "plan", &json!({"v": 1}), None));
        assert!(write_state(
            temp.path(),
            "plan",
            &json!({"v": 2}),
            Some("s1")
        ));

        assert!(clear_state(temp.path(), "plan", Some("s1")));
        assert!(read_state(temp.path(), "plan", None).is_none());
    }

    #[test]
    fn clear_reaps_legacy_owned_by_same_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write_state(
            temp.path(),
            "plan",
            &json!({"v": 1, "session_id": "s1"}),
            None
        ));

        assert!(clear_state(temp.path(), "plan", Some("s1")));
        assert!(read_state(temp.path(), "plan", None).is_none());
    }

    /// A legacy file owned by a different session must survive a clear.
    #[test]
    fn clear_preserves_legacy_owned_by_other_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(write_state(
            temp.path(),
            "plan",
            &json!({"v": 1, "session_id": "other"}),
            None
        ));

        assert!(clear_state(temp.path(), "plan", Some("s1")));
        let legacy = read_state(temp.path(), "plan", None).expect("legacy survives");
        assert_eq!(legacy["session_id"], "other");
    }

    #[test]
    fn clear_of_missing_files_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(clear_state(temp.path(), "plan", Some("s1")));
        assert!(clear_state(temp.path(), "plan", None));
    }

    #[test]
    fn path_unsafe_mode_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!write_state(temp.path(), "../evil", &json!({}), None));
        assert!(!write_state(temp.path(), "plan", &json!({}), Some("a/b")));
    }
}
