//! JSON Lines event logs for offline replay.
//!
//! One record per line:
//!
//! ```text
//! {"op":"add","object":{...}}      initial listing entry, or a live create
//! {"op":"sync"}                    end of the initial listing
//! {"op":"update","object":{...}}
//! {"op":"delete","object":{"metadata":{"name":"x","namespace":"y"}}}
//! {"op":"fault","message":"connection reset"}
//! {"op":"pause","millis":250}
//! ```
//!
//! Records before `sync` form the initial listing; a log without `sync`
//! is all listing. Blank lines and lines starting with `#` are skipped.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rollwatch_core::{ResourceIdentity, ResourceSnapshot, SubEntityLayout};
use serde::{Deserialize, Serialize};

use crate::ScriptStep;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum LogRecord {
    Add { object: serde_json::Value },
    Update { object: serde_json::Value },
    Delete { object: serde_json::Value },
    Sync,
    Fault { message: String },
    Pause { millis: u64 },
}

/// A parsed log: what the source lists first and what it plays after sync.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub initial: Vec<ResourceSnapshot>,
    pub live: Vec<ScriptStep>,
}

pub fn parse_line(line: &str) -> Result<Option<LogRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

pub fn parse(text: &str, layout: &SubEntityLayout) -> Result<Script> {
    let mut script = Script::default();
    let mut synced = false;
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let Some(rec) = parse_line(line).with_context(|| format!("line {lineno}"))? else {
            continue;
        };
        let snapshot = |object: &serde_json::Value| {
            layout.build_snapshot(object).map_err(|e| anyhow!("line {lineno}: {e}"))
        };
        match (rec, synced) {
            (LogRecord::Sync, true) => bail!("line {lineno}: duplicate sync record"),
            (LogRecord::Sync, false) => synced = true,
            (LogRecord::Add { object }, false) => script.initial.push(snapshot(&object)?),
            (LogRecord::Add { object } | LogRecord::Update { object }, true) => {
                script.live.push(ScriptStep::Apply(snapshot(&object)?))
            }
            (LogRecord::Delete { object }, true) => {
                let id = ResourceIdentity::from_object(&object)
                    .ok_or_else(|| anyhow!("line {lineno}: delete without metadata.name"))?;
                script.live.push(ScriptStep::Delete(id));
            }
            (LogRecord::Fault { message }, true) => script.live.push(ScriptStep::Fault(message)),
            (LogRecord::Pause { millis }, true) => script.live.push(ScriptStep::Pause(Duration::from_millis(millis))),
            (LogRecord::Update { .. }, false) => bail!("line {lineno}: update before sync"),
            (_, false) => bail!("line {lineno}: only add records may precede sync"),
        }
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"
# initial listing
{"op":"add","object":{"metadata":{"name":"web","namespace":"demo"},"spec":{"template":{"spec":{"containers":[{"name":"app","image":"nginx:1"}]}}}}}
{"op":"sync"}
{"op":"update","object":{"metadata":{"name":"web","namespace":"demo"},"spec":{"template":{"spec":{"containers":[{"name":"app","image":"nginx:2"}]}}}}}
{"op":"fault","message":"watch closed"}
{"op":"pause","millis":5}
{"op":"delete","object":{"metadata":{"name":"web","namespace":"demo"}}}
"#;

    #[test]
    fn parses_listing_and_live_steps() {
        let script = parse(LOG, &SubEntityLayout::default()).unwrap();
        assert_eq!(script.initial.len(), 1);
        assert_eq!(script.initial[0].sub_entity("app").unwrap().field("image"), Some("nginx:1"));
        assert_eq!(script.live.len(), 4);
        assert!(matches!(&script.live[0], ScriptStep::Apply(s) if s.sub_entity("app").unwrap().field("image") == Some("nginx:2")));
        assert!(matches!(&script.live[1], ScriptStep::Fault(m) if m == "watch closed"));
        assert!(matches!(script.live[2], ScriptStep::Pause(d) if d == Duration::from_millis(5)));
        assert!(matches!(&script.live[3], ScriptStep::Delete(id) if id.name == "web"));
    }

    #[test]
    fn log_without_sync_is_all_listing() {
        let text = r#"{"op":"add","object":{"metadata":{"name":"a"}}}
{"op":"add","object":{"metadata":{"name":"b"}}}"#;
        let script = parse(text, &SubEntityLayout::default()).unwrap();
        assert_eq!(script.initial.len(), 2);
        assert!(script.live.is_empty());
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse("{\"op\":\"delete\",\"object\":{}}", &SubEntityLayout::default()).unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");
        let err = parse("{\"op\":\"sync\"}\nnot json", &SubEntityLayout::default()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"), "{err:#}");
        let err = parse("{\"op\":\"sync\"}\n{\"op\":\"sync\"}", &SubEntityLayout::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate sync"));
    }
}
