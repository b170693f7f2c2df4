//! Raw frame recorder
//!
//! Appends every frame exchanged with the agent to a JSONL file as
//! `{"dir":"in"|"out","ts":...,"frame":...}`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use agentlink_core::FrameObserver;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

pub struct FrameRecorder {
    file: Mutex<BufWriter<File>>,
}

impl FrameRecorder {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn record(&self, dir: &str, frame: &str) {
        // Keep unparseable frames verbatim
        let frame = serde_json::from_str::<Value>(frame).unwrap_or_else(|_| Value::String(frame.to_string()));
        let entry = json!({
            "dir": dir,
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "frame": frame,
        });

        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
            warn!("Failed to record frame: {}", e);
        }
    }
}

impl FrameObserver for FrameRecorder {
    fn incoming(&self, frame: &str) {
        self.record("in", frame);
    }

    fn outgoing(&self, frame: &str) {
        self.record("out", frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_records_both_directions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames").join("session.jsonl");
        let recorder = FrameRecorder::create(&path).unwrap();

        recorder.outgoing(r#"{"id":1,"method":"initialize","params":{}}"#);
        recorder.incoming(r#"{"id":1,"result":{}}"#);
        recorder.incoming("not json");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["dir"], "out");
        assert_eq!(lines[0]["frame"]["method"], "initialize");
        assert_eq!(lines[1]["dir"], "in");
        assert_eq!(lines[2]["frame"], "not json");
        assert!(lines[0]["ts"].as_str().unwrap().ends_with('Z'));
    }
}
