#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::edge::EdgeService;
use crate::error::{Error, Result};

pub const F1_FEATURE: &str = r#"{
    "id": "f1-id",
    "key": "f1",
    "type": "BOOLEAN",
    "value": false,
    "version": 1,
    "l": false,
    "strategies": []
}"#;

pub const F2_FEATURE: &str = r#"{
    "id": "f2-id",
    "key": "f2",
    "type": "STRING",
    "value": "base",
    "version": 1,
    "strategies": [
        {"id": "sA", "name": "A", "percentage": 300000, "value": "A-value"},
        {"id": "sB", "name": "B", "percentage": 700000, "value": "B-value"}
    ]
}"#;

/// Same as f2, but the slices only cover 90% of the range.
pub const F2_GAP_FEATURE: &str = r#"{
    "id": "f2-id",
    "key": "f2",
    "type": "STRING",
    "value": "base",
    "version": 1,
    "strategies": [
        {"id": "sA", "name": "A", "percentage": 300000, "value": "A-value"},
        {"id": "sB", "name": "B", "percentage": 600000, "value": "B-value"}
    ]
}"#;

pub const F3_FEATURE: &str = r#"{
    "id": "f3-id",
    "key": "f3",
    "type": "STRING",
    "value": "base",
    "version": 1,
    "strategies": [{
        "id": "sNZ",
        "name": "kiwis",
        "value": "kiwi",
        "attributes": [{
            "conditional": "EQUALS",
            "fieldName": "country",
            "type": "STRING",
            "values": ["NZ"]
        }]
    }]
}"#;

pub fn feature(json: &str) -> crate::FeatureDefinition {
    serde_json::from_str(json).expect("fixture should parse")
}

/// Builds a definition from a fixture with a different version and value.
pub fn feature_at(json: &str, version: i64, value: serde_json::Value) -> crate::FeatureDefinition {
    let mut def = feature(json);
    def.version = version;
    def.value = Some(value);
    def
}

/// Waits for `f` to become true, polling briefly. Listener dispatch is asynchronous.
pub fn eventually<F: Fn() -> bool>(f: F) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

/// Collects values sent from listener callbacks on worker threads.
pub struct Recorder<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Recorder<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Recorder { tx, rx }
    }

    pub fn record(&self, value: T) {
        let _ = self.tx.send(value);
    }

    /// Returns everything recorded within a short settling window.
    pub fn settle(&self) -> Vec<T> {
        let mut seen = Vec::new();
        while let Ok(v) = self.rx.recv_timeout(Duration::from_millis(100)) {
            seen.push(v);
        }
        seen
    }
}

/// An edge connection that remembers every header it was told about.
pub struct RecordingEdge {
    pub headers: Mutex<Vec<Option<String>>>,
    pub replace_on_change: bool,
    pub fail: bool,
    pub closes: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingEdge {
    pub fn new() -> Self {
        RecordingEdge {
            headers: Mutex::new(Vec::new()),
            replace_on_change: false,
            fail: false,
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EdgeService for RecordingEdge {
    fn context_change(&self, header: Option<&str>) -> Result<()> {
        self.headers.lock().push(header.map(str::to_owned));
        if self.fail {
            return Err(Error::Edge("connection refused".into()));
        }
        Ok(())
    }

    fn requires_replacement_on_header_change(&self) -> bool {
        self.replace_on_change
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
