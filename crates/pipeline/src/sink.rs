//! Output sinks for finalized physical events.

use std::io::Write;

use recon_core::{PhysicalEvent, SinkError};

/// Consumer of finalized physical events. Events may arrive in any
/// order across workers; the footer arrives once at stream close.
pub trait EventSink {
    fn emit(&mut self, event: PhysicalEvent) -> Result<(), SinkError>;

    /// Free-text provenance block (configuration dump, run statistics).
    fn footer(&mut self, text: &str) -> Result<(), SinkError> {
        let _ = text;
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<PhysicalEvent>,
    pub footer: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: PhysicalEvent) -> Result<(), SinkError> {
        self.events.push(event);
        Ok(())
    }

    fn footer(&mut self, text: &str) -> Result<(), SinkError> {
        self.footer = Some(text.to_string());
        Ok(())
    }
}

/// JSON-lines sink over any writer; the footer goes out as `#`-prefixed
/// comment lines.
pub struct JsonlSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        JsonlSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonlSink<W> {
    fn emit(&mut self, event: PhysicalEvent) -> Result<(), SinkError> {
        let line =
            serde_json::to_string(&event).map_err(|e| SinkError::Write(e.to_string()))?;
        writeln!(self.writer, "{line}").map_err(|e| SinkError::Write(e.to_string()))
    }

    fn footer(&mut self, text: &str) -> Result<(), SinkError> {
        for line in text.lines() {
            writeln!(self.writer, "# {line}").map_err(|e| SinkError::Write(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::PhysicalEventKind;

    #[test]
    fn test_jsonl_sink_writes_one_line_per_event() {
        let mut sink = JsonlSink::new(Vec::new());
        sink.emit(PhysicalEvent {
            event_id: 1,
            time: 0.5,
            kind: PhysicalEventKind::Photo {
                position: nalgebra::Vector3::new(0.0, 0.0, -1.0),
                energy: 662.0,
            },
        })
        .unwrap();
        sink.footer("run done").unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"photo\""));
        assert!(lines[1].starts_with("# run done"));
    }
}
