//! File sink: append messages to a file or stdout, one frame per line.
//!
//! There is no consumer on the other end, so every message confirms as
//! soon as it is written (`auto_confirm`). Binary messages get the 4-byte
//! length prefix instead of a newline.

use super::sink::{ClientRequest, ServerResponse, Sink};
use crate::builder::OutputMessage;
use crate::error::{RedoError, Result};
use crate::format::OutputKind;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub struct FileSink {
    out: Box<dyn Write + Send>,
    kind: OutputKind,
}

impl FileSink {
    pub fn create(path: Option<&Path>, kind: OutputKind) -> Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        RedoError::config(10021, format!("output file {}: {e}", path.display()))
                    })?;
                tracing::info!(file = %path.display(), "file sink open");
                Box::new(file)
            }
            None => Box::new(std::io::stdout()),
        };
        Ok(FileSink { out, kind })
    }
}

impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn poll(&mut self) -> Result<Option<ClientRequest>> {
        Ok(None)
    }

    fn send(&mut self, msg: &OutputMessage) -> Result<()> {
        match self.kind {
            OutputKind::Json => {
                self.out.write_all(&msg.data)?;
                self.out.write_all(b"\n")?;
            }
            OutputKind::Binary => {
                self.out.write_all(&(msg.data.len() as u32).to_be_bytes())?;
                self.out.write_all(&msg.data)?;
            }
        }
        self.out.flush()?;
        metrics::counter!("redoflow_writer_messages_sent_total").increment(1);
        Ok(())
    }

    fn respond(&mut self, _resp: &ServerResponse) -> Result<()> {
        Ok(())
    }

    fn auto_confirm(&self) -> bool {
        true
    }

    fn connected(&self) -> bool {
        true
    }
}
