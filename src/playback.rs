//! Speech sinks and a local playback engine
//!
//! The dispatcher only ever publishes text. Where that text goes decides who
//! reports markers back:
//! - `JsonLinesSink` writes it out for an external engine, which reports
//!   bookmarks over the transport
//! - `LocalPlayback` voices it in-process and reports markers itself

use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::{PlaybackConfig, PlaybackEngineConfig};
use crate::marker::{MarkerFormat, MarkerId, Segment};
use crate::transport::Outbound;

/// Accepts one utterance per mixed group, fire-and-forget
pub trait SpeechSink: Send + Sync {
    fn publish(&self, text: &str);
}

impl<F> SpeechSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn publish(&self, text: &str) {
        self(text)
    }
}

// ============================================================================
// JSON lines sink
// ============================================================================

/// Writes each utterance as an outbound speech message, one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> SpeechSink for JsonLinesSink<W> {
    fn publish(&self, text: &str) {
        let line = match Outbound::speech(text).to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("failed to encode speech message: {}", e);
                return;
            }
        };

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            error!("failed to write speech message: {}", e);
        }
    }
}

// ============================================================================
// Local playback engine
// ============================================================================

/// How the local engine voices a run of text between markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Voice {
    /// Spend a fixed time per word
    Paced { word: Duration },
    /// Run a TTS program with the text appended as its last argument
    Program { argv: Vec<String> },
}

impl Voice {
    /// Voice for the configured engine, `None` when playback is external
    pub fn from_config(config: &PlaybackConfig) -> Option<Self> {
        match config.engine {
            PlaybackEngineConfig::Stdout => None,
            PlaybackEngineConfig::Paced => Some(Voice::Paced {
                word: Duration::from_millis(config.word_ms),
            }),
            PlaybackEngineConfig::Program => Some(Voice::Program {
                argv: config.program.clone(),
            }),
        }
    }

    fn speak(&self, text: &str) {
        match self {
            Voice::Paced { word } => {
                let words = text.split_whitespace().count() as u32;
                debug!(text, "speaking");
                thread::sleep(*word * words);
            }
            Voice::Program { argv } => {
                let Some((program, args)) = argv.split_first() else {
                    return;
                };
                let status = Command::new(program)
                    .args(args)
                    .arg(text)
                    .stdin(Stdio::null())
                    .stdout(io::stderr())
                    .status();
                match status {
                    Ok(s) if s.success() => {}
                    Ok(s) => warn!(%program, code = ?s.code(), "speech program exited unsuccessfully"),
                    Err(e) => warn!(%program, "failed to run speech program: {}", e),
                }
            }
        }
    }
}

/// In-process playback engine
///
/// Utterances play in the order published, one at a time, on a worker
/// thread. After voicing the text before a marker the engine sends that
/// marker id to `markers`, the same channel an external engine's bookmark
/// reports go to.
pub struct LocalPlayback {
    queue: flume::Sender<String>,
}

impl LocalPlayback {
    pub fn spawn(
        voice: Voice,
        format: MarkerFormat,
        markers: flume::Sender<MarkerId>,
    ) -> io::Result<Self> {
        let (queue, utterances) = flume::unbounded::<String>();

        thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                for text in utterances.iter() {
                    for segment in format.split(&text) {
                        match segment {
                            Segment::Text(run) => {
                                let run = run.trim();
                                if !run.is_empty() {
                                    voice.speak(run);
                                }
                            }
                            Segment::Marker(id) => {
                                debug!(marker = id, "playback reached marker");
                                if markers.send(id).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            })?;

        Ok(Self { queue })
    }
}

impl SpeechSink for LocalPlayback {
    fn publish(&self, text: &str) {
        if self.queue.send(text.to_string()).is_err() {
            warn!("playback engine has stopped, dropping speech");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_json_lines_sink() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.publish("hello \\mrk=50\\");
        sink.publish("world");

        let written = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "speech");
        assert_eq!(lines[0]["text"], "hello \\mrk=50\\");
        assert_eq!(lines[1]["text"], "world");
        assert!(lines[1]["at"].is_string());
    }

    #[test]
    fn test_voice_from_config() {
        let mut config = PlaybackConfig::default();
        assert_eq!(Voice::from_config(&config), None);

        config.engine = PlaybackEngineConfig::Paced;
        config.word_ms = 5;
        assert_eq!(
            Voice::from_config(&config),
            Some(Voice::Paced {
                word: Duration::from_millis(5)
            })
        );

        config.engine = PlaybackEngineConfig::Program;
        assert_eq!(
            Voice::from_config(&config),
            Some(Voice::Program {
                argv: vec!["espeak-ng".to_string()]
            })
        );
    }

    #[test]
    fn test_local_playback_reports_markers_in_order() {
        let (tx, rx) = flume::unbounded();
        let playback = LocalPlayback::spawn(
            Voice::Paced {
                word: Duration::from_millis(1),
            },
            MarkerFormat::new("\\mrk={id}\\").unwrap(),
            tx,
        )
        .unwrap();

        playback.publish("one \\mrk=50\\ two three \\mrk=51\\");
        playback.publish("\\mrk=52\\ four");

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 50);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 51);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 52);
    }
}
