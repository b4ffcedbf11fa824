//! Speech with embedded commands, launched when playback reaches them
//!
//! A message such as `hello !rping_8.8.8.8 world` is split into groups of
//! speech and commands. Each command gets a marker id that is written into
//! the speech text; the playback engine reports the id back when its voice
//! gets there, and the command is launched at that moment. Blocking commands
//! (`!r...`) hold back the rest of the message until they finish.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod group;
pub mod marker;
pub mod parser;
pub mod playback;
pub mod transport;
pub mod unit;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{CueError, Result};
pub use group::Group;
pub use marker::{MarkerFormat, MarkerId, MarkerRegistry};
pub use parser::{CommandParser, CommandSyntax};
pub use playback::{JsonLinesSink, LocalPlayback, SpeechSink, Voice};
pub use transport::{Inbound, Outbound};
pub use unit::{ExecutionUnit, Outcome, ProcessRunner, SystemRunner, UnitState};
