//! A group is one unit of control flow: speech with embedded markers, or a run of commands

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::marker::MarkerRegistry;
use crate::playback::SpeechSink;
use crate::unit::ExecutionUnit;

#[derive(Debug, Default)]
pub struct Group {
    text_chunks: Vec<String>,
    units: Vec<Arc<ExecutionUnit>>,
}

impl Group {
    pub fn push_text(&mut self, word: &str) {
        self.text_chunks.push(word.to_string());
    }

    /// Append a unit and its marker placeholder
    pub fn push_unit(&mut self, unit: Arc<ExecutionUnit>) {
        self.text_chunks.push(unit.marker().to_string());
        self.units.push(unit);
    }

    pub fn text_chunks(&self) -> &[String] {
        &self.text_chunks
    }

    pub fn units(&self) -> &[Arc<ExecutionUnit>] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.text_chunks.is_empty()
    }

    /// Every chunk is a marker, there is nothing to say
    pub fn is_pure_command(&self) -> bool {
        self.text_chunks.len() == self.units.len()
    }

    /// The speech text handed to the playback engine
    pub fn utterance(&self) -> String {
        self.text_chunks.join(" ")
    }

    /// Last unit, if it is blocking; the only one a mixed group waits on
    pub fn trailing_blocker(&self) -> Option<&Arc<ExecutionUnit>> {
        self.units.last().filter(|u| u.is_blocking())
    }

    /// Run the group to the end of its wait condition
    ///
    /// A pure-command group launches its units in order, waiting on each
    /// blocking one. A mixed group is published as one utterance and its
    /// units are left to marker events; only a trailing blocking unit is
    /// waited on.
    pub fn execute(
        &self,
        sink: &dyn SpeechSink,
        registry: &Arc<MarkerRegistry>,
        max_wait: Option<Duration>,
    ) {
        if self.is_pure_command() {
            for unit in &self.units {
                unit.mark_dispatched();
                if let Err(e) = unit.launch(registry) {
                    warn!(marker = unit.id(), "{}", e);
                    continue;
                }
                info!(marker = unit.id(), argv = ?unit.argv(), "launching command");
                if unit.is_blocking() {
                    wait_for(unit, max_wait);
                }
            }
            return;
        }

        for unit in &self.units {
            unit.mark_dispatched();
        }
        let text = self.utterance();
        info!(text = %text, "speaking");
        sink.publish(&text);

        if let Some(unit) = self.trailing_blocker() {
            wait_for(unit, max_wait);
        }
    }
}

fn wait_for(unit: &ExecutionUnit, max_wait: Option<Duration>) {
    debug!(marker = unit.id(), "waiting for blocking command");
    match max_wait {
        None => unit.wait_until_completed(),
        Some(limit) => {
            if !unit.wait_timeout(limit) {
                warn!(
                    marker = unit.id(),
                    state = %unit.state(),
                    ?limit,
                    "blocking command not finished in time, moving on"
                );
            }
        }
    }
}
