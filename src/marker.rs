//! Marker registry - correlates "playback reached marker X" events with commands
//!
//! Every command embedded in speech gets a small integer id from a cycling
//! window. The id is written into the speech text as a placeholder; when the
//! playback engine reports that id back, the registry launches the command
//! stored under it. A slot stays occupied until its command completes.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::config::MarkersConfig;
use crate::error::{CueError, Result};
use crate::unit::{ExecutionUnit, ProcessRunner};

pub type MarkerId = u32;

// ============================================================================
// Placeholder format
// ============================================================================

/// Piece of speech text as seen by a playback engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Marker(MarkerId),
}

/// Textual marker syntax understood by the playback engine, e.g. `\mrk=52\`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFormat {
    prefix: String,
    suffix: String,
}

impl MarkerFormat {
    /// Build from a template containing `{id}` exactly once, with text before it
    pub fn new(template: &str) -> Result<Self> {
        let (prefix, suffix) = template.split_once("{id}").ok_or_else(|| {
            CueError::Config(format!("marker template '{}' has no {{id}}", template))
        })?;
        if prefix.is_empty() || suffix.contains("{id}") {
            return Err(CueError::Config(format!(
                "marker template '{}' needs a prefix and a single {{id}}",
                template
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn render(&self, id: MarkerId) -> String {
        format!("{}{}{}", self.prefix, id, self.suffix)
    }

    /// Split speech text into text runs and markers, in textual order
    pub fn split<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        let mut segments = Vec::new();
        let mut text_start = 0;
        let mut search = 0;

        while let Some(found) = text[search..].find(&self.prefix) {
            let start = search + found;
            let digits_start = start + self.prefix.len();
            let digits_len = text[digits_start..]
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count();
            let digits_end = digits_start + digits_len;

            let id = if digits_len > 0 && text[digits_end..].starts_with(&self.suffix) {
                text[digits_start..digits_end].parse::<MarkerId>().ok()
            } else {
                None
            };

            match id {
                Some(id) => {
                    if start > text_start {
                        segments.push(Segment::Text(&text[text_start..start]));
                    }
                    segments.push(Segment::Marker(id));
                    text_start = digits_end + self.suffix.len();
                    search = text_start;
                }
                None => search = digits_start,
            }
        }

        if text_start < text.len() {
            segments.push(Segment::Text(&text[text_start..]));
        }
        segments
    }

    /// Marker ids in the order they appear
    pub fn scan(&self, text: &str) -> Vec<MarkerId> {
        self.split(text)
            .into_iter()
            .filter_map(|s| match s {
                Segment::Marker(id) => Some(id),
                Segment::Text(_) => None,
            })
            .collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Slots {
    /// Absent: never allocated. `None`: released after completion.
    slots: HashMap<MarkerId, Option<Arc<ExecutionUnit>>>,
    next_id: MarkerId,
}

/// Process-wide marker table, shared as `Arc<MarkerRegistry>`
pub struct MarkerRegistry {
    first_id: MarkerId,
    last_id: MarkerId,
    inner: Mutex<Slots>,
    runner: Arc<dyn ProcessRunner>,
}

impl MarkerRegistry {
    /// Registry handing out ids from `first_id..=last_id`
    pub fn new(first_id: MarkerId, last_id: MarkerId, runner: Arc<dyn ProcessRunner>) -> Arc<Self> {
        let (first_id, last_id) = (first_id.min(last_id), first_id.max(last_id));
        Arc::new(Self {
            first_id,
            last_id,
            inner: Mutex::new(Slots {
                slots: HashMap::new(),
                next_id: first_id,
            }),
            runner,
        })
    }

    pub fn from_config(config: &MarkersConfig, runner: Arc<dyn ProcessRunner>) -> Arc<Self> {
        Self::new(config.first_id, config.last_id, runner)
    }

    pub fn window(&self) -> RangeInclusive<MarkerId> {
        self.first_id..=self.last_id
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, id: MarkerId) -> MarkerId {
        if id >= self.last_id {
            self.first_id
        } else {
            id + 1
        }
    }

    /// Store a new unit under the next free id
    ///
    /// The counter walks the window in order and wraps; ids whose unit is
    /// still pending are skipped rather than overwritten. When every id in
    /// the window is pending this fails with `RegistryFull`.
    pub fn allocate(
        &self,
        build: impl FnOnce(MarkerId) -> ExecutionUnit,
    ) -> Result<Arc<ExecutionUnit>> {
        let mut slots = self.lock();

        let span = u64::from(self.last_id - self.first_id) + 1;
        let mut candidate = slots.next_id;
        let mut free = None;
        for _ in 0..span {
            if !matches!(slots.slots.get(&candidate), Some(Some(_))) {
                free = Some(candidate);
                break;
            }
            candidate = self.advance(candidate);
        }

        let Some(id) = free else {
            return Err(CueError::RegistryFull {
                first: self.first_id,
                last: self.last_id,
            });
        };

        let unit = Arc::new(build(id));
        slots.slots.insert(id, Some(Arc::clone(&unit)));
        slots.next_id = self.advance(id);
        debug!(marker = id, argv = ?unit.argv(), "allocated marker");
        Ok(unit)
    }

    /// Launch the unit registered under `id`
    pub fn resolve_and_launch(self: &Arc<Self>, id: MarkerId) -> Result<Arc<ExecutionUnit>> {
        let unit = match self.lock().slots.get(&id) {
            None => return Err(CueError::UnknownMarker(id)),
            Some(None) => return Err(CueError::StaleMarker(id)),
            Some(Some(unit)) => Arc::clone(unit),
        };
        unit.launch(self)?;
        Ok(unit)
    }

    /// Handle a marker-reached event from the playback engine
    pub fn on_marker_reached(self: &Arc<Self>, id: MarkerId) {
        match self.resolve_and_launch(id) {
            Ok(unit) => info!(marker = id, argv = ?unit.argv(), "launching command"),
            Err(e @ CueError::UnknownMarker(_)) => error!(marker = id, "{}", e),
            Err(e) => warn!(marker = id, "{}", e),
        }
    }

    /// Clear `id` if it still holds exactly `unit`, returns whether it did
    pub fn release(&self, id: MarkerId, unit: &ExecutionUnit) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.slots.get_mut(&id) else {
            return false;
        };

        let holds_unit = slot.as_deref().is_some_and(|u| std::ptr::eq(u, unit));
        if holds_unit {
            *slot = None;
            debug!(marker = id, "released marker");
        }
        holds_unit
    }

    /// Unit currently holding `id`, if any
    pub fn occupant(&self, id: MarkerId) -> Option<Arc<ExecutionUnit>> {
        self.lock().slots.get(&id).cloned().flatten()
    }

    /// Number of ids held by pending or running units
    pub fn live(&self) -> usize {
        self.lock().slots.values().filter(|s| s.is_some()).count()
    }

    /// Resolve marker events until every sender is gone
    pub fn serve(self: Arc<Self>, events: flume::Receiver<MarkerId>) {
        for id in events.iter() {
            self.on_marker_reached(id);
        }
        debug!("marker event channel closed");
    }
}
