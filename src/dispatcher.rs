//! Dispatcher - runs each message's groups strictly in order
//!
//! Messages are handled one at a time. Within a message, group n+1 is not
//! started until group n's wait (if any) has resolved.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::group::Group;
use crate::marker::MarkerRegistry;
use crate::parser::{CommandParser, CommandSyntax};
use crate::playback::SpeechSink;

pub struct Dispatcher {
    parser: CommandParser,
    registry: Arc<MarkerRegistry>,
    sink: Arc<dyn SpeechSink>,
    max_wait: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        syntax: CommandSyntax,
        registry: Arc<MarkerRegistry>,
        sink: Arc<dyn SpeechSink>,
    ) -> Self {
        Self {
            parser: CommandParser::new(syntax, Arc::clone(&registry)),
            registry,
            sink,
            max_wait: None,
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<MarkerRegistry>,
        sink: Arc<dyn SpeechSink>,
    ) -> Result<Self> {
        let syntax = CommandSyntax::from_config(config)?;
        Ok(Self::new(syntax, registry, sink).with_max_wait(config.dispatch.max_wait()))
    }

    /// Stop waiting on a blocking command after `limit`
    pub fn with_max_wait(mut self, limit: Option<Duration>) -> Self {
        self.max_wait = limit;
        self
    }

    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    /// Parse and run one input message
    pub fn process(&self, input: &str) {
        info!(input, "processing command string");
        let groups = self.parser.parse(input);
        self.run(&groups);
    }

    pub fn run(&self, groups: &[Group]) {
        for (index, group) in groups.iter().enumerate() {
            debug!(
                group = index,
                pure_command = group.is_pure_command(),
                units = group.units().len(),
                "dispatching group"
            );
            group.execute(self.sink.as_ref(), &self.registry, self.max_wait);
        }
    }

    /// Process messages until every sender is gone
    pub fn serve(&self, messages: flume::Receiver<String>) {
        for message in messages.iter() {
            self.process(&message);
        }
        debug!("command channel closed");
    }

    /// Move the dispatcher onto its own thread, fed by the returned handle
    pub fn spawn(self) -> io::Result<DispatcherHandle> {
        let (queue, messages) = flume::unbounded::<String>();
        let (done_tx, done) = flume::bounded::<()>(1);
        let registry = Arc::clone(&self.registry);

        let thread = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || {
                self.serve(messages);
                let _ = done_tx.send(());
            })?;

        Ok(DispatcherHandle {
            queue,
            done,
            registry,
            thread,
        })
    }
}

/// Input side of a dispatcher running on its own thread
pub struct DispatcherHandle {
    queue: flume::Sender<String>,
    done: flume::Receiver<()>,
    registry: Arc<MarkerRegistry>,
    thread: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Queue a message, false once the dispatcher thread is gone
    pub fn submit(&self, message: String) -> bool {
        self.queue.send(message).is_ok()
    }

    /// Messages queued but not yet started
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue and wait for the dispatcher to work through it
    ///
    /// With a `limit`, gives up once it passes and returns false, leaving
    /// the thread blocked where it is. Without one, waits as long as it takes.
    pub fn finish(self, limit: Option<Duration>) -> bool {
        let queued = self.queued();
        drop(self.queue);

        let finished = match limit {
            None => {
                let _ = self.done.recv();
                true
            }
            Some(limit) => !matches!(
                self.done.recv_timeout(limit),
                Err(flume::RecvTimeoutError::Timeout)
            ),
        };

        if finished {
            if self.thread.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        } else {
            warn!(
                queued,
                unfinished = self.registry.live(),
                ?limit,
                "abandoning messages that did not finish in time"
            );
        }
        finished
    }
}
