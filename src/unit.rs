//! Execution units - one external process launch per embedded command
//!
//! A unit is created when the parser sees a command token, is launched either
//! directly by the dispatcher or later by a marker event, and runs its process
//! on a dedicated thread. Completion is signalled through a condition
//! variable so a caller can start waiting before the launch has happened.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CueError, Result};
use crate::marker::{MarkerId, MarkerRegistry};
use crate::parser::CommandSyntax;

/// Lifecycle of a unit, only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitState {
    Created,
    Dispatched,
    Running,
    Completed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Created => write!(f, "created"),
            UnitState::Dispatched => write!(f, "dispatched"),
            UnitState::Running => write!(f, "running"),
            UnitState::Completed => write!(f, "completed"),
        }
    }
}

/// How a launch attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Process ran; exit code is `None` when it was killed by a signal
    Exited(Option<i32>),
    /// Process never started
    LaunchFailed(String),
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Outcome::Exited(Some(0)))
    }
}

// ============================================================================
// Process runner
// ============================================================================

/// Runs an argv to completion
pub trait ProcessRunner: Send + Sync {
    /// Block until the process exits, returning its exit code
    fn run(&self, argv: &[String]) -> Result<Option<i32>>;
}

/// Runs commands with `std::process::Command`
///
/// Child stdout is sent to our stderr, stdout carries the wire protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<Option<i32>> {
        let (program, args) = argv.split_first().ok_or_else(|| CueError::ProcessLaunch {
            program: String::new(),
            reason: "empty argv".into(),
        })?;

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(std::io::stderr())
            .status()
            .map_err(|e| CueError::ProcessLaunch {
                program: program.clone(),
                reason: e.to_string(),
            })?;
        Ok(status.code())
    }
}

// ============================================================================
// Execution unit
// ============================================================================

struct Progress {
    state: UnitState,
    outcome: Option<Outcome>,
}

pub struct ExecutionUnit {
    id: MarkerId,
    argv: Vec<String>,
    blocking: bool,
    marker: String,
    progress: Mutex<Progress>,
    completed: Condvar,
}

impl ExecutionUnit {
    pub fn new(id: MarkerId, argv: Vec<String>, blocking: bool, marker: String) -> Self {
        Self {
            id,
            argv,
            blocking,
            marker,
            progress: Mutex::new(Progress {
                state: UnitState::Created,
                outcome: None,
            }),
            completed: Condvar::new(),
        }
    }

    /// Parse a command token and register the unit under a fresh marker id
    pub fn create(
        token: &str,
        syntax: &CommandSyntax,
        registry: &MarkerRegistry,
    ) -> Result<Arc<Self>> {
        let command = syntax.parse_command(token)?;
        registry.allocate(|id| {
            Self::new(id, command.argv, command.blocking, syntax.marker().render(id))
        })
    }

    pub fn id(&self) -> MarkerId {
        self.id
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Placeholder substituted into speech text for this unit
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn state(&self) -> UnitState {
        self.lock().state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that the dispatcher has taken charge of this unit
    pub fn mark_dispatched(&self) {
        let mut progress = self.lock();
        if progress.state == UnitState::Created {
            progress.state = UnitState::Dispatched;
        }
    }

    /// Start the process on its own thread
    ///
    /// A unit launches at most once; later requests get `AlreadyLaunched`.
    /// On exit, or if the runner panics, the unit releases its marker and
    /// then becomes `Completed`.
    pub fn launch(self: &Arc<Self>, registry: &Arc<MarkerRegistry>) -> Result<()> {
        {
            let mut progress = self.lock();
            if progress.state >= UnitState::Running {
                return Err(CueError::AlreadyLaunched(self.id));
            }
            progress.state = UnitState::Running;
        }
        debug!(marker = self.id, argv = ?self.argv, "starting command");

        let unit = Arc::clone(self);
        let worker_registry = Arc::clone(registry);
        let spawned = thread::Builder::new()
            .name(format!("unit-{}", self.id))
            .spawn(move || {
                let run = || worker_registry.runner().run(&unit.argv);
                let outcome = match panic::catch_unwind(AssertUnwindSafe(run)) {
                    Ok(Ok(code)) => Outcome::Exited(code),
                    Ok(Err(e)) => Outcome::LaunchFailed(e.to_string()),
                    Err(_) => Outcome::LaunchFailed("process runner panicked".into()),
                };
                unit.complete(outcome, &worker_registry);
            });

        if let Err(e) = spawned {
            self.complete(Outcome::LaunchFailed(e.to_string()), registry);
        }
        Ok(())
    }

    fn complete(&self, outcome: Outcome, registry: &MarkerRegistry) {
        match &outcome {
            o if o.succeeded() => info!(marker = self.id, argv = ?self.argv, "command finished"),
            Outcome::Exited(code) => {
                warn!(marker = self.id, argv = ?self.argv, ?code, "command exited unsuccessfully")
            }
            Outcome::LaunchFailed(reason) => {
                warn!(marker = self.id, argv = ?self.argv, %reason, "command failed to launch")
            }
        }

        registry.release(self.id, self);

        let mut progress = self.lock();
        progress.state = UnitState::Completed;
        progress.outcome = Some(outcome);
        drop(progress);
        self.completed.notify_all();
    }

    /// Block until the unit has completed, however long its launch takes to arrive
    pub fn wait_until_completed(&self) {
        let guard = self.lock();
        let _done = self
            .completed
            .wait_while(guard, |p| p.state != UnitState::Completed)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like `wait_until_completed`, but gives up after `limit`
    ///
    /// Returns whether the unit completed.
    pub fn wait_timeout(&self, limit: Duration) -> bool {
        let guard = self.lock();
        let (progress, _) = self
            .completed
            .wait_timeout_while(guard, limit, |p| p.state != UnitState::Completed)
            .unwrap_or_else(PoisonError::into_inner);
        progress.state == UnitState::Completed
    }
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("argv", &self.argv)
            .field("blocking", &self.blocking)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Instant;

    /// Runner whose processes exit when the test says so
    struct Gated {
        release: flume::Receiver<Option<i32>>,
    }

    impl ProcessRunner for Gated {
        fn run(&self, _argv: &[String]) -> Result<Option<i32>> {
            Ok(self.release.recv().unwrap_or(None))
        }
    }

    struct CannotStart;

    impl ProcessRunner for CannotStart {
        fn run(&self, argv: &[String]) -> Result<Option<i32>> {
            Err(CueError::ProcessLaunch {
                program: argv[0].clone(),
                reason: "No such file or directory".into(),
            })
        }
    }

    struct Panics;

    impl ProcessRunner for Panics {
        fn run(&self, _argv: &[String]) -> Result<Option<i32>> {
            panic!("runner blew up");
        }
    }

    fn syntax() -> CommandSyntax {
        CommandSyntax::from_config(&Config::default()).unwrap()
    }

    fn gated_registry() -> (Arc<MarkerRegistry>, flume::Sender<Option<i32>>) {
        let (tx, rx) = flume::unbounded();
        (MarkerRegistry::new(50, 1000, Arc::new(Gated { release: rx })), tx)
    }

    #[test]
    fn test_create_blocking_unit() {
        let (registry, _tx) = gated_registry();
        let unit = ExecutionUnit::create("!rping_8.8.8.8", &syntax(), &registry).unwrap();

        assert_eq!(unit.id(), 50);
        assert_eq!(unit.argv(), ["ping", "8.8.8.8"]);
        assert!(unit.is_blocking());
        assert_eq!(unit.marker(), "\\mrk=50\\");
        assert_eq!(unit.state(), UnitState::Created);
        assert!(registry.occupant(50).is_some());
    }

    #[test]
    fn test_create_non_blocking_unit() {
        let (registry, _tx) = gated_registry();
        let unit = ExecutionUnit::create("!secho_hi", &syntax(), &registry).unwrap();
        assert_eq!(unit.argv(), ["echo", "hi"]);
        assert!(!unit.is_blocking());

        let unit = ExecutionUnit::create("!w_notify-send_done", &syntax(), &registry).unwrap();
        assert_eq!(unit.argv(), ["notify-send", "done"]);
        assert!(!unit.is_blocking());
    }

    #[test]
    fn test_malformed_token_allocates_nothing() {
        let (registry, _tx) = gated_registry();
        assert!(matches!(
            ExecutionUnit::create("!r___", &syntax(), &registry),
            Err(CueError::MalformedToken(_))
        ));
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_launch_runs_to_completion() {
        let (registry, tx) = gated_registry();
        let unit = ExecutionUnit::create("!rsleep_1", &syntax(), &registry).unwrap();

        unit.mark_dispatched();
        assert_eq!(unit.state(), UnitState::Dispatched);

        unit.launch(&registry).unwrap();
        assert_eq!(unit.state(), UnitState::Running);
        assert!(!unit.wait_timeout(Duration::from_millis(20)));

        tx.send(Some(0)).unwrap();
        unit.wait_until_completed();
        assert_eq!(unit.state(), UnitState::Completed);
        assert_eq!(unit.outcome(), Some(Outcome::Exited(Some(0))));
        assert!(registry.occupant(unit.id()).is_none());
    }

    #[test]
    fn test_wait_begins_before_launch() {
        let (registry, tx) = gated_registry();
        let unit = ExecutionUnit::create("!rsleep_1", &syntax(), &registry).unwrap();

        let waiter = thread::spawn({
            let unit = Arc::clone(&unit);
            move || {
                let started = Instant::now();
                unit.wait_until_completed();
                started.elapsed()
            }
        });

        thread::sleep(Duration::from_millis(30));
        assert_eq!(unit.state(), UnitState::Created);
        registry.resolve_and_launch(unit.id()).unwrap();
        tx.send(Some(0)).unwrap();

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(30));
        assert_eq!(unit.state(), UnitState::Completed);
    }

    #[test]
    fn test_second_launch_is_refused() {
        let (registry, tx) = gated_registry();
        let unit = ExecutionUnit::create("!secho_hi", &syntax(), &registry).unwrap();

        unit.launch(&registry).unwrap();
        assert!(matches!(
            unit.launch(&registry),
            Err(CueError::AlreadyLaunched(50))
        ));

        tx.send(Some(0)).unwrap();
        unit.wait_until_completed();
        assert!(matches!(
            unit.launch(&registry),
            Err(CueError::AlreadyLaunched(50))
        ));
    }

    #[test]
    fn test_failures_still_complete() {
        let (registry, tx) = gated_registry();
        let unit = ExecutionUnit::create("!rfalse", &syntax(), &registry).unwrap();
        unit.launch(&registry).unwrap();
        tx.send(Some(1)).unwrap();
        unit.wait_until_completed();
        assert_eq!(unit.outcome(), Some(Outcome::Exited(Some(1))));
        assert!(!unit.outcome().unwrap().succeeded());

        let registry = MarkerRegistry::new(50, 1000, Arc::new(CannotStart));
        let unit = ExecutionUnit::create("!rno-such-program", &syntax(), &registry).unwrap();
        unit.launch(&registry).unwrap();
        unit.wait_until_completed();
        assert!(matches!(unit.outcome(), Some(Outcome::LaunchFailed(_))));
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_panicking_runner_still_completes() {
        let registry = MarkerRegistry::new(50, 1000, Arc::new(Panics));
        let unit = ExecutionUnit::create("!rboom", &syntax(), &registry).unwrap();

        unit.launch(&registry).unwrap();
        assert!(unit.wait_timeout(Duration::from_secs(5)));
        assert_eq!(unit.state(), UnitState::Completed);
        assert!(matches!(unit.outcome(), Some(Outcome::LaunchFailed(_))));
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_system_runner_rejects_empty_argv() {
        assert!(matches!(
            SystemRunner.run(&[]),
            Err(CueError::ProcessLaunch { .. })
        ));
    }
}
