// ============================================================================
// Execution host: one sandboxed worker thread bound to one script source
// ============================================================================
//
// The host side is single-threaded and cooperative: worker events queue on a
// channel and are dispatched to the registered callbacks only from `pump()`.
// Callbacks run while the host is borrowed, so they record what happened and
// let the owner react once `pump()` returns.

use rhai::{CallFnOptions, Dynamic, Map, Scope};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender, TryRecvError},
};
use uuid::Uuid;

use super::protocol::{ExecutionRequest, ExecutionResult};
use super::sandbox::{SandboxLimits, ScriptError, WorkerContext, create_engine};

/// Prefix for faults raised by user code (syntax or runtime).
pub const WORKER_ERROR_PREFIX: &str = "Worker Error: ";
/// Prefix for faults of the sandbox itself.
pub const CREATION_ERROR_PREFIX: &str = "Worker creation error: ";

/// Name of the script function invoked for every posted message.
const MESSAGE_HANDLER: &str = "onmessage";

// ============================================================================
// Messages between host and worker thread
// ============================================================================

pub(crate) enum WorkerCommand {
    /// Inbound message map, already copied for the worker.
    Message(Dynamic),
}

pub(crate) enum WorkerFault {
    /// Compile or runtime failure in user code.
    Script(ScriptError),
    /// The sandbox could not be started.
    Startup(String),
}

pub(crate) enum WorkerEvent {
    /// Top-level script body finished; messages are now handled.
    Ready,
    Reply(ExecutionResult),
    Fault(WorkerFault),
    Console(String),
    /// One posted message has been fully handled, whatever it replied.
    Settled,
}

// ============================================================================
// Public host types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Created,
    Running,
    Errored,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// `post` after `terminate`.
    Terminated,
    /// The worker thread is gone and cannot receive messages.
    Disconnected,
    /// Pixel payload exceeds what the sandbox accepts.
    PayloadTooLarge { bytes: usize, limit: usize },
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Terminated => write!(f, "host has been terminated"),
            HostError::Disconnected => write!(f, "worker is no longer running"),
            HostError::PayloadTooLarge { bytes, limit } => write!(
                f,
                "message payload of {} bytes exceeds the worker limit of {} bytes",
                bytes, limit
            ),
        }
    }
}

impl std::error::Error for HostError {}

impl From<mpsc::SendError<WorkerCommand>> for HostError {
    fn from(_: mpsc::SendError<WorkerCommand>) -> Self {
        HostError::Disconnected
    }
}

type ResultCallback = Box<dyn FnMut(ExecutionResult)>;
type TextCallback = Box<dyn FnMut(String)>;

/// One isolated execution context running user script on its own thread.
pub struct ExecutionHost {
    id: Uuid,
    state: HostState,
    limits: SandboxLimits,
    commands: Option<Sender<WorkerCommand>>,
    events: Receiver<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
    on_result: Option<ResultCallback>,
    on_error: Option<TextCallback>,
    on_console: Option<TextCallback>,
    in_flight: usize,
}

impl ExecutionHost {
    /// Start a worker for `source`. Never fails synchronously: compile errors
    /// and startup faults arrive later through `on_error`.
    pub fn create(source: &str, limits: SandboxLimits) -> Self {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (evt_tx, evt_rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker_events = evt_tx.clone();
        let worker_cancel = cancelled.clone();
        let worker_source = source.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("pixelplay-worker-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                worker_main(worker_source, limits, cmd_rx, worker_events, worker_cancel)
            });

        let commands = match spawned {
            Ok(_) => {
                crate::log_info!("Worker {} created", short_id(&id));
                Some(cmd_tx)
            }
            Err(e) => {
                crate::log_err!("Worker {} failed to start: {}", short_id(&id), e);
                let _ = evt_tx.send(WorkerEvent::Fault(WorkerFault::Startup(e.to_string())));
                None
            }
        };

        Self {
            id,
            state: HostState::Created,
            limits,
            commands,
            events: evt_rx,
            cancelled,
            on_result: None,
            on_error: None,
            on_console: None,
            in_flight: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == HostState::Terminated
    }

    /// Posted messages the worker has not finished handling yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Replaces any previously registered result consumer.
    pub fn on_result(&mut self, callback: impl FnMut(ExecutionResult) + 'static) {
        if !self.is_terminated() {
            self.on_result = Some(Box::new(callback));
        }
    }

    /// Replaces any previously registered error consumer.
    pub fn on_error(&mut self, callback: impl FnMut(String) + 'static) {
        if !self.is_terminated() {
            self.on_error = Some(Box::new(callback));
        }
    }

    /// Lines the script prints.
    pub fn on_console(&mut self, callback: impl FnMut(String) + 'static) {
        if !self.is_terminated() {
            self.on_console = Some(Box::new(callback));
        }
    }

    /// Send one request to the worker without waiting for it.
    pub fn post(&mut self, request: &ExecutionRequest) -> Result<(), HostError> {
        if self.is_terminated() {
            return Err(HostError::Terminated);
        }
        let bytes = request.image_data.data().len();
        if bytes > self.limits.max_array_size {
            return Err(HostError::PayloadTooLarge {
                bytes,
                limit: self.limits.max_array_size,
            });
        }
        let commands = self.commands.as_ref().ok_or(HostError::Disconnected)?;
        commands.send(WorkerCommand::Message(request.to_message()))?;
        self.in_flight += 1;
        Ok(())
    }

    /// Dispatch every queued worker event to the callbacks.
    /// Returns the number of events handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while !self.is_terminated() {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Worker exited; nothing it was handling will settle now.
                    self.in_flight = 0;
                    self.commands = None;
                    break;
                }
            };
            handled += 1;
            self.dispatch(event);
        }
        handled
    }

    fn dispatch(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready => {
                if self.state == HostState::Created {
                    self.state = HostState::Running;
                }
            }
            WorkerEvent::Reply(result) => {
                if let Some(cb) = self.on_result.as_mut() {
                    cb(result);
                }
            }
            WorkerEvent::Fault(fault) => {
                self.state = HostState::Errored;
                let message = match fault {
                    WorkerFault::Script(err) => {
                        crate::log_warn!(
                            "Worker {} script fault:\n{}",
                            short_id(&self.id),
                            err.friendly_message()
                        );
                        format!("{}{}", WORKER_ERROR_PREFIX, err)
                    }
                    WorkerFault::Startup(reason) => format!("{}{}", CREATION_ERROR_PREFIX, reason),
                };
                if let Some(cb) = self.on_error.as_mut() {
                    cb(message);
                }
            }
            WorkerEvent::Console(line) => {
                if let Some(cb) = self.on_console.as_mut() {
                    cb(line);
                }
            }
            WorkerEvent::Settled => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    /// End the worker and discard anything in flight. Returns `false` when
    /// the host was already terminated.
    pub fn terminate(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.cancelled.store(true, Ordering::Relaxed);
        self.commands = None;
        self.on_result = None;
        self.on_error = None;
        self.on_console = None;
        while self.events.try_recv().is_ok() {}
        self.in_flight = 0;
        self.state = HostState::Terminated;
        crate::log_info!("Worker {} terminated", short_id(&self.id));
        true
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        // Dropping the sender ends the worker's receive loop; the flag stops
        // a call that is still running.
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

// ============================================================================
// Worker thread
// ============================================================================

fn worker_main(
    source: String,
    limits: SandboxLimits,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let panic_events = events.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_worker(&source, &limits, &commands, events, &cancelled)
    }));
    if result.is_err() {
        let _ = panic_events.send(WorkerEvent::Fault(WorkerFault::Script(ScriptError::new(
            "Worker panicked (internal error)",
        ))));
    }
}

fn run_worker(
    source: &str,
    limits: &SandboxLimits,
    commands: &Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
    cancelled: &Arc<AtomicBool>,
) {
    let ctx = Arc::new(Mutex::new(WorkerContext::new(events.clone(), cancelled.clone())));
    let engine = create_engine(ctx, limits);
    let mut scope = Scope::new();

    let ast = match engine.compile(source) {
        Ok(ast) => ast,
        Err(e) => {
            let _ = events.send(WorkerEvent::Fault(WorkerFault::Script(ScriptError::from_parse(&e))));
            return;
        }
    };

    if let Err(e) = engine.run_ast_with_scope(&mut scope, &ast) {
        if !cancelled.load(Ordering::Relaxed) {
            let _ = events.send(WorkerEvent::Fault(WorkerFault::Script(ScriptError::from_eval(&e))));
        }
        return;
    }

    let has_handler = ast
        .iter_functions()
        .any(|f| f.name == MESSAGE_HANDLER && f.params.len() == 1);
    let _ = events.send(WorkerEvent::Ready);

    // Persistent per-worker state, visible to the handler as `this`.
    let mut this = Dynamic::from_map(Map::new());

    while let Ok(command) = commands.recv() {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        match command {
            WorkerCommand::Message(message) => {
                if has_handler {
                    let options = CallFnOptions::new()
                        .eval_ast(false)
                        .rewind_scope(false)
                        .bind_this_ptr(&mut this);
                    let outcome = engine.call_fn_with_options::<Dynamic>(
                        options,
                        &mut scope,
                        &ast,
                        MESSAGE_HANDLER,
                        (message,),
                    );
                    if let Err(e) = outcome {
                        if cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = events.send(WorkerEvent::Fault(WorkerFault::Script(
                            ScriptError::from_eval(&e),
                        )));
                    }
                }
                let _ = events.send(WorkerEvent::Settled);
            }
        }
    }
}
