//! Print protocol engine
//!
//! The state machine that drives a print over the stop-and-wait serial
//! protocol. One monitor thread owns the transport and runs a cooperative
//! loop: read with a short timeout, classify, drain the command queue,
//! advance the send cursor, repeat. External callers never touch the port;
//! they enqueue commands and read the observable snapshot.
//!
//! Invariant: at most one unacknowledged line is in flight. After sending
//! line `n` the loop blocks advancement until an `ok` acks it, a resend
//! rewinds onto it, or the heartbeat path gives up and latches ERROR.

use crate::firmware::{flavor_for, FirmwareDetector, FirmwareFlavor, FirmwareKind};
use crate::protocol::cursor::SendCursor;
use crate::protocol::queue::{CommandPriority, CommandQueue, QueuedCommand};
use crate::protocol::response::{classify, Response};
use crate::transport::serial::SerialTransport;
use crate::transport::{detect, ConnectionParams, Transport};
use parking_lot::{Mutex, RwLock};
use printkit_core::{
    AbortFlag, Error, HeaterKey, JobProgress, LogEntry, PrinterListener, PrinterListenerHandle,
    PrinterState, ProtocolError, Result, TemperatureReading, TemperatureSample,
    TemperatureSnapshot,
};
use printkit_gcode::{frame, parse_line, AnalysisResult, CommandCode, Program};
use printkit_settings::Config;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use uuid::Uuid;

/// Pause between monitor iterations when the read returned nothing; keeps
/// the loop from spinning against instant mock transports
const IDLE_LOOP_DELAY: Duration = Duration::from_millis(2);

/// Capacity of the user command lane
const USER_QUEUE_DEPTH: usize = 64;

/// The line in flight awaiting its `ok`
#[derive(Debug, Clone, PartialEq, Eq)]
enum InFlight {
    /// Numbered program line
    Program(usize),
    /// Queued command, sent verbatim
    Command(String),
}

/// A loaded program being streamed
struct PrintJob {
    program: Program,
    cursor: SendCursor,
    /// Frames already transmitted, kept so a resend is bit-identical
    framed: Vec<Option<String>>,
    /// Whether slot 0 (`M110 N0`) went out for this job
    reset_sent: bool,
}

impl PrintJob {
    fn new(program: Program) -> Self {
        let len = program.len();
        Self {
            program,
            cursor: SendCursor::new(len),
            framed: vec![None; len],
            reset_sent: false,
        }
    }
}

/// Everything the monitor and the API mutate, behind one lock
struct EngineState {
    printer_state: PrinterState,
    flavor: Arc<dyn FirmwareFlavor>,
    loaded: Option<Program>,
    job: Option<PrintJob>,
    analysis: Option<AnalysisResult>,
    in_flight: Option<InFlight>,
    current_tool: u8,
    /// `M83` seen on the stream
    relative_e: bool,
    /// Last absolute E coordinate sent, for the pause/resume `G92` restore
    last_absolute_e: Option<f64>,
    paused_e: Option<f64>,
    feed_modifiers: HashMap<String, f64>,
    temperatures: TemperatureSnapshot,
    temperature_history: VecDeque<TemperatureSample>,
    log: VecDeque<LogEntry>,
    elapsed_accum: Duration,
    run_since: Option<Instant>,
    last_rx: Instant,
    heartbeat_failures: u32,
    resend_line: Option<usize>,
    resend_count: u32,
    cancel_pending: bool,
    latched_error: Option<String>,
    /// Progress as of the last cursor movement; survives job teardown so
    /// a finished print still reads 100%
    last_progress: JobProgress,
}

impl EngineState {
    fn new() -> Self {
        Self {
            printer_state: PrinterState::Disconnected,
            flavor: flavor_for(FirmwareKind::Marlin),
            loaded: None,
            job: None,
            analysis: None,
            in_flight: None,
            current_tool: 0,
            relative_e: false,
            last_absolute_e: None,
            paused_e: None,
            feed_modifiers: HashMap::new(),
            temperatures: TemperatureSnapshot::new(),
            temperature_history: VecDeque::new(),
            log: VecDeque::new(),
            elapsed_accum: Duration::ZERO,
            run_since: None,
            last_rx: Instant::now(),
            heartbeat_failures: 0,
            resend_line: None,
            resend_count: 0,
            cancel_pending: false,
            latched_error: None,
            last_progress: JobProgress::default(),
        }
    }

    fn refusal(&self, operation: &str) -> Error {
        ProtocolError::InvalidOperation {
            state: self.printer_state.to_string(),
            operation: operation.to_string(),
        }
        .into()
    }

    /// Fold the running stretch into the accumulator (pause, finish, fault)
    fn fold_elapsed(&mut self) {
        if let Some(since) = self.run_since.take() {
            self.elapsed_accum += since.elapsed();
        }
    }

    /// Print time so far, pause time excluded
    fn elapsed(&self) -> Duration {
        match self.run_since {
            Some(since) => self.elapsed_accum + since.elapsed(),
            None => self.elapsed_accum,
        }
    }

    fn progress(&self) -> JobProgress {
        let Some(job) = &self.job else {
            return JobProgress {
                elapsed_secs: self.elapsed().as_secs_f64(),
                ..self.last_progress
            };
        };
        let current_line = job.cursor.acked();
        JobProgress {
            current_line,
            total_lines: job.program.len(),
            fraction: job.cursor.progress(),
            elapsed_secs: self.elapsed().as_secs_f64(),
            remaining_secs: self
                .analysis
                .as_ref()
                .map(|analysis| analysis.remaining_after(current_line)),
        }
    }

    fn push_log(&mut self, entry: LogEntry, depth: usize) {
        self.log.push_back(entry);
        while self.log.len() > depth {
            self.log.pop_front();
        }
    }

    fn push_temperatures(&mut self, snapshot: TemperatureSnapshot, depth: usize) {
        self.temperatures = snapshot.clone();
        self.temperature_history
            .push_back(TemperatureSample::now(snapshot));
        while self.temperature_history.len() > depth {
            self.temperature_history.pop_front();
        }
    }
}

/// A consistent, recent view of the engine for any observer
#[derive(Debug, Clone)]
pub struct PrinterSnapshot {
    /// Current state
    pub state: PrinterState,
    /// Detected firmware family
    pub firmware: FirmwareKind,
    /// Progress of the current (or last) job
    pub progress: JobProgress,
    /// Latest temperature report
    pub temperatures: TemperatureSnapshot,
    /// Rolling temperature history, oldest first
    pub temperature_history: Vec<TemperatureSample>,
    /// Rolling console log, oldest first
    pub log: Vec<LogEntry>,
    /// The latched fault, if the engine is in ERROR
    pub error: Option<String>,
}

/// Listener notification payloads
enum EngineEvent {
    State(PrinterState),
    Temp(TemperatureSnapshot),
    Progress(JobProgress),
    Log(LogEntry),
    Error(String),
}

/// Shared core handed to the monitor thread
struct Shared {
    state: RwLock<EngineState>,
    queue: Mutex<CommandQueue>,
    listeners: RwLock<HashMap<String, Arc<dyn PrinterListener>>>,
    runtime: RwLock<Option<Handle>>,
    config: Config,
}

impl Shared {
    fn notify(&self, event: EngineEvent) {
        let Some(handle) = self.runtime.read().clone() else {
            return;
        };
        let listeners: Vec<_> = self.listeners.read().values().cloned().collect();
        match event {
            EngineEvent::State(state) => {
                for listener in listeners {
                    handle.spawn(async move { listener.on_state(state).await });
                }
            }
            EngineEvent::Temp(snapshot) => {
                for listener in listeners {
                    let snapshot = snapshot.clone();
                    handle.spawn(async move { listener.on_temp(&snapshot).await });
                }
            }
            EngineEvent::Progress(progress) => {
                for listener in listeners {
                    handle.spawn(async move { listener.on_progress(progress).await });
                }
            }
            EngineEvent::Log(entry) => {
                for listener in listeners {
                    let entry = entry.clone();
                    handle.spawn(async move { listener.on_log(&entry).await });
                }
            }
            EngineEvent::Error(message) => {
                for listener in listeners {
                    let message = message.clone();
                    handle.spawn(async move { listener.on_error(&message).await });
                }
            }
        }
    }

    /// Latch a fatal fault; sends stop, the state survives until a
    /// disconnect/connect cycle
    fn latch_error(&self, error: Error) {
        let message = error.to_string();
        {
            let mut state = self.state.write();
            if state.printer_state == PrinterState::Error {
                return;
            }
            tracing::error!("latched: {}", message);
            state.printer_state = PrinterState::Error;
            state.latched_error = Some(message.clone());
            state.fold_elapsed();
            state.in_flight = None;
        }
        self.notify(EngineEvent::Error(message));
        self.notify(EngineEvent::State(PrinterState::Error));
    }

    fn log_line(&self, entry: LogEntry) {
        let depth = self.config.protocol.log_history;
        self.state.write().push_log(entry.clone(), depth);
        self.notify(EngineEvent::Log(entry));
    }
}

/// The print protocol engine
///
/// Owns the monitor thread for one printer connection. All operations are
/// non-blocking from the caller's perspective; anything that must touch
/// the serial port goes through the command queue.
pub struct PrintEngine {
    shared: Arc<Shared>,
    shutdown: AbortFlag,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PrintEngine {
    /// Create an engine with the given configuration
    pub fn new(config: Config) -> Self {
        let queue = CommandQueue::new(USER_QUEUE_DEPTH);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(EngineState::new()),
                queue: Mutex::new(queue),
                listeners: RwLock::new(HashMap::new()),
                runtime: RwLock::new(None),
                config,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        }
    }

    /// Open the configured serial port (resolving `Auto`) and connect
    pub async fn connect(&self) -> Result<()> {
        let params = detect::resolve(&self.shared.config.connection)?;
        let transport = SerialTransport::open(params)?;
        self.connect_with(Box::new(transport)).await
    }

    /// Connect to an explicit port and baud rate, bypassing the config
    pub async fn connect_to(&self, port: &str, baud_rate: u32) -> Result<()> {
        let params = ConnectionParams {
            port: port.to_string(),
            baud_rate,
            timeout_ms: self.shared.config.connection.read_timeout_ms,
        };
        let transport = SerialTransport::open(params)?;
        self.connect_with(Box::new(transport)).await
    }

    /// Connect over an already-open transport
    ///
    /// Sends `M110 N0` to reset the line counter and `M115` to probe the
    /// firmware, then enters the heartbeat loop. The engine reaches
    /// OPERATIONAL on the first `ok` or temperature report.
    pub async fn connect_with(&self, transport: Box<dyn Transport>) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if state.printer_state.is_connected() {
                return Err(state.refusal("connect"));
            }
            *state = EngineState::new();
            state.printer_state = PrinterState::Connecting;
            state.last_rx = Instant::now();
        }
        *self.shared.runtime.write() = Some(Handle::current());
        self.shared.notify(EngineEvent::State(PrinterState::Connecting));

        {
            let mut queue = self.shared.queue.lock();
            queue.push("M110 N0", CommandPriority::Control);
            queue.push("M115", CommandPriority::Control);
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("printkit-monitor".to_string())
            .spawn(move || monitor_loop(shared, shutdown, transport))
            .map_err(|e| Error::other(format!("failed to spawn monitor: {}", e)))?;
        *self.monitor.lock() = Some(handle);

        tracing::info!("connecting");
        Ok(())
    }

    /// Close the connection; idempotent
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if matches!(
                state.printer_state,
                PrinterState::Disconnected | PrinterState::Closed
            ) {
                return Ok(());
            }
            state.printer_state = PrinterState::Closing;
            state.fold_elapsed();
            state.job = None;
            state.in_flight = None;
        }
        self.shared.notify(EngineEvent::State(PrinterState::Closing));

        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }

        self.shared.state.write().printer_state = PrinterState::Closed;
        self.shared.notify(EngineEvent::State(PrinterState::Closed));
        tracing::info!("disconnected");
        Ok(())
    }

    /// Load a program for the next print
    pub async fn load(&self, program: Program) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.printer_state.is_busy() {
            return Err(state.refusal("load"));
        }
        state.loaded = Some(program);
        Ok(())
    }

    /// Attach an analyzer result so the snapshot carries an ETA
    pub async fn set_reference_analysis(&self, analysis: AnalysisResult) {
        self.shared.state.write().analysis = Some(analysis);
    }

    /// Start streaming the loaded program
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if state.printer_state != PrinterState::Operational {
                return Err(state.refusal("start"));
            }
            let Some(program) = state.loaded.clone() else {
                return Err(ProtocolError::NoProgram.into());
            };
            let total_lines = program.len();
            state.job = Some(PrintJob::new(program));
            state.printer_state = PrinterState::Printing;
            state.elapsed_accum = Duration::ZERO;
            state.run_since = Some(Instant::now());
            state.resend_line = None;
            state.resend_count = 0;
            state.cancel_pending = false;
            state.last_progress = JobProgress {
                total_lines,
                ..JobProgress::default()
            };
        }
        self.shared.notify(EngineEvent::State(PrinterState::Printing));
        tracing::info!("print started");
        Ok(())
    }

    /// Suspend streaming; unsolicited output is still serviced
    pub async fn pause(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if state.printer_state != PrinterState::Printing {
                return Err(state.refusal("pause"));
            }
            state.printer_state = PrinterState::Paused;
            state.fold_elapsed();
            state.paused_e = if state.relative_e {
                None
            } else {
                state.last_absolute_e
            };
        }
        self.shared.notify(EngineEvent::State(PrinterState::Paused));
        tracing::info!("print paused");
        Ok(())
    }

    /// Resume a paused print
    pub async fn resume(&self) -> Result<()> {
        let restore_e = {
            let mut state = self.shared.state.write();
            if state.printer_state != PrinterState::Paused {
                return Err(state.refusal("resume"));
            }
            state.printer_state = PrinterState::Printing;
            state.run_since = Some(Instant::now());
            state.paused_e.take()
        };
        if let Some(e) = restore_e {
            // Re-anchor absolute E in case manual extrusion or a G92
            // straddled the pause
            self.shared
                .queue
                .lock()
                .push(format!("G92 E{:.5}", e), CommandPriority::Control);
        }
        self.shared.notify(EngineEvent::State(PrinterState::Printing));
        tracing::info!("print resumed");
        Ok(())
    }

    /// Abandon the print: discard the remainder of the program, disable
    /// steppers and heaters, return to OPERATIONAL once those ack
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if !state.printer_state.is_busy() {
                return Err(state.refusal("cancel"));
            }
            state.job = None;
            state.fold_elapsed();
            state.run_since = None;
            state.cancel_pending = true;
        }
        let mut queue = self.shared.queue.lock();
        queue.clear_user();
        queue.push("M84", CommandPriority::Control);
        queue.push("M104 S0", CommandPriority::Control);
        queue.push("M140 S0", CommandPriority::Control);
        tracing::info!("print cancelled");
        Ok(())
    }

    /// Enqueue an arbitrary GCODE line
    ///
    /// `M112` jumps the queue. The command goes out unnumbered after at
    /// most one in-flight program line.
    pub async fn command(&self, line: impl Into<String>) -> Result<()> {
        let body = line.into();
        let state = self.shared.state.read();
        if !state.printer_state.is_connected() {
            return Err(state.refusal("command"));
        }
        drop(state);

        let priority = if body.trim_start().starts_with("M112") {
            CommandPriority::Emergency
        } else {
            CommandPriority::User
        };
        if !self.shared.queue.lock().push(body, priority) {
            return Err(ProtocolError::Other {
                message: "command queue full".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Set a hotend target temperature
    pub async fn set_temperature(&self, heater: HeaterKey, target: f64) -> Result<()> {
        let body = match heater {
            HeaterKey::Bed => format!("M140 S{}", target),
            HeaterKey::Tool(i) => {
                let current = self.shared.state.read().current_tool;
                if i == current {
                    format!("M104 S{}", target)
                } else {
                    format!("M104 T{} S{}", i, target)
                }
            }
        };
        self.command(body).await
    }

    /// Set the heated bed target temperature
    pub async fn set_bed_temperature(&self, target: f64) -> Result<()> {
        self.set_temperature(HeaterKey::Bed, target).await
    }

    /// Scale the `F` parameter of lines carrying the given `;TYPE:` tag
    ///
    /// A ratio of 1.0 removes the override.
    pub async fn set_feedrate_modifier(&self, type_tag: impl Into<String>, ratio: f64) -> Result<()> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(ProtocolError::Other {
                message: format!("feedrate ratio must be positive, got {}", ratio),
            }
            .into());
        }
        let tag = type_tag.into();
        let mut state = self.shared.state.write();
        if (ratio - 1.0).abs() < f64::EPSILON {
            state.feed_modifiers.remove(&tag);
        } else {
            state.feed_modifiers.insert(tag, ratio);
        }
        Ok(())
    }

    /// Register a listener for engine events
    pub fn subscribe(&self, listener: Arc<dyn PrinterListener>) -> PrinterListenerHandle {
        let id = Uuid::new_v4().to_string();
        self.shared.listeners.write().insert(id.clone(), listener);
        PrinterListenerHandle(id)
    }

    /// Remove a previously registered listener
    pub fn unsubscribe(&self, handle: PrinterListenerHandle) {
        self.shared.listeners.write().remove(&handle.0);
    }

    /// Current engine state
    pub fn state(&self) -> PrinterState {
        self.shared.state.read().printer_state
    }

    /// Consistent observable snapshot
    pub fn snapshot(&self) -> PrinterSnapshot {
        let state = self.shared.state.read();
        PrinterSnapshot {
            state: state.printer_state,
            firmware: state.flavor.kind(),
            progress: state.progress(),
            temperatures: state.temperatures.clone(),
            temperature_history: state.temperature_history.iter().cloned().collect(),
            log: state.log.iter().cloned().collect(),
            error: state.latched_error.clone(),
        }
    }
}

impl Drop for PrintEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor loop
// ---------------------------------------------------------------------------

fn monitor_loop(shared: Arc<Shared>, shutdown: AbortFlag, mut transport: Box<dyn Transport>) {
    tracing::debug!("monitor loop running on {}", transport.name());

    while !shutdown.load(Ordering::SeqCst) {
        // 1. READ PHASE
        let mut idle = false;
        match transport.read_line() {
            Ok(Some(line)) => handle_received(&shared, &line),
            Ok(None) => idle = true,
            Err(e) => {
                shared.latch_error(e);
                idle = true;
            }
        }

        // 2. HEARTBEAT PHASE
        check_heartbeat(&shared, transport.as_mut());

        // 3. COMMAND PHASE: injected commands go out between program lines
        send_queued(&shared, transport.as_mut());

        // 4. PROGRAM PHASE
        send_program_line(&shared, transport.as_mut());

        // 5. CANCEL COMPLETION
        finish_cancel(&shared);

        if idle {
            std::thread::sleep(IDLE_LOOP_DELAY);
        }
    }

    transport.close();
    tracing::debug!("monitor loop stopped");
}

fn handle_received(shared: &Arc<Shared>, line: &str) {
    shared.log_line(LogEntry::incoming(line));

    let (response, was_connecting) = {
        let mut state = shared.state.write();
        state.last_rx = Instant::now();
        state.heartbeat_failures = 0;

        if let Some(kind) = FirmwareDetector::detect(line) {
            if kind != state.flavor.kind() && kind != FirmwareKind::Unknown {
                tracing::info!("firmware detected: {}", kind);
                state.flavor = flavor_for(kind);
            }
        }

        let response = classify(line, state.flavor.as_ref(), state.current_tool);
        (response, state.printer_state == PrinterState::Connecting)
    };

    match response {
        Response::Ack { temperatures } => {
            if let Some(snapshot) = temperatures {
                apply_temperatures(shared, snapshot);
            }
            handle_ack(shared, was_connecting);
        }
        Response::Temperature(snapshot) => {
            apply_temperatures(shared, snapshot);
            if was_connecting {
                become_operational(shared);
            }
        }
        Response::Resend(line_number) => handle_resend(shared, line_number),
        Response::Boot => {
            let printing = shared.state.read().printer_state == PrinterState::Printing;
            if printing {
                shared.latch_error(
                    ProtocolError::ResetDuringPrint {
                        banner: line.to_string(),
                    }
                    .into(),
                );
            } else if was_connecting {
                become_operational(shared);
            } else {
                tracing::warn!("unexpected boot banner: {}", line);
            }
        }
        Response::Wait | Response::Busy => {
            // Keepalives only reset the heartbeat clock, already done above
        }
        Response::Fault(fault) => {
            if fault.fatal {
                shared.latch_error(
                    ProtocolError::FirmwareFatal {
                        message: fault.message,
                    }
                    .into(),
                );
            } else {
                tracing::warn!("firmware error: {}", fault.message);
            }
        }
        Response::Other => {
            tracing::debug!("recv: {}", line);
        }
    }
}

fn become_operational(shared: &Arc<Shared>) {
    let mut state = shared.state.write();
    if state.printer_state == PrinterState::Connecting {
        state.printer_state = PrinterState::Operational;
        drop(state);
        shared.notify(EngineEvent::State(PrinterState::Operational));
        tracing::info!("printer online");
    }
}

fn apply_temperatures(shared: &Arc<Shared>, snapshot: TemperatureSnapshot) {
    let depth = shared.config.protocol.temperature_history;
    shared
        .state
        .write()
        .push_temperatures(snapshot.clone(), depth);
    shared.notify(EngineEvent::Temp(snapshot));
}

fn handle_ack(shared: &Arc<Shared>, was_connecting: bool) {
    if was_connecting {
        become_operational(shared);
    }

    let mut finished = false;
    let mut progress = None;
    {
        let mut state = shared.state.write();
        match state.in_flight.take() {
            Some(InFlight::Program(n)) => {
                if let Some(job) = state.job.as_mut() {
                    job.cursor.mark_acked(n);
                    if job.cursor.is_complete() {
                        finished = true;
                    }
                }
                let current = state.progress();
                state.last_progress = current;
                if finished {
                    state.job = None;
                    state.fold_elapsed();
                    state.printer_state = PrinterState::Operational;
                }
                progress = Some(current);
            }
            Some(InFlight::Command(_)) | None => {}
        }
    }

    if let Some(progress) = progress {
        shared.notify(EngineEvent::Progress(progress));
    }
    if finished {
        shared.notify(EngineEvent::State(PrinterState::Operational));
        tracing::info!("print complete");
    }
}

fn handle_resend(shared: &Arc<Shared>, line_number: usize) {
    let max_attempts = shared.config.protocol.max_resend_attempts;
    let mut error = None;
    {
        let mut state = shared.state.write();
        let Some(job) = state.job.as_mut() else {
            tracing::warn!("resend request for line {} with no job", line_number);
            return;
        };
        if line_number > job.cursor.sent() {
            tracing::warn!(
                "resend for line {} beyond sent watermark {}",
                line_number,
                job.cursor.sent()
            );
            return;
        }

        if state.resend_line == Some(line_number) {
            state.resend_count += 1;
        } else {
            state.resend_line = Some(line_number);
            state.resend_count = 1;
        }

        if state.resend_count >= max_attempts {
            error = Some(ProtocolError::ResendLoop {
                line_number,
                attempts: state.resend_count,
            });
        } else {
            tracing::debug!(
                "rewinding to line {} (request {} for it)",
                line_number,
                state.resend_count
            );
            if let Some(job) = state.job.as_mut() {
                job.cursor.rewind(line_number);
            }
            state.in_flight = None;
        }
    }
    if let Some(err) = error {
        shared.latch_error(err.into());
    }
}

fn check_heartbeat(shared: &Arc<Shared>, transport: &mut dyn Transport) {
    let probe = {
        let mut state = shared.state.write();
        let waiting = state.printer_state == PrinterState::Connecting
            || (state.in_flight.is_some()
                && matches!(
                    state.printer_state,
                    PrinterState::Operational | PrinterState::Printing | PrinterState::Paused
                ));
        if !waiting {
            return;
        }

        let timeout = Duration::from_millis(shared.config.protocol.ack_timeout_ms);
        if state.last_rx.elapsed() < timeout {
            return;
        }

        state.heartbeat_failures += 1;
        state.last_rx = Instant::now();
        if state.heartbeat_failures >= shared.config.protocol.max_heartbeat_failures {
            Err(ProtocolError::HeartbeatTimeout {
                probes: state.heartbeat_failures,
            })
        } else {
            tracing::warn!(
                "no reply for {:?}, probing ({}/{})",
                timeout,
                state.heartbeat_failures,
                shared.config.protocol.max_heartbeat_failures
            );
            Ok(())
        }
    };

    match probe {
        Ok(()) => {
            send_raw(shared, transport, "M105");
        }
        Err(err) => shared.latch_error(err.into()),
    }
}

fn send_queued(shared: &Arc<Shared>, transport: &mut dyn Transport) {
    let command: Option<QueuedCommand> = {
        let state = shared.state.read();
        if state.in_flight.is_some() {
            None
        } else {
            match state.printer_state {
                PrinterState::Error => shared.queue.lock().pop_emergency(),
                PrinterState::Connecting
                | PrinterState::Operational
                | PrinterState::Printing
                | PrinterState::Paused => shared.queue.lock().pop(),
                _ => None,
            }
        }
    };

    let Some(command) = command else { return };
    inspect_outgoing(shared, &command.body);
    if send_raw(shared, transport, &command.body) {
        shared.state.write().in_flight = Some(InFlight::Command(command.body));
    }
}

/// One decision of the program send phase
enum SendAction {
    /// Transmit a framed line
    Send { framed: String, line_number: usize },
    /// `M0`/`M1` reached: hold in PAUSED without forwarding it
    Pause { line_number: usize },
    /// Empty slot skipped; look at the next one
    Skip,
    /// Nothing to do this iteration
    Done,
}

fn send_program_line(shared: &Arc<Shared>, transport: &mut dyn Transport) {
    loop {
        let action = next_send_action(shared);
        match action {
            SendAction::Done => return,
            SendAction::Skip => continue,
            SendAction::Pause { line_number } => {
                shared.notify(EngineEvent::State(PrinterState::Paused));
                tracing::info!("program stop at line {}, holding for resume", line_number);
                return;
            }
            SendAction::Send { framed, line_number } => {
                // Inspect the canonical body (between "N<n> " and "*")
                if let Some(body) = unframe(&framed) {
                    inspect_outgoing(shared, body);
                }
                if send_raw(shared, transport, &framed) {
                    shared.state.write().in_flight = Some(InFlight::Program(line_number));
                }
                return;
            }
        }
    }
}

fn next_send_action(shared: &Arc<Shared>) -> SendAction {
    let mut state = shared.state.write();
    if state.printer_state != PrinterState::Printing || state.in_flight.is_some() {
        return SendAction::Done;
    }

    // Each job leads with its own line-counter reset
    let needs_reset = matches!(&state.job, Some(job) if !job.reset_sent);
    if needs_reset {
        let Some(job) = state.job.as_mut() else {
            return SendAction::Done;
        };
        job.reset_sent = true;
        let Some(slot) = job.program.line(0) else {
            return SendAction::Done;
        };
        let framed = frame(0, slot.body());
        job.framed[0] = Some(framed.clone());
        job.cursor.mark_sent(0);
        return SendAction::Send {
            framed,
            line_number: 0,
        };
    }

    let (n, parsed, cached) = {
        let Some(job) = state.job.as_ref() else {
            return SendAction::Done;
        };
        let Some(n) = job.cursor.next_line() else {
            // Everything sent; completion happens on the final ack
            return SendAction::Done;
        };
        let Some(slot) = job.program.line(n) else {
            return SendAction::Done;
        };
        (n, slot.parsed.clone(), job.framed[n].clone())
    };

    if parsed.is_empty() {
        // Nothing to transmit; advance as if acked
        if let Some(job) = state.job.as_mut() {
            job.cursor.mark_sent(n);
            job.cursor.mark_acked(n);
            job.cursor.advance();
        }
        return SendAction::Skip;
    }

    if parsed.code.is_m(0) || parsed.code.is_m(1) {
        // Host-side stop: the firmware's own hold is bypassed so the UI
        // stays responsive
        if let Some(job) = state.job.as_mut() {
            job.cursor.mark_sent(n);
            job.cursor.mark_acked(n);
            job.cursor.advance();
        }
        state.printer_state = PrinterState::Paused;
        state.fold_elapsed();
        state.paused_e = if state.relative_e {
            None
        } else {
            state.last_absolute_e
        };
        return SendAction::Pause { line_number: n };
    }

    let framed = match cached {
        // A resend replays the original bytes even if a modifier changed
        Some(existing) => existing,
        None => {
            let ratio = parsed
                .type_tag
                .as_deref()
                .and_then(|tag| state.feed_modifiers.get(tag).copied());
            let body = match ratio {
                Some(ratio) => parsed.body_with_feedrate_ratio(ratio),
                None => parsed.body.clone(),
            };
            let framed = frame(n, &body);
            if let Some(job) = state.job.as_mut() {
                job.framed[n] = Some(framed.clone());
            }
            framed
        }
    };

    if let Some(job) = state.job.as_mut() {
        job.cursor.mark_sent(n);
        job.cursor.advance();
    }
    SendAction::Send {
        framed,
        line_number: n,
    }
}

/// Borrow the body back out of a framed line
fn unframe(framed: &str) -> Option<&str> {
    let after_n = framed.split_once(' ')?.1;
    after_n.rsplit_once('*').map(|(body, _)| body)
}

/// Track stream state the receive side depends on: the selected tool for
/// temperature canonicalization, setpoints for the UI, E bookkeeping for
/// the pause/resume restore
fn inspect_outgoing(shared: &Arc<Shared>, body: &str) {
    let parsed = parse_line(body).line;
    let mut state = shared.state.write();
    let mut setpoint: Option<(HeaterKey, f64)> = None;

    match parsed.code {
        CommandCode::T(n) => state.current_tool = n,
        CommandCode::M(104) | CommandCode::M(109) => {
            if let Some(s) = parsed.param('S') {
                // The tool index rides in a T word, which the scanner
                // reserves for tool-change codes; read it off the text
                let tool = body
                    .split_whitespace()
                    .skip(1)
                    .find_map(|word| word.strip_prefix('T')?.parse::<u8>().ok())
                    .unwrap_or(state.current_tool);
                setpoint = Some((HeaterKey::Tool(tool), s));
            }
        }
        CommandCode::M(140) | CommandCode::M(190) => {
            if let Some(s) = parsed.param('S') {
                setpoint = Some((HeaterKey::Bed, s));
            }
        }
        CommandCode::M(82) => state.relative_e = false,
        CommandCode::M(83) => state.relative_e = true,
        CommandCode::G(92) => {
            if let Some(e) = parsed.param('E') {
                state.last_absolute_e = Some(e);
            }
        }
        _ => {}
    }

    if !state.relative_e {
        if let Some(e) = parsed.param('E') {
            if matches!(parsed.code, CommandCode::G(0) | CommandCode::G(1)) {
                state.last_absolute_e = Some(e);
            }
        }
    }

    if let Some((heater, target)) = setpoint {
        let entry = state
            .temperatures
            .entry(heater)
            .or_insert_with(TemperatureReading::default);
        entry.target = Some(target);
        let snapshot = state.temperatures.clone();
        drop(state);
        shared.notify(EngineEvent::Temp(snapshot));
    }
}

fn send_raw(shared: &Arc<Shared>, transport: &mut dyn Transport, line: &str) -> bool {
    match transport.send_line(line) {
        Ok(()) => {
            shared.log_line(LogEntry::outgoing(line));
            true
        }
        Err(e) => {
            shared.latch_error(e);
            false
        }
    }
}

fn finish_cancel(shared: &Arc<Shared>) {
    let done = {
        let state = shared.state.read();
        state.cancel_pending
            && state.in_flight.is_none()
            && state.printer_state.is_busy()
            && shared.queue.lock().is_empty()
    };
    if !done {
        return;
    }
    {
        let mut state = shared.state.write();
        state.cancel_pending = false;
        state.printer_state = PrinterState::Operational;
    }
    shared.notify(EngineEvent::State(PrinterState::Operational));
}
