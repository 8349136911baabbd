//! End-to-end engine scenarios against a scripted mock printer.

use parking_lot::Mutex;
use printkit_communication::{PrintEngine, Transport};
use printkit_core::{
    HeaterKey, LogEntry, PrinterListener, PrinterState, Result, TemperatureSnapshot,
};
use printkit_gcode::{checksum, Program};
use printkit_settings::Config;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared side of the mock: what the engine sent, what it will read next
#[derive(Default)]
struct MockIo {
    sent: Mutex<Vec<String>>,
    inbox: Mutex<VecDeque<String>>,
}

impl MockIo {
    fn push_incoming(&self, line: &str) {
        self.inbox.lock().push_back(line.to_string());
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn sent_matching(&self, prefix: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }
}

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// A printer on the other end of the wire, scripted per scenario
struct MockPrinter {
    io: Arc<MockIo>,
    responder: Option<Responder>,
}

impl MockPrinter {
    fn new(responder: Option<Responder>) -> (Box<Self>, Arc<MockIo>) {
        let io = Arc::new(MockIo::default());
        (
            Box::new(Self {
                io: io.clone(),
                responder,
            }),
            io,
        )
    }
}

impl Transport for MockPrinter {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        self.io.sent.lock().push(line.to_string());
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(line);
            let mut inbox = self.io.inbox.lock();
            for reply in replies {
                inbox.push_back(reply);
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.io.inbox.lock().pop_front())
    }

    fn close(&mut self) {}
}

/// Acks everything; answers `M115` with a Marlin identification and
/// program frames per the per-scenario hook
fn marlin_responder(
    mut on_frame: impl FnMut(&str) -> Option<Vec<String>> + Send + 'static,
) -> Responder {
    Box::new(move |line: &str| {
        if line.starts_with("M115") {
            return vec![
                "FIRMWARE_NAME:Marlin 2.1.2 (Jun 10 2024)".to_string(),
                "ok".to_string(),
            ];
        }
        if line.starts_with('N') {
            if let Some(replies) = on_frame(line) {
                return replies;
            }
        }
        vec!["ok".to_string()]
    })
}

/// Records every listener callback as a line of text
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl PrinterListener for RecordingListener {
    async fn on_state(&self, new_state: PrinterState) {
        self.events.lock().push(format!("state:{}", new_state));
    }

    async fn on_temp(&self, snapshot: &TemperatureSnapshot) {
        self.events.lock().push(format!("temp:{}", snapshot.len()));
    }

    async fn on_log(&self, _entry: &LogEntry) {}

    async fn on_error(&self, message: &str) {
        self.events.lock().push(format!("error:{}", message));
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn test_config() -> Config {
    Config::default()
}

const PROGRAM: &str = "G28\nG1 X10 F600\nG1 X20\n";

#[tokio::test]
async fn full_print_reaches_operational_with_every_line_acked() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|_| None)));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    let listener = Arc::new(RecordingListener::default());
    engine.subscribe(listener.clone());

    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.load(Program::from_text(PROGRAM).unwrap()).await.unwrap();
    engine.start().await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    // Four numbered lines went out: the injected M110 plus the program
    let frames = io.sent_matching("N");
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0], format!("N0 M110 N0*{}", checksum("N0 M110 N0")));
    assert_eq!(frames[1], "N1 G28*18");
    assert_eq!(
        frames[2],
        format!("N2 G1 X10 F600*{}", checksum("N2 G1 X10 F600"))
    );
    assert_eq!(frames[3], format!("N3 G1 X20*{}", checksum("N3 G1 X20")));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.progress.fraction, 1.0);
    assert_eq!(snapshot.progress.current_line, 3);
    assert!(snapshot.error.is_none());

    // Listener notifications are dispatched async; wait them in
    assert!(wait_until(
        || {
            let events = listener.events.lock();
            let states: Vec<&String> =
                events.iter().filter(|e| e.starts_with("state:")).collect();
            states.contains(&&"state:Printing".to_string())
                && states.last().is_some_and(|s| s.as_str() == "state:Operational")
        },
        1000
    )
    .await);

    engine.disconnect().await.unwrap();
    assert_eq!(engine.state(), PrinterState::Closed);
}

#[tokio::test]
async fn resend_replays_identical_frame() {
    let asked = Arc::new(Mutex::new(false));
    let asked_hook = asked.clone();
    let (printer, io) = MockPrinter::new(Some(marlin_responder(move |frame| {
        if frame.starts_with("N2 ") && !*asked_hook.lock() {
            *asked_hook.lock() = true;
            return Some(vec!["Resend: 2".to_string(), "ok".to_string()]);
        }
        None
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.load(Program::from_text(PROGRAM).unwrap()).await.unwrap();
    engine.start().await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    let second_line: Vec<String> = io.sent_matching("N2 ");
    assert_eq!(second_line.len(), 2);
    assert_eq!(second_line[0], second_line[1]);

    // The stream still ends complete
    assert_eq!(engine.snapshot().progress.fraction, 1.0);
}

#[tokio::test]
async fn repeated_resends_for_one_line_latch_error() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame
            .starts_with("N2 ")
            .then(|| vec!["Resend: 2".to_string(), "ok".to_string()])
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.load(Program::from_text(PROGRAM).unwrap()).await.unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| engine.state() == PrinterState::Error, 2000).await);
    let error = engine.snapshot().error.unwrap();
    assert!(error.contains("resent"), "unexpected error: {}", error);
}

#[tokio::test]
async fn fatal_firmware_error_stops_the_stream() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame
            .starts_with("N1 ")
            .then(|| vec!["Error: MINTEMP triggered, system stopped!".to_string()])
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    let listener = Arc::new(RecordingListener::default());
    engine.subscribe(listener.clone());

    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.load(Program::from_text(PROGRAM).unwrap()).await.unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| engine.state() == PrinterState::Error, 2000).await);

    // The listener saw the verbatim firmware text and no further program
    // lines went out
    assert!(wait_until(
        || listener
            .events
            .lock()
            .iter()
            .any(|e| e.starts_with("error:") && e.contains("MINTEMP")),
        1000
    )
    .await);
    assert!(io.sent_matching("N2 ").is_empty());

    // Latched until an explicit disconnect/connect cycle
    assert!(engine.start().await.is_err());
}

#[tokio::test]
async fn silence_after_connect_exhausts_heartbeats() {
    let (printer, io) = MockPrinter::new(None);

    let mut config = test_config();
    config.protocol.ack_timeout_ms = 50;

    let engine = PrintEngine::new(config);
    engine.connect_with(printer).await.unwrap();

    assert!(wait_until(|| engine.state() == PrinterState::Error, 2000).await);

    // Two probes went out before the third timeout latched the fault
    assert_eq!(io.sent_matching("M105").len(), 2);
    let error = engine.snapshot().error.unwrap();
    assert!(error.contains("heartbeat"), "unexpected error: {}", error);
}

#[tokio::test]
async fn busy_keepalives_defer_the_heartbeat() {
    // The first program line answers with busy chatter before its ok;
    // the keepalives must neither ack nor trip the 80 ms heartbeat
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame.starts_with("N1 ").then(Vec::new)
    })));
    io.push_incoming("start");

    let mut config = test_config();
    config.protocol.ack_timeout_ms = 80;

    let engine = PrintEngine::new(config);
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine
        .load(Program::from_text("G28\nG1 X0\n").unwrap())
        .await
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| !io.sent_matching("N1 ").is_empty(), 2000).await);

    // Feed busy lines for ~300 ms, each inside the timeout window
    for _ in 0..6 {
        io.push_incoming("echo:busy: processing");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(engine.state(), PrinterState::Printing);
    assert!(io.sent_matching("M105").is_empty());
    // Still exactly one transmission of the line, no resend
    assert_eq!(io.sent_matching("N1 ").len(), 1);

    io.push_incoming("ok");
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);
    assert_eq!(io.sent_matching("N2 ").len(), 1);
}

#[tokio::test]
async fn boot_banner_mid_print_is_fatal() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame.starts_with("N2 ").then(|| vec!["start".to_string()])
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.load(Program::from_text(PROGRAM).unwrap()).await.unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| engine.state() == PrinterState::Error, 2000).await);
    assert!(engine.snapshot().error.unwrap().contains("reset"));
}

#[tokio::test]
async fn unsolicited_temperatures_update_without_acking() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame.starts_with("N1 ").then(Vec::new)
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine
        .load(Program::from_text("G28\nG1 X0\n").unwrap())
        .await
        .unwrap();
    engine.start().await.unwrap();
    assert!(wait_until(|| !io.sent_matching("N1 ").is_empty(), 2000).await);

    // Heat-wait style report: temperature only, no ack
    io.push_incoming("T:142.5 /210.0");
    assert!(wait_until(
        || {
            engine
                .snapshot()
                .temperatures
                .get(&HeaterKey::Tool(0))
                .is_some_and(|r| r.actual == 142.5)
        },
        1000
    )
    .await);

    // The in-flight line is still unacked, so N2 must not have gone out
    assert!(io.sent_matching("N2 ").is_empty());
    assert_eq!(engine.state(), PrinterState::Printing);
}

#[tokio::test]
async fn program_stop_holds_in_paused_without_forwarding() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|_| None)));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine
        .load(Program::from_text("G28\nM0\nG1 X5 F600\n").unwrap())
        .await
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| engine.state() == PrinterState::Paused, 2000).await);
    assert!(io.sent().iter().all(|l| !l.contains("M0")));
    assert!(io.sent_matching("N3 ").is_empty());

    engine.resume().await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);
    assert_eq!(io.sent_matching("N3 ").len(), 1);
}

#[tokio::test]
async fn pause_freezes_elapsed_time() {
    // The line after G28 never acks, so the print sits in flight while
    // the clock runs
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|frame| {
        frame.starts_with("N2 ").then(Vec::new)
    })));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine
        .load(Program::from_text("G28\nG4 S10\nG1 X5 F600\n").unwrap())
        .await
        .unwrap();
    engine.start().await.unwrap();
    assert!(wait_until(|| !io.sent_matching("N2 ").is_empty(), 2000).await);

    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.pause().await.unwrap();
    let frozen = engine.snapshot().progress.elapsed_secs;
    assert!(frozen > 0.0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let still = engine.snapshot().progress.elapsed_secs;
    assert!((still - frozen).abs() < 0.02, "elapsed advanced while paused");

    engine.resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(engine.snapshot().progress.elapsed_secs > still);
}

#[tokio::test]
async fn cancel_cleans_up_and_returns_to_operational() {
    // Manual pumping: the test acks each line itself so it can interleave
    // the cancel mid-stream
    let (printer, io) = MockPrinter::new(None);
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();

    // Ack the connect-time M110/M115 by hand
    assert!(wait_until(|| !io.sent_matching("M110").is_empty(), 2000).await);
    io.push_incoming("ok");
    assert!(wait_until(|| !io.sent_matching("M115").is_empty(), 2000).await);
    io.push_incoming("ok");
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    let program = "G28\nG1 X1 F600\nG1 X2\nG1 X3\nG1 X4\nG1 X5\n";
    engine.load(Program::from_text(program).unwrap()).await.unwrap();
    engine.start().await.unwrap();

    assert!(wait_until(|| !io.sent_matching("N0 ").is_empty(), 2000).await);
    io.push_incoming("ok");
    assert!(wait_until(|| !io.sent_matching("N1 ").is_empty(), 2000).await);

    engine.cancel().await.unwrap();
    io.push_incoming("ok"); // ack of N1 lands after the cancel

    for expected in ["M84", "M104 S0", "M140 S0"] {
        assert!(
            wait_until(|| io.sent().iter().any(|l| l == expected), 2000).await,
            "missing {}",
            expected
        );
        io.push_incoming("ok");
    }

    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);
    // The remainder of the program was discarded
    assert!(io.sent_matching("N3 ").is_empty());
}

#[tokio::test]
async fn feedrate_modifier_scales_tagged_lines() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|_| None)));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.set_feedrate_modifier("FILL", 0.5).await.unwrap();
    let program = "G28\n;TYPE:FILL\nG1 X10 F1200\n";
    engine.load(Program::from_text(program).unwrap()).await.unwrap();
    engine.start().await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    // Slot 2 is the ;TYPE: comment (empty), slot 3 the scaled move
    let frames = io.sent_matching("N3 ");
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0],
        format!("N3 G1 X10 F600*{}", checksum("N3 G1 X10 F600"))
    );
}

#[tokio::test]
async fn temperature_setters_update_setpoints_on_send() {
    let (printer, io) = MockPrinter::new(Some(marlin_responder(|_| None)));
    io.push_incoming("start");

    let engine = PrintEngine::new(test_config());
    engine.connect_with(printer).await.unwrap();
    assert!(wait_until(|| engine.state() == PrinterState::Operational, 2000).await);

    engine.set_temperature(HeaterKey::Tool(0), 210.0).await.unwrap();
    engine.set_bed_temperature(60.0).await.unwrap();

    assert!(wait_until(|| io.sent().iter().any(|l| l == "M104 S210"), 2000).await);
    assert!(wait_until(|| io.sent().iter().any(|l| l == "M140 S60"), 2000).await);

    assert!(wait_until(
        || {
            let temps = engine.snapshot().temperatures;
            temps
                .get(&HeaterKey::Tool(0))
                .is_some_and(|r| r.target == Some(210.0))
                && temps.get(&HeaterKey::Bed).is_some_and(|r| r.target == Some(60.0))
        },
        2000
    )
    .await);
}
