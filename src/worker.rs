//! Connection/acquisition state machine.
//!
//! One background worker owns the transport and both decoders. The control side
//! ([`Connection`]) only touches the shared record (state, command queue, data
//! format, run flag), always under its mutex. Everything the worker observes is
//! reported as an [`Event`] over an mpsc channel.
//!
//! ```text
//! idle --connect--> ready --ack start--> acquiring
//!                     ^                      |
//!                     +--end / ack stop------+
//! any --disconnect / I/O error--> idle
//! ```

use std::collections::VecDeque;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ascii::{split_command, AsciiDecoder};
use crate::batch::{AckLine, DecodedBatch};
use crate::binary::BinaryDecoder;
use crate::commands::{Command, DataFormat, PendingCommand};
use crate::errors::Result;
use crate::serial::{self, Transport};

/// Prompt the device shell prepends to response lines.
const PROMPT: &str = "PowerShield > ";

/// Sleep between polls when no bytes are pending.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Upper bound for one read.
const READ_CHUNK: usize = 65_536;

/// How long `disconnect` waits for the worker to exit.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Ready,
    Acquiring,
}

/// Notifications for the UI/consumer side.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connection { connected: bool, message: String },
    /// Console line: traffic (`>>`/`<<`) and status markers.
    Log(String),
    CommandResult(AckLine),
    /// Telemetry batch with at least one sample, timestamp, error or flag.
    Data(DecodedBatch),
    /// `true` when an acquisition starts, `false` when it ends.
    Acquisition(bool),
}

#[derive(Debug, Default)]
struct Shared {
    state: ConnectionState,
    queue: VecDeque<PendingCommand>,
    format: DataFormat,
    keep_running: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-owned decoding state for one connection.
struct Session {
    /// Raw response bytes not yet split into lines (ready state).
    response: Vec<u8>,
    ascii: AsciiDecoder,
    binary: BinaryDecoder,
    /// Name of the last command written, until its ack/err arrives.
    pending: Option<String>,
    /// Decoder selected when the running acquisition started.
    active: Option<DataFormat>,
    events: Sender<Event>,
}

impl Session {
    fn new(events: Sender<Event>) -> Self {
        Self {
            response: Vec::new(),
            ascii: AsciiDecoder::new(),
            binary: BinaryDecoder::new(),
            pending: None,
            active: None,
            events,
        }
    }

    fn emit(&self, event: Event) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.events.send(event);
    }

    fn log(&self, line: String) {
        self.emit(Event::Log(line));
    }

    fn sent(&mut self, cmd: &PendingCommand) {
        let display = String::from_utf8_lossy(&cmd.bytes).trim().to_string();
        debug!(">> {}", display);
        self.log(format!(">> {display}"));
        self.pending = Some(cmd.name.clone());
    }

    /// Route bytes read from the transport according to the current state.
    fn handle_bytes(&mut self, raw: &[u8], shared: &Mutex<Shared>) {
        let state = lock(shared).state;
        match (state, self.active) {
            (ConnectionState::Ready, _) => self.handle_response(raw, shared),
            (ConnectionState::Acquiring, Some(format)) => {
                self.handle_acquisition(raw, format, shared)
            }
            (ConnectionState::Acquiring, None) => {
                warn!("acquiring without an active decoder, treating bytes as responses");
                self.handle_response(raw, shared)
            }
            (ConnectionState::Idle, _) => {
                debug!("dropping {} bytes received while idle", raw.len())
            }
        }
    }

    fn handle_response(&mut self, raw: &[u8], shared: &Mutex<Shared>) {
        self.response.extend_from_slice(raw);

        let mut cursor = 0;
        while let Some(offset) = self.response[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            let text = String::from_utf8_lossy(&self.response[cursor..end]);
            let line = text.trim_end_matches('\r').to_string();
            cursor = end + 1;

            if line.is_empty() {
                continue;
            }
            debug!("<< {}", line);
            self.log(format!("<< {line}"));

            let Some(result) = parse_response(&line) else {
                continue;
            };
            let started = result.success && result.command == "start";
            self.report(result);

            if started {
                // The device may already be streaming behind the ack line.
                let leftover = self.response.split_off(cursor);
                self.response.clear();
                let format = self.begin_acquisition(shared);
                if !leftover.is_empty() {
                    self.handle_acquisition(&leftover, format, shared);
                }
                return;
            }
        }

        self.response.drain(..cursor);
    }

    fn handle_acquisition(&mut self, raw: &[u8], format: DataFormat, shared: &Mutex<Shared>) {
        let mut batch = match format {
            DataFormat::AsciiDec => self.ascii.feed(raw),
            DataFormat::BinHexa => self.binary.feed(raw),
        };

        for line in &batch.raw_lines {
            if line.starts_with("ack ") || line.starts_with("err ") {
                self.log(format!("<< {line}"));
            }
        }
        for err in &batch.errors {
            warn!("stream error: {}", err);
            self.log(format!("[Stream error] {err}"));
        }

        let acks = std::mem::take(&mut batch.acks);
        let ended = batch.end_of_acquisition;
        let overcurrent = batch.overcurrent;
        if batch.has_data() {
            self.emit(Event::Data(batch));
        }

        let mut stopped = false;
        for ack in acks {
            stopped |= ack.success && ack.command == "stop";
            self.report(ack);
        }

        if overcurrent {
            warn!("overcurrent detected");
            self.log("[WARNING] Overcurrent detected!".to_string());
        }

        if ended || stopped {
            self.end_acquisition(format, shared);
        }
    }

    fn begin_acquisition(&mut self, shared: &Mutex<Shared>) -> DataFormat {
        let format = {
            let mut s = lock(shared);
            s.state = ConnectionState::Acquiring;
            s.format
        };
        self.ascii.reset();
        self.binary.reset();
        self.active = Some(format);
        info!("acquisition started ({})", format);
        self.emit(Event::Acquisition(true));
        self.log("[Acquisition started]".to_string());
        format
    }

    fn end_acquisition(&mut self, format: DataFormat, shared: &Mutex<Shared>) {
        let leftover = match format {
            DataFormat::AsciiDec => self.ascii.take_pending(),
            DataFormat::BinHexa => self.binary.take_pending(),
        };
        lock(shared).state = ConnectionState::Ready;
        self.active = None;
        self.response.clear();

        info!("acquisition ended");
        self.emit(Event::Acquisition(false));
        self.log("[Acquisition ended]".to_string());

        // Whatever followed the end marker is command-response traffic again.
        if !leftover.is_empty() {
            self.handle_response(&leftover, shared);
        }
    }

    fn report(&mut self, mut result: AckLine) {
        if result.command.is_empty() {
            if let Some(pending) = &self.pending {
                result.command = pending.clone();
            }
        }
        if self.pending.as_deref() == Some(result.command.as_str()) {
            self.pending = None;
        }

        if result.success {
            debug!("ack {} {}", result.command, result.payload);
        } else {
            warn!("command failed: {} {}", result.command, result.payload);
        }
        self.emit(Event::CommandResult(result));
    }
}

/// Interpret one response line received while not acquiring.
fn parse_response(line: &str) -> Option<AckLine> {
    let line = line.strip_prefix(PROMPT).unwrap_or(line);

    if let Some(rest) = line.strip_prefix("ack ") {
        let (command, payload) = split_command(rest);
        Some(AckLine::ack(command, payload))
    } else if let Some(rest) = line.strip_prefix("err ") {
        Some(AckLine::err("", rest.trim()))
    } else if let Some(rest) = line.strip_prefix("error ") {
        let (command, payload) = split_command(rest);
        Some(AckLine::err(command, payload))
    } else {
        None
    }
}

/// Worker main loop. Returns once stopped or after a transport error.
fn run(mut transport: Box<dyn Transport>, shared: Arc<Mutex<Shared>>, mut session: Session) {
    let mut buf = vec![0u8; READ_CHUNK];

    let failure = loop {
        let outgoing = {
            let mut s = lock(&shared);
            if !s.keep_running {
                break None;
            }
            match s.state {
                ConnectionState::Ready | ConnectionState::Acquiring => s.queue.pop_front(),
                ConnectionState::Idle => None,
            }
        };

        if let Some(cmd) = outgoing {
            if let Err(e) = serial::send_bytes(transport.as_mut(), &cmd.bytes) {
                break Some(format!("[Send error] {e}"));
            }
            session.sent(&cmd);
        }

        match serial::poll_read(transport.as_mut(), &mut buf) {
            Ok(0) => thread::sleep(IDLE_SLEEP),
            Ok(n) => session.handle_bytes(&buf[..n], &shared),
            Err(e) => break Some(format!("[Read error] {e}")),
        }
    };

    {
        let mut s = lock(&shared);
        s.state = ConnectionState::Idle;
        s.keep_running = false;
    }

    if let Some(reason) = &failure {
        warn!("transport failure, closing session: {}", reason);
        session.log(reason.clone());
    }
    // Best effort: the port may already be gone.
    if let Err(e) = transport.flush() {
        debug!("flush on close failed: {}", e);
    }
    drop(transport);

    info!("disconnected");
    session.emit(Event::Connection {
        connected: false,
        message: "Disconnected".to_string(),
    });
}

/// Control-side handle to the PowerShield connection.
///
/// # Example
/// ```ignore
/// let (mut conn, events) = Connection::new();
/// conn.connect_port("/dev/ttyACM0")?;
/// conn.set_format(DataFormat::BinHexa);
/// conn.send(&Command::Format(DataFormat::BinHexa));
/// conn.send(&Command::Start);
/// for event in events.iter() { /* ... */ }
/// ```
pub struct Connection {
    shared: Arc<Mutex<Shared>>,
    events: Sender<Event>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    /// New idle connection and the receiving end of its event stream.
    pub fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let conn = Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            events: tx,
            worker: None,
        };
        (conn, rx)
    }

    /// Open the serial port at `path` and start the worker on it.
    pub fn connect_port(&mut self, path: &str) -> Result<()> {
        match serial::open_port(path) {
            Ok(port) => self.connect(
                Box::new(port),
                &format!("Connected to {} @ {} baud", path, serial::BAUD_RATE),
            ),
            Err(e) => {
                let _ = self.events.send(Event::Connection {
                    connected: false,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start a session on an already open transport.
    ///
    /// Any previous session is shut down first. Queued commands are discarded.
    pub fn connect(&mut self, transport: Box<dyn Transport>, message: &str) -> Result<()> {
        if self.worker.is_some() {
            self.disconnect();
        }

        {
            let mut s = lock(&self.shared);
            s.state = ConnectionState::Ready;
            s.keep_running = true;
            s.queue.clear();
        }
        info!("{}", message);
        let _ = self.events.send(Event::Connection {
            connected: true,
            message: message.to_string(),
        });

        let shared = Arc::clone(&self.shared);
        let session = Session::new(self.events.clone());
        let spawned = thread::Builder::new()
            .name("powershield-worker".into())
            .spawn(move || run(transport, shared, session));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                {
                    let mut s = lock(&self.shared);
                    s.state = ConnectionState::Idle;
                    s.keep_running = false;
                }
                let _ = self.events.send(Event::Connection {
                    connected: false,
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Ask the worker to stop and wait (bounded) for it to close the transport.
    pub fn disconnect(&mut self) {
        lock(&self.shared).keep_running = false;

        let Some(handle) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("connection worker panicked");
            }
        } else {
            warn!(
                "connection worker did not stop within {:?}, detaching",
                DISCONNECT_TIMEOUT
            );
        }
    }

    /// Queue raw command bytes; flushed by the worker while connected.
    pub fn enqueue(&self, cmd: PendingCommand) {
        lock(&self.shared).queue.push_back(cmd);
    }

    pub fn send(&self, cmd: &Command) {
        self.enqueue(cmd.pending());
    }

    /// Select the decoder used for the next acquisition.
    pub fn set_format(&self, format: DataFormat) {
        lock(&self.shared).format = format;
    }

    pub fn format(&self) -> DataFormat {
        lock(&self.shared).format
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    /// Commands waiting to be written.
    pub fn queued(&self) -> usize {
        lock(&self.shared).queue.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
