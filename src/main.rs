use std::process::exit;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use powershield::{
    list_ports, logging, AcquisitionConfig, Command, Connection, DataFormat, DecodedBatch, Event,
};

/// How long to wait for the board to confirm `stop`.
const STOP_GRACE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "powershield",
    about = "Configure a PowerShield (X-NUCLEO-LPM01A) and stream current measurements"
)]
struct Args {
    /// Serial port of the board (e.g., /dev/ttyACM0 or COM5)
    #[arg(required_unless_present = "list")]
    port: Option<String>,
    /// List serial ports and exit
    #[arg(long)]
    list: bool,
    /// Acquisition settings as JSON (missing fields use defaults)
    #[arg(long)]
    config: Option<String>,
    /// Stream encoding, overrides the config file (ascii_dec or bin_hexa)
    #[arg(long)]
    format: Option<DataFormat>,
    /// Send `stop` after this many seconds
    #[arg(long)]
    seconds: Option<f64>,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_with_level_str(args.log_level.as_deref());

    if args.list {
        let ports = list_ports().context("enumerating serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found.");
        }
        for port in ports {
            println!("{port}");
        }
        return Ok(());
    }

    let port = args
        .port
        .context("no serial port given (use --list to see available ports)")?;

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => AcquisitionConfig::default(),
    };
    if let Some(format) = args.format {
        config.format = format;
    }
    if let Some(seconds) = args.seconds {
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("--seconds must be a positive number, got {seconds}");
        }
    }

    let (mut conn, events) = Connection::new();
    conn.connect_port(&port)
        .with_context(|| format!("connecting to {port}"))?;

    for cmd in [Command::Powershield, Command::Version, Command::Htc] {
        conn.send(&cmd);
    }
    for cmd in config.commands() {
        conn.send(&cmd);
    }
    conn.set_format(config.format);
    conn.send(&Command::Start);
    info!("starting acquisition ({})", config.format);

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs_f64(s));
    let mut stop_sent_at: Option<Instant> = None;
    let mut stats = Stats::default();

    loop {
        match events.recv_timeout(POLL) {
            Ok(Event::Connection { connected, message }) => {
                println!("{message}");
                if !connected {
                    break;
                }
            }
            Ok(Event::Log(line)) => {
                if line.starts_with('[') {
                    println!("{line}");
                } else {
                    debug!("{}", line);
                }
            }
            Ok(Event::CommandResult(result)) => {
                let tag = if result.success { "ack" } else { "err" };
                println!("{tag} {} {}", result.command, result.payload);
                if !result.success && result.command == "start" {
                    conn.disconnect();
                    bail!("board refused to start acquisition: {}", result.payload);
                }
            }
            Ok(Event::Data(batch)) => stats.add(&batch),
            Ok(Event::Acquisition(true)) => {}
            Ok(Event::Acquisition(false)) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        match stop_sent_at {
            None if deadline.is_some_and(|d| now >= d) => {
                info!("time limit reached, stopping acquisition");
                conn.send(&Command::Stop);
                stop_sent_at = Some(now);
            }
            Some(sent) if now.duration_since(sent) > STOP_GRACE => {
                warn!("no acknowledgement for stop after {:?}", STOP_GRACE);
                break;
            }
            _ => {}
        }
    }

    stats.print();
    conn.disconnect();
    Ok(())
}

/// Running totals over all received batches.
#[derive(Default)]
struct Stats {
    batches: usize,
    samples: usize,
    sum: f64,
    peak: f64,
    errors: usize,
}

impl Stats {
    fn add(&mut self, batch: &DecodedBatch) {
        self.batches += 1;
        self.samples += batch.samples.len();
        self.sum += batch.samples.iter().sum::<f64>();
        self.peak = batch.samples.iter().copied().fold(self.peak, f64::max);
        self.errors += batch.errors.len();

        if !batch.samples.is_empty() {
            let mean = batch.samples.iter().sum::<f64>() / batch.samples.len() as f64;
            println!(
                "[Batch {}] {} samples | mean {:.3e} | total {}",
                self.batches,
                batch.samples.len(),
                mean,
                self.samples
            );
        }
        for ts in &batch.timestamps {
            println!("[Timestamp] {} ms | buffer {}%", ts.time_ms, ts.buffer_pct);
        }
    }

    fn print(&self) {
        if self.samples == 0 {
            println!("No samples received.");
            return;
        }
        println!(
            "{} samples in {} batches | mean {:.3e} | peak {:.3e} | {} stream errors",
            self.samples,
            self.batches,
            self.sum / self.samples as f64,
            self.peak,
            self.errors
        );
    }
}
