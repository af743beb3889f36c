//! OBD-II Monitor - command-line front end
//!
//! Connects to an ELM327 adapter (or the built-in simulated vehicle), then
//! streams live sensor values, reads or clears trouble codes, or prints the
//! monitor self-test status.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use obd_poller::Session;
use obd_protocol::sim::{SimulatedAdapter, SimulatedVehicle};
use obd_protocol::{
    available_ports, dtc, event_channel, CommError, EventReceiver, PortOpener, SerialPortOpener,
    BAUD_RATES,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod logging;
mod output;

use config::AppConfig;
use logging::init_logging;

/// OBD-II Monitor - live data and trouble codes over an ELM327 adapter
#[derive(Parser, Debug)]
#[command(name = "obd-monitor", version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", default_value = "obd-monitor.toml")]
    config: PathBuf,

    /// Serial port, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate, overrides the configuration
    #[arg(short, long, value_parser = parse_baud)]
    baud: Option<u32>,

    /// Use the built-in simulated vehicle instead of a serial adapter
    #[arg(long)]
    simulate: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports on this machine
    Ports,
    /// Look up trouble code descriptions
    Codes {
        /// Only codes starting with this prefix, e.g. P03
        prefix: Option<String>,
    },
    /// Stream live sensor values
    Monitor {
        /// PID in hex, e.g. 0C; repeat for more
        #[arg(long = "pid", value_parser = parse_pid, required = true)]
        pids: Vec<u8>,
        /// ECU display number
        #[arg(long, default_value_t = 1)]
        ecu: usize,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Read stored and pending trouble codes
    Dtc,
    /// Clear trouble codes
    ClearDtc,
    /// Show monitor self-test status
    Tests,
}

fn parse_pid(s: &str) -> Result<u8, String> {
    let hex = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(hex, 16).map_err(|_| format!("{} is not a hex PID", s))
}

fn parse_baud(s: &str) -> Result<u32, String> {
    let baud: u32 = s.parse().map_err(|_| format!("{} is not a number", s))?;
    if BAUD_RATES.contains(&baud) {
        Ok(baud)
    } else {
        Err(format!("baud rate must be one of {:?}", BAUD_RATES))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    init_logging(&config.logging)?;

    info!("=== OBD Monitor v{} ===", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Ports => {
            let ports = available_ports().context("Failed to enumerate serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Codes { prefix } => {
            let prefix = prefix.as_deref().unwrap_or("").to_ascii_uppercase();
            for (code, description) in dtc::catalog().iter().filter(|(c, _)| c.starts_with(&prefix)) {
                println!("{}  {}", code, description);
            }
            Ok(())
        }
        command => run_session(&args, &config, command).await,
    }
}

async fn run_session(args: &Args, config: &AppConfig, command: &Command) -> Result<()> {
    let opener: Box<dyn PortOpener> = if args.simulate {
        info!("Using simulated vehicle");
        Box::new(SimulatedAdapter::new(SimulatedVehicle::demo()))
    } else {
        Box::new(SerialPortOpener)
    };

    let (tx, rx) = event_channel();
    let printer = tokio::spawn(print_events(rx, args.json));

    let connected = Session::connect(
        opener.as_ref(),
        &config.connection,
        config.poller.clone(),
        tx,
    )
    .await;
    let mut session = match connected {
        Ok(session) => session,
        Err(e) => {
            if let Err(join) = printer.await {
                warn!("Event printer failed: {}", join);
            }
            return Err(e).context("Connect failed");
        }
    };

    let outcome = run_command(&session, command).await;

    session.disconnect().await;
    drop(session);
    printer.await.context("Event printer failed")?;
    outcome
}

async fn run_command(session: &Session, command: &Command) -> Result<()> {
    match command {
        Command::Monitor { pids, ecu, seconds } => {
            let address = session
                .registry()
                .by_number(*ecu)
                .map(|e| e.address)
                .with_context(|| format!("No ECU number {}", ecu))?;
            for pid in pids {
                session.enable_sensor(*pid, address)?;
            }
            session.select_active_ecu(Some(address))?;

            match seconds {
                Some(secs) => tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(*secs)) => {}
                    signal = tokio::signal::ctrl_c() => signal?,
                },
                None => tokio::signal::ctrl_c().await?,
            }
            Ok(())
        }
        Command::Dtc => {
            session.get_dtcs().await?;
            Ok(())
        }
        Command::ClearDtc => {
            session.clear_dtcs().await?;
            Ok(())
        }
        Command::Tests => {
            let addresses: Vec<_> = session.registry().addresses().collect();
            for ecu in addresses {
                match session.get_self_test_status(ecu).await {
                    Ok(_) => {}
                    Err(obd_poller::SessionError::Comm(CommError::NoData)) => {
                        warn!("ECU {} does not report monitor status", ecu)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
        Command::Ports | Command::Codes { .. } => bail!("{:?} does not need a connection", command),
    }
}

async fn print_events(mut rx: EventReceiver, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        } else {
            println!("{}", output::render(&event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("0C"), Ok(0x0C));
        assert_eq!(parse_pid("0x5c"), Ok(0x5C));
        assert!(parse_pid("1FF").is_err());
    }

    #[test]
    fn test_parse_baud() {
        assert_eq!(parse_baud("38400"), Ok(38400));
        assert!(parse_baud("12345").is_err());
    }

    #[test]
    fn test_cli_parses_monitor() {
        let args = Args::try_parse_from([
            "obd-monitor", "--simulate", "monitor", "--pid", "0C", "--pid", "0D", "--seconds", "3",
        ])
        .unwrap();
        assert!(args.simulate);
        match args.command {
            Command::Monitor { pids, ecu, seconds } => {
                assert_eq!(pids, vec![0x0C, 0x0D]);
                assert_eq!(ecu, 1);
                assert_eq!(seconds, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simulated_dtc_session() {
        let args = Args::try_parse_from(["obd-monitor", "--simulate", "dtc"]).unwrap();
        let mut config = AppConfig::default();
        config.connection.timeout_ms = 200;
        run_session(&args, &config, &args.command).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_still_flushes_events() {
        let args = Args::try_parse_from(["obd-monitor", "--port", "/dev/does-not-exist", "dtc"]).unwrap();
        let mut config = AppConfig::default();
        config.connection.port = "/dev/does-not-exist".to_string();
        config.connection.max_attempts = 1;
        config.connection.retry_delay_ms = 1;

        let err = run_session(&args, &config, &args.command).await.unwrap_err();
        assert!(err.to_string().contains("Connect failed"));
    }
}
