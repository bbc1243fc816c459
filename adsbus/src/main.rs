//! adsbus: ADS-B message bus.
//!
//! Connects any number of inputs (receivers, upstream buses, files, child
//! processes) to any number of outputs, converting between wire formats on
//! the way. Endpoints are given as flags; see `adsbus --help`.

use std::process;

use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use adsbus::{Bus, BusReactor};
use adsbus_core::{AdsbusError, BusConfig, EndpointSpec, ServerInfo};

#[derive(Parser)]
#[command(name = "adsbus", version, about = "ADS-B message bus")]
struct Cli {
    /// Connect to HOST/PORT and receive packets (any format, auto-detected)
    #[arg(long, value_name = "HOST/PORT")]
    connect_receive: Vec<String>,

    /// Connect to HOST/PORT and send packets
    #[arg(long, value_name = "FORMAT=HOST/PORT")]
    connect_send: Vec<String>,

    /// Connect to HOST/PORT and both send and receive
    #[arg(long, value_name = "FORMAT=HOST/PORT")]
    connect_send_receive: Vec<String>,

    /// Listen on [HOST/]PORT and receive from every connection
    #[arg(long, value_name = "[HOST/]PORT")]
    listen_receive: Vec<String>,

    /// Listen on [HOST/]PORT and send to every connection
    #[arg(long, value_name = "FORMAT=[HOST/]PORT")]
    listen_send: Vec<String>,

    /// Listen on [HOST/]PORT and both send and receive
    #[arg(long, value_name = "FORMAT=[HOST/]PORT")]
    listen_send_receive: Vec<String>,

    /// Read packets from PATH
    #[arg(long, value_name = "PATH")]
    file_read: Vec<String>,

    /// Write packets to PATH, truncating it
    #[arg(long, value_name = "FORMAT=PATH")]
    file_write: Vec<String>,

    /// Write packets to PATH, truncating it, and read from it too
    #[arg(long, value_name = "FORMAT=PATH")]
    file_write_read: Vec<String>,

    /// Append packets to PATH
    #[arg(long, value_name = "FORMAT=PATH")]
    file_append: Vec<String>,

    /// Append packets to PATH and read from it too
    #[arg(long, value_name = "FORMAT=PATH")]
    file_append_read: Vec<String>,

    /// Run COMMAND and receive packets from its stdout
    #[arg(long, value_name = "COMMAND")]
    exec_receive: Vec<String>,

    /// Run COMMAND and send packets to its stdin
    #[arg(long, value_name = "FORMAT=COMMAND")]
    exec_send: Vec<String>,

    /// Run COMMAND, sending to its stdin and receiving from its stdout
    #[arg(long, value_name = "FORMAT=COMMAND")]
    exec_send_receive: Vec<String>,

    /// Receive packets on stdin
    #[arg(long)]
    stdin: bool,

    /// Send packets to stdout
    #[arg(long, value_name = "FORMAT")]
    stdout: Option<String>,

    /// Drop packets that have crossed this many buses [default: $ADSBUS_MAX_HOPS or 5]
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    max_hops: Option<u16>,

    /// Threads used for DNS lookups
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    resolver_threads: u16,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Prefix log lines with timestamps
    #[arg(long)]
    log_timestamps: bool,
}

impl Cli {
    fn endpoints(&self) -> Result<Vec<EndpointSpec>, AdsbusError> {
        let groups = [
            ("connect-receive", &self.connect_receive),
            ("connect-send", &self.connect_send),
            ("connect-send-receive", &self.connect_send_receive),
            ("listen-receive", &self.listen_receive),
            ("listen-send", &self.listen_send),
            ("listen-send-receive", &self.listen_send_receive),
            ("file-read", &self.file_read),
            ("file-write", &self.file_write),
            ("file-write-read", &self.file_write_read),
            ("file-append", &self.file_append),
            ("file-append-read", &self.file_append_read),
            ("exec-receive", &self.exec_receive),
            ("exec-send", &self.exec_send),
            ("exec-send-receive", &self.exec_send_receive),
        ];
        let mut specs = Vec::new();
        for (flag, values) in groups {
            for value in values {
                specs.push(EndpointSpec::parse(flag, value)?);
            }
        }
        if self.stdin {
            specs.push(EndpointSpec::parse("stdin", "")?);
        }
        if let Some(format) = &self.stdout {
            specs.push(EndpointSpec::parse("stdout", format)?);
        }
        Ok(specs)
    }
}

fn setup_logging(quiet: bool, timestamps: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    setup_logging(cli.quiet, cli.log_timestamps);

    let endpoints = match cli.endpoints() {
        Ok(endpoints) if endpoints.is_empty() => {
            let _ = Cli::command().print_help();
            process::exit(1);
        }
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&cli, &endpoints) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(cli: &Cli, endpoints: &[EndpointSpec]) -> Result<(), AdsbusError> {
    let mut config = BusConfig::from_env()?;
    if let Some(max_hops) = cli.max_hops {
        config.max_hops = max_hops;
    }
    config.resolver_threads = usize::from(cli.resolver_threads);

    // Signals first: the resolver threads must inherit the blocked mask.
    let mut reactor = BusReactor::new()?;
    reactor.install_signals()?;
    let mut bus = Bus::new(config, ServerInfo::generate())?;
    for spec in endpoints {
        bus.add_endpoint(&mut reactor, spec);
    }

    reactor.run(&mut bus)?;
    let counts = bus.counts();
    if counts.is_live() {
        info!("Shutting down");
    } else {
        info!(
            inputs = counts.inputs(),
            outputs = counts.outputs(),
            "No inputs or outputs left; exiting"
        );
    }
    Ok(())
}
