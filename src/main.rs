use anyhow::Context;
use clap::Parser;
use itertools::Itertools;
use stalker_remote::config::SessionConfig;
use stalker_remote::remote::feature::Support;
use stalker_remote::remote::transport::{SerialTransport, TcpTransport, Transport};
use stalker_remote::remote::{EventHook, RemoteTarget, TargetKind};
use std::sync::Once;

/// Connect to a GDB remote stub and print what it offers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stub address: `host:port` or a serial device path.
    target: String,

    /// Use extended-remote connection.
    #[arg(long)]
    extended: bool,

    /// Path to session configuration (TOML).
    #[arg(long)]
    config: Option<String>,

    /// Serial line baud rate.
    #[arg(long, default_value_t = 115200)]
    baud: u32,
}

struct PrintHook;

impl EventHook for PrintHook {
    fn on_console_output(&self, text: &str) {
        print!("{text}");
    }
}

static LOGGER_INIT: Once = Once::new();

fn main() -> anyhow::Result<()> {
    LOGGER_INIT.call_once(env_logger::init);
    let args = Args::parse();
    let config = SessionConfig::from_file(args.config.as_deref());

    let poll = config.interrupt_poll();
    let transport: Box<dyn Transport> = if args.target.starts_with('/') {
        Box::new(SerialTransport::open(&args.target, args.baud, poll)?)
    } else {
        Box::new(TcpTransport::connect(&args.target, poll)?)
    };

    let kind = if args.extended {
        TargetKind::Extended
    } else {
        TargetKind::Remote
    };
    let mut target = RemoteTarget::connect(kind, transport, config, Box::new(PrintHook))
        .with_context(|| format!("connect to {}", args.target))?;
    target.session().interrupt_flag().register_sigint()?;

    let session = target.session();
    println!("connection: {kind}");
    println!(
        "packet size: {} (ack mode {})",
        session.packet_size(),
        if session.ack_mode() { "on" } else { "off" }
    );
    println!("capabilities:");
    for (feature, cap) in session.features().iter() {
        let support = match cap.effective() {
            Support::Enabled => "+",
            Support::Disabled => "-",
            Support::Unknown => "?",
        };
        println!("  {:<24} {support} ({})", feature.name(), cap.detect);
    }

    println!("threads:");
    for thread in target.registry().threads() {
        let details = [
            thread.name.clone(),
            thread.core.map(|c| format!("core {c}")),
        ]
        .into_iter()
        .flatten()
        .join(", ");
        println!("  {:>3} {} {details}", thread.num, thread.ptid);
    }

    match target.initial_stop() {
        Some(stop) => println!("initial stop: {stop}"),
        None => println!("initial stop: no process"),
    }

    let pids = target.registry().inferiors().map(|inf| inf.pid).collect::<Vec<_>>();
    for pid in pids {
        if let Err(e) = target.detach(pid) {
            log::warn!("detach from process {pid}: {e}");
        }
        if target.session().is_closed() {
            break;
        }
    }
    target.disconnect();
    Ok(())
}
