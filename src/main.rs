use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use stylus_core::logger;
use stylus_core::session::Session;
use stylus_core::settings::{Settings, TransportSettings};
use stylus_core::transport::serial::list_ports;

#[derive(Parser)]
#[command(name = "stylus")]
#[command(about = "Run a plan script on a stylus arm, step by step")]
struct Args {
    /// Plan script to run
    script: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(short = 's', long, default_value = "settings.json")]
    settings: PathBuf,

    /// Use the in-memory transport and perception
    #[arg(long)]
    stub: bool,

    /// Log directory
    #[arg(long, default_value = "logs")]
    logs: PathBuf,

    /// Echo log lines to stderr
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Serial port, overrides the settings file
    #[arg(long, conflicts_with = "ip")]
    port: Option<String>,

    /// WiFi board address, overrides the settings file
    #[arg(long)]
    ip: Option<String>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    logger::init(&args.logs).with_context(|| format!("creating log dir {}", args.logs.display()))?;
    if args.verbose {
        let (tx, rx) = mpsc::channel::<String>();
        logger::set_sink(tx);
        thread::spawn(move || {
            for line in rx {
                eprintln!("{}", line);
            }
        });
    }

    if args.list_ports {
        for p in list_ports() {
            println!("{}", p);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(script_path) = args.script else {
        anyhow::bail!("no script given (see --help)");
    };
    let src = std::fs::read_to_string(&script_path)
        .with_context(|| format!("reading {}", script_path.display()))?;

    let mut settings = Settings::load(&args.settings);
    apply_overrides(&mut settings, args.port, args.ip);
    logger::info(&format!("stylus started, script {}", script_path.display()));

    let mut session = Session::open(&settings, args.stub)?;
    let outcome = session.run_script(&src);
    session.close();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn apply_overrides(settings: &mut Settings, port: Option<String>, ip: Option<String>) {
    if let Some(p) = port {
        let (baud, capture_url) = match &settings.transport {
            TransportSettings::Serial { baud, capture_url, .. } => (*baud, capture_url.clone()),
            _ => (stylus_core::transport::serial::DEFAULT_BAUD, None),
        };
        settings.transport = TransportSettings::Serial { port: Some(p), baud, capture_url };
    } else if let Some(ip) = ip {
        settings.transport = match &settings.transport {
            TransportSettings::Wifi { port, username, password, .. } => TransportSettings::Wifi {
                ip,
                port: *port,
                username: username.clone(),
                password: password.clone(),
            },
            _ => TransportSettings::Wifi {
                ip,
                port: stylus_core::transport::wifi::DEFAULT_PORT,
                username: "admin".into(),
                password: "admin".into(),
            },
        };
    }
}
