//! LyncNat device CLI.
//!
//! # Commands
//!
//! - `decode` - Pretty-print a hex-encoded frame
//! - `keepalive` - Build a keepalive frame
//! - `args` - Show the argument encoding of a sample `bake` action
//! - `run` - Run the demo oven device against the relay (`--log-json` for
//!   machine-readable logs)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lyncnat::{
    capability::{CapabilityRegistry, DeviceInfo},
    codec::{arguments, integrity, Integrity, Message, MessageFactory},
    session::{identity_store, Device, DeviceContext, OfflineAccount, SessionManager},
    ArgumentDef, ArgumentType, ArgumentValue, Config, TransportKind, VERSION,
};
use uuid::Uuid;

/// How long `run` waits for the transport worker after the device stopped
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "lyncnat")]
#[command(version = VERSION)]
#[command(about = "LyncNat device runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a hex-encoded frame
    Decode {
        /// Frame bytes as hex
        hex: String,

        /// API key to check MESSAGE-INTEGRITY with
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Print a keepalive frame as hex
    Keepalive {
        /// Account username
        #[arg(short, long)]
        username: String,

        /// Device UUID
        #[arg(long)]
        uuid: Uuid,

        /// Account API key
        #[arg(short, long)]
        api_key: String,
    },

    /// Encode the arguments of a `bake` action
    Args {
        /// Oven temperature
        #[arg(long, default_value_t = 200)]
        temperature: i32,

        /// Baking time in minutes
        #[arg(long, default_value_t = 5)]
        time: i32,
    },

    /// Run the demo oven device
    Run {
        /// Config file (defaults to LYNCNAT_* environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the transport (udp, tls)
        #[arg(short, long)]
        transport: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Log as JSON lines
        #[arg(long)]
        log_json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { hex, key } => cmd_decode(&hex, key.as_deref()),
        Commands::Keepalive {
            username,
            uuid,
            api_key,
        } => cmd_keepalive(&username, uuid, &api_key),
        Commands::Args { temperature, time } => cmd_args(temperature, time),
        Commands::Run {
            config,
            transport,
            verbose,
            log_json,
        } => cmd_run(config, transport, verbose, log_json),
    }
}

fn cmd_decode(hex: &str, key: Option<&str>) -> anyhow::Result<()> {
    let bytes = parse_hex(hex)?;
    let message = Message::decode(&bytes)?;
    print!("{}", message);

    if let Some(key) = key {
        match integrity::verify(&bytes, key.as_bytes()) {
            Ok(Integrity::Verified) => println!("integrity: verified"),
            Ok(Integrity::Absent) => println!("integrity: absent"),
            Err(e) => println!("integrity: {}", e),
        }
    }
    if let Ok(Some(addr)) = message.mapped_address() {
        println!("mapped address: {}", addr);
    }
    Ok(())
}

fn cmd_keepalive(username: &str, uuid: Uuid, api_key: &str) -> anyhow::Result<()> {
    let frame = MessageFactory::new(username, api_key).keepalive(uuid)?;
    println!("{}", to_hex(&frame));
    Ok(())
}

fn cmd_args(temperature: i32, time: i32) -> anyhow::Result<()> {
    let defs = bake_arguments();
    let values: HashMap<String, ArgumentValue> = [
        ("temperature".to_string(), ArgumentValue::Integer(temperature)),
        ("time".to_string(), ArgumentValue::Integer(time)),
    ]
    .into_iter()
    .collect();

    let encoded = arguments::encode(&defs, &values)?;
    println!("{}", to_hex(&encoded));
    eprintln!();
    eprintln!("Layout:");
    eprintln!("  Arguments:    {}", encoded[0]);
    eprintln!("  Lengths:      {:?}", &encoded[1..=defs.len()]);
    eprintln!("  String mask:  {:#010b}", encoded[defs.len() + 1]);
    for (def, value) in defs.iter().zip(arguments::decode_ordered(&encoded, &defs)?) {
        eprintln!("  {:<13} {} = {}", format!("{}:", def.name), def.kind, value);
    }
    Ok(())
}

fn cmd_run(
    config: Option<PathBuf>,
    transport: Option<String>,
    verbose: bool,
    log_json: bool,
) -> anyhow::Result<()> {
    // Initialize logging
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match config {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env(),
    };
    if let Some(kind) = transport {
        config.relay.transport = kind
            .parse::<TransportKind>()
            .map_err(anyhow::Error::msg)?;
    }
    config.validate()?;

    tracing::info!(
        "Starting device '{}' via {} to {}",
        config.device.name,
        config.relay.transport,
        config.relay.addr()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (transport, worker) = lyncnat::transport::spawn(&config).await?;
        let identity = identity_store(&config.device);
        let manager = SessionManager::new(
            &config,
            Oven::default(),
            oven_registry()?,
            transport.clone(),
            Arc::new(OfflineAccount),
            identity.as_ref(),
        )
        .await?;
        tracing::info!("Device UUID: {}", manager.uuid());

        let running = manager.start().await?;
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }

        let oven = running.stop().await?;
        tracing::info!("Oven left at {} degrees", oven.temperature);

        // Detach alone is not enough while the worker is stuck reconnecting
        transport.shutdown();
        match tokio::time::timeout(WORKER_STOP_TIMEOUT, worker).await {
            Ok(joined) => joined?,
            Err(_) => tracing::warn!(
                "Transport worker still busy after {:?}, exiting anyway",
                WORKER_STOP_TIMEOUT
            ),
        }
        Ok::<_, anyhow::Error>(())
    })
}

/// Demo device: an oven that heats towards a target and reports when done.
#[derive(Debug, Default)]
struct Oven {
    temperature: i32,
    target: i32,
    minutes_left: i32,
}

impl Oven {
    fn bake(&mut self, args: &[ArgumentValue]) -> anyhow::Result<()> {
        let target = args[0].as_i32().context("temperature")?;
        let minutes = args[1].as_i32().context("time")?;
        if !(0..=300).contains(&target) {
            anyhow::bail!("temperature {} out of range", target);
        }
        tracing::info!("Baking at {} degrees for {} minutes", target, minutes);
        self.target = target;
        self.minutes_left = minutes;
        Ok(())
    }
}

impl Device for Oven {
    fn setup(&mut self) -> anyhow::Result<()> {
        self.temperature = 20;
        Ok(())
    }

    // One simulated minute per second
    fn tick(&mut self, ctx: &DeviceContext) -> anyhow::Result<()> {
        if self.minutes_left == 0 {
            self.temperature = (self.temperature - 10).max(20);
            return Ok(());
        }
        self.temperature = (self.temperature + 25).min(self.target);
        self.minutes_left -= 1;
        if self.minutes_left == 0 {
            self.target = 0;
            ctx.send_event("finished", None)?;
        }
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }
}

fn bake_arguments() -> Vec<ArgumentDef> {
    vec![
        ArgumentDef::new("temperature", ArgumentType::Integer),
        ArgumentDef::new("time", ArgumentType::Integer),
    ]
}

fn oven_registry() -> lyncnat::Result<CapabilityRegistry<Oven>> {
    CapabilityRegistry::builder()
        .action("bake", "Bake food", bake_arguments(), |oven: &mut Oven, args: &[ArgumentValue]| {
            oven.bake(args)
        })
        .action("stop", "Turn the oven off", vec![], |oven: &mut Oven, _: &[ArgumentValue]| {
            oven.target = 0;
            oven.minutes_left = 0;
            Ok(())
        })
        .event("finished")
        .status("temperature", ArgumentType::Integer, |oven: &Oven| {
            Ok(ArgumentValue::Integer(oven.temperature))
        })
        .status("baking", ArgumentType::Boolean, |oven: &Oven| {
            Ok(ArgumentValue::Boolean(oven.minutes_left > 0))
        })
        .info(DeviceInfo {
            model_name: "demo-oven".to_string(),
            manufacturer: "LyncNat".to_string(),
            serial_number: "0001".to_string(),
            ..DeviceInfo::default()
        })
        .build()
}

fn parse_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {}", i))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
