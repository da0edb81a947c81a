use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::backend::MockPlatform;
use crate::client::{CardProxy, PlatformProxy, ANY_EVENT};
use crate::config::{ClientConfig, ServerConfig, TransportConfig};
use crate::core::{
    apdu::ResponseApdu,
    platform::Platform,
    utils::{describe_status_word, format_ascii, format_hex_dump, format_hex_spaced, parse_hex},
};
use crate::rpc::{envelope::Value, stream, Event};
use crate::server::ServerAdapter;

const DEFAULT_ADDR: &str = "127.0.0.1:7878";

#[derive(Parser)]
#[command(name = "pcsc-bridge")]
#[command(about = "Remote smart card bridge: host PC/SC readers and drive them over the network")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host local readers for remote clients
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = DEFAULT_ADDR)]
        listen: String,

        /// Serve simulated readers instead of the PC/SC service
        #[arg(long)]
        mock: bool,
    },

    /// List readers on a bridge host
    List {
        /// Bridge address
        #[arg(long, default_value = DEFAULT_ADDR)]
        connect: String,

        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Send an APDU to a remote card
    Transmit {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,

        /// APDU command in hex format (e.g., "00A40400")
        apdu: String,

        /// Bridge address
        #[arg(long, default_value = DEFAULT_ADDR)]
        connect: String,

        /// Show response in different formats
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Print the ATR of the card in a remote reader
    Atr {
        /// Reader name or index
        reader: String,

        /// Bridge address
        #[arg(long, default_value = DEFAULT_ADDR)]
        connect: String,
    },

    /// Execute commands from a script file
    Script {
        /// Script file path
        file: String,

        /// Reader name or index to use for all commands
        reader: String,

        /// Bridge address
        #[arg(long, default_value = DEFAULT_ADDR)]
        connect: String,

        /// Continue on errors
        #[arg(short, long)]
        continue_on_error: bool,
    },

    /// Print reader and card events until interrupted
    Watch {
        /// Also watch card events on this reader (name or index)
        reader: Option<String>,

        /// Bridge address
        #[arg(long, default_value = DEFAULT_ADDR)]
        connect: String,
    },
}

#[derive(Clone, Debug)]
pub enum ResponseFormat {
    Hex,
    HexSpaced,
    HexDump,
    Ascii,
    All,
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(ResponseFormat::Hex),
            "spaced" => Ok(ResponseFormat::HexSpaced),
            "dump" => Ok(ResponseFormat::HexDump),
            "ascii" => Ok(ResponseFormat::Ascii),
            "all" => Ok(ResponseFormat::All),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::Serve { listen, mock } => cmd_serve(&listen, mock).await,
        Commands::List { connect, detailed } => cmd_list(&connect, detailed).await,
        Commands::Transmit {
            reader,
            apdu,
            connect,
            format,
        } => cmd_transmit(&connect, &reader, &apdu, format).await,
        Commands::Atr { reader, connect } => cmd_atr(&connect, &reader).await,
        Commands::Script {
            file,
            reader,
            connect,
            continue_on_error,
        } => cmd_script(&connect, &file, &reader, continue_on_error).await,
        Commands::Watch { reader, connect } => cmd_watch(&connect, reader.as_deref()).await,
    }
}

#[cfg(feature = "pcsc")]
fn open_platform(mock: bool, config: &ServerConfig) -> Result<Arc<dyn Platform>> {
    if mock {
        return Ok(Arc::new(MockPlatform::with_demo_readers(config.event_buffer)));
    }
    let platform = crate::backend::PcscPlatform::new(config.event_buffer)
        .context("Failed to initialize PCSC")?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "pcsc"))]
fn open_platform(mock: bool, config: &ServerConfig) -> Result<Arc<dyn Platform>> {
    if !mock {
        bail!("Built without PC/SC support; run with --mock");
    }
    Ok(Arc::new(MockPlatform::with_demo_readers(config.event_buffer)))
}

async fn cmd_serve(listen: &str, mock: bool) -> Result<()> {
    let server_config = ServerConfig::from_env();
    let transport_config = TransportConfig::from_env();

    let platform = open_platform(mock, &server_config)?;
    platform
        .init()
        .await
        .context("Failed to initialize platform")?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    println!(
        "Serving {} readers on {}",
        if mock { "mock" } else { "PC/SC" },
        listener.local_addr()?
    );

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("Failed to accept connection")?,
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                return Ok(());
            }
        };
        log::info!("Client connected: {peer}");

        let platform = Arc::clone(&platform);
        let transport = Arc::new(stream::server(socket, &transport_config));
        let server_config = server_config.clone();

        tokio::spawn(async move {
            let adapter = ServerAdapter::with_config(platform, transport, server_config);
            if let Err(e) = adapter.start().await {
                log::error!("Failed to serve {peer}: {e}");
                return;
            }
            adapter.closed().await;
            if let Err(e) = adapter.stop().await {
                log::warn!("Unclean shutdown for {peer}: {e}");
            }
            log::info!("Client disconnected: {peer}");
        });
    }
}

async fn connect(addr: &str) -> Result<PlatformProxy> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to bridge at {addr}"))?;
    let transport = stream::client(socket, &TransportConfig::from_env(), &ClientConfig::from_env());

    let platform = PlatformProxy::new(Arc::new(transport));
    platform
        .init()
        .await
        .context("Failed to initialize remote platform")?;
    Ok(platform)
}

async fn cmd_list(addr: &str, detailed: bool) -> Result<()> {
    let platform = connect(addr).await?;
    let readers = platform
        .get_device_info()
        .await
        .context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No readers found on {addr}.");
        return Ok(());
    }

    println!("Readers on {addr}:");
    for (i, reader) in readers.iter().enumerate() {
        if !detailed {
            println!("  [{}] {}", i, reader.friendly_name);
            continue;
        }

        let device = platform
            .acquire_device(&reader.id)
            .await
            .with_context(|| format!("Failed to acquire reader: {}", reader.id))?;
        let present = device.is_card_present().await.unwrap_or(false);

        println!("  [{}] {}", i, reader.friendly_name);
        println!(
            "      Status: {}",
            if present { "Card present" } else { "No card" }
        );
        println!(
            "      Interface: {:?}{}",
            reader.physical_protocol,
            if reader.supports_contactless {
                " (contactless)"
            } else {
                ""
            }
        );
        if present {
            if let Ok(card) = device.start_session().await {
                if let Ok(atr) = card.get_atr().await {
                    println!("      ATR: {}", format_hex_spaced(&atr));
                }
            }
        }
        device.release().await.ok();
    }

    platform.close().await;
    Ok(())
}

async fn open_card(platform: &PlatformProxy, name_or_index: &str) -> Result<(String, CardProxy)> {
    let reader = resolve_reader(platform, name_or_index).await?;
    let device = platform
        .acquire_device(&reader)
        .await
        .with_context(|| format!("Failed to acquire reader: {reader}"))?;
    let card = device
        .start_session()
        .await
        .with_context(|| format!("Failed to connect to reader: {reader}"))?;
    Ok((reader, card))
}

async fn cmd_transmit(
    addr: &str,
    reader: &str,
    apdu_hex: &str,
    format: Option<ResponseFormat>,
) -> Result<()> {
    let apdu = parse_hex(apdu_hex).context("Failed to parse APDU")?;
    if apdu.len() < 4 {
        bail!("APDU must be at least 4 bytes");
    }

    let platform = connect(addr).await?;
    let (_, card) = open_card(&platform, reader).await?;

    let start = Instant::now();
    let response = card
        .transmit_raw(&apdu)
        .await
        .context("Failed to execute transmit command")?;
    let elapsed = start.elapsed();

    println!("APDU: {}", format_hex_spaced(&apdu));

    let format = format.unwrap_or(ResponseFormat::HexSpaced);
    print_response(&response, &format);

    // Show status word interpretation
    if let Ok(parsed) = ResponseApdu::from_bytes(&response) {
        println!(
            "Status: {:02X} {:02X} ({})",
            parsed.sw1,
            parsed.sw2,
            describe_status_word(parsed.sw1, parsed.sw2)
        );
    }
    println!("Duration: {}ms", elapsed.as_millis());

    card.release().await.ok();
    platform.close().await;
    Ok(())
}

async fn cmd_atr(addr: &str, reader: &str) -> Result<()> {
    let platform = connect(addr).await?;
    let (reader, card) = open_card(&platform, reader).await?;

    let atr = card.get_atr().await.context("Failed to read ATR")?;
    println!("Reader: {reader}");
    println!("ATR: {}", format_hex_spaced(&atr));

    card.release().await.ok();
    platform.close().await;
    Ok(())
}

async fn cmd_script(
    addr: &str,
    file_path: &str,
    reader: &str,
    continue_on_error: bool,
) -> Result<()> {
    let file = File::open(file_path)
        .await
        .with_context(|| format!("Failed to open script file: {file_path}"))?;

    let platform = connect(addr).await?;
    let (reader_name, card) = open_card(&platform, reader).await?;

    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0;
    let mut errors = 0;

    println!("Executing script: {file_path}");
    println!("Reader: {reader_name}");
    println!();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read line from script")?
    {
        line_number += 1;
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        println!("Line {line_number}: {line}");

        let parts: Vec<&str> = line.split_whitespace().collect();
        let start = Instant::now();
        let result = match parts[0].to_lowercase().as_str() {
            "transmit" => match parts.get(1) {
                Some(apdu) => match parse_hex(apdu) {
                    Ok(apdu) => card.transmit_raw(&apdu).await.map_err(anyhow::Error::from),
                    Err(e) => Err(e),
                },
                None => Err(anyhow::anyhow!("Missing APDU for transmit command")),
            },
            "atr" => card.get_atr().await.map_err(anyhow::Error::from),
            "reset" => card
                .reset()
                .await
                .map(|_| Vec::new())
                .map_err(anyhow::Error::from),
            _ => Err(anyhow::anyhow!("Unknown command: {}", parts[0])),
        };

        match result {
            Ok(response) => {
                println!(
                    "  Response: {} ({}ms)",
                    format_hex_spaced(&response),
                    start.elapsed().as_millis()
                );
            }
            Err(e) => {
                errors += 1;
                println!("  ERROR: {e}");
                if !continue_on_error {
                    bail!(
                        "Script execution stopped due to error on line {}",
                        line_number
                    );
                }
            }
        }
        println!();
    }

    println!("Script execution completed.");
    println!("Total lines processed: {line_number}");
    if errors > 0 {
        println!("Errors encountered: {errors}");
    }

    card.release().await.ok();
    platform.close().await;
    Ok(())
}

async fn cmd_watch(addr: &str, reader: Option<&str>) -> Result<()> {
    let platform = connect(addr).await?;

    let _platform_events = platform.on(ANY_EVENT, |event| print_event("platform", &event));

    let mut device_events = None;
    if let Some(reader) = reader {
        let reader = resolve_reader(&platform, reader).await?;
        let device = platform
            .acquire_device(&reader)
            .await
            .with_context(|| format!("Failed to acquire reader: {reader}"))?;
        let label = reader.clone();
        device_events = Some((
            device.on(ANY_EVENT, move |event| print_event(&label, &event)),
            device,
        ));
        println!("Watching {addr} and reader '{reader}' (Ctrl+C to stop)");
    } else {
        println!("Watching {addr} (Ctrl+C to stop)");
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if platform.is_closed() {
                    println!("Connection closed by bridge");
                    return Ok(());
                }
            }
        }
    }

    if let Some((_subscription, device)) = device_events {
        device.release().await.ok();
    }
    platform.close().await;
    Ok(())
}

fn print_event(scope: &str, event: &Event) {
    let detail = match &event.payload {
        Value::Text(text) => text.clone(),
        Value::Device(device) => device.friendly_name.clone(),
        other => format!("{other:?}"),
    };
    println!(
        "[{}] {:<10} {:<15} {}",
        chrono::Local::now().format("%H:%M:%S"),
        scope,
        event.name,
        detail
    );
}

async fn resolve_reader(platform: &PlatformProxy, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = platform
            .get_device_info()
            .await
            .context("Failed to list readers")?;
        return match readers.get(index) {
            Some(reader) => Ok(reader.id.clone()),
            None if readers.is_empty() => bail!("No readers available"),
            None => bail!(
                "Reader index {} out of range (0-{})",
                index,
                readers.len() - 1
            ),
        };
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_response(data: &[u8], format: &ResponseFormat) {
    if data.is_empty() {
        println!("Response: (empty)");
        return;
    }

    match format {
        ResponseFormat::Hex => {
            println!("Response: {}", hex::encode_upper(data));
        }
        ResponseFormat::HexSpaced => {
            println!("Response: {}", format_hex_spaced(data));
        }
        ResponseFormat::HexDump => {
            println!("Response:");
            println!("{}", format_hex_dump(data));
        }
        ResponseFormat::Ascii => {
            println!("Response (ASCII): {}", format_ascii(data));
        }
        ResponseFormat::All => {
            println!("Response (Hex): {}", format_hex_spaced(data));
            println!("Response (ASCII): {}", format_ascii(data));
            if data.len() > 16 {
                println!("Response (Dump):");
                println!("{}", format_hex_dump(data));
            }
        }
    }
}
