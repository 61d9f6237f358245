//! CLI entry point for the secure wallet messenger.
//!
//! This binary provides a command-line interface for the messenger library:
//! identity generation, bundle inspection, configuration management, a relay
//! server and an interactive chat session.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::info;
use secure_wallet_messenger::{
    app::{load_profile, profile_exists, save_profile},
    crypto::{safety_number, PreKeyBundle, UserProfile},
    defaults,
    transport::relay::RelayServer,
    utils::{MessengerConfig, TransportConfig, DEFAULT_CONFIG_FILE},
    Address, App, ChainType, GroupId, MessageId, MessagingEvent, PeerId, Platform,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

/// Secure Wallet Messenger - end-to-end encrypted messaging between wallets
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "Peer-to-peer messenger with X3DH, Double Ratchet and sender-key groups")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for storing keys
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and show the wallet identity
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Inspect prekey bundles
    Bundle {
        #[command(subcommand)]
        action: BundleCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run a relay server
    Relay {
        #[command(subcommand)]
        action: RelayCommands,
    },
    /// Start the messenger and chat interactively
    Chat {
        /// Port for direct socket links
        #[arg(short, long)]
        port: Option<u16>,
        /// Relay server address (host:port)
        #[arg(short, long)]
        relay: Option<String>,
        /// Write our prekey bundle to this file once started
        #[arg(long, value_name = "FILE")]
        export_bundle: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity for a wallet address
    Generate {
        /// Wallet address
        #[arg(short, long)]
        address: String,
        /// Chain of the wallet (ethereum, bitcoin, solana, tron)
        #[arg(short, long, default_value = "ethereum")]
        chain: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current identity
    Show {
        /// Key output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Verify a bundle and print its contents
    Inspect {
        /// Bundle string, or a file containing one
        bundle: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[derive(Subcommand)]
enum RelayCommands {
    /// Serve relay clients until interrupted
    Serve {
        /// Listen address
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], defaults::DEFAULT_RELAY_PORT)))]
        listen: SocketAddr,
        /// Server identifier clients put in relay addresses
        #[arg(long, default_value = "default")]
        id: String,
        /// Expected client heartbeat interval in milliseconds
        #[arg(long, default_value = "15000")]
        heartbeat_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = MessengerConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage.keys_dir = data_dir.join("keys");
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Bundle { action } => handle_bundle_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Relay { action } => handle_relay_commands(action).await,
        Commands::Chat {
            port,
            relay,
            export_bundle,
        } => handle_chat_command(port, relay, export_bundle, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn handle_key_commands(action: KeyCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        KeyCommands::Generate {
            address,
            chain,
            name,
            force,
        } => {
            if profile_exists(&config.storage.keys_dir) && !force {
                bail!("Identity already exists. Use --force to overwrite.");
            }
            let chain: ChainType = chain.parse()?;

            config.ensure_directories()?;
            info!("Generating new identity for {}:{}", chain, address);
            let profile = UserProfile::new(PeerId::new(&address, chain, name));
            save_profile(&config.storage, &profile)?;

            println!("✓ Identity generated successfully");
            println!("  Name: {}", profile.peer.display_name());
            println!("  Peer: {}", profile.peer);
            println!("  Saved to: {}", config.storage.keys_dir.display());
        }
        KeyCommands::Show { format } => {
            let profile = require_profile(config)?;
            let key = profile.identity_key();

            println!("Name: {}", profile.peer.display_name());
            println!("Peer: {}", profile.peer);
            match format.as_str() {
                "hex" => println!("Identity key: {}", hex::encode(key.0)),
                "base64" => println!("Identity key: {}", general_purpose::STANDARD.encode(key.0)),
                _ => bail!("Unsupported format: {}", format),
            }
            println!("Fingerprint: {}", hex::encode(key.fingerprint()));
        }
    }
    Ok(())
}

fn handle_bundle_commands(action: BundleCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        BundleCommands::Inspect { bundle } => {
            let encoded = if Path::new(&bundle).is_file() {
                std::fs::read_to_string(&bundle)?
            } else {
                bundle
            };
            let bundle = PreKeyBundle::from_transfer_string(&encoded)
                .context("bundle failed to decode or verify")?;

            println!("✓ Bundle signature verified");
            println!("  Peer: {} ({})", bundle.peer, bundle.peer.display_name());
            println!("  Identity fingerprint: {}", hex::encode(bundle.identity_key.fingerprint()));
            println!(
                "  Signed prekey: #{} created {}",
                bundle.signed_prekey.id,
                bundle.signed_prekey.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("  One-time prekeys: {}", bundle.one_time_prekeys.len());

            if let Ok(profile) = load_profile(&config.storage) {
                let number = safety_number(
                    (&profile.peer, &profile.identity_key()),
                    (&bundle.peer, &bundle.identity_key),
                );
                println!("  Safety number: {}", group_digits(&number));
            }
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                MessengerConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let value: toml::Value = toml::from_str(&config_str)?;
                let section = value
                    .get(&section_name)
                    .ok_or_else(|| anyhow!("No section '{}' in configuration", section_name))?;
                println!("[{}]", section_name);
                println!("{}", toml::to_string_pretty(section)?);
            } else {
                println!("{}", config_str);
            }
        }
    }
    Ok(())
}

async fn handle_relay_commands(action: RelayCommands) -> Result<()> {
    match action {
        RelayCommands::Serve {
            listen,
            id,
            heartbeat_ms,
        } => {
            let server = RelayServer::bind(listen, id.clone(), Duration::from_millis(heartbeat_ms)).await?;
            println!("Relay '{}' listening on {}", id, server.local_addr()?);

            tokio::select! {
                () = server.run() => {}
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }
        }
    }
    Ok(())
}

async fn handle_chat_command(
    port: Option<u16>,
    relay: Option<String>,
    export_bundle: Option<PathBuf>,
    mut config: MessengerConfig,
) -> Result<()> {
    // Override config with command line options
    for transport in &mut config.network.transports {
        match transport {
            TransportConfig::Socket(socket) => {
                if let Some(port) = port {
                    socket.listen_addr.set_port(port);
                }
            }
            TransportConfig::Relay(relay_config) => {
                if let Some(relay) = &relay {
                    relay_config.server_addr = relay.clone();
                }
            }
            _ => {}
        }
    }

    let profile = require_profile(&config)?;
    let platform = Platform::standalone(&profile.peer);
    let mut app = App::new(config, profile, platform).await?;
    app.start().await?;
    let mut events = app
        .take_events()
        .ok_or_else(|| anyhow!("messaging events already taken"))?;

    println!("Chatting as {} ({})", app.profile().peer, app.profile().peer.display_name());
    for address in app.manager().local_addresses() {
        println!("  reachable at {}", address);
    }
    if let Some(path) = export_bundle {
        std::fs::write(&path, app.messaging().export_bundle()?)?;
        println!("✓ Bundle written to {}", path.display());
    }
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_chat_line(&app, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {e:#}"),
                }
            }
            Some(event) = events.recv() => print_event(&event),
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    app.shutdown().await;
    Ok(())
}

const CHAT_HELP: &str = "\
/bundle                         print our prekey bundle
/import <bundle>                start a session from a bundle
/addr <chain:address> <addr>    add a transport address for a peer
/msg <chain:address> <text>     send a message
/retry <message-id>             retry a failed message
/read <message-id>              mark a message read
/history <chain:address|group>  show a conversation
/safety <chain:address>         show the safety number for a peer
/verify <chain:address> <num>   compare a safety number
/peers                          list links and contacts
/group-create <peer>...         create a group
/group-add <group> <peer>       add a group member
/group-remove <group> <peer>    remove a group member
/group-send <group> <text>      send to a group
/pending                        retry failed group key deliveries
/quit                           leave";

/// Run one chat command; `Ok(false)` ends the session
async fn handle_chat_line(app: &App, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let messaging = app.messaging();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/help" => println!("{CHAT_HELP}"),
        "/quit" | "/exit" => return Ok(false),
        "/bundle" => println!("{}", messaging.export_bundle()?),
        "/import" => {
            let peer = messaging.import_bundle(rest).await?;
            println!("✓ Session ready with {}", peer);
        }
        "/addr" => {
            let (peer, address) = two_args(rest)?;
            let peer: PeerId = peer.parse()?;
            let address: Address = address.parse()?;
            app.manager().add_address(&peer, address);
            messaging.contacts().add(peer.clone());
            println!("✓ Address added for {}", peer);
        }
        "/msg" => {
            let (peer, text) = two_args(rest)?;
            let peer: PeerId = peer.parse()?;
            let id = messaging
                .send_message(&peer.to_string(), peer.address(), peer.chain_type(), text)
                .await?;
            println!("→ {} [{}]", peer, id);
        }
        "/retry" => {
            let id: MessageId = rest.parse()?;
            let status = messaging.retry_message(&id).await?;
            println!("{} is {:?}", id, status);
        }
        "/read" => {
            let id: MessageId = rest.parse()?;
            messaging.mark_read(&id).await?;
        }
        "/history" => {
            let conversation = match rest.parse::<PeerId>() {
                Ok(peer) => peer.to_string(),
                Err(_) => rest.to_string(),
            };
            for (message, body) in messaging.conversation(&conversation)? {
                println!(
                    "{} {:?} {} {:?}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.direction,
                    message.peer,
                    message.status,
                    body
                );
            }
        }
        "/safety" => {
            let peer: PeerId = rest.parse()?;
            let number = messaging.contacts().safety_number(messaging.profile(), &peer)?;
            println!("{}", group_digits(&number));
        }
        "/verify" => {
            let (peer, number) = two_args(rest)?;
            let peer: PeerId = peer.parse()?;
            if messaging.contacts().verify(messaging.profile(), &peer, number)? {
                println!("✓ {} verified", peer);
            } else {
                println!("✗ Safety number does not match for {}", peer);
            }
        }
        "/peers" => {
            for (peer, kind) in app.manager().connected_peers() {
                println!("link    {} over {}", peer, kind);
            }
            for contact in messaging.contacts().all() {
                println!(
                    "contact {} {}{}",
                    contact.peer,
                    contact.peer.display_name(),
                    if contact.verified { " (verified)" } else { "" }
                );
            }
        }
        "/group-create" => {
            let members = rest
                .split_whitespace()
                .map(str::parse)
                .collect::<secure_wallet_messenger::Result<Vec<PeerId>>>()?;
            let group = messaging.create_group(members).await?;
            println!("✓ Group {} created", group);
        }
        "/group-add" => {
            let (group, peer) = two_args(rest)?;
            let epoch = messaging.add_member(&GroupId::new(group), peer.parse()?).await?;
            println!("✓ Group {} now at epoch {}", group, epoch);
        }
        "/group-remove" => {
            let (group, peer) = two_args(rest)?;
            let epoch = messaging
                .remove_member(&GroupId::new(group), &peer.parse()?)
                .await?;
            println!("✓ Group {} now at epoch {}", group, epoch);
        }
        "/group-send" => {
            let (group, text) = two_args(rest)?;
            let id = messaging.send_group_message(&GroupId::new(group), text).await?;
            println!("→ {} [{}]", group, id);
        }
        "/pending" => {
            let delivered = messaging.retry_pending_distributions().await;
            println!(
                "Delivered {} group keys, {} still pending",
                delivered,
                messaging.pending_distributions().len()
            );
        }
        _ => println!("Unknown command '{}'. Type /help for commands.", command),
    }
    Ok(true)
}

fn print_event(event: &MessagingEvent) {
    match event {
        MessagingEvent::PeerDiscovered { peer } => println!("* discovered {}", peer),
        MessagingEvent::PeerConnected { peer, kind } => println!("* connected to {} over {}", peer, kind),
        MessagingEvent::PeerDisconnected { peer } => println!("* disconnected from {}", peer),
        MessagingEvent::MessageReceived {
            id,
            peer,
            text,
            group,
            ..
        } => match group {
            Some(group) => println!("[{}] {}: {} ({})", group, peer, text, id),
            None => println!("{}: {} ({})", peer, text, id),
        },
        MessagingEvent::StatusChanged { id, status } => println!("* {} is {:?}", id, status),
        MessagingEvent::DeliveryFailed { id, kind, reason } => {
            println!("* {} failed ({:?}): {}; /retry {}", id, kind, reason, id);
        }
        MessagingEvent::IdentityChanged { peer } => {
            println!("! identity key of {} changed; verify the safety number again", peer);
        }
        MessagingEvent::GroupJoined { group, epoch } => println!("* joined group {} at epoch {}", group, epoch),
        MessagingEvent::MessageDropped { peer, kind, reason } => {
            log::debug!("Dropped frame from {} ({:?}): {}", peer, kind, reason);
        }
    }
}

fn require_profile(config: &MessengerConfig) -> Result<UserProfile> {
    load_profile(&config.storage)
        .context("no identity found; run `messenger keys generate` first")
}

fn two_args(rest: &str) -> Result<(&str, &str)> {
    rest.split_once(' ')
        .map(|(first, second)| (first, second.trim()))
        .filter(|(_, second)| !second.is_empty())
        .ok_or_else(|| anyhow!("expected two arguments"))
}

/// Safety number in groups of five digits
fn group_digits(number: &str) -> String {
    number
        .as_bytes()
        .chunks(5)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
