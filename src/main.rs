use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use wakelink::Config;
use wakelink::peer::{LoopbackPeer, PeerMode};
use wakelink::permission::{HostMicrophoneAccess, PermissionGate, PermissionStatus};
use wakelink::session::{
    Command as SessionCommand, Coordinator, CoordinatorHandle, StatusUpdate, Subsystems,
};
use wakelink::voice::{
    AudioInput, Clip, Level, Microphone, PlaybackSession, SAMPLE_RATE, Speaker,
};

/// Port the loopback peer uses when `--port` is not given
const DEFAULT_PEER_PORT: u16 = 8000;

/// Wakelink - wake word voice client for a remote assistant
#[derive(Parser)]
#[command(name = "wakelink", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Assistant host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Assistant port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Arm the wake word as soon as the link opens
    #[arg(long, global = true)]
    listen: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive console (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Check microphone permission
    CheckPermission,
    /// Run a loopback assistant for local testing (listens on --port, default 8000)
    Peer {
        /// Response behaviour
        #[arg(long, value_enum, default_value_t = PeerMode::Echo)]
        mode: PeerMode,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,wakelink=info",
        1 => "info,wakelink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::TestMic { duration }) => test_mic(duration).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::CheckPermission) => check_permission().await,
        Some(Command::Peer { mode }) => {
            let port = cli.port.unwrap_or(DEFAULT_PEER_PORT);
            LoopbackPeer::bind(port, mode).await?.run().await?;
            Ok(())
        }
        Some(Command::Run) | None => {
            let config = load_config(cli.host, cli.port, cli.listen)?;
            console(config).await
        }
    }
}

/// Load configuration and apply command line overrides
fn load_config(host: Option<String>, port: Option<u16>, listen: bool) -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if listen {
        config.wake.listen_on_start = true;
    }
    config.validate()?;

    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

/// Interactive front-end: prints status, reads commands from stdin
#[allow(clippy::future_not_send)]
async fn console(config: Config) -> anyhow::Result<()> {
    let subsystems = Subsystems::host(&config)?;
    let (mut coordinator, handle) = Coordinator::new(&config, subsystems);

    println!("wakelink - {}", config.server.url()?);
    println!("  c = connect, d = disconnect, Enter/t = hold-to-speak on/off,");
    println!("  w = wake word on/off ('{}'), q = quit\n", config.wake.phrase);

    let printer = tokio::spawn(print_updates(handle.subscribe()));
    let input = tokio::spawn(read_commands(handle, config.wake.listen_on_start));

    coordinator.run().await;

    input.abort();
    printer.abort();
    Ok(())
}

async fn print_updates(mut updates: broadcast::Receiver<StatusUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                println!("[{}] {update}", update.at.format("%H:%M:%S"));
                if update.open_settings {
                    println!("  -> open your system settings to grant microphone access");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "status printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn read_commands(handle: CoordinatorHandle, listening: bool) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pressed = false;
    let mut wake = listening;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => Ok(None),
        };

        let command = match line {
            Ok(Some(line)) => match line.trim() {
                "c" => SessionCommand::Connect,
                "d" => SessionCommand::Disconnect,
                "" | "t" => {
                    pressed = !pressed;
                    if pressed {
                        SessionCommand::PressStart
                    } else {
                        SessionCommand::PressEnd
                    }
                }
                "w" => {
                    wake = !wake;
                    if wake {
                        SessionCommand::ArmWakeWord
                    } else {
                        SessionCommand::DisarmWakeWord
                    }
                }
                "q" => SessionCommand::Shutdown,
                other => {
                    println!("unknown command: {other}");
                    continue;
                }
            },
            Ok(None) => SessionCommand::Shutdown,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                SessionCommand::Shutdown
            }
        };

        let done = command == SessionCommand::Shutdown;
        if handle.send(command).await.is_err() || done {
            break;
        }
    }
}

/// Test microphone input with a level meter
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    // Same conversion path as a real utterance: downmixed and resampled
    let mut mic = Microphone::new(SAMPLE_RATE);
    mic.open()?;
    println!("Delivering {} Hz mono\n---", mic.sample_rate());

    let mut ticks = tokio::time::interval(Duration::from_secs(1));
    ticks.tick().await;
    for second in 1..=duration {
        ticks.tick().await;
        let samples = mic.take_samples()?;
        let level = Level::measure(&samples);
        println!(
            "[{second:2}s] {:>6} samples | RMS: {:.4} | Peak: {:.4} | [{}]",
            samples.len(),
            level.rms,
            level.peak,
            level.meter(50)
        );
    }
    mic.close();

    println!("---");
    println!("A silent meter or zero samples means wake word and hold-to-speak will hear nothing.");
    println!("Check the default input device (`pactl info`, `arecord -l`).");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let mut playback = PlaybackSession::new(Box::new(Speaker::new()));
    playback.play_clip(Clip::new(samples, sample_rate))?;

    match tokio::time::timeout(Duration::from_secs(5), playback.finished()).await {
        Ok(end) if end.completed => println!("Done!"),
        Ok(_) => println!("Playback was cut short"),
        Err(_) => println!("Playback did not finish in time"),
    }

    Ok(())
}

/// Report microphone authorization
async fn check_permission() -> anyhow::Result<()> {
    let mut gate = PermissionGate::new(Box::new(HostMicrophoneAccess));
    let status = gate.ensure().await;

    println!("Microphone permission: {status:?}");
    if status == PermissionStatus::Blocked {
        println!("{}", PermissionGate::settings_hint());
    }

    Ok(())
}
