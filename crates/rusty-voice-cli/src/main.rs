use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use rusty_voice_core::config::{Config, LoggingConfig};
use rusty_voice_gateway::{GatewayState, PipelineFactory};

#[derive(Parser)]
#[command(
    name = "rusty-voice",
    about = "Real-time voice assistant: streaming transcription, generation and speech with barge-in",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Talk to the assistant through the local microphone and speaker
    #[cfg(feature = "device")]
    Talk,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,

    /// Check configuration and provider credentials
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config with secrets redacted
    Show,
    /// Print one value by dotted path (e.g. "barge_in.debounce_ms")
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Gateway { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!("Starting Rusty Voice gateway on port {port}");

            let pipeline = PipelineFactory::from_config(&config)?;
            let state = GatewayState::new(Arc::new(config), Arc::new(pipeline));
            #[cfg(feature = "prometheus")]
            let state = state.with_prometheus(rusty_voice_gateway::metrics::install_prometheus_recorder());

            rusty_voice_gateway::start_gateway(Arc::new(state), port).await?;
        }
        #[cfg(feature = "device")]
        Commands::Talk => talk::run(&config).await?,
        Commands::Status => {
            println!("Rusty Voice v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {}", config.gateway_port());
            match probe_gateway(&config).await {
                Some(sessions) => println!("Status: running ({sessions} active sessions)"),
                None => println!("Status: not running"),
            }
        }
        Commands::Doctor => {
            let failures = doctor(&config, &config_path);
            if failures > 0 {
                anyhow::bail!("{failures} check(s) failed");
            }
        }
        Commands::Config { action } => {
            let mut value = serde_json::to_value(&config)?;
            redact_secrets(&mut value);
            match action {
                ConfigAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                ConfigAction::Get { key } => match lookup_path(&value, &key) {
                    Some(found) => println!("{}", serde_json::to_string_pretty(found)?),
                    None => anyhow::bail!("No config value at '{key}'"),
                },
            }
        }
    }

    Ok(())
}

/// Configure the tracing subscriber from the `logging` section.
///
/// `RUST_LOG` overrides everything; `--verbose` overrides the configured level.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        logging
            .and_then(|l| l.level.as_deref())
            .unwrap_or("info")
    };
    let mut directives = level.to_string();
    for extra in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(extra);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Ask a running gateway for its health; returns the active session count.
async fn probe_gateway(config: &Config) -> Option<u64> {
    let url = format!(
        "http://{}:{}/health",
        config.gateway_bind(),
        config.gateway_port()
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let body: Value = client.get(url).send().await.ok()?.json().await.ok()?;
    body["sessions"].as_u64()
}

const SECRET_KEYS: &[&str] = &["api_key", "token"];

fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) && child.is_string() {
                    *child = Value::String("***".into());
                } else {
                    redact_secrets(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

fn lookup_path<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(value, |current, part| match current {
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(part),
    })
}

/// Print one line per check; returns the number of failures.
fn doctor(config: &Config, config_path: &Path) -> usize {
    let mut failures = 0;
    let mut report = |ok: bool, what: &str, detail: String| {
        let mark = if ok { "ok" } else { "FAIL" };
        println!("[{mark:>4}] {what}: {detail}");
        if !ok {
            failures += 1;
        }
    };

    report(
        true,
        "config",
        if config_path.exists() {
            config_path.display().to_string()
        } else {
            format!("{} (missing, using defaults)", config_path.display())
        },
    );

    match rusty_voice_providers::registry::resolve(config) {
        Ok(resolved) => report(
            true,
            "language model",
            format!("{} / {}", resolved.provider.id(), config.model()),
        ),
        Err(e) => report(false, "language model", e.to_string()),
    }

    match rusty_voice_media::stt::build_provider(&config.transcription, &config.capture) {
        Ok(stt) => report(
            true,
            "transcription",
            format!("{} at {} Hz", stt.id(), config.transcription.sample_rate),
        ),
        Err(e) => report(false, "transcription", e.to_string()),
    }

    match rusty_voice_media::tts_stream::build_provider(&config.tts) {
        Ok(tts) => report(true, "synthesis", tts.id().to_string()),
        Err(e) => report(false, "synthesis", e.to_string()),
    }

    if config.memory.enabled {
        let path = config.memory_path();
        let writable = path
            .parent()
            .is_none_or(|dir| dir.exists() || std::fs::create_dir_all(dir).is_ok());
        report(writable, "memory", path.display().to_string());
    } else {
        report(true, "memory", "disabled".into());
    }

    report(
        true,
        "gateway",
        format!(
            "{}:{} (auth {})",
            config.gateway_bind(),
            config.gateway_port(),
            if config.gateway_token().is_some() { "on" } else { "off" }
        ),
    );

    failures
}

#[cfg(feature = "device")]
mod talk {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use rusty_voice_core::config::Config;
    use rusty_voice_core::protocol::ServerEvent;
    use rusty_voice_gateway::PipelineFactory;
    use rusty_voice_media::capture::AudioCapture;
    use rusty_voice_media::capture::device::DeviceCapture;
    use rusty_voice_media::sink::device::SpeakerSink;

    /// Speaker output needs raw PCM, so the synthesis format must be `pcm_<rate>`.
    fn playback_rate(config: &Config) -> anyhow::Result<u32> {
        config
            .tts
            .output_format
            .as_deref()
            .and_then(|f| f.strip_prefix("pcm_"))
            .and_then(|rate| rate.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("talk requires tts.output_format = \"pcm_<rate>\""))
    }

    pub async fn run(config: &Config) -> anyhow::Result<()> {
        let factory = PipelineFactory::from_config(config)?;
        let speaker = SpeakerSink::open(playback_rate(config)?)?;

        let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(256);
        let mut session = factory.start_session_with_sink(events_tx, Arc::new(speaker));

        // The device writes into its own queue; frames are forwarded into the session.
        let (mic_tx, mut mic_rx) = AudioCapture::channel(config.frame_bytes(), config.capture.queue_frames);
        let _mic = DeviceCapture::start(mic_tx, config.transcription.sample_rate)?;
        println!("Listening. Press Ctrl+C to stop.");

        loop {
            tokio::select! {
                frame = mic_rx.recv() => match frame {
                    Some(frame) => {
                        session.push_audio(&frame.pcm);
                    }
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Some(ServerEvent::Transcript { text, is_final: true, .. }) => println!("you: {text}"),
                    Some(ServerEvent::Turn { role, text }) => println!("{role:?}: {text}"),
                    Some(ServerEvent::BargeIn { .. }) => println!("(interrupted)"),
                    Some(ServerEvent::TextOnly { text, .. }) => println!("(unspoken) {text}"),
                    Some(ServerEvent::Halted { reason }) => println!("halted: {reason}"),
                    Some(ServerEvent::Error { code, message }) => eprintln!("error [{code}]: {message}"),
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        let finished = session.finish().await?;
        println!(
            "Session {} ended after {} turns",
            finished.id,
            finished.turns().len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_secrets() {
        let mut value = serde_json::json!({
            "tts": {"api_key": "sk-live", "api_key_env": "TTS_KEY"},
            "models": {"providers": [{"id": "openai", "api_key": "sk-x"}]},
            "gateway": {"auth": {"token": "hunter2"}}
        });
        redact_secrets(&mut value);
        assert_eq!(value["tts"]["api_key"], "***");
        assert_eq!(value["tts"]["api_key_env"], "TTS_KEY");
        assert_eq!(value["models"]["providers"][0]["api_key"], "***");
        assert_eq!(value["gateway"]["auth"]["token"], "***");
    }

    #[test]
    fn test_lookup_path() {
        let value = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(lookup_path(&value, "barge_in.debounce_ms"), Some(&Value::from(0)));
        assert_eq!(lookup_path(&value, "capture.frame_ms"), Some(&Value::from(20)));
        assert!(lookup_path(&value, "capture.nope").is_none());
    }
}
