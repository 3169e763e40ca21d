//! avatara CLI: talking-avatar session server and client.
//!
//! ```text
//! avatara serve [--port 8010] [--model wav2lip] [--avatar-id avator_1]
//! avatara new [--model musetalk] [--server http://localhost:8010]
//! avatara speak <session> "hello world" [--interrupt]
//! avatara audio <session> speech.wav
//! avatara interrupt / status / close <session>
//! avatara state <session> <audiotype> [--reinit]
//! avatara record <session> start|stop
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use avatara_lib::avatara_core::types::{CustomClipConfig, ModelConfig, SessionConfig, SynthConfig};
use avatara_lib::server::{ServerDefaults, ServerState};
use avatara_lib::synth::KokoroSynth;

/// Real-time talking-avatar sessions
#[derive(Parser)]
#[command(name = "avatara", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the avatara session server
    Serve {
        /// Listen port
        #[arg(long, default_value = "8010")]
        port: u16,
        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Renderer variant (wav2lip, ultralight, musetalk, static)
        #[arg(long, default_value = "wav2lip")]
        model: String,
        /// Avatar identity under --avatars-dir
        #[arg(long, default_value = "avator_1")]
        avatar_id: String,
        #[arg(long, default_value = "data/avatars")]
        avatars_dir: PathBuf,
        /// Renderer weights (default: <avatars-dir>/<avatar-id>/<model>.onnx)
        #[arg(long)]
        model_path: Option<PathBuf>,
        /// Skip the warm-up inference after loading a model
        #[arg(long)]
        no_warm_up: bool,
        /// Audio chunks per second (video runs at half)
        #[arg(long, default_value = "50")]
        fps: u32,
        /// Video frames per inference batch
        #[arg(long, default_value = "16")]
        batch_size: usize,
        #[arg(long, default_value = "10")]
        stride_left: usize,
        #[arg(long, default_value = "10")]
        stride_right: usize,
        /// Zero-pad trailing partial audio chunks instead of dropping them
        #[arg(long)]
        pad_partial: bool,
        /// Emit frames as fast as possible instead of in real time
        #[arg(long)]
        offline: bool,
        /// JSON list of custom clips: [{"audiotype", "imgpath", "audiopath"}]
        #[arg(long)]
        customopt: Option<PathBuf>,
        #[arg(long, default_value = "data")]
        record_dir: PathBuf,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,
        /// Kokoro TTS server URL
        #[arg(long, default_value = "http://localhost:8880")]
        kokoro_url: String,
        /// TTS voice
        #[arg(long, default_value = "af_heart")]
        voice: String,
        /// TTS speed
        #[arg(long, default_value = "1.0")]
        speed: f32,
    },
    /// Create a session and print its id
    New {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        avatar_id: Option<String>,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Speak text in a session
    Speak {
        session: u32,
        text: String,
        /// Cut off whatever the avatar is saying first
        #[arg(long)]
        interrupt: bool,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Upload a WAV file to a session
    Audio {
        session: u32,
        file: PathBuf,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Stop the current utterance
    Interrupt {
        session: u32,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Switch the idle custom state
    State {
        session: u32,
        audiotype: u32,
        /// Restart the clip from its first frame
        #[arg(long)]
        reinit: bool,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Start or stop recording
    Record {
        session: u32,
        action: RecordAction,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Get session status
    Status {
        session: u32,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
    /// Close a session
    Close {
        session: u32,
        #[arg(long, default_value = "http://localhost:8010")]
        server: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RecordAction {
    Start,
    Stop,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatara=info,avatara_lib=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            host,
            model,
            avatar_id,
            avatars_dir,
            model_path,
            no_warm_up,
            fps,
            batch_size,
            stride_left,
            stride_right,
            pad_partial,
            offline,
            customopt,
            record_dir,
            ffmpeg,
            kokoro_url,
            voice,
            speed,
        } => {
            let clips = match customopt {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .unwrap_or_else(|e| fail(&format!("cannot read {}: {e}", path.display())));
                    CustomClipConfig::parse_list(&json).unwrap_or_else(|e| fail(&e.to_string()))
                }
                None => Vec::new(),
            };
            let session = SessionConfig {
                fps,
                batch_size,
                stride_left,
                stride_right,
                realtime: !offline,
                pad_partial_chunk: pad_partial,
                record_dir,
                ffmpeg,
                queue_timeout: Duration::from_secs(1),
                ..Default::default()
            };
            if let Err(e) = session.validate() {
                fail(&e.to_string());
            }
            let defaults = ServerDefaults {
                session,
                model: ModelConfig {
                    model,
                    avatar_id,
                    avatars_dir,
                    model_path,
                    warm_up: !no_warm_up,
                },
                clips,
            };
            let synth = KokoroSynth::new(&SynthConfig {
                kokoro_url,
                voice,
                speed,
            });

            let state = Arc::new(ServerState::new(defaults, Arc::new(synth)));
            let app = avatara_lib::server::router(state);

            let addr = format!("{host}:{port}");
            eprintln!("avatara listening on {addr}");

            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind");

            axum::serve(listener, app).await.expect("server error");
        }

        Command::New {
            model,
            avatar_id,
            server,
        } => {
            post_json(
                &server,
                "session",
                serde_json::json!({ "model": model, "avatar_id": avatar_id }),
            )
            .await
        }

        Command::Speak {
            session,
            text,
            interrupt,
            server,
        } => {
            post_json(
                &server,
                "human",
                serde_json::json!({
                    "sessionid": session,
                    "type": "echo",
                    "text": text,
                    "interrupt": interrupt,
                }),
            )
            .await
        }

        Command::Audio {
            session,
            file,
            server,
        } => {
            let bytes = std::fs::read(&file)
                .unwrap_or_else(|e| fail(&format!("cannot read {}: {e}", file.display())));
            let resp = reqwest::Client::new()
                .post(format!("{server}/humanaudio?sessionid={session}"))
                .body(bytes)
                .send()
                .await
                .expect("request failed");
            println!("{}", resp.text().await.unwrap_or_default());
        }

        Command::Interrupt { session, server } => {
            post_json(&server, "interrupt_talk", serde_json::json!({ "sessionid": session })).await
        }

        Command::State {
            session,
            audiotype,
            reinit,
            server,
        } => {
            post_json(
                &server,
                "set_audiotype",
                serde_json::json!({ "sessionid": session, "audiotype": audiotype, "reinit": reinit }),
            )
            .await
        }

        Command::Record {
            session,
            action,
            server,
        } => {
            let kind = match action {
                RecordAction::Start => "start_record",
                RecordAction::Stop => "end_record",
            };
            post_json(
                &server,
                "record",
                serde_json::json!({ "sessionid": session, "type": kind }),
            )
            .await
        }

        Command::Status { session, server } => {
            let resp = reqwest::Client::new()
                .get(format!("{server}/session/{session}/status"))
                .send()
                .await
                .expect("request failed");
            println!("{}", resp.text().await.unwrap_or_default());
        }

        Command::Close { session, server } => {
            let resp = reqwest::Client::new()
                .delete(format!("{server}/session/{session}"))
                .send()
                .await
                .expect("request failed");
            println!("{}", resp.text().await.unwrap_or_default());
        }
    }
}

async fn post_json(server: &str, endpoint: &str, body: serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .json(&body)
        .send()
        .await
        .expect("request failed");
    println!("{}", resp.text().await.unwrap_or_default());
}

fn fail(msg: &str) -> ! {
    eprintln!("avatara: {msg}");
    std::process::exit(1);
}
