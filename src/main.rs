use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::stream;
use tracing_subscriber::EnvFilter;

use cadence_voice::audio::{AudioFrame, FRAME_DURATION, read_wav, split_frames, write_wav};
use cadence_voice::config::file::config_file_path;
use cadence_voice::ports::RIME_SAMPLE_RATE;
use cadence_voice::{AgentConfig, Job, JobDispatcher, LocalRoom, RoomTransport, VoiceAssistant};

/// Cadence - Session orchestration core for real-time voice agents
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session against a recorded participant
    Simulate {
        /// WAV file played as the participant's microphone
        #[arg(short, long)]
        input: PathBuf,
        /// WAV file receiving everything the agent said
        #[arg(short, long, default_value = "agent.wav")]
        output: PathBuf,
        /// Room name reported in logs
        #[arg(long, default_value = "local")]
        room: String,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,cadence_voice=info",
        1 => "info,cadence_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Simulate {
            input,
            output,
            room,
        } => simulate(&input, &output, room).await,
        Command::Config => show_config(),
    }
}

/// Feed a WAV file through a full session and record the agent's audio
async fn simulate(input: &Path, output: &Path, room: String) -> anyhow::Result<()> {
    let config = AgentConfig::load()?;
    let (samples, sample_rate) = read_wav(input)?;
    let mut frames = split_frames(&samples, sample_rate, FRAME_DURATION);

    // The caller leaves when the recording runs out. Trailing silence lets a
    // last utterance that runs to the end of the file finish its turn first.
    let tail = config.max_silence.as_millis() / FRAME_DURATION.as_millis() + 1;
    frames.extend((0..tail).map(|_| AudioFrame::silence(FRAME_DURATION, sample_rate)));
    tracing::info!(
        input = %input.display(),
        sample_rate,
        frames = frames.len(),
        "starting simulated session"
    );

    let room = Arc::new(LocalRoom::new(room));
    room.join("caller", stream::iter(frames));
    let speaker = room.output();

    let dispatcher = JobDispatcher::new(Arc::new(VoiceAssistant::new(config)));
    dispatcher.prewarm().await?;

    let transport: Arc<dyn RoomTransport> = room;
    let handle = dispatcher.dispatch(Job::new(transport)).await?;
    let report = handle.await??;

    let out_rate = speaker
        .frames()
        .first()
        .map_or(RIME_SAMPLE_RATE, |f| f.sample_rate());
    write_wav(output, &speaker.samples(), out_rate)?;

    println!("session {} ended: {:?}", report.job_id, report.end_reason);
    println!("usage: {}", report.summary);
    println!("agent audio written to {}", output.display());
    if !report.failed_callbacks.is_empty() {
        println!("failed shutdown callbacks: {}", report.failed_callbacks.join(", "));
    }

    Ok(())
}

/// Print configuration with secrets redacted
fn show_config() -> anyhow::Result<()> {
    let config = AgentConfig::load()?;
    let redact = |set: bool| if set { "set" } else { "not set" };

    match config_file_path() {
        Some(path) => println!("config file:         {}", path.display()),
        None => println!("config file:         (no home directory)"),
    }
    println!("instructions:        {}", config.instructions);
    println!(
        "greeting:            {}",
        config.greeting.as_deref().unwrap_or("(none)")
    );
    println!("max silence:         {:?}", config.max_silence);
    println!("min silence:         {:?}", config.min_silence);
    println!("queue capacity:      {}", config.queue_capacity);
    println!("failure policy:      {:?}", config.failure_policy);
    println!("participant timeout: {:?}", config.participant_timeout);
    println!("connect retries:     {}", config.connect_retry.max_retries);
    println!("stt model:           {}", config.models.stt_model);
    println!("llm model:           {}", config.models.llm_model);
    println!(
        "tts model:           {} ({})",
        config.models.tts_model, config.models.tts_voice
    );
    if let Some(url) = &config.models.openai_base_url {
        println!("openai base url:     {url}");
    }
    println!("openai api key:      {}", redact(config.api_keys.openai.is_some()));
    println!("rime api key:        {}", redact(config.api_keys.rime.is_some()));

    Ok(())
}
