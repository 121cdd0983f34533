use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use companion_voice::voice::{
    CpalRecorder, CpalSpeaker, EnergyBudget, PLAYBACK_SAMPLE_RATE, PipelineEvent, Recorder, Role,
    VoicePipeline,
};
use companion_voice::{Config, SpeakOutcome};

/// Companion voice - hands-free speech in and out for a chat companion
#[derive(Parser)]
#[command(name = "companion-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Synthesize text and play it
    Speak {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Voice identifier (defaults to the configured voice)
        #[arg(long)]
        voice: Option<String>,
    },
    /// Record one utterance and print its transcription
    Listen,
    /// Hands-free loop: every utterance is answered out loud
    Converse,
    /// Show the voice energy budget
    Energy,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,companion_voice=info",
        1 => "info,companion_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

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
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Speak { text, voice } => speak(&text, voice.as_deref()).await,
        Command::Listen => listen().await,
        Command::Converse => converse().await,
        Command::Energy => energy(),
    }
}

fn load_pipeline() -> anyhow::Result<(Config, VoicePipeline)> {
    let config = Config::load()?;
    tracing::debug!(?config.voice, data_dir = %config.data_dir.display(), "loaded configuration");
    let pipeline = VoicePipeline::from_config(&config)?;
    Ok((config, pipeline))
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut recorder = CpalRecorder::new()?;
    recorder.open()?;
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let level = recorder.level_db();

        // Visual meter over -80..0 dB
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = ((level + 80.0).clamp(0.0, 80.0) * 50.0 / 80.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] level: {:7.1} dBFS | [{}]", i + 1, level, meter);
    }

    let artifact = recorder.finish()?;

    println!("\n---");
    println!(
        "Captured {:.1}s ({} bytes of WAV)",
        artifact.duration.as_secs_f32(),
        artifact.wav.len()
    );
    println!("If the meter rose above -55 dBFS while you spoke, your mic is working!");
    println!("If it stayed near -160, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let speaker = CpalSpeaker::new()?;

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), PLAYBACK_SAMPLE_RATE);

    let end = speaker.play_samples(samples)?.wait().await;

    println!("\n---");
    println!("Playback ended: {end:?}");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Synthesize and play one phrase
async fn speak(text: &str, voice: Option<&str>) -> anyhow::Result<()> {
    let (_config, pipeline) = load_pipeline()?;
    let mut events = pipeline.subscribe();
    let voice = voice.map_or_else(|| pipeline.voice_id().to_string(), ToString::to_string);

    match pipeline.speak(text, &voice).await? {
        SpeakOutcome::Playing => {
            wait_for(&mut events, |e| matches!(e, PipelineEvent::SpeakingFinished)).await;
        }
        SpeakOutcome::QuotaExhausted => {
            println!("Voice energy is exhausted; it refills tomorrow.");
        }
        SpeakOutcome::Superseded => {}
    }

    println!("Energy remaining: {:.0}%", pipeline.energy_percent());
    pipeline.shutdown().await;
    Ok(())
}

/// Record until silence and print the transcription
async fn listen() -> anyhow::Result<()> {
    let (_config, pipeline) = load_pipeline()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    pipeline
        .start_recording(Arc::new(move |text| {
            let _ = tx.send(text);
        }))
        .await?;
    println!("Listening... (stops after 2s of silence, Ctrl-C to stop now)");

    let text = tokio::select! {
        Some(text) = rx.recv() => text,
        _ = tokio::signal::ctrl_c() => pipeline.stop_recording().await,
    };

    if text.is_empty() {
        println!("(nothing recognized)");
    } else {
        println!("{text}");
    }
    pipeline.shutdown().await;
    Ok(())
}

/// Hands-free conversation with an echo reply
async fn converse() -> anyhow::Result<()> {
    let (_config, pipeline) = load_pipeline()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = {
        let pipeline = pipeline.clone();
        Arc::new(move |text: String| {
            pipeline.message_posted(Role::User);
            let _ = tx.send(text);
        })
    };

    pipeline.set_hands_free(true);
    pipeline.start_recording(handler).await?;
    println!("Hands-free on. Talk, pause, and listen for the reply. Ctrl-C to quit.");

    loop {
        let text = tokio::select! {
            Some(text) = rx.recv() => text,
            _ = tokio::signal::ctrl_c() => break,
        };
        println!("you: {text}");

        let reply = format!("You said: {text}");
        println!("companion: {reply}");
        match pipeline.speak(&reply, pipeline.voice_id()).await {
            Ok(SpeakOutcome::QuotaExhausted) => {
                println!("(voice energy exhausted, reply shown as text only)");
            }
            Ok(_) => {}
            Err(e) => println!("(could not speak: {e})"),
        }
        pipeline.message_posted(Role::Assistant);
    }

    pipeline.shutdown().await;
    Ok(())
}

/// Print the persisted energy budget
fn energy() -> anyhow::Result<()> {
    let config = Config::load()?;
    let mut budget =
        EnergyBudget::load_or_new(&config.energy_path(), chrono::Local::now().date_naive());
    budget.set_premium_exempt(config.premium);

    println!("Energy:      {:.0}%", budget.energy_percent());
    println!("Last reset:  {}", budget.last_reset_date());
    println!("Premium:     {}", budget.is_premium_exempt());
    println!("Tired:       {}", budget.is_tired());
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<PipelineEvent>,
    done: impl Fn(&PipelineEvent) -> bool,
) {
    loop {
        match events.recv().await {
            Ok(event) if done(&event) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
