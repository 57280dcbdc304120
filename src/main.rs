use clap::Parser;
use dialogd::agent::{AgentServices, DirectiveRouter};
use dialogd::asr::{AsrAgent, AsrState, RecognitionListener, RecognitionResult};
use dialogd::audioplayer::{AudioPlayerAgent, AudioPlayerListener, AudioPlayerState};
use dialogd::config_loader::{self, Settings};
use dialogd::context::ContextManager;
use dialogd::device::EndPointDetector;
use dialogd::display::DisplayAgent;
use dialogd::executor::Scheduler;
use dialogd::focus::FocusArbiter;
use dialogd::ingress::{ChannelSender, Ingress};
use dialogd::playsync::PlaySynchronizer;
use dialogd::sim::{SimAudioInput, SimEndPointDetector, SimPlayer, SimRenderer};
use dialogd::tts::{TtsAgent, TtsListener, TtsState};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Dialog control plane daemon
#[derive(Parser)]
#[command(name = "dialogd")]
#[command(version)]
#[command(about = "Serves directives to the speech, audio and display agents", long_about = None)]
struct Args {
    /// Extra settings file, loaded after the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the directive ingress, overrides `listen_addr`
    #[arg(short, long)]
    listen: Option<String>,
}

/// Logs what the agents are doing.
struct ActivityLog;

impl TtsListener for ActivityLog {
    fn on_state_changed(&self, state: TtsState, dialog_request_id: &str) {
        info!(?state, dialog_request_id, "speech");
    }
}

impl RecognitionListener for ActivityLog {
    fn on_state_changed(&self, state: AsrState, dialog_request_id: &str) {
        info!(?state, dialog_request_id, "recognizer");
    }

    fn on_result(&self, result: &RecognitionResult, dialog_request_id: &str) {
        info!(?result, dialog_request_id, "recognition result");
    }
}

impl AudioPlayerListener for ActivityLog {
    fn on_state_changed(&self, state: AudioPlayerState, token: &str) {
        info!(?state, token, "audio player");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let (settings, load_error) = match &args.config {
        Some(path) => (Settings::load(Some(path.as_path()))?, None),
        None => config_loader::current(),
    };

    let filter = EnvFilter::try_from_env("DIALOGD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Some(error) = load_error {
        warn!(error = error.as_str(), "invalid settings; using defaults");
    }

    let scheduler = Arc::new(Scheduler::with_handle(tokio::runtime::Handle::current()));
    let context = Arc::new(ContextManager::new(scheduler.clone(), settings.context_timeout()));
    let sender = ChannelSender::new(256);
    let services = AgentServices {
        arbiter: Arc::new(FocusArbiter::new(settings.channel_configs())?),
        playsync: PlaySynchronizer::new(scheduler.clone()),
        scheduler: scheduler.clone(),
        sender: Arc::new(sender.clone()),
        context: context.clone(),
        event_ack_timeout: settings.event_ack_timeout(),
    };

    let timing = settings.sim_timing();
    let log = Arc::new(ActivityLog);

    let speech = Arc::new(SimPlayer::new("speech", scheduler.clone(), Some(timing)));
    let tts = TtsAgent::new(settings.tts_config(), services.clone(), speech)?;
    tts.add_listener(log.clone());

    // Simulated user: starts talking after 800ms, for 1.5s.
    let detector: Arc<dyn EndPointDetector> = Arc::new(SimEndPointDetector::new(
        scheduler.clone(),
        Some((Duration::from_millis(800), Duration::from_millis(1500))),
    ));
    let asr = AsrAgent::new(
        settings.asr_config(),
        services.clone(),
        Arc::new(SimAudioInput::default()),
        Some(detector),
    )?;
    asr.add_listener(log.clone());

    let music = Arc::new(SimPlayer::new("music", scheduler.clone(), Some(timing)));
    let audio_player = AudioPlayerAgent::new(settings.audio_player_config(), services.clone(), music)?;
    audio_player.add_listener(log);

    let renderer = Arc::new(SimRenderer::default());
    let display = DisplayAgent::new(settings.display_config(), services, renderer.clone())?;
    renderer.connect(&display);

    let router = Arc::new(DirectiveRouter::new());
    router.add_agent(tts.clone());
    router.add_agent(asr.clone());
    router.add_agent(audio_player.clone());
    router.add_agent(display.clone());
    context.add_provider(tts);
    context.add_provider(asr);
    context.add_provider(audio_player);
    context.add_provider(display);

    let addr = args.listen.unwrap_or_else(|| settings.listen_addr.clone());
    let listener = TcpListener::bind(&addr).await?;
    let ingress = Ingress::new(router, context, sender);

    tokio::select! {
        result = ingress.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
