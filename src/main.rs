//! Barbaric voice agent.
//!
//! Talks to an optional host UI via JSON-line IPC on stdin/stdout. All
//! components are built on the main thread before the tokio runtime starts;
//! the runtime only drives the command loop, and blocking work (capture,
//! model calls, plans) runs on `spawn_blocking` tasks that the loop awaits.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use barbaric_agent::assistant::{Assistant, ChatPlanner};
use barbaric_agent::capture::microphone::{list_devices, CpalMicrophone};
use barbaric_agent::capture::{CaptureGate, Listen};
use barbaric_agent::config::paths::{get_config_path, get_log_dir};
use barbaric_agent::config::{read_agent_config, save_agent_config_to, ConfigHandle};
use barbaric_agent::effectors::{
    EffectorRegistry, RdevInput, ScreenReader, SystemShell, TesseractReader,
};
use barbaric_agent::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader};
use barbaric_agent::ipc::{AgentCommand, AgentEvent, EchoSpeaker, IpcOverlay};
use barbaric_agent::logger;
use barbaric_agent::plan::PlanInterpreter;
use barbaric_agent::skills::SkillHost;
use barbaric_agent::speech::{system_renderer, Speak, SpeechChannel};
use barbaric_agent::supervisor::{Flow, ListeningSupervisor, UtteranceHandler};

/// How long shutdown waits for queued speech (the farewell) to finish.
const SHUTDOWN_SPEECH_WAIT: Duration = Duration::from_secs(8);

/// Reports each always-listen utterance to the host before handling it.
struct ReportingHandler(Arc<Assistant>);

impl UtteranceHandler for ReportingHandler {
    fn handle(&self, utterance: &str) -> anyhow::Result<Flow> {
        emit_event(&AgentEvent::Transcription {
            text: utterance.to_string(),
        });
        self.0.handle(utterance)
    }
}

struct Agent {
    config: ConfigHandle,
    speaker: Arc<dyn Speak>,
    gate: Arc<CaptureGate>,
    skills: Arc<SkillHost>,
    assistant: Arc<Assistant>,
    supervisor: ListeningSupervisor,
}

fn loading(step: &str) {
    emit_event(&AgentEvent::Loading {
        step: step.to_string(),
    });
}

/// Build every component. Only a missing speech engine is fatal.
fn build_agent(config: ConfigHandle, exit_tx: mpsc::UnboundedSender<()>) -> anyhow::Result<Agent> {
    loading("Initializing speech...");
    let renderer = system_renderer(&config).context("no usable speech engine")?;
    let speech = Arc::new(SpeechChannel::spawn(config.clone(), renderer));
    let speaker: Arc<dyn Speak> = Arc::new(EchoSpeaker::new(speech.clone()));

    loading("Opening microphone...");
    let devices = list_devices();
    info!(?devices, "Input devices");
    if devices.is_empty() {
        warn!("No input devices found; listening will time out");
    }
    let mic = Arc::new(CpalMicrophone::new(config.clone()));
    let gate = Arc::new(CaptureGate::new(mic, speech.playback(), config.clone()));

    loading("Checking OCR...");
    let reader = Arc::new(TesseractReader::new(config.clone()));
    if let Err(reason) = reader.check_available() {
        warn!(%reason, "OCR unavailable; screen reading and click-by-text will fail");
        emit_error(&format!("OCR unavailable: {}", reason));
    }
    let effectors = EffectorRegistry::new(Arc::new(RdevInput::new()), Arc::new(SystemShell), reader);

    loading("Loading skills...");
    let skills = Arc::new(SkillHost::new(config.clone()));
    let count = skills.load_all();
    emit_event(&AgentEvent::SkillsReloaded { count });

    let interpreter = PlanInterpreter::new(
        config.clone(),
        speaker.clone(),
        gate.clone(),
        effectors,
        skills.clone(),
    )
    .with_overlay(Arc::new(IpcOverlay));
    let planner = Arc::new(ChatPlanner::new(config.clone()));
    let assistant = Arc::new(Assistant::new(planner, Arc::new(interpreter), speaker.clone()));

    let supervisor = ListeningSupervisor::new(
        gate.clone(),
        Arc::new(ReportingHandler(assistant.clone())),
        speaker.clone(),
    )
    .with_exit_hook(move || {
        let _ = exit_tx.send(());
    });

    Ok(Agent {
        config,
        speaker,
        gate,
        skills,
        assistant,
        supervisor,
    })
}

fn set_always_listen(agent: &Agent, enabled: bool) {
    if enabled {
        agent.supervisor.start();
    } else {
        agent.supervisor.stop();
    }
    emit_event(&AgentEvent::ListeningState { active: enabled });
}

/// Run `respond` off the async thread. Returns `false` when the session should end.
async fn respond_blocking(agent: &Agent, text: String) -> bool {
    let assistant = agent.assistant.clone();
    match tokio::task::spawn_blocking(move || assistant.respond(&text)).await {
        Ok(Ok(Flow::Exit)) => false,
        Ok(_) => true,
        Err(e) => {
            error!("Request task failed: {}", e);
            emit_error("Request failed");
            true
        }
    }
}

fn apply_config_update(agent: &Agent, patch: serde_json::Value) {
    if !patch.is_object() {
        emit_error("config_update expects a JSON object");
        return;
    }
    let current = agent.config.snapshot();
    let updated = match current.merged(&patch) {
        Ok(updated) => updated,
        Err(e) => {
            warn!("Rejected config update: {}", e);
            emit_error(&format!("Invalid configuration: {}", e));
            return;
        }
    };
    agent.config.replace(updated.clone());
    if let Err(e) = save_agent_config_to(&get_config_path(), &updated) {
        warn!("Failed to persist configuration: {}", e);
    }
    info!("Configuration updated");

    if updated.always_listen != current.always_listen {
        set_always_listen(agent, updated.always_listen);
    }
    match updated.to_public_json() {
        Ok(config) => emit_event(&AgentEvent::ConfigUpdated { config }),
        Err(e) => error!("Failed to serialize configuration: {}", e),
    }
}

/// Handle a single command from the host.
/// Returns `false` if the main loop should exit.
async fn handle_command(agent: &Agent, cmd: AgentCommand) -> bool {
    match cmd {
        AgentCommand::Ping {} => {
            emit_event(&AgentEvent::Pong {});
        }

        AgentCommand::Stop {} => {
            return false;
        }

        AgentCommand::Query { text } => {
            info!(text = %text, "Query received");
            return respond_blocking(agent, text).await;
        }

        AgentCommand::ExecutePlan { plan } => {
            let raw = plan.to_string();
            let interpreter = agent.assistant.interpreter().clone();
            match tokio::task::spawn_blocking(move || interpreter.execute(&raw)).await {
                Ok(report) => info!(?report, "Host plan executed"),
                Err(e) => {
                    error!("Plan task failed: {}", e);
                    emit_error("Plan execution failed");
                }
            }
        }

        AgentCommand::ListenOnce {} => {
            if agent.supervisor.is_running() {
                emit_error("Always listen is active");
                return true;
            }
            let gate = agent.gate.clone();
            let heard = match tokio::task::spawn_blocking(move || gate.capture()).await {
                Ok(heard) => heard,
                Err(e) => {
                    error!("Capture task failed: {}", e);
                    None
                }
            };
            if let Some(text) = heard {
                emit_event(&AgentEvent::Transcription { text: text.clone() });
                return respond_blocking(agent, text).await;
            }
            info!("Nothing heard");
        }

        AgentCommand::SystemSpeak { text } => {
            agent.speaker.say(&text);
        }

        AgentCommand::SetAlwaysListen { enabled } => {
            agent.config.update(|c| c.always_listen = enabled);
            set_always_listen(agent, enabled);
        }

        AgentCommand::ReloadSkills {} => {
            let skills = agent.skills.clone();
            match tokio::task::spawn_blocking(move || skills.load_all()).await {
                Ok(count) => emit_event(&AgentEvent::SkillsReloaded { count }),
                Err(e) => {
                    error!("Skill reload task failed: {}", e);
                    emit_error("Skill reload failed");
                }
            }
        }

        AgentCommand::ConfigUpdate { config } => {
            apply_config_update(agent, config);
        }
    }
    true
}

async fn command_loop(agent: &Agent, mut exit_rx: mpsc::UnboundedReceiver<()>) {
    let mut cmd_rx = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if stdin_open => {
                match cmd {
                    Some(command) => {
                        if !handle_command(agent, command).await {
                            break;
                        }
                    }
                    None => {
                        if !agent.supervisor.is_running() {
                            info!("stdin closed, shutting down");
                            break;
                        }
                        info!("stdin closed, continuing in always-listen mode");
                        stdin_open = false;
                    }
                }
            }
            Some(()) = exit_rx.recv() => {
                info!("Session ended by voice");
                break;
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    emit_event(&AgentEvent::Starting {});

    loading("Reading configuration...");
    let config = ConfigHandle::new(read_agent_config());
    info!(config = ?config.snapshot(), "Configuration loaded");

    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let agent = build_agent(config.clone(), exit_tx)?;

    emit_event(&AgentEvent::Ready {});
    info!("Agent ready");
    let snapshot = config.snapshot();
    agent.speaker.say(&format!(
        "Hello! I am {}, your smart assistant. How can I help you today?",
        snapshot.agent_name
    ));
    if snapshot.always_listen {
        set_always_listen(&agent, true);
    }

    let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    runtime.block_on(command_loop(&agent, exit_rx));
    runtime.shutdown_timeout(Duration::from_secs(1));

    emit_event(&AgentEvent::Stopping {});
    info!("Agent shutting down");
    agent.supervisor.stop();
    if !agent.speaker.wait_until_idle(SHUTDOWN_SPEECH_WAIT) {
        warn!("Exiting with speech still queued");
    }
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = logger::init(&get_log_dir()) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            emit_error(&format!("Fatal: {:#}", e));
            ExitCode::FAILURE
        }
    }
}
