use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::models::{EngineState, RigEvent, RunOutcome, StepKind, StepRecord};
use super::{CommandHistory, CycleState, Result, RigError, Sequencer, SharedLink};
use crate::config::{RigConfig, SerialSettings};
use crate::serial::protocol::normalize_command;
use crate::serial::{GcodeProtocol, HostPlatform, LineTransport, SerialInterface, TranscriptLine};

/// Opens the transport for `connect`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, settings: &SerialSettings) -> Result<Box<dyn LineTransport>>;
}

/// Discovers (unless a port is configured) and opens the real serial device.
pub struct SerialConnector {
    platform: HostPlatform,
}

impl SerialConnector {
    pub fn new(platform: HostPlatform) -> Self {
        Self { platform }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(HostPlatform::current())
    }
}

#[async_trait::async_trait]
impl Connector for SerialConnector {
    async fn open(&self, settings: &SerialSettings) -> Result<Box<dyn LineTransport>> {
        let port_name = match &settings.port {
            Some(port) => port.clone(),
            None => SerialInterface::discover_port(self.platform, settings)?,
        };
        log::info!("Attempting to connect to port: {}", port_name);
        let interface = SerialInterface::open(&port_name, settings.baud_rate, settings.read_timeout())?
            .with_reset_settle(settings.reset_settle());
        Ok(Box::new(interface))
    }
}

/// Entry point for the presentation layer.
///
/// Owns the link, the step list, the ad-hoc replay buffer and the command
/// history. Long runs go to a spawned worker; results come back as events.
pub struct RigController {
    config: RigConfig,
    connector: Box<dyn Connector>,
    sequencer: Sequencer,
    transcript: broadcast::Sender<TranscriptLine>,
    steps: Arc<RwLock<Vec<StepRecord>>>,
    source: Arc<RwLock<Vec<String>>>,
    history: Arc<Mutex<CommandHistory>>,
    worker: Mutex<Option<JoinHandle<RunOutcome>>>,
}

impl RigController {
    pub fn new(config: RigConfig) -> Self {
        Self::with_connector(config, Box::new(SerialConnector::default()))
    }

    pub fn with_connector(config: RigConfig, connector: Box<dyn Connector>) -> Self {
        let link: SharedLink = Arc::new(Mutex::new(None));
        let (transcript, _) = broadcast::channel(1024);
        Self {
            sequencer: Sequencer::new(link, &config),
            config,
            connector,
            transcript,
            steps: Arc::new(RwLock::new(Vec::new())),
            source: Arc::new(RwLock::new(Vec::new())),
            history: Arc::new(Mutex::new(CommandHistory::new())),
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RigEvent> {
        self.sequencer.subscribe_events()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptLine> {
        self.transcript.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.sequencer.state_receiver()
    }

    pub fn state(&self) -> EngineState {
        self.sequencer.state()
    }

    pub async fn is_connected(&self) -> bool {
        self.sequencer.link().lock().await.is_some()
    }

    pub async fn cycle_state(&self) -> CycleState {
        self.sequencer.cycle_state().await
    }

    /// Open the controller, run the reset handshake, then bring-up.
    ///
    /// If bring-up fails the link stays open; `reset` re-runs it from the top.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut link = self.sequencer.link().lock().await;
            if link.is_some() {
                return Err(RigError::AlreadyConnected);
            }

            let transport = self.connector.open(&self.config.serial).await?;
            let mut protocol = GcodeProtocol::new(transport, self.config.timing.clone())
                .with_transcript(self.transcript.clone());
            protocol.reset().await?;

            log::info!("Connected to controller on {}", protocol.transport().info().port_name);
            *link = Some(protocol);
        }

        self.sequencer.reset_cycle().await;
        self.sequencer.stop_signal().clear();
        self.sequencer.initialize().await
    }

    /// Reset handshake and bring-up on the already-open link.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_idle().await?;
        {
            let mut link = self.sequencer.link().lock().await;
            let protocol = link.as_mut().ok_or(RigError::LinkUnavailable)?;
            protocol.reset().await?;
            log::info!("Controller reset on {}", protocol.transport().info().port_name);
        }

        self.sequencer.reset_cycle().await;
        self.sequencer.stop_signal().clear();
        self.sequencer.initialize().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_idle().await?;
        let protocol = self.sequencer.link().lock().await.take();
        match protocol {
            Some(protocol) => {
                log::info!("Disconnected from {}", protocol.transport().info().port_name);
                self.sequencer.reset_cycle().await;
                Ok(())
            }
            None => Err(RigError::LinkUnavailable),
        }
    }

    /// Validate and append a step. Returns the stored record.
    pub async fn add_step(&self, name: &str, kind: StepKind, duration_text: &str) -> Result<StepRecord> {
        let record = StepRecord::new(name, kind, duration_text)?;
        self.steps.write().await.push(record.clone());
        log::debug!("Added step '{}' ({}, {})", record.name, record.kind, record.duration);
        Ok(record)
    }

    pub async fn steps(&self) -> Vec<StepRecord> {
        self.steps.read().await.clone()
    }

    pub async fn clear_steps(&self) -> Result<()> {
        self.ensure_idle().await?;
        self.steps.write().await.clear();
        Ok(())
    }

    /// Replace the ad-hoc replay buffer. On error the previous buffer is kept.
    pub async fn load_steps_from_source<I, S>(&self, lines: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = parse_source(lines)?;
        let count = parsed.len();
        *self.source.write().await = parsed;
        log::info!("Loaded {} g-code lines for replay", count);
        Ok(count)
    }

    pub async fn load_source_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RigError::SourceFormat(format!("{}: {}", path.display(), e)))?;
        self.load_steps_from_source(text.lines()).await
    }

    pub async fn loaded_source(&self) -> Vec<String> {
        self.source.read().await.clone()
    }

    /// Spawn a worker that runs `steps`. Returns the run id immediately.
    pub async fn start(&self, steps: Vec<StepRecord>) -> Result<Uuid> {
        self.spawn_run(move |sequencer| async move { sequencer.run(&steps).await })
            .await
    }

    /// Spawn a worker that sends the loaded source lines in order.
    pub async fn replay(&self) -> Result<Uuid> {
        let lines = self.loaded_source().await;
        if lines.is_empty() {
            return Err(RigError::SourceFormat("no g-code loaded".to_string()));
        }
        self.spawn_run(move |sequencer| async move { sequencer.replay(&lines).await })
            .await
    }

    async fn spawn_run<F, Fut>(&self, job: F) -> Result<Uuid>
    where
        F: FnOnce(Sequencer) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(RigError::Busy(self.state()));
        }
        if !self.is_connected().await {
            return Err(RigError::LinkUnavailable);
        }
        if self.state() != EngineState::Idle {
            return Err(RigError::Busy(self.state()));
        }

        let run_id = Uuid::new_v4();
        let sequencer = self.sequencer.clone();
        sequencer.stop_signal().clear();
        sequencer.set_state(EngineState::Running { step_index: 0 });
        log::info!("Starting run {}", run_id);

        *worker = Some(tokio::spawn(async move {
            let outcome = match job(sequencer.clone()).await {
                Ok(()) => RunOutcome::Completed,
                Err(RigError::Stopped) => RunOutcome::Stopped,
                Err(e) => {
                    log::error!("Run {} aborted: {}", run_id, e);
                    RunOutcome::Aborted(e.to_string())
                }
            };
            log::info!("Run {} finished: {:?}", run_id, outcome);
            sequencer.emit(RigEvent::RunFinished {
                run_id,
                outcome: outcome.clone(),
            });
            outcome
        }));

        Ok(run_id)
    }

    /// Wait for the current (or last) run to finish.
    pub async fn join_run(&self) -> Option<RunOutcome> {
        let handle = self.worker.lock().await.take()?;
        Some(match handle.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Aborted(format!("worker failed: {}", e)),
        })
    }

    /// Stop whatever is running and send the firmware hard stop.
    pub async fn em_stop(&self) -> Result<Vec<String>> {
        self.sequencer.em_stop().await
    }

    /// Send one ad-hoc command and return its response lines.
    pub async fn send_raw(&self, text: &str) -> Result<Vec<String>> {
        let command = normalize_command(text);
        if command.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_idle().await?;

        let mut link = self.sequencer.link().lock().await;
        let protocol = link.as_mut().ok_or(RigError::LinkUnavailable)?;
        self.history.lock().await.record(command.clone());
        Ok(protocol.transmit(&command).await?)
    }

    pub async fn recall_previous(&self) -> Result<String> {
        self.history.lock().await.recall_previous()
    }

    pub async fn recall_next(&self) -> Result<String> {
        self.history.lock().await.recall_next()
    }

    pub async fn history(&self) -> Vec<String> {
        self.history.lock().await.entries().to_vec()
    }

    async fn ensure_idle(&self) -> Result<()> {
        let worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(RigError::Busy(self.state()));
        }
        match self.state() {
            EngineState::Idle => Ok(()),
            other => Err(RigError::Busy(other)),
        }
    }
}

/// Parse a plain-text g-code source: one command per line, `;` comments and
/// blank lines dropped, every command starting with a word letter and number.
pub fn parse_source<I, S>(lines: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut commands = Vec::new();
    for (index, raw) in lines.into_iter().enumerate() {
        let raw = raw.as_ref();
        let line = raw.split(';').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let mut chars = line.chars();
        let starts_with_word = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.next().is_some_and(|c| c.is_ascii_digit());
        if !starts_with_word || line.chars().any(|c| c.is_control()) {
            return Err(RigError::SourceFormat(format!(
                "line {}: not a g-code command: {:?}",
                index + 1,
                raw
            )));
        }
        commands.push(normalize_command(line));
    }
    Ok(commands)
}
