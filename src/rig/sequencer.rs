//! Step sequencing: bring-up, timed dispense/aspirate cycles, replay.
//!
//! The sequencer never holds the link across a dwell. It takes the lock for a
//! single transmit at a time, so an emergency stop can always get through
//! between motions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};

use super::models::{progress_percent, EngineState, RigEvent, StepRecord};
use super::position::CycleState;
use super::{Result, RigError};
use crate::config::{MotionProfile, RackGeometry, RigConfig};
use crate::serial::GcodeProtocol;

/// The one controller connection, shared by the worker, ad-hoc sends and
/// emergency stop. `None` while disconnected.
pub type SharedLink = Arc<Mutex<Option<GcodeProtocol>>>;

/// Cooperative cancellation flag checked between motions and raced against dwells.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is (or already was) triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Sequencer {
    link: SharedLink,
    cycle: Arc<Mutex<CycleState>>,
    geometry: Arc<RackGeometry>,
    motion: Arc<MotionProfile>,
    dwell_buffer: Duration,
    events: broadcast::Sender<RigEvent>,
    state: Arc<watch::Sender<EngineState>>,
    stop: StopSignal,
}

impl Sequencer {
    pub fn new(link: SharedLink, config: &RigConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            link,
            cycle: Arc::new(Mutex::new(CycleState::new(&config.geometry))),
            geometry: Arc::new(config.geometry.clone()),
            motion: Arc::new(config.motion.clone()),
            dwell_buffer: config.timing.dwell_buffer(),
            events,
            state: Arc::new(state),
            stop: StopSignal::new(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RigEvent> {
        self.events.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    pub async fn cycle_state(&self) -> CycleState {
        self.cycle.lock().await.clone()
    }

    /// Start the position model over from the rack origins.
    pub async fn reset_cycle(&self) {
        *self.cycle.lock().await = CycleState::new(&self.geometry);
    }

    pub(crate) fn emit(&self, event: RigEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Engine state {} -> {}", previous, state);
            self.emit(RigEvent::StateChanged(state));
        }
    }

    /// Transmit one command under the link lock, unless a stop is pending.
    pub async fn send(&self, command: &str) -> Result<Vec<String>> {
        if self.stop.is_triggered() {
            return Err(RigError::Stopped);
        }
        let mut guard = self.link.lock().await;
        let protocol = guard.as_mut().ok_or(RigError::LinkUnavailable)?;
        Ok(protocol.transmit(command).await?)
    }

    /// Run the fixed bring-up script. Every command must get a response.
    pub async fn initialize(&self) -> Result<()> {
        self.set_state(EngineState::Initializing);
        let result = self.run_bring_up().await;
        self.set_state(EngineState::Idle);
        match &result {
            Ok(()) => log::info!("Bring-up complete"),
            Err(e) => log::error!("Bring-up failed: {}", e),
        }
        result
    }

    async fn run_bring_up(&self) -> Result<()> {
        for command in bring_up_commands(&self.motion) {
            let response = self.send(&command).await?;
            if response.is_empty() {
                return Err(RigError::ProtocolTimeout { command });
            }
        }
        Ok(())
    }

    /// Execute `steps` in order, one cycle per step, reporting progress after each.
    pub async fn run(&self, steps: &[StepRecord]) -> Result<()> {
        let result = self.run_steps(steps).await;
        self.set_state(EngineState::Idle);
        result
    }

    async fn run_steps(&self, steps: &[StepRecord]) -> Result<()> {
        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            if self.stop.is_triggered() {
                return Err(RigError::Stopped);
            }
            self.set_state(EngineState::Running { step_index: index });
            log::info!("Step {}/{}: {} ({}, {})", index + 1, total, step.name, step.kind, step.duration);
            self.emit(RigEvent::StepStarted {
                index,
                name: step.name.clone(),
            });

            let delay = step.duration.dwell(self.dwell_buffer);
            self.execute_cycle(index, delay).await?;

            self.emit(RigEvent::Progress {
                percent: progress_percent(index + 1, total),
            });
        }
        log::info!("All {} steps complete", total);
        Ok(())
    }

    /// Dispense, dwell for `delay`, aspirate.
    pub async fn execute_cycle(&self, index: usize, delay: Duration) -> Result<()> {
        self.dispense_phase().await?;
        self.cycle.lock().await.advance_cycle();
        self.dwell(index, delay).await?;
        self.aspiration_phase().await
    }

    async fn dispense_phase(&self) -> Result<()> {
        let m = &self.motion;
        self.collect_tip().await?;
        self.collect_solution().await?;
        self.send(&travel(m.sensor.x, m.sensor.y, m.travel_feed)).await?;
        self.send(&move_z(m.well_z, m.travel_feed)).await?;
        self.send(&plunger(m.plunger_inject, m.plunger_feed)).await?;
        self.eject_tips().await
    }

    async fn aspiration_phase(&self) -> Result<()> {
        let m = &self.motion;
        self.collect_tip().await?;
        self.send(&travel(m.sensor.x, m.sensor.y, m.travel_feed)).await?;
        self.send(&plunger(m.plunger_compress, m.plunger_feed)).await?;
        self.send(&move_z(m.well_z, m.travel_feed)).await?;
        self.send(&plunger(0.0, m.plunger_feed)).await?;
        self.eject_tips().await
    }

    async fn dwell(&self, index: usize, delay: Duration) -> Result<()> {
        if self.stop.is_triggered() {
            return Err(RigError::Stopped);
        }
        log::info!("Dwelling {}s", delay.as_secs());
        self.emit(RigEvent::DwellStarted {
            index,
            seconds: delay.as_secs(),
        });
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.stop.triggered() => Err(RigError::Stopped),
        }
    }

    async fn collect_tip(&self) -> Result<()> {
        let m = &self.motion;
        let (x, y) = self.cycle.lock().await.tip_pickup_coordinates();
        self.send(&travel(x, y, m.travel_feed)).await?;
        self.send(&move_z(m.tip_pickup_z, m.travel_feed)).await?;
        self.send(&move_z(m.travel_z, m.travel_feed)).await?;
        self.cycle.lock().await.advance_tip(&self.geometry);
        Ok(())
    }

    async fn collect_solution(&self) -> Result<()> {
        let m = &self.motion;
        let (x, y) = self.cycle.lock().await.reservoir_coordinates();
        self.send(&travel(x, y, m.travel_feed)).await?;
        self.send(&plunger(m.plunger_air_gap, m.plunger_feed)).await?;
        self.send(&move_z(m.reservoir_z, m.travel_feed)).await?;
        self.send(&plunger(m.plunger_draw, m.plunger_feed)).await?;
        self.send(&move_z(m.travel_z, m.travel_feed)).await?;
        self.cycle.lock().await.advance_reservoir(&self.geometry);
        Ok(())
    }

    async fn eject_tips(&self) -> Result<()> {
        let m = &self.motion;
        self.send(&move_z(m.travel_z, m.travel_feed)).await?;
        self.send(&travel(m.waste.x, m.waste.y, m.travel_feed)).await?;
        self.send(&plunger(m.plunger_eject, m.plunger_feed)).await?;
        self.send(&plunger(0.0, m.plunger_feed)).await?;
        Ok(())
    }

    /// Send raw g-code lines one by one, reporting progress per line.
    pub async fn replay(&self, lines: &[String]) -> Result<()> {
        let result = self.replay_lines(lines).await;
        self.set_state(EngineState::Idle);
        result
    }

    async fn replay_lines(&self, lines: &[String]) -> Result<()> {
        let total = lines.len();
        for (index, line) in lines.iter().enumerate() {
            self.set_state(EngineState::Running { step_index: index });
            self.send(line).await?;
            self.emit(RigEvent::Progress {
                percent: progress_percent(index + 1, total),
            });
        }
        Ok(())
    }

    /// Raise the stop signal, drop to idle and send the hard stop.
    ///
    /// A worker mid-drain finishes that drain first; it then sees the signal
    /// before its next motion.
    pub async fn em_stop(&self) -> Result<Vec<String>> {
        self.stop.trigger();
        self.set_state(EngineState::Idle);
        let mut guard = self.link.lock().await;
        let protocol = guard.as_mut().ok_or(RigError::LinkUnavailable)?;
        Ok(protocol.emergency_stop().await?)
    }
}

/// Bring-up script: units, cold extrusion, home Y, X, then Z, clearance pose.
pub fn bring_up_commands(motion: &MotionProfile) -> Vec<String> {
    vec![
        "G21".to_string(),
        "M302 S0".to_string(),
        "G28 Y".to_string(),
        "G28 X".to_string(),
        "G28 Z".to_string(),
        format!(
            "G0 X{} Y{} Z{} F{}",
            coord(motion.clearance.x),
            coord(motion.clearance.y),
            coord(motion.clearance_z),
            motion.travel_feed
        ),
    ]
}

fn travel(x: f64, y: f64, feed: u32) -> String {
    format!("G0 X{} Y{} F{}", coord(x), coord(y), feed)
}

fn move_z(z: f64, feed: u32) -> String {
    format!("G0 Z{} F{}", coord(z), feed)
}

fn plunger(e: f64, feed: u32) -> String {
    format!("G1 E{} F{}", coord(e), feed)
}

/// Millimetre value with at most three decimals and no trailing zeros.
pub fn coord(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
