use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::RigConfig;
use crate::rig::{RigController, RigEvent, RunOutcome, StepKind};
use crate::serial::{Direction, SerialInterface, TranscriptLine};

#[derive(Parser, Debug)]
#[command(name = "pipa-rig", version, about = "Drive the PIPA liquid-handling rig over serial")]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial port to open, skipping discovery
    #[arg(short, long)]
    pub port: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List serial ports and their descriptions
    Ports,
    /// Connect, run bring-up, then send each command in turn
    Send {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Connect, run bring-up, then run timed steps
    Run {
        /// Step as NAME,KIND,HH:MM:SS (KIND: home, add-solution, wash)
        #[arg(long = "step", required = true, value_parser = parse_step_arg)]
        steps: Vec<StepArg>,
    },
    /// Connect, run bring-up, then replay a g-code file line by line
    Replay { file: PathBuf },
}

#[derive(Debug, Clone)]
pub struct StepArg {
    pub name: String,
    pub kind: StepKind,
    pub duration: String,
}

fn parse_step_arg(value: &str) -> Result<StepArg, String> {
    let parts: Vec<&str> = value.splitn(3, ',').map(str::trim).collect();
    match parts.as_slice() {
        [name, kind, duration] => Ok(StepArg {
            name: name.to_string(),
            kind: kind.parse()?,
            duration: duration.to_string(),
        }),
        _ => Err(format!("expected NAME,KIND,HH:MM:SS, got '{}'", value)),
    }
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => RigConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RigConfig::default(),
    };
    if cli.port.is_some() {
        config.serial.port = cli.port.clone();
    }

    if let Command::Ports = cli.command {
        return list_ports();
    }

    let rig = RigController::new(config);
    spawn_transcript_logger(rig.subscribe_transcript());
    rig.connect().await.context("connecting to controller")?;

    let result = match cli.command {
        Command::Ports => Ok(()),
        Command::Send { commands } => send_commands(&rig, &commands).await,
        Command::Run { steps } => run_steps(&rig, steps).await,
        Command::Replay { file } => replay_file(&rig, file).await,
    };

    if let Err(e) = rig.disconnect().await {
        log::warn!("Disconnect failed: {}", e);
    }
    result
}

fn list_ports() -> anyhow::Result<()> {
    let ports = SerialInterface::list_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.port_name, port.description);
    }
    Ok(())
}

async fn send_commands(rig: &RigController, commands: &[String]) -> anyhow::Result<()> {
    for command in commands {
        let response = rig.send_raw(command).await?;
        if response.is_empty() {
            log::warn!("No response to {}", command);
        }
    }
    Ok(())
}

async fn run_steps(rig: &RigController, steps: Vec<StepArg>) -> anyhow::Result<()> {
    for step in &steps {
        rig.add_step(&step.name, step.kind, &step.duration).await?;
    }
    let events = rig.subscribe_events();
    rig.start(rig.steps().await).await?;
    finish_run(rig, events).await
}

async fn replay_file(rig: &RigController, file: PathBuf) -> anyhow::Result<()> {
    let count = rig.load_source_file(&file).await?;
    log::info!("Replaying {} commands from {}", count, file.display());
    let events = rig.subscribe_events();
    rig.replay().await?;
    finish_run(rig, events).await
}

/// Follow engine events until the run finishes. Ctrl-C sends the emergency stop.
async fn finish_run(rig: &RigController, mut events: broadcast::Receiver<RigEvent>) -> anyhow::Result<()> {
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RigEvent::RunFinished { outcome, .. }) => break outcome,
                Ok(RigEvent::StepStarted { index, name }) => log::info!("Step {}: {}", index + 1, name),
                Ok(RigEvent::DwellStarted { seconds, .. }) => log::info!("Waiting {}s", seconds),
                Ok(RigEvent::Progress { percent }) => log::info!("Progress: {}%", percent),
                Ok(RigEvent::StateChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("Missed {} engine events", skipped),
                Err(RecvError::Closed) => bail!("engine event channel closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted, sending emergency stop");
                rig.em_stop().await?;
            }
        }
    };
    rig.join_run().await;

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Stopped => Err(anyhow!("run stopped by emergency stop")),
        RunOutcome::Aborted(reason) => Err(anyhow!("run aborted: {}", reason)),
    }
}

fn spawn_transcript_logger(mut transcript: broadcast::Receiver<TranscriptLine>) {
    tokio::spawn(async move {
        loop {
            match transcript.recv().await {
                Ok(line) => {
                    let arrow = match line.direction {
                        Direction::Sent => ">>",
                        Direction::Received => "<<",
                    };
                    log::info!("{} {}", arrow, line.text);
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("Transcript skipped {} lines", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
