// Scripted stand-in for the serial controller. Every write queues the
// responder's lines; reads pop them and return None once the queue is empty,
// which is what a read timeout looks like on the real link.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipa_rig_lib::config::{ProtocolTiming, RigConfig, SerialSettings};
use pipa_rig_lib::rig::{Connector, RigError};
use pipa_rig_lib::serial::{ConnectionInfo, LineTransport, SerialError};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Write(String),
    Read(Option<String>),
    Reset,
}

/// Shared record of everything the transport saw.
#[derive(Clone, Default)]
pub struct Probe(Arc<Mutex<Vec<Op>>>);

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, op: Op) {
        self.0.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.0.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn resets(&self) -> usize {
        self.ops().iter().filter(|op| **op == Op::Reset).count()
    }
}

pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

pub struct ScriptedTransport {
    info: ConnectionInfo,
    probe: Probe,
    responder: Responder,
    pending: VecDeque<String>,
    endless: Option<String>,
}

impl ScriptedTransport {
    /// Answers every command with a single `ok`.
    pub fn new(probe: Probe) -> Self {
        Self::with_responder(probe, Box::new(|_| vec!["ok".to_string()]))
    }

    pub fn with_responder(probe: Probe, responder: Responder) -> Self {
        Self {
            info: ConnectionInfo {
                port_name: "scripted".to_string(),
                baud_rate: 250_000,
                read_timeout: Duration::from_secs(1),
            },
            probe,
            responder,
            pending: VecDeque::new(),
            endless: None,
        }
    }

    /// Never goes idle: every read returns `line`.
    pub fn endless(probe: Probe, line: &str) -> Self {
        let mut transport = Self::new(probe);
        transport.endless = Some(line.to_string());
        transport
    }
}

#[async_trait::async_trait]
impl LineTransport for ScriptedTransport {
    async fn write_line(&mut self, text: &str) -> Result<(), SerialError> {
        self.probe.push(Op::Write(text.to_string()));
        let response = (self.responder)(text);
        self.pending.extend(response);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        let line = match &self.endless {
            Some(line) => Some(line.clone()),
            None => self.pending.pop_front(),
        };
        self.probe.push(Op::Read(line.clone()));
        Ok(line)
    }

    async fn reset_buffers(&mut self) -> Result<(), SerialError> {
        self.probe.push(Op::Reset);
        self.pending.clear();
        Ok(())
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

/// Hands out scripted transports sharing one probe. Commands listed in
/// `silent` get no response at all.
pub struct ScriptedConnector {
    pub probe: Probe,
    pub silent: Vec<String>,
}

impl ScriptedConnector {
    pub fn new(probe: Probe) -> Self {
        Self { probe, silent: Vec::new() }
    }

    pub fn silent_on(probe: Probe, command: &str) -> Self {
        Self {
            probe,
            silent: vec![command.to_string()],
        }
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _settings: &SerialSettings) -> Result<Box<dyn LineTransport>, RigError> {
        let silent = self.silent.clone();
        let responder: Responder = Box::new(move |command| {
            if silent.iter().any(|s| s == command) {
                Vec::new()
            } else {
                vec!["ok".to_string()]
            }
        });
        Ok(Box::new(ScriptedTransport::with_responder(self.probe.clone(), responder)))
    }
}

pub fn test_config() -> RigConfig {
    RigConfig {
        timing: ProtocolTiming::immediate(),
        ..RigConfig::default()
    }
}

pub const BRING_UP: [&str; 6] = ["G21", "M302 S0", "G28 Y", "G28 X", "G28 Z", "G0 X0 Y0 Z80 F3000"];

/// Commands of one full cycle with the default geometry and motion profile,
/// starting from a fresh cycle state.
pub fn first_cycle_commands() -> Vec<&'static str> {
    vec![
        // dispense: tip
        "G0 X20 Y120 F3000",
        "G0 Z12 F3000",
        "G0 Z60 F3000",
        // dispense: solution
        "G0 X110 Y160 F3000",
        "G1 E2 F300",
        "G0 Z20 F3000",
        "G1 E8 F300",
        "G0 Z60 F3000",
        // dispense: inject at sensor
        "G0 X180 Y90 F3000",
        "G0 Z25 F3000",
        "G1 E-2 F300",
        // eject
        "G0 Z60 F3000",
        "G0 X230 Y20 F3000",
        "G1 E-14 F300",
        "G1 E0 F300",
        // aspiration: tip
        "G0 X29 Y120 F3000",
        "G0 Z12 F3000",
        "G0 Z60 F3000",
        // aspiration: withdraw from sensor
        "G0 X180 Y90 F3000",
        "G1 E-6 F300",
        "G0 Z25 F3000",
        "G1 E0 F300",
        // eject
        "G0 Z60 F3000",
        "G0 X230 Y20 F3000",
        "G1 E-14 F300",
        "G1 E0 F300",
    ]
}

pub const DISPENSE_COMMAND_COUNT: usize = 15;
