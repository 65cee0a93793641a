use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::{Direction, LineTransport, Result, SerialError, TranscriptLine};
use crate::config::ProtocolTiming;

/// Firmware hard-stop directive.
pub const EMERGENCY_STOP: &str = "M112";

/// Synchronous g-code request/response exchange over a line transport.
///
/// The link is half-duplex at this level: `transmit` never returns before the
/// response to its command has been drained, so a caller can't interleave two
/// commands.
pub struct GcodeProtocol {
    transport: Box<dyn LineTransport>,
    timing: ProtocolTiming,
    transcript: Option<broadcast::Sender<TranscriptLine>>,
}

impl GcodeProtocol {
    pub fn new(transport: Box<dyn LineTransport>, timing: ProtocolTiming) -> Self {
        Self {
            transport,
            timing,
            transcript: None,
        }
    }

    /// Push every sent and received line to `tx`.
    pub fn with_transcript(mut self, tx: broadcast::Sender<TranscriptLine>) -> Self {
        self.transcript = Some(tx);
        self
    }

    /// Send one command and drain its response.
    pub async fn transmit(&mut self, command_text: &str) -> Result<Vec<String>> {
        let command = normalize_command(command_text);
        log::debug!("-> {}", command);
        self.transport.write_line(&command).await?;
        self.publish(Direction::Sent, &command);

        pause(self.timing.post_write_settle()).await;
        self.receive().await
    }

    /// Read lines until the first empty read.
    ///
    /// When a drain limit is configured and the firmware is still talking once
    /// it elapses, the drain fails with `ResponseOverrun`.
    pub async fn receive(&mut self) -> Result<Vec<String>> {
        let started = Instant::now();
        let mut lines = Vec::new();

        while let Some(line) = self.transport.read_line().await? {
            if !line.is_empty() {
                log::debug!("<- {}", line);
                self.publish(Direction::Received, &line);
                lines.push(line);
            }

            if let Some(limit) = self.timing.drain_limit() {
                if started.elapsed() > limit {
                    log::warn!("Response drain exceeded {:?} after {} lines", limit, lines.len());
                    return Err(SerialError::ResponseOverrun {
                        limit,
                        lines: lines.len(),
                    });
                }
            }

            pause(self.timing.inter_read_pause()).await;
        }

        Ok(lines)
    }

    pub async fn emergency_stop(&mut self) -> Result<Vec<String>> {
        log::warn!("Sending emergency stop to {}", self.transport.info().port_name);
        self.transmit(EMERGENCY_STOP).await
    }

    /// Run the transport's reset handshake.
    pub async fn reset(&mut self) -> Result<()> {
        self.transport.reset_buffers().await
    }

    pub fn transport(&self) -> &dyn LineTransport {
        self.transport.as_ref()
    }

    fn publish(&self, direction: Direction, text: &str) {
        if let Some(tx) = &self.transcript {
            // No subscribers is fine
            let _ = tx.send(TranscriptLine::new(direction, text));
        }
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Trim and upper-case a command line for the wire.
pub fn normalize_command(text: &str) -> String {
    text.trim().to_uppercase()
}
