use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RigError;

/// What an operator-authored step is for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepKind {
    Home,
    AddSolution,
    Wash,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Home => "Home",
            StepKind::AddSolution => "Add solution",
            StepKind::Wash => "Wash",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "home" => Ok(StepKind::Home),
            "addsolution" => Ok(StepKind::AddSolution),
            "wash" => Ok(StepKind::Wash),
            _ => Err(format!("Unknown step kind: {}", s)),
        }
    }
}

/// Step time budget, written `HH:MM:SS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDuration {
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
}

impl StepDuration {
    pub fn as_secs(&self) -> u64 {
        u64::from(self.hours) * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds)
    }

    /// The dwell a step actually gets: its own budget plus the fixed buffer.
    pub fn dwell(&self, buffer: Duration) -> Duration {
        Duration::from_secs(self.as_secs()) + buffer
    }
}

impl FromStr for StepDuration {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RigError::MalformedDuration(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(malformed());
        }

        let hours: u32 = parts[0].parse().map_err(|_| malformed())?;
        let minutes: u8 = parts[1].parse().map_err(|_| malformed())?;
        let seconds: u8 = parts[2].parse().map_err(|_| malformed())?;
        if minutes >= 60 || seconds >= 60 {
            return Err(malformed());
        }

        Ok(Self { hours, minutes, seconds })
    }
}

impl fmt::Display for StepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

/// One unit of operator-authored work. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub kind: StepKind,
    pub duration: StepDuration,
    pub added_at: DateTime<Utc>,
}

impl StepRecord {
    /// Validates `duration_text` here, so a bad step never reaches a run.
    pub fn new(name: impl Into<String>, kind: StepKind, duration_text: &str) -> Result<Self, RigError> {
        Ok(Self {
            name: name.into(),
            kind,
            duration: duration_text.parse()?,
            added_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Initializing,
    Running { step_index: usize },
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::Initializing => f.write_str("initializing"),
            EngineState::Running { step_index } => write!(f, "running step {}", step_index + 1),
        }
    }
}

/// Percent complete after `completed` of `total` steps, rounded to the nearest integer.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let completed = completed.min(total);
    ((completed * 100 + total / 2) / total) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Aborted(String),
}

/// Engine notifications pushed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RigEvent {
    StateChanged(EngineState),
    StepStarted { index: usize, name: String },
    DwellStarted { index: usize, seconds: u64 },
    Progress { percent: u8 },
    RunFinished { run_id: Uuid, outcome: RunOutcome },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parse() {
        let d: StepDuration = "01:02:03".parse().unwrap();
        assert_eq!(d, StepDuration { hours: 1, minutes: 2, seconds: 3 });
        assert_eq!(d.as_secs(), 3723);
        assert_eq!(d.to_string(), "01:02:03");
    }

    #[test]
    fn test_dwell_adds_buffer() {
        let buffer = Duration::from_secs(20);
        for (text, hours, minutes, seconds) in [
            ("00:00:00", 0u64, 0u64, 0u64),
            ("00:00:30", 0, 0, 30),
            ("00:15:00", 0, 15, 0),
            ("02:00:59", 2, 0, 59),
            ("120:59:59", 120, 59, 59),
        ] {
            let d: StepDuration = text.parse().unwrap();
            assert_eq!(d.dwell(buffer).as_secs(), 3600 * hours + 60 * minutes + seconds + 20);
        }
    }

    #[test]
    fn test_duration_rejects_malformed() {
        for text in ["", "10", "00:30", "aa:bb:cc", "00:60:00", "00:00:60", "-1:00:00", "00::00", "1:2:3:4"] {
            assert!(
                matches!(text.parse::<StepDuration>(), Err(RigError::MalformedDuration(_))),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_step_kind_labels() {
        assert_eq!("Add solution".parse::<StepKind>().unwrap(), StepKind::AddSolution);
        assert_eq!("add_solution".parse::<StepKind>().unwrap(), StepKind::AddSolution);
        assert_eq!("WASH".parse::<StepKind>().unwrap(), StepKind::Wash);
        assert!("rinse".parse::<StepKind>().is_err());
        assert_eq!(StepKind::AddSolution.to_string(), "Add solution");
    }

    #[test]
    fn test_progress_three_steps() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn test_step_record_rejects_bad_duration() {
        assert!(StepRecord::new("Step 1", StepKind::Wash, "00:00:30").is_ok());
        assert!(matches!(
            StepRecord::new("Step 1", StepKind::Wash, "30s"),
            Err(RigError::MalformedDuration(_))
        ));
    }
}
