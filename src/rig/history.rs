use super::{Result, RigError};

/// Cursor over ad-hoc commands sent by the operator.
///
/// The cursor ranges over `0..=len`; `len` is the empty draft line after the
/// newest entry.
#[derive(Debug, Clone, Default)]
pub struct CommandHistory {
    entries: Vec<String>,
    cursor: usize,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sent command and park the cursor past the end.
    pub fn record(&mut self, raw_command: impl Into<String>) {
        self.entries.push(raw_command.into());
        self.cursor = self.entries.len();
    }

    pub fn recall_previous(&mut self) -> Result<String> {
        if self.cursor == 0 {
            return Err(RigError::AtBoundary);
        }
        self.cursor -= 1;
        Ok(self.entries[self.cursor].clone())
    }

    /// Moving past the newest entry yields the empty draft line.
    pub fn recall_next(&mut self) -> Result<String> {
        if self.cursor >= self.entries.len() {
            return Err(RigError::AtBoundary);
        }
        self.cursor += 1;
        Ok(self.entries.get(self.cursor).cloned().unwrap_or_default())
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
