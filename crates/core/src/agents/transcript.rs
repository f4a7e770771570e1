//! Incremental diffing of cumulative assistant text.
//!
//! Agent CLIs stream the *whole* assistant message on every update. The
//! [`TranscriptCursor`] keeps byte-offset cursors into the current message so
//! each byte is emitted once, and splits the text at the first markdown
//! heading: everything before it is commentary (for the log), everything
//! from it onward is plan content (for the plan file). Once a heading has
//! been seen the split is sticky for the rest of the run.

use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

fn heading_regex() -> Option<&'static Regex> {
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();
    HEADING
        .get_or_init(|| Regex::new(r"(?m)^#{1,6}[ \t]").ok())
        .as_ref()
}

/// New text produced by one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptDelta {
    /// Commentary not yet logged.
    pub commentary: String,
    /// Plan content not yet written.
    pub plan: String,
}

impl TranscriptDelta {
    pub fn is_empty(&self) -> bool {
        self.commentary.is_empty() && self.plan.is_empty()
    }
}

/// Cursor over the cumulative text of one run.
#[derive(Debug, Default)]
pub struct TranscriptCursor {
    /// Text of the current assistant message.
    message: String,
    /// Bytes of `message` already emitted as commentary.
    logged: usize,
    /// Bytes of `message` already emitted as plan.
    plan_written: usize,
    /// Offset in `message` where plan content starts.
    plan_start: Option<usize>,
    /// A heading was seen in this run.
    plan_found: bool,
    /// Every message of the run, separated by newlines.
    full: String,
}

impl TranscriptCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a plan heading has been seen.
    pub fn plan_found(&self) -> bool {
        self.plan_found
    }

    /// All text seen so far.
    pub fn text(&self) -> &str {
        &self.full
    }

    /// Feed the latest snapshot of an assistant message.
    ///
    /// A snapshot that does not extend the current message starts a new one;
    /// a stale snapshot (a prefix of what was already seen) is ignored.
    pub fn ingest(&mut self, snapshot: &str) -> TranscriptDelta {
        let mut delta = TranscriptDelta::default();

        if !self.message.is_empty() && self.message.starts_with(snapshot) {
            return delta;
        }
        if !snapshot.starts_with(self.message.as_str()) {
            delta = self.flush();
            if !self.full.is_empty() {
                self.full.push('\n');
            }
            self.message.clear();
            self.logged = 0;
            self.plan_written = 0;
            self.plan_start = self.plan_found.then_some(0);
        }

        self.full.push_str(&snapshot[self.message.len()..]);
        self.message.clear();
        self.message.push_str(snapshot);

        if self.plan_start.is_none() {
            if let Some(m) = heading_regex().and_then(|re| re.find(&self.message)) {
                self.plan_start = Some(m.start());
                self.plan_found = true;
            }
        }

        match self.plan_start {
            Some(start) => {
                if self.logged < start {
                    delta.commentary.push_str(&self.message[self.logged..start]);
                    self.logged = start;
                }
                let from = self.plan_written.max(start);
                delta.plan.push_str(&self.message[from..]);
                self.plan_written = self.message.len();
            }
            None => {
                let end = self.commentary_end();
                if self.logged < end {
                    delta.commentary.push_str(&self.message[self.logged..end]);
                    self.logged = end;
                }
            }
        }
        delta
    }

    /// Emit anything held back. Call once the run has ended.
    pub fn finish(&mut self) -> TranscriptDelta {
        self.flush()
    }

    fn flush(&mut self) -> TranscriptDelta {
        let mut delta = TranscriptDelta::default();
        let end = self.plan_start.unwrap_or(self.message.len());
        if self.logged < end {
            delta.commentary.push_str(&self.message[self.logged..end]);
            self.logged = end;
        }
        if let Some(start) = self.plan_start {
            let from = self.plan_written.max(start);
            if from < self.message.len() {
                delta.plan.push_str(&self.message[from..]);
                self.plan_written = self.message.len();
            }
        }
        delta
    }

    /// End of the commentary that is safe to emit: a trailing partial line
    /// starting with `#` may still grow into a heading, so it is held back.
    fn commentary_end(&self) -> usize {
        let line_start = self.message.rfind('\n').map_or(0, |i| i + 1);
        if self.message[line_start..].starts_with('#') {
            line_start
        } else {
            self.message.len()
        }
    }
}

/// Writes plan content: the first write truncates, later writes append.
#[derive(Debug)]
pub struct PlanWriter {
    path: PathBuf,
    started: bool,
}

impl PlanWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            started: false,
        }
    }

    pub async fn write(&mut self, text: &str) -> std::io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if self.started {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let mut file = options.open(&self.path).await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        self.started = true;
        Ok(())
    }
}
