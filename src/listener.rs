//! Progress and results reporting
//!
//! Every bus request emits exactly one fixed wording progress line, so that a report
//! generated from the same bus traffic is byte for byte identical.

/// Severity of a test outcome
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Outcome {
    /// Criteria met
    Pass,
    /// Informational finding
    Info,
    /// Deviation that does not fail the step
    Warn,
    /// Timing deviation
    Timing,
    /// Criteria not met
    Fail,
    /// Step could not be completed
    Incomplete,
    /// Step was aborted
    Abort,
}

/// Receiver of progress and results from the query layer
pub trait ResultsListener {
    /// Transient progress message
    fn on_progress(&mut self, message: &str);
    /// Line for the results log
    fn on_result(&mut self, message: &str);
    /// Records an outcome against a test part and step
    fn add_outcome(&mut self, part: u8, step: u8, outcome: Outcome, message: &str);
}

/// An outcome recorded by [RecordingListener]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Test part
    pub part: u8,
    /// Test step
    pub step: u8,
    /// Severity
    pub outcome: Outcome,
    /// Message
    pub message: String,
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (6.{}.{}) {}", self.outcome, self.part, self.step, self.message)
    }
}

/// Listener which keeps everything it is told
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    /// Progress messages, in order
    pub progress: Vec<String>,
    /// Result lines, in order
    pub results: Vec<String>,
    /// Outcomes, in order
    pub outcomes: Vec<ActionOutcome>,
}

impl RecordingListener {
    /// Creates an empty listener
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes of a given severity
    pub fn outcomes_of(&self, outcome: Outcome) -> Vec<&ActionOutcome> {
        self.outcomes.iter().filter(|o| o.outcome == outcome).collect()
    }
}

impl ResultsListener for RecordingListener {
    fn on_progress(&mut self, message: &str) {
        self.progress.push(message.to_string());
    }

    fn on_result(&mut self, message: &str) {
        self.results.push(message.to_string());
    }

    fn add_outcome(&mut self, part: u8, step: u8, outcome: Outcome, message: &str) {
        self.outcomes.push(ActionOutcome {
            part,
            step,
            outcome,
            message: message.to_string(),
        });
    }
}

/// Listener which discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpListener;

impl ResultsListener for NoOpListener {
    fn on_progress(&mut self, _message: &str) {}

    fn on_result(&mut self, _message: &str) {}

    fn add_outcome(&mut self, _part: u8, _step: u8, _outcome: Outcome, _message: &str) {}
}
