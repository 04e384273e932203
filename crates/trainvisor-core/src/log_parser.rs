//! Extract structured progress from unstructured worker output.
//!
//! The parser is an ordered list of [`ParseRule`]s. Each line is tested
//! against the rules in priority order and the first rule whose pattern
//! matches and whose extractor yields a value wins. Lines no rule matches
//! are only kept as raw log text.

use regex::{Captures, Regex};
use trainvisor_state::{Job, Phase};

/// A single field (or group of fields) recognised in a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extracted {
    Progress {
        epoch: u32,
        total_epochs: u32,
        step: u64,
        total_steps: u64,
    },
    ValLoss(f64),
    Loss(f64),
    LearningRate(f64),
    Accuracy(f64),
    Phase(Phase),
}

/// Result of applying one parsed line to a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedUpdate {
    /// Name of the rule that matched
    pub rule: &'static str,
    pub value: Extracted,
    /// Whether the job was modified
    pub changed: bool,
}

impl ParsedUpdate {
    /// Whether this update carries a new training loss.
    pub fn updates_loss(&self) -> bool {
        matches!(self.value, Extracted::Loss(_))
    }
}

type Extractor = fn(&Captures<'_>) -> Option<Extracted>;

/// `(name, pattern, extractor)` triple.
#[derive(Clone)]
pub struct ParseRule {
    name: &'static str,
    pattern: Regex,
    extract: Extractor,
}

impl ParseRule {
    pub fn new(
        name: &'static str,
        pattern: &str,
        extract: Extractor,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            extract,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, line: &str) -> Option<Extracted> {
        self.pattern
            .captures(line)
            .and_then(|caps| (self.extract)(&caps))
    }
}

impl std::fmt::Debug for ParseRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

fn capture<T: std::str::FromStr>(caps: &Captures<'_>, idx: usize) -> Option<T> {
    caps.get(idx)?.as_str().parse().ok()
}

fn finite(caps: &Captures<'_>) -> Option<f64> {
    capture::<f64>(caps, 1).filter(|v| v.is_finite())
}

const NUMBER: &str = r"([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)";

fn progress(caps: &Captures<'_>) -> Option<Extracted> {
    Some(Extracted::Progress {
        epoch: capture(caps, 1)?,
        total_epochs: capture(caps, 2)?,
        step: capture(caps, 3)?,
        total_steps: capture(caps, 4)?,
    })
}

fn val_loss(caps: &Captures<'_>) -> Option<Extracted> {
    finite(caps).map(Extracted::ValLoss)
}

fn loss(caps: &Captures<'_>) -> Option<Extracted> {
    finite(caps).map(Extracted::Loss)
}

fn learning_rate(caps: &Captures<'_>) -> Option<Extracted> {
    finite(caps).map(Extracted::LearningRate)
}

fn accuracy(caps: &Captures<'_>) -> Option<Extracted> {
    finite(caps).map(Extracted::Accuracy)
}

fn phase(caps: &Captures<'_>) -> Option<Extracted> {
    let phase = match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "preparing" => Phase::Preparing,
        "training" => Phase::Training,
        _ => Phase::Evaluating,
    };
    Some(Extracted::Phase(phase))
}

/// Built-in rules in priority order.
fn builtin_rules() -> Vec<ParseRule> {
    let specs: [(&'static str, String, Extractor); 6] = [
        (
            "progress",
            r"(?i)epoch\s+(\d+)\s*/\s*(\d+).*?step\s+(\d+)\s*/\s*(\d+)".to_string(),
            progress,
        ),
        (
            "val_loss",
            format!(r"(?i)\b(?:val_loss|eval_loss)\s*[:=]\s*{NUMBER}"),
            val_loss,
        ),
        (
            "loss",
            format!(r"(?i)(?:train_loss|loss)\s*[:=]\s*{NUMBER}"),
            loss,
        ),
        (
            "learning_rate",
            format!(r"(?i)\b(?:learning_rate|lr)\s*[:=]\s*{NUMBER}"),
            learning_rate,
        ),
        (
            "accuracy",
            format!(r"(?i)(?:accuracy|acc)\s*[:=]\s*{NUMBER}"),
            accuracy,
        ),
        (
            "phase",
            r"(?i)(preparing|training|evaluating|validation)".to_string(),
            phase,
        ),
    ];

    specs
        .into_iter()
        .filter_map(|(name, pattern, extract)| ParseRule::new(name, &pattern, extract).ok())
        .collect()
}

/// Ordered rule set applied to each worker output line.
#[derive(Debug, Clone)]
pub struct LogParser {
    rules: Vec<ParseRule>,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    /// Parser with the built-in rules.
    pub fn new() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }

    /// Parser with a custom rule list, evaluated in the given order.
    pub fn with_rules(rules: Vec<ParseRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of all existing ones.
    pub fn prepend(mut self, rule: ParseRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.name)
    }

    /// First matching rule's name and value, without touching any job.
    pub fn extract(&self, line: &str) -> Option<(&'static str, Extracted)> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(line).map(|value| (rule.name, value)))
    }

    /// Parse `line` and apply the result to `job` in place.
    pub fn parse_line(&self, line: &str, job: &mut Job) -> Option<ParsedUpdate> {
        let (rule, value) = self.extract(line)?;
        let changed = apply(value, job);
        Some(ParsedUpdate {
            rule,
            value,
            changed,
        })
    }
}

fn set<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        return false;
    }
    *slot = Some(value);
    true
}

/// Apply an extracted value to a job. Returns whether anything changed.
pub fn apply(value: Extracted, job: &mut Job) -> bool {
    let m = &mut job.metrics;
    let changed = match value {
        Extracted::Progress {
            epoch,
            total_epochs,
            step,
            total_steps,
        } => {
            let mut changed = set(&mut m.epoch, epoch);
            changed |= set(&mut m.total_epochs, total_epochs);
            changed |= set(&mut m.step, step);
            changed |= set(&mut m.total_steps, total_steps);
            if total_epochs > 0 && job.target_epochs != total_epochs {
                job.target_epochs = total_epochs;
                changed = true;
            }
            if total_steps > 0 {
                let pct = (step as f64 / total_steps as f64 * 100.0)
                    .round()
                    .clamp(0.0, 100.0) as u8;
                if job.progress != pct {
                    job.progress = pct;
                    changed = true;
                }
            }
            changed
        }
        Extracted::ValLoss(v) => set(&mut m.val_loss, v),
        Extracted::Loss(v) => set(&mut m.loss, v),
        Extracted::LearningRate(v) => set(&mut m.learning_rate, v),
        Extracted::Accuracy(v) => set(&mut m.accuracy, v),
        Extracted::Phase(phase) => job.observe_phase(phase),
    };
    if changed {
        job.updated_at = chrono::Utc::now();
    }
    changed
}
