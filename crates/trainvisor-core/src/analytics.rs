//! Summaries derived from a run's metric history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use trainvisor_state::MetricSample;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub count: usize,
    pub min_loss: f64,
    pub max_loss: f64,
    pub avg_loss: f64,
    /// Mean over samples that reported an accuracy
    pub avg_accuracy: Option<f64>,
}

/// Estimated completion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eta {
    pub ms_per_epoch: f64,
    pub remaining_epochs: u32,
    pub eta_at: DateTime<Utc>,
}

/// Loss and accuracy statistics; `None` for an empty history.
pub fn summarize(samples: &[MetricSample]) -> Option<MetricsSummary> {
    if samples.is_empty() {
        return None;
    }
    let count = samples.len();
    let (min_loss, max_loss, sum) = samples.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(lo, hi, sum), s| (lo.min(s.loss), hi.max(s.loss), sum + s.loss),
    );
    let accs: Vec<f64> = samples.iter().filter_map(|s| s.accuracy).collect();
    let avg_accuracy = if accs.is_empty() {
        None
    } else {
        Some(accs.iter().sum::<f64>() / accs.len() as f64)
    };
    Some(MetricsSummary {
        count,
        min_loss,
        max_loss,
        avg_loss: sum / count as f64,
        avg_accuracy,
    })
}

/// Extrapolate the finish time from the pace between the first and last
/// sample. Needs at least two samples.
pub fn eta(samples: &[MetricSample], target_epochs: u32, now: DateTime<Utc>) -> Option<Eta> {
    let (first, last) = match samples {
        [first, .., last] => (first, last),
        _ => return None,
    };
    let epochs_covered = i64::from(last.epoch) - i64::from(first.epoch) + 1;
    if epochs_covered <= 0 {
        return None;
    }
    let elapsed_ms = (last.timestamp - first.timestamp).num_milliseconds() as f64;
    let ms_per_epoch = elapsed_ms / epochs_covered as f64;
    let remaining_epochs = target_epochs.saturating_sub(last.epoch);
    let eta_ms = (ms_per_epoch * f64::from(remaining_epochs)).max(0.0);
    Some(Eta {
        ms_per_epoch,
        remaining_epochs,
        eta_at: now + Duration::milliseconds(eta_ms.round() as i64),
    })
}
