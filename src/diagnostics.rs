//! Structured record of what a pipeline invocation did.
//!
//! Every event is also emitted through `tracing`, but the record travels with
//! the result so callers (and tests) can see which fallbacks were taken
//! without scraping logs.

use serde::Serialize;
use tracing::{info, warn};

/// Where in the pipeline an inversion was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InversionStage {
    /// Matrix or transform file inverted into the moving→fixed convention.
    Initial,
    /// Moving→fixed result inverted into the output→input resampling direction.
    Resample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InversionOutcome {
    Applied,
    KeptOriginal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    SliceSkipped {
        series: String,
        source: String,
        reason: String,
    },
    NonOrthonormalOrientation {
        source: String,
    },
    NonUniformSpacing {
        series: String,
        median: f64,
        min_gap: f64,
        max_gap: f64,
    },
    Flattened {
        input: String,
        output: String,
        leaves: usize,
    },
    Inversion {
        stage: InversionStage,
        #[serde(flatten)]
        outcome: InversionOutcome,
    },
    DirectionProbe {
        forward: i32,
        inverse: i32,
        inverted: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub events: Vec<TraceEvent>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: TraceEvent) {
        match &event {
            TraceEvent::SliceSkipped {
                series,
                source,
                reason,
            } => warn!(%series, %source, %reason, "skipping slice"),
            TraceEvent::NonOrthonormalOrientation { source } => {
                warn!(%source, "row/column direction cosines are not orthonormal")
            }
            TraceEvent::NonUniformSpacing {
                series,
                median,
                min_gap,
                max_gap,
            } => warn!(
                %series,
                median, min_gap, max_gap, "irregular slice gaps, using median spacing"
            ),
            TraceEvent::Flattened {
                input,
                output,
                leaves,
            } => info!(%input, %output, leaves, "flattened transform"),
            TraceEvent::Inversion { stage, outcome } => match outcome {
                InversionOutcome::Applied => info!(?stage, "inverted transform"),
                InversionOutcome::KeptOriginal { reason } => {
                    warn!(?stage, %reason, "unable to invert transform, using as-is")
                }
            },
            TraceEvent::DirectionProbe {
                forward,
                inverse,
                inverted,
            } => info!(forward, inverse, inverted, "probed transform direction"),
        }
        self.events.push(event);
    }

    /// Outcomes of every inversion attempted at `stage`, in order.
    pub fn inversions(&self, stage: InversionStage) -> Vec<&InversionOutcome> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Inversion { stage: s, outcome } if *s == stage => Some(outcome),
                _ => None,
            })
            .collect()
    }

    pub fn direction_probe(&self) -> Option<(i32, i32, bool)> {
        self.events.iter().find_map(|event| match event {
            TraceEvent::DirectionProbe {
                forward,
                inverse,
                inverted,
            } => Some((*forward, *inverse, *inverted)),
            _ => None,
        })
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.events.extend(other.events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inversion_events_serialize_flat() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(TraceEvent::Inversion {
            stage: InversionStage::Resample,
            outcome: InversionOutcome::KeptOriginal {
                reason: "singular matrix".into(),
            },
        });
        let json = serde_json::to_value(&diagnostics).unwrap();
        let event = &json["events"][0];
        assert_eq!(event["event"], "inversion");
        assert_eq!(event["stage"], "resample");
        assert_eq!(event["outcome"], "kept_original");
        assert_eq!(event["reason"], "singular matrix");
    }

    #[test]
    fn inversions_filter_by_stage() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(TraceEvent::Inversion {
            stage: InversionStage::Initial,
            outcome: InversionOutcome::Applied,
        });
        diagnostics.record(TraceEvent::DirectionProbe {
            forward: 5,
            inverse: 0,
            inverted: false,
        });
        assert_eq!(
            diagnostics.inversions(InversionStage::Initial),
            vec![&InversionOutcome::Applied]
        );
        assert!(diagnostics.inversions(InversionStage::Resample).is_empty());
        assert_eq!(diagnostics.direction_probe(), Some((5, 0, false)));
    }
}
