//! Per-subscriber threshold crossings with hysteresis and debounce.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AlertConfig;
use crate::subscribers::Subscriber;

/// Where a subscriber's effective threshold came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    User,
    FallbackDefault,
}

impl fmt::Display for ThresholdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::FallbackDefault => "fallback_default",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub subscriber_id: String,
    pub threshold: f64,
    pub threshold_source: ThresholdSource,
    /// Currently above threshold.
    pub armed: bool,
    pub last_notified_value: Option<f64>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventKind {
    Entered,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub subscriber_id: String,
    pub kind: AlertEventKind,
    pub value: f64,
    pub threshold: f64,
    pub threshold_source: ThresholdSource,
    /// Set on `entered` events that passed debounce.
    pub notify: bool,
}

/// A message the dispatcher should deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub subscriber_id: String,
    pub channel_id: String,
    pub text: String,
}

/// Result of one evaluation cycle.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub states: Vec<AlertState>,
    pub events: Vec<AlertEvent>,
    pub requests: Vec<NotificationRequest>,
}

pub fn effective_threshold(sub: &Subscriber, cfg: &AlertConfig) -> (f64, ThresholdSource) {
    match sub.threshold {
        Some(t) if sub.premium && t.is_finite() && t > 0.0 => (t, ThresholdSource::User),
        _ => (cfg.default_threshold, ThresholdSource::FallbackDefault),
    }
}

/// Advance one subscriber's state for the latest `value`.
pub fn step(
    prev: Option<&AlertState>,
    sub: &Subscriber,
    value: f64,
    cfg: &AlertConfig,
    now: DateTime<Utc>,
) -> (AlertState, Option<AlertEvent>) {
    let (threshold, threshold_source) = effective_threshold(sub, cfg);
    let mut state = match prev {
        Some(p) => AlertState {
            threshold,
            threshold_source,
            updated_at: now,
            ..p.clone()
        },
        None => AlertState {
            subscriber_id: sub.id.clone(),
            threshold,
            threshold_source,
            armed: false,
            last_notified_value: None,
            last_notified_at: None,
            updated_at: now,
        },
    };

    let kind = if !state.armed && value > threshold {
        state.armed = true;
        AlertEventKind::Entered
    } else if state.armed && value < threshold - cfg.hysteresis_margin {
        state.armed = false;
        AlertEventKind::Cleared
    } else {
        return (state, None);
    };

    let notify = kind == AlertEventKind::Entered
        && state
            .last_notified_at
            .map_or(true, |at| now - at >= cfg.debounce());
    if notify {
        state.last_notified_at = Some(now);
        state.last_notified_value = Some(value);
    }

    let event = AlertEvent {
        subscriber_id: sub.id.clone(),
        kind,
        value,
        threshold,
        threshold_source,
        notify,
    };
    (state, Some(event))
}

pub fn alert_text(value: f64, threshold: f64, at: DateTime<Utc>) -> String {
    format!(
        "Tremor alert: amplitude {value:.2} is above your threshold of {threshold:.2} (reading at {} UTC).",
        at.format("%Y-%m-%d %H:%M")
    )
}

pub struct AlertEvaluator<'a> {
    cfg: &'a AlertConfig,
}

impl<'a> AlertEvaluator<'a> {
    pub fn new(cfg: &'a AlertConfig) -> Self {
        Self { cfg }
    }

    /// Evaluate every subscriber, sequentially, against the latest reading.
    pub fn evaluate(
        &self,
        subscribers: &[Subscriber],
        previous: &HashMap<String, AlertState>,
        value: f64,
        reading_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let mut out = Evaluation::default();
        for sub in subscribers {
            let (state, event) = step(previous.get(&sub.id), sub, value, self.cfg, now);
            if let Some(event) = event {
                info!(
                    subscriber = %sub.id,
                    kind = ?event.kind,
                    value,
                    threshold = event.threshold,
                    threshold_source = %event.threshold_source,
                    notify = event.notify,
                    "alert transition"
                );
                if event.notify {
                    out.requests.push(NotificationRequest {
                        subscriber_id: sub.id.clone(),
                        channel_id: sub.channel_id.clone(),
                        text: alert_text(value, event.threshold, reading_at),
                    });
                } else if event.kind == AlertEventKind::Entered {
                    debug!(subscriber = %sub.id, "crossing debounced");
                }
                out.events.push(event);
            }
            out.states.push(state);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sub(id: &str) -> Subscriber {
        Subscriber {
            id: id.into(),
            channel_id: format!("chan-{id}"),
            threshold: None,
            premium: false,
            active: true,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    /// Feed `values` ten minutes apart, returning the events.
    fn run(values: &[f64], cfg: &AlertConfig) -> Vec<AlertEvent> {
        let s = sub("a");
        let mut state: Option<AlertState> = None;
        let mut events = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let now = t0() + Duration::minutes(10 * i as i64);
            let (next, ev) = step(state.as_ref(), &s, *v, cfg, now);
            state = Some(next);
            events.extend(ev);
        }
        events
    }

    #[test]
    fn hysteresis_sequence() {
        let events = run(&[1.5, 2.1, 1.9, 2.3, 1.7], &AlertConfig::default());
        let kinds: Vec<(AlertEventKind, f64)> = events.iter().map(|e| (e.kind, e.value)).collect();
        assert_eq!(
            kinds,
            vec![(AlertEventKind::Entered, 2.1), (AlertEventKind::Cleared, 1.7)]
        );
    }

    #[test]
    fn exactly_at_threshold_changes_nothing() {
        let cfg = AlertConfig::default();
        assert!(run(&[2.0, 2.0], &cfg).is_empty());
        // armed, then exactly threshold - margin: still armed
        let events = run(&[2.5, 1.8], &cfg);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Entered);
    }

    #[test]
    fn debounce_suppresses_second_crossing() {
        let cfg = AlertConfig::default();
        let events = run(&[2.5, 1.5, 2.5], &cfg);
        let notified: Vec<&AlertEvent> = events.iter().filter(|e| e.notify).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(notified.len(), 1);
    }

    #[test]
    fn crossing_after_debounce_window_notifies_again() {
        let cfg = AlertConfig {
            debounce_minutes: 15,
            ..AlertConfig::default()
        };
        let events = run(&[2.5, 1.5, 2.5], &cfg);
        assert_eq!(events.iter().filter(|e| e.notify).count(), 2);
    }

    #[test]
    fn cleared_events_never_notify() {
        let events = run(&[3.0, 0.5], &AlertConfig::default());
        assert!(!events[1].notify);
        assert_eq!(events[1].kind, AlertEventKind::Cleared);
    }

    #[test]
    fn premium_override_and_default_threshold() {
        let cfg = AlertConfig::default();
        let mut premium = sub("p");
        premium.premium = true;
        premium.threshold = Some(5.0);
        assert_eq!(effective_threshold(&premium, &cfg), (5.0, ThresholdSource::User));

        let mut free = sub("f");
        free.threshold = Some(5.0);
        assert_eq!(
            effective_threshold(&free, &cfg),
            (2.0, ThresholdSource::FallbackDefault)
        );
        assert_eq!(
            effective_threshold(&sub("n"), &cfg),
            (2.0, ThresholdSource::FallbackDefault)
        );
    }

    #[test]
    fn evaluator_builds_requests_for_notifying_subscribers() {
        let cfg = AlertConfig::default();
        let mut high = sub("high");
        high.premium = true;
        high.threshold = Some(10.0);
        let subs = vec![sub("low"), high];

        let mut previous = HashMap::new();
        let (already, _) = step(None, &sub("low"), 3.0, &cfg, t0());
        previous.insert("low".to_string(), already.clone());
        assert!(already.armed);

        let eval = AlertEvaluator::new(&cfg).evaluate(&subs, &HashMap::new(), 3.0, t0(), t0());
        assert_eq!(eval.states.len(), 2);
        assert_eq!(eval.requests.len(), 1);
        assert_eq!(eval.requests[0].channel_id, "chan-low");
        assert!(eval.requests[0].text.contains("3.00"));

        // already armed: no new event
        let later = t0() + Duration::minutes(30);
        let eval = AlertEvaluator::new(&cfg).evaluate(&subs, &previous, 3.0, later, later);
        assert!(eval.requests.is_empty());
        assert!(eval.events.is_empty());
        assert_eq!(eval.states.len(), 2);
    }
}
