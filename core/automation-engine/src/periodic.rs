//! Periodic topics: interval timers and on-demand system event topics

use crate::config::{parse_duration, SystemTopicsConfig};
use crate::error::{EngineError, Result};
use crate::registry::{TopicRegistry, UpdateOutcome};
use crate::topic::{PeriodicConfig, TopicVariant};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam::channel::{bounded, tick, Sender};
use serde_json::{json, Value};
use std::io;
use std::sync::Weak;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TICKER_PREFIX: &str = "system/ticker/";
pub const EVENTS_PREFIX: &str = "system/events/";

/// On-demand system event topics
pub const SYSTEM_EVENTS: [&str; 4] = ["startup", "shutdown", "error", "heartbeat"];

/// Background timer driving one Periodic topic
///
/// The timer thread stops when the ticker is dropped or the registry goes away.
pub struct Ticker {
    _stop: Sender<()>,
}

impl Ticker {
    pub fn parse_interval(interval: &str) -> Result<Duration> {
        let duration = parse_duration(interval)
            .map_err(|err| EngineError::Validation(format!("invalid interval: {}", err)))?;
        if duration.is_zero() {
            return Err(EngineError::Validation(format!("interval {} must be positive", interval)));
        }
        Ok(duration)
    }

    pub fn start(topic: &str, interval: Duration, registry: Weak<TopicRegistry>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticks = tick(interval);
        let topic = topic.to_string();

        thread::Builder::new()
            .name(format!("ticker-{}", topic))
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticks) -> instant => {
                        if instant.is_err() {
                            break;
                        }
                        let Some(live) = registry.upgrade() else {
                            break;
                        };
                        match live.update_value(&topic, tick_payload(&topic, Utc::now())) {
                            Ok(_) => {}
                            Err(EngineError::NotFound(_)) => break,
                            Err(err) => warn!("Tick for {} failed: {}", topic, err),
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })?;

        Ok(Self { _stop: stop_tx })
    }
}

/// Payload written on every tick
pub fn tick_payload(topic: &str, now: DateTime<Utc>) -> Value {
    json!({
        "timestamp": now.timestamp(),
        "iso_time": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "topic": topic,
    })
}

/// Payload written to `system/events/<event_type>`
pub fn system_event_payload(event_type: &str, data: Value, now: DateTime<Utc>) -> Value {
    json!({
        "event_type": event_type,
        "timestamp": now.timestamp(),
        "iso_time": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "data": data,
    })
}

impl TopicRegistry {
    /// Install configured ticker and event topics, starting any stopped timers
    pub fn install_system_topics(&self, config: &SystemTopicsConfig) -> Result<()> {
        for interval in &config.ticker_intervals {
            let name = format!("{}{}", TICKER_PREFIX, interval);
            if !self.contains(&name) {
                self.register_periodic(
                    &name,
                    PeriodicConfig::interval(interval.as_str())
                        .with_description(format!("System ticker every {}", interval)),
                )?;
            }
            self.start_periodic(&name)?;
        }

        if config.event_topics {
            for event in SYSTEM_EVENTS {
                let name = format!("{}{}", EVENTS_PREFIX, event);
                if !self.contains(&name) {
                    self.register_periodic(
                        &name,
                        PeriodicConfig::on_demand(format!("System {} events", event)),
                    )?;
                }
            }
        }

        info!(
            "Installed system topics ({} tickers, event topics {})",
            config.ticker_intervals.len(),
            if config.event_topics { "on" } else { "off" }
        );
        Ok(())
    }

    /// Write a system event to `system/events/<event_type>`
    pub fn emit_system_event(&self, event_type: &str, data: Value) -> Result<UpdateOutcome> {
        let name = format!("{}{}", EVENTS_PREFIX, event_type);
        match self.variant_of(&name) {
            Some(TopicVariant::Periodic) => {}
            Some(_) | None => return Err(EngineError::NotFound(name)),
        }

        debug!("Emitting system event: {}", event_type);
        self.update_value(&name, system_event_payload(event_type, data, Utc::now()))
    }
}
