//! Cron producer.
//!
//! Every update aborts all running timers and starts one task per cron
//! trigger. Ticks that fall inside the swap are lost; nothing is replayed.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use trellis_types::{CronEventData, Event, EventKind, Trigger};

use crate::error::Result;
use crate::producer::Producer;
use crate::stream::EventStream;

/// Accept standard 5-field expressions by pinning seconds to zero.
///
/// 6 fields (seconds first) and 7 fields (with year) pass through.
pub fn normalize_expression(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> std::result::Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_expression(expr))
}

struct Timer {
    expression: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct CronProducer {
    timers: Vec<Timer>,
}

impl CronProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expressions with a live timer, in scheduling order.
    pub fn active_timers(&self) -> Vec<String> {
        self.timers
            .iter()
            .filter(|t| !t.task.is_finished())
            .map(|t| t.expression.clone())
            .collect()
    }

    fn abort_all(&mut self) {
        for timer in self.timers.drain(..) {
            timer.task.abort();
        }
    }
}

async fn run_timer(trigger: Arc<Trigger>, schedule: Schedule, stream: EventStream) {
    let mut cursor = Utc::now();
    loop {
        let Some(next) = schedule.after(&cursor).next() else {
            debug!(trigger = %trigger.id(), "Cron schedule has no further occurrences");
            return;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;

        let actual = Utc::now();
        let data = CronEventData::new(next, actual);
        debug!(trigger = %trigger.id(), drift_ms = data.drift_ms(), "Cron fired");
        let Ok(data) = serde_json::to_value(&data) else {
            continue;
        };
        if stream
            .publish(Event::targeted(EventKind::Cron, trigger.clone(), data))
            .is_err()
        {
            return;
        }
        cursor = actual.max(next);
    }
}

#[async_trait]
impl Producer for CronProducer {
    fn name(&self) -> &'static str {
        "cron"
    }

    async fn update_triggers(
        &mut self,
        triggers: &[Arc<Trigger>],
        stream: EventStream,
    ) -> Result<()> {
        self.abort_all();

        for trigger in triggers {
            let Some(spec) = trigger.as_cron() else {
                continue;
            };
            let schedule = match parse_schedule(&spec.expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(
                        trigger = %trigger.id(),
                        expression = %spec.expression,
                        error = %e,
                        "Invalid cron expression, trigger skipped"
                    );
                    continue;
                }
            };
            let task = tokio::spawn(run_timer(trigger.clone(), schedule, stream.clone()));
            self.timers.push(Timer {
                expression: spec.expression.clone(),
                task,
            });
        }

        if !self.timers.is_empty() {
            info!(count = self.timers.len(), "Cron timers scheduled");
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.abort_all();
        Ok(())
    }
}

impl Drop for CronProducer {
    fn drop(&mut self) {
        self.abort_all();
    }
}
