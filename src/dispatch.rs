//! Routing of validated items to the configured sinks.
//!
//! Events go to the calendar (with duplicate detection), tasks fan out to
//! zero or more reminder sinks. Every sink attempt is independent: a failure
//! is logged and reported for that item/sink only and never rolls back or
//! blocks the rest of the batch. A batch report is pushed once at the end
//! when the push sink is configured and something was created.

use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;

use crate::classifier::{ClassifiedItem, EventItem, TaskItem};
use crate::sinks::{CalendarSink, ExistingEvent, PushSink, TaskSink};

/// Two events are duplicates when they fall on the same local day, the
/// titles match case-insensitively, and the starts are within this window.
const DUPLICATE_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// At least one sink materialized the item.
    Created { description: String },
    /// A matching calendar entry already exists. Deliberate no-op.
    DuplicateSkipped,
    /// No sink is enabled for this kind of item. No-op by configuration.
    NoSinkConfigured,
    /// Every applicable sink attempt failed.
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub title: String,
    pub outcome: DispatchOutcome,
}

impl ItemResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Created { .. })
    }
}

pub struct Dispatcher {
    calendar: Option<Arc<dyn CalendarSink>>,
    task_sinks: Vec<Arc<dyn TaskSink>>,
    push: Option<Arc<dyn PushSink>>,
}

impl Dispatcher {
    pub fn new(
        calendar: Option<Arc<dyn CalendarSink>>,
        task_sinks: Vec<Arc<dyn TaskSink>>,
        push: Option<Arc<dyn PushSink>>,
    ) -> Self {
        Self {
            calendar,
            task_sinks,
            push,
        }
    }

    /// Dispatch every item in the batch, then push one newline-joined report
    /// covering what was created. Never fails the batch: each result carries
    /// its own outcome.
    pub async fn dispatch_batch(
        &self,
        items: &[ClassifiedItem],
        now: NaiveDateTime,
    ) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = match item {
                ClassifiedItem::Event(event) => self.dispatch_event(event).await,
                ClassifiedItem::Task(task) => self.dispatch_task(task, now).await,
            };
            results.push(result);
        }

        if let Some(push) = &self.push {
            let lines: Vec<String> = results
                .iter()
                .filter_map(|r| match &r.outcome {
                    DispatchOutcome::Created { description } => Some(description.clone()),
                    _ => None,
                })
                .collect();
            if !lines.is_empty() {
                if let Err(e) = push.send(&lines.join("\n")).await {
                    tracing::warn!("Push report failed: {}", e);
                }
            }
        }

        results
    }

    async fn dispatch_event(&self, event: &EventItem) -> ItemResult {
        let Some(calendar) = &self.calendar else {
            tracing::debug!("Calendar sink disabled, skipping '{}'", event.title);
            return ItemResult {
                title: event.title.clone(),
                outcome: DispatchOutcome::NoSinkConfigured,
            };
        };

        // A failed duplicate query must not block creation; worst case the
        // calendar's own entry shows up twice and the user deletes one.
        match calendar.events_on_day(event.start.date()).await {
            Ok(existing) => {
                if is_duplicate(&existing, event) {
                    tracing::info!("Skipping duplicate event '{}'", event.title);
                    return ItemResult {
                        title: event.title.clone(),
                        outcome: DispatchOutcome::DuplicateSkipped,
                    };
                }
            }
            Err(e) => {
                tracing::warn!("Duplicate check failed for '{}': {}", event.title, e);
            }
        }

        match calendar.create_event(event).await {
            Ok(()) => ItemResult {
                title: event.title.clone(),
                outcome: DispatchOutcome::Created {
                    description: format!(
                        "Created event: {} ({})",
                        event.title,
                        event.start.format("%Y-%m-%d %H:%M")
                    ),
                },
            },
            Err(e) => {
                tracing::error!("Calendar sink failed for '{}': {}", event.title, e);
                ItemResult {
                    title: event.title.clone(),
                    outcome: DispatchOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    async fn dispatch_task(&self, task: &TaskItem, now: NaiveDateTime) -> ItemResult {
        if self.task_sinks.is_empty() {
            tracing::debug!("No reminder sink enabled, skipping '{}'", task.title);
            return ItemResult {
                title: task.title.clone(),
                outcome: DispatchOutcome::NoSinkConfigured,
            };
        }

        let due = now + Duration::minutes(task.due_minutes);
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for sink in &self.task_sinks {
            match sink.create_task(&task.title, due).await {
                Ok(()) => succeeded.push(sink.name().to_string()),
                Err(e) => {
                    tracing::error!("Reminder sink '{}' failed for '{}': {}", sink.name(), task.title, e);
                    failures.push(format!("{}: {}", sink.name(), e));
                }
            }
        }

        if succeeded.is_empty() {
            ItemResult {
                title: task.title.clone(),
                outcome: DispatchOutcome::Failed {
                    reason: failures.join("; "),
                },
            }
        } else {
            ItemResult {
                title: task.title.clone(),
                outcome: DispatchOutcome::Created {
                    description: format!(
                        "Created reminder: {} (due {}, via {})",
                        task.title,
                        due.format("%H:%M"),
                        succeeded.join(", ")
                    ),
                },
            }
        }
    }
}

fn is_duplicate(existing: &[ExistingEvent], event: &EventItem) -> bool {
    existing.iter().any(|e| {
        e.title.trim().eq_ignore_ascii_case(event.title.trim())
            && (e.start - event.start).abs() <= Duration::minutes(DUPLICATE_WINDOW_MINUTES)
    })
}
