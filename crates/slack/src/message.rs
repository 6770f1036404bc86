use chrono::{DateTime, Utc};
use serde::Serialize;

use runwarden_core::alerts::AlertEvent;
use runwarden_core::money::format_usd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertColor {
    Danger,
    Warning,
    Good,
}

impl AlertColor {
    pub fn hex(&self) -> &'static str {
        match self {
            Self::Danger => "#FF6B6B",
            Self::Warning => "#FFA500",
            Self::Good => "#51CF66",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttachmentField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub color: String,
    pub title: String,
    pub text: String,
    pub fields: Vec<AttachmentField>,
    pub ts: i64,
}

/// Incoming-webhook body: `{"attachments": [...]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub attachments: Vec<Attachment>,
}

pub struct AttachmentBuilder {
    color: AlertColor,
    title: String,
    text: String,
    fields: Vec<AttachmentField>,
}

impl AttachmentBuilder {
    pub fn new(color: AlertColor, title: impl Into<String>) -> Self {
        Self { color, title: title.into(), text: String::new(), fields: Vec::new() }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn field(mut self, title: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(AttachmentField { title: title.into(), value: value.into(), short: true });
        self
    }

    pub fn long_field(mut self, title: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(AttachmentField { title: title.into(), value: value.into(), short: false });
        self
    }

    pub fn build(self, at: DateTime<Utc>) -> WebhookPayload {
        WebhookPayload {
            attachments: vec![Attachment {
                color: self.color.hex().to_owned(),
                title: self.title,
                text: self.text,
                fields: self.fields,
                ts: at.timestamp(),
            }],
        }
    }
}

pub fn render(event: &AlertEvent, at: DateTime<Utc>) -> WebhookPayload {
    match event {
        AlertEvent::RunKilled { run_id, reason, total_cost } => {
            AttachmentBuilder::new(AlertColor::Danger, "🛑 Agent Run Killed")
                .text(format!("Run `{run_id}` was terminated"))
                .field("Reason", reason.as_str())
                .field("Cost", format_usd(*total_cost))
                .build(at)
        }
        AlertEvent::LoopDetected { run_id, step_count, total_cost } => {
            AttachmentBuilder::new(AlertColor::Warning, "🔄 Infinite Loop Detected")
                .text(format!("Run `{run_id}` detected infinite loop pattern"))
                .field("Steps", step_count.to_string())
                .field("Cost", format_usd(*total_cost))
                .build(at)
        }
        AlertEvent::BudgetExceeded { run_id, spent, budget } => {
            let budget = budget.map(format_usd).unwrap_or_else(|| "N/A".to_owned());
            AttachmentBuilder::new(AlertColor::Danger, "💰 Budget Exceeded")
                .text(format!("Run `{run_id}` exceeded budget limit"))
                .field("Spent", format_usd(*spent))
                .field("Budget", budget)
                .build(at)
        }
        AlertEvent::RunCompleted { run_id, step_count, total_cost, total_latency_ms } => {
            AttachmentBuilder::new(AlertColor::Good, "✅ Agent Run Completed")
                .text(format!("Run `{run_id}` finished successfully"))
                .field("Steps", step_count.to_string())
                .field("Cost", format_usd(*total_cost))
                .field("Latency", format!("{total_latency_ms}ms"))
                .build(at)
        }
        AlertEvent::RunFailed { run_id, error } => {
            AttachmentBuilder::new(AlertColor::Danger, "❌ Agent Run Failed")
                .text(format!("Run `{run_id}` encountered an error"))
                .long_field("Error", error.as_str())
                .build(at)
        }
    }
}
