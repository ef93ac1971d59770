// Outbound throttled broadcast: one templated message to an ordered target
// list, sent strictly sequentially with a randomized delay between sends so
// the cadence does not trip the gateway's anti-spam detection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::{sleep, timeout};

use crate::gateway::{Gateway, NetworkError};
use crate::models::SendPayload;

/// Per-target delivery state: Pending -> Sending -> Sent | Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Pending,
    Sending,
    Sent,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastTarget {
    /// Conversation id the gateway delivers to.
    pub id: String,
    pub status: TargetStatus,
    pub error: Option<String>,
}

impl BroadcastTarget {
    pub fn new(id: impl Into<String>) -> Self {
        BroadcastTarget {
            id: id.into(),
            status: TargetStatus::Pending,
            error: None,
        }
    }
}

/// Inter-send delay window; each delay is drawn uniformly from
/// [min_ms, min_ms + jitter_ms].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayWindow {
    pub min_ms: u64,
    pub jitter_ms: u64,
}

impl DelayWindow {
    pub fn sample(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        Duration::from_millis(self.min_ms + jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    Completed,
}

/// Aggregate tally once every target reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub success_count: usize,
    pub error_count: usize,
}

/// One line of the per-event assignee listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentLine {
    pub event_label: String,
    pub assignees: Vec<String>,
}

/// Values substituted into the template once, before the send loop starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateContext {
    pub event_title: String,
    pub date_range: String,
    pub assignments: Vec<AssignmentLine>,
    pub notes: String,
}

/// Substitute the fixed recognized placeholder set: {title}, {dates},
/// {assignments}, {notes}. Unknown placeholders are left as-is.
pub fn render_template(template: &str, ctx: &TemplateContext) -> String {
    let assignments = ctx
        .assignments
        .iter()
        .map(|line| format!("{}: {}", line.event_label, line.assignees.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");
    template
        .replace("{title}", &ctx.event_title)
        .replace("{dates}", &ctx.date_range)
        .replace("{assignments}", &assignments)
        .replace("{notes}", &ctx.notes)
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast has no recipients")]
    NoRecipients,

    #[error("broadcast template is empty")]
    EmptyTemplate,

    #[error("broadcast was already started")]
    AlreadyStarted,
}

/// Live progress notifications for the UI.
#[derive(Debug, Clone)]
pub enum BroadcastProgress {
    Started { total: usize },
    /// Sleeping before `next_index` is attempted.
    Delaying { next_index: usize, delay: Duration },
    TargetUpdated { index: usize, status: TargetStatus },
    Completed(BroadcastOutcome),
}

/// The observable state of one broadcast run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub template: String,
    pub targets: Vec<BroadcastTarget>,
    pub delay: DelayWindow,
    pub state: JobState,
    pub outcome: Option<BroadcastOutcome>,
}

/// Sends one rendered message to every target, strictly in list order.
/// There is deliberately no abort: once started a job runs to completion,
/// so every target record reaches a terminal state and the tally is always
/// meaningful. Callers that want the job out of the way spawn `run` and
/// keep the progress receiver ("minimize").
#[derive(Clone)]
pub struct BroadcastDispatcher {
    gateway: Arc<dyn Gateway>,
    job: Arc<TokioMutex<BroadcastJob>>,
    rendered: String,
    send_timeout: Duration,
    progress_tx: mpsc::Sender<BroadcastProgress>,
}

impl BroadcastDispatcher {
    /// Validates the job up front: an empty target list or a blank template
    /// refuses to start. Per-target failures later never abort the run.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        template: &str,
        context: &TemplateContext,
        targets: Vec<BroadcastTarget>,
        delay: DelayWindow,
        send_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<BroadcastProgress>), BroadcastError> {
        if targets.is_empty() {
            return Err(BroadcastError::NoRecipients);
        }
        if template.trim().is_empty() {
            return Err(BroadcastError::EmptyTemplate);
        }
        // Rendered once for the whole job, not per target.
        let rendered = render_template(template, context);
        let (progress_tx, progress_rx) = mpsc::channel(100);
        let job = BroadcastJob {
            template: template.to_string(),
            targets,
            delay,
            state: JobState::Idle,
            outcome: None,
        };
        let dispatcher = BroadcastDispatcher {
            gateway,
            job: Arc::new(TokioMutex::new(job)),
            rendered,
            send_timeout,
            progress_tx,
        };
        Ok((dispatcher, progress_rx))
    }

    /// Read-only view of the job, available during the run and after
    /// completion until the dispatcher is dropped.
    pub async fn job(&self) -> BroadcastJob {
        self.job.lock().await.clone()
    }

    pub async fn outcome(&self) -> Option<BroadcastOutcome> {
        self.job.lock().await.outcome
    }

    /// Run the job to completion and return the aggregate tally.
    pub async fn run(&self) -> Result<BroadcastOutcome, BroadcastError> {
        let (total, delay) = {
            let mut job = self.job.lock().await;
            if job.state != JobState::Idle {
                return Err(BroadcastError::AlreadyStarted);
            }
            job.state = JobState::Running;
            (job.targets.len(), job.delay)
        };
        info!("broadcast started: {} targets", total);
        self.emit(BroadcastProgress::Started { total }).await;

        let mut success_count = 0usize;
        let mut error_count = 0usize;

        for index in 0..total {
            if index > 0 {
                let pause = delay.sample();
                self.emit(BroadcastProgress::Delaying {
                    next_index: index,
                    delay: pause,
                })
                .await;
                sleep(pause).await;
            }

            let target_id = {
                let mut job = self.job.lock().await;
                job.targets[index].status = TargetStatus::Sending;
                job.targets[index].id.clone()
            };
            self.emit(BroadcastProgress::TargetUpdated {
                index,
                status: TargetStatus::Sending,
            })
            .await;

            let payload = SendPayload::Text {
                body: self.rendered.clone(),
            };
            let result = match timeout(self.send_timeout, self.gateway.send(&target_id, &payload))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(NetworkError::Timeout(self.send_timeout)),
            };

            let (status, error) = match result {
                Ok(_) => {
                    success_count += 1;
                    (TargetStatus::Sent, None)
                }
                Err(e) => {
                    // A single failed recipient must not abort the job.
                    warn!("broadcast target {} failed: {}", target_id, e);
                    error_count += 1;
                    (TargetStatus::Error, Some(e.to_string()))
                }
            };
            {
                let mut job = self.job.lock().await;
                job.targets[index].status = status;
                job.targets[index].error = error;
            }
            self.emit(BroadcastProgress::TargetUpdated { index, status })
                .await;
        }

        let outcome = BroadcastOutcome {
            success_count,
            error_count,
        };
        {
            let mut job = self.job.lock().await;
            job.state = JobState::Completed;
            job.outcome = Some(outcome);
        }
        info!(
            "broadcast completed: {} sent, {} failed",
            success_count, error_count
        );
        self.emit(BroadcastProgress::Completed(outcome)).await;
        Ok(outcome)
    }

    async fn emit(&self, progress: BroadcastProgress) {
        if self.progress_tx.send(progress).await.is_err() {
            debug!("broadcast progress dropped: no subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_recognized_placeholders() {
        let ctx = TemplateContext {
            event_title: "Open house".to_string(),
            date_range: "12.05. - 14.05.".to_string(),
            assignments: vec![
                AssignmentLine {
                    event_label: "Friday".to_string(),
                    assignees: vec!["Ana".to_string(), "Ben".to_string()],
                },
                AssignmentLine {
                    event_label: "Saturday".to_string(),
                    assignees: vec!["Cleo".to_string()],
                },
            ],
            notes: "bring badges".to_string(),
        };
        let rendered = render_template(
            "{title} ({dates})\n{assignments}\nNotes: {notes} {unknown}",
            &ctx,
        );
        assert_eq!(
            rendered,
            "Open house (12.05. - 14.05.)\nFriday: Ana, Ben\nSaturday: Cleo\nNotes: bring badges {unknown}"
        );
    }

    #[test]
    fn test_delay_sample_stays_in_window() {
        let window = DelayWindow {
            min_ms: 40,
            jitter_ms: 20,
        };
        for _ in 0..100 {
            let d = window.sample();
            assert!(d >= Duration::from_millis(40));
            assert!(d <= Duration::from_millis(60));
        }
    }

    #[test]
    fn test_zero_jitter_is_a_fixed_delay() {
        let window = DelayWindow {
            min_ms: 25,
            jitter_ms: 0,
        };
        assert_eq!(window.sample(), Duration::from_millis(25));
    }
}
