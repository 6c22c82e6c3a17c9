use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use wa_core::config::SchedulerConfig;
use wa_core::kv::{Claim, SharedStore};
use wa_core::model::{ScheduledFollowup, ScheduledReminder, SentVia, SummaryWebhookStatus};
use wa_store::Store;

use crate::error::Result;
use crate::store::SchedulerStore;

/// Outcome of the AI send/skip decision for a follow-up step.
pub enum FollowupOutcome {
    Send {
        content: String,
        sent_via: SentVia,
        template_name: Option<String>,
    },
    Skip {
        reason: String,
    },
}

/// The side effects the scheduler can't perform itself: generating and
/// sending reminder/follow-up content and shipping a summary webhook. Kept
/// as a trait so this crate never needs an LLM client or HTTP stack;
/// `wa-agent`/`wa-gateway` implement it.
#[async_trait::async_trait]
pub trait SchedulerSink: Send + Sync {
    async fn send_reminder(&self, reminder: &ScheduledReminder) -> std::result::Result<(), String>;

    async fn deliver_summary_webhook(
        &self,
        webhook_url: &str,
        conversation_id: i64,
        summary_text: &str,
    ) -> std::result::Result<(), String>;

    async fn decide_followup(&self, followup: &ScheduledFollowup) -> FollowupOutcome;
}

const FOLLOWUP_TIMER_SET: &str = "followup:timers";
const FOLLOWUP_CONCURRENCY_CAP: usize = 10;

pub struct SchedulerEngine {
    scheduler_store: Arc<SchedulerStore>,
    store: Arc<Store>,
    shared: Arc<dyn SharedStore>,
    sink: Arc<dyn SchedulerSink>,
    config: SchedulerConfig,
}

impl SchedulerEngine {
    pub fn new(
        scheduler_store: Arc<SchedulerStore>,
        store: Arc<Store>,
        shared: Arc<dyn SharedStore>,
        sink: Arc<dyn SchedulerSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            scheduler_store,
            store,
            shared,
            sink,
            config,
        }
    }

    /// Main tick loop. Only the instance holding `scheduler:lock` for this
    /// tick runs a cycle; every other instance's tick is a no-op, matching
    /// the single-leader design named in the spec.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut interval = tokio::time::interval(StdDuration::from_secs(self.config.check_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let lease_ttl = StdDuration::from_secs(self.config.lease_secs);
                    if self.shared.acquire_scheduler_lease(lease_ttl) == Claim::Acquired {
                        if let Err(e) = self.cycle().await {
                            error!("scheduler cycle error: {e}");
                        }
                    } else {
                        debug!("scheduler lease held by another instance this tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn cycle(&self) -> Result<()> {
        self.drain_reminders().await?;
        self.detect_summary_eligible_conversations().await?;
        self.retry_summary_webhooks().await?;
        self.drain_followup_timers().await?;
        self.process_pending_followups().await?;
        Ok(())
    }

    // --- C8: reminders -------------------------------------------------

    async fn drain_reminders(&self) -> Result<()> {
        let due = self
            .scheduler_store
            .claim_due_reminders(self.config.reminder_batch_size as i64)?;
        for reminder in due {
            match self.sink.send_reminder(&reminder).await {
                Ok(()) => {
                    self.scheduler_store.mark_reminder_sent(reminder.id)?;
                    info!(reminder_id = reminder.id, "reminder sent");
                }
                Err(e) => {
                    self.scheduler_store.mark_reminder_failed(reminder.id, &e)?;
                    warn!(reminder_id = reminder.id, error = %e, "reminder failed");
                }
            }
        }
        Ok(())
    }

    // --- C9: summaries ---------------------------------------------------

    async fn detect_summary_eligible_conversations(&self) -> Result<()> {
        let eligible = self.scheduler_store.detect_eligible_conversations(Utc::now())?;
        for candidate in eligible {
            let messages = self
                .store
                .recent_messages(candidate.conversation_id, candidate.max_messages)
                .map_err(summary_store_err)?;
            if messages.is_empty() {
                continue;
            }
            let summary_text = render_plain_summary(&messages);

            match self.scheduler_store.insert_summary(
                candidate.conversation_id,
                candidate.last_customer_message_at,
                &summary_text,
            )? {
                Some(summary) => {
                    info!(
                        conversation_id = candidate.conversation_id,
                        summary_id = summary.id,
                        "summary detected"
                    );
                }
                None => {
                    debug!(conversation_id = candidate.conversation_id, "summary race lost to peer, skipping");
                }
            }
        }
        Ok(())
    }

    async fn retry_summary_webhooks(&self) -> Result<()> {
        let due = self.scheduler_store.due_summary_webhooks(50)?;
        for summary in due {
            if summary.status != SummaryWebhookStatus::Pending {
                continue;
            }
            let conversation = match self.store.get_conversation(summary.conversation_id) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let agent = match self.store.get_agent(conversation.agent_id) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let Some(webhook_url) = agent.summaries.webhook_url.clone() else {
                self.scheduler_store.mark_webhook_sent(summary.id)?;
                continue;
            };
            match self
                .sink
                .deliver_summary_webhook(&webhook_url, summary.conversation_id, &summary.summary)
                .await
            {
                Ok(()) => self.scheduler_store.mark_webhook_sent(summary.id)?,
                Err(e) => self.scheduler_store.record_webhook_failure(
                    summary.id,
                    &e,
                    agent.summaries.webhook_retry_delay_secs,
                    agent.summaries.webhook_retry_count,
                )?,
            }
        }
        Ok(())
    }

    // --- C10: follow-ups -------------------------------------------------

    /// A timer firing doesn't send anything by itself — it materializes the
    /// `scheduled_followups` row for this step so `claim_due_followups`
    /// picks it up next. The row is created lazily like this (rather than
    /// up front when the sequence starts) so a customer reply that arrives
    /// before the step is due never leaves a dead row behind to cancel: I3's
    /// `cancel_pending_followups` only ever has to clean up steps that have
    /// actually fired.
    async fn drain_followup_timers(&self) -> Result<()> {
        let now_unix = Utc::now().timestamp();
        let due_members = self.shared.drain_due_timers(FOLLOWUP_TIMER_SET, now_unix);
        for member in due_members {
            let Some((conversation_id, followup_number)) = parse_timer_member(&member) else {
                continue;
            };
            if self
                .scheduler_store
                .has_pending_or_sent_followup(conversation_id, followup_number)?
            {
                debug!(conversation_id, followup_number, "follow-up already materialized, skipping");
                continue;
            }
            let conversation = match self.store.get_conversation(conversation_id) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if conversation.blocks_outbound() {
                continue;
            }
            let agent = match self.store.get_agent(conversation.agent_id) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let Some(step) = agent.followups.sequence.get((followup_number - 1) as usize) else {
                continue;
            };
            // A newer customer message since this timer was armed means the
            // sequence was effectively cancelled (I3) without ever needing a
            // `remove_timer` call: recompute the quiet window the same way
            // C9 does instead of tracking per-timer cancellation state.
            let quiet_long_enough = match conversation.last_customer_message_at {
                Some(last) => Utc::now() - last >= Duration::milliseconds((step.delay_hours * 3_600_000.0) as i64),
                None => false,
            };
            if !quiet_long_enough {
                debug!(conversation_id, followup_number, "customer replied since timer was armed, skipping");
                continue;
            }
            self.scheduler_store.schedule_followup(
                conversation_id,
                agent.id,
                conversation.user_id,
                followup_number,
                &step.instruction,
                Utc::now(),
            )?;
            debug!(conversation_id, followup_number, "follow-up materialized");
        }
        Ok(())
    }


    async fn process_pending_followups(&self) -> Result<()> {
        let due = self
            .scheduler_store
            .claim_due_followups(self.config.followup_batch_size as i64)?;

        let mut tasks = Vec::new();
        for followup in due {
            if tasks.len() >= self.config.followup_concurrency.min(FOLLOWUP_CONCURRENCY_CAP) {
                futures_util::future::join_all(std::mem::take(&mut tasks)).await;
            }
            let scheduler_store = Arc::clone(&self.scheduler_store);
            let sink = Arc::clone(&self.sink);
            let this_agent_id = followup.agent_id;
            let this_conversation_id = followup.conversation_id;
            let this_followup_number = followup.followup_number;
            let engine_store = Arc::clone(&self.store);
            let engine_shared = Arc::clone(&self.shared);
            tasks.push(async move {
                let outcome = sink.decide_followup(&followup).await;
                let sent = matches!(outcome, FollowupOutcome::Send { .. });
                let result = match outcome {
                    FollowupOutcome::Send {
                        content,
                        sent_via,
                        template_name,
                    } => scheduler_store.mark_followup_sent(
                        followup.id,
                        &content,
                        sent_via,
                        template_name.as_deref(),
                    ),
                    FollowupOutcome::Skip { reason } => {
                        scheduler_store.mark_followup_skipped(followup.id, &reason)
                    }
                };
                if let Err(e) = result {
                    error!(followup_id = followup.id, error = %e, "failed to persist follow-up outcome");
                } else if sent {
                    let next_number = this_followup_number + 1;
                    if let Ok(agent) = engine_store.get_agent(this_agent_id) {
                        if let Some(step) = agent.followups.sequence.get((next_number - 1) as usize) {
                            let fire_at = Utc::now() + Duration::seconds((step.delay_hours * 3600.0) as i64);
                            let member = format!("{this_conversation_id}:{next_number}");
                            engine_shared.enqueue_timer(FOLLOWUP_TIMER_SET, &member, fire_at.timestamp());
                        }
                    }
                }
            });
        }
        futures_util::future::join_all(tasks).await;
        Ok(())
    }
}

fn parse_timer_member(member: &str) -> Option<(i64, i64)> {
    let (a, b) = member.split_once(':')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn render_plain_summary(messages: &[wa_core::model::Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summary_store_err(e: wa_store::Error) -> crate::error::SchedulerError {
    crate::error::SchedulerError::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::kv::DashMapStore;
    use wa_core::model::WhatsAppProvider;

    struct NoopSink;

    #[async_trait::async_trait]
    impl SchedulerSink for NoopSink {
        async fn send_reminder(&self, _reminder: &ScheduledReminder) -> std::result::Result<(), String> {
            Ok(())
        }

        async fn deliver_summary_webhook(
            &self,
            _url: &str,
            _conversation_id: i64,
            _summary: &str,
        ) -> std::result::Result<(), String> {
            Ok(())
        }

        async fn decide_followup(&self, _followup: &ScheduledFollowup) -> FollowupOutcome {
            FollowupOutcome::Skip {
                reason: "test stub never sends".into(),
            }
        }
    }

    fn make_engine() -> SchedulerEngine {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let db_path = format!("file:wa_scheduler_test_{id}?mode=memory&cache=shared");
        let scheduler_store = Arc::new(SchedulerStore::open(&db_path).unwrap());
        let store = Arc::new(Store::open(&db_path).unwrap());
        let shared: Arc<dyn SharedStore> = Arc::new(DashMapStore::new());
        let sink: Arc<dyn SchedulerSink> = Arc::new(NoopSink);
        SchedulerEngine::new(scheduler_store, store, shared, sink, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn cycle_runs_without_error_on_empty_state() {
        let engine = make_engine();
        engine.cycle().await.unwrap();
    }

    #[tokio::test]
    async fn drain_reminders_marks_due_reminder_sent() {
        let engine = make_engine();
        let agent = engine
            .store
            .create_agent("Clinic", WhatsAppProvider::Meta, "claude-3-5-sonnet")
            .unwrap();
        let appt = engine
            .scheduler_store
            .book_appointment(agent.id, 1, Utc::now(), Utc::now() + Duration::minutes(30), "Checkup", None, None)
            .unwrap();
        let reminder = engine
            .scheduler_store
            .materialize_reminder(crate::reminders::NewReminder {
                appointment_id: appt.id,
                agent_id: agent.id,
                user_id: 1,
                scheduled_for: Utc::now() - Duration::minutes(1),
                content_type: wa_core::model::ReminderContentType::Template,
                template: Some("reminder text"),
                ai_prompt: None,
                rule_index: 0,
            })
            .unwrap();

        engine.drain_reminders().await.unwrap();
        let fetched = engine.scheduler_store.get_reminder(reminder.id).unwrap();
        assert_eq!(fetched.status, wa_core::model::ReminderStatus::Sent);
    }

    #[test]
    fn timer_member_round_trips() {
        assert_eq!(parse_timer_member("42:3"), Some((42, 3)));
        assert_eq!(parse_timer_member("garbage"), None);
    }
}
