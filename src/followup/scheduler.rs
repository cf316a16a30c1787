//! Periodic follow-up runs.
//!
//! A run selects members stuck in a state past a threshold who have not yet
//! received the job's reminder, nudges them with bounded concurrency, and
//! records each nudge in the ledger so no member is reminded twice.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::chat::{ChatClient, MemberHandle};
use crate::config::FollowupConfig;
use crate::error::{ChatError, DatabaseError};
use crate::onboarding::model::Member;
use crate::store::{FollowupLedger, MemberStore};

use super::{DeliveryPolicy, FollowupJob};

/// What a single run did. Entries are `id:username` labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub notified: Vec<String>,
    /// Members no longer resolvable on the chat platform.
    pub missing: Vec<String>,
    /// Members whose ledger write or reminder send failed.
    pub failed: Vec<String>,
    /// Set when the run could not start (e.g. the stalled query failed).
    pub aborted: bool,
}

impl RunReport {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notified.is_empty() && self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Result for one member within a run.
enum Delivery {
    Notified,
    Missing,
    Failed,
    /// Another run already claimed or recorded this member.
    Skipped,
}

type ClaimKey = (String, &'static str);

/// A member being delivered to by some run. Released on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<ClaimKey>>,
    key: ClaimKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct FollowupScheduler {
    store: Arc<dyn MemberStore>,
    ledger: Arc<dyn FollowupLedger>,
    chat: Arc<dyn ChatClient>,
    config: FollowupConfig,
    /// `(member_id, followup_type)` pairs currently being delivered.
    in_flight: Mutex<HashSet<ClaimKey>>,
}

impl FollowupScheduler {
    pub fn new(
        store: Arc<dyn MemberStore>,
        ledger: Arc<dyn FollowupLedger>,
        chat: Arc<dyn ChatClient>,
        config: FollowupConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            chat,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Execute one pass of `job`. Never panics or propagates; failures are
    /// logged and reflected in the report.
    pub async fn run(&self, job: &FollowupJob) -> RunReport {
        let cutoff = Utc::now() - chrono::Duration::minutes(job.min_minutes_stalled);
        let stalled = match self
            .store
            .list_stalled_members(job.state, cutoff, job.followup_type)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                error!(followup_type = job.followup_type, error = %e, "Follow-up run aborted");
                return RunReport::aborted();
            }
        };

        if stalled.is_empty() {
            debug!(followup_type = job.followup_type, "No members need a follow-up");
            return RunReport::default();
        }

        let fanout = self.config.fanout.max(1);
        let results: Vec<(String, Delivery)> = stream::iter(stalled)
            .map(|member| async move {
                let delivery = self.deliver(job, &member).await;
                (member.log_label(), delivery)
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        let mut report = RunReport::default();
        for (label, delivery) in results {
            match delivery {
                Delivery::Notified => report.notified.push(label),
                Delivery::Missing => report.missing.push(label),
                Delivery::Failed => report.failed.push(label),
                Delivery::Skipped => {}
            }
        }
        report.notified.sort();
        report.missing.sort();
        report.failed.sort();

        info!(
            followup_type = job.followup_type,
            policy = %self.config.policy,
            notified = ?report.notified,
            missing = ?report.missing,
            failed = ?report.failed,
            "Follow-up run complete"
        );
        report
    }

    async fn deliver(&self, job: &FollowupJob, member: &Member) -> Delivery {
        let Some(_claim) = self.claim(job, member) else {
            debug!(member = %member.log_label(), "Follow-up already in flight");
            return Delivery::Skipped;
        };

        match self.config.policy {
            DeliveryPolicy::RecordBeforeSend => {
                let handle = self.resolve(member).await;
                match self.record(job, member).await {
                    Ok(true) => {}
                    Ok(false) => return Delivery::Skipped,
                    Err(_) => return Delivery::Failed,
                }
                match handle {
                    Some(handle) => self.send(job, member, &handle).await,
                    None => Delivery::Missing,
                }
            }
            DeliveryPolicy::RecordAfterSend => {
                // An earlier run may have finished after our stalled query.
                match self
                    .ledger
                    .followup_exists(&member.id, job.followup_type, member.joined_at)
                    .await
                {
                    Ok(false) => {}
                    Ok(true) => return Delivery::Skipped,
                    Err(e) => {
                        error!(member = %member.log_label(), error = %e, "Failed to check follow-up ledger");
                        return Delivery::Failed;
                    }
                }
                let Some(handle) = self.resolve(member).await else {
                    return Delivery::Missing;
                };
                match self.send(job, member, &handle).await {
                    Delivery::Notified => {}
                    other => return other,
                }
                match self.record(job, member).await {
                    Ok(true) => Delivery::Notified,
                    Ok(false) => {
                        warn!(
                            member = %member.log_label(),
                            followup_type = job.followup_type,
                            "Follow-up was recorded concurrently by another process"
                        );
                        Delivery::Skipped
                    }
                    // Sent but unrecorded: the member may be nudged again.
                    Err(_) => Delivery::Failed,
                }
            }
        }
    }

    fn claim<'a>(&'a self, job: &FollowupJob, member: &Member) -> Option<Claim<'a>> {
        let key = (member.id.clone(), job.followup_type);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            key,
        })
    }

    /// Live handle for the member, or `None` if gone, failing or too slow.
    async fn resolve(&self, member: &Member) -> Option<MemberHandle> {
        match self.timed(self.chat.resolve_member(&member.id)).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(member = %member.log_label(), error = %e, "Failed to resolve member");
                None
            }
        }
    }

    async fn record(&self, job: &FollowupJob, member: &Member) -> Result<bool, DatabaseError> {
        self.ledger
            .append_followup(&member.id, job.followup_type, member.joined_at, Utc::now())
            .await
            .inspect_err(|e| {
                error!(
                    member = %member.log_label(),
                    followup_type = job.followup_type,
                    error = %e,
                    "Failed to record follow-up"
                );
            })
    }

    async fn send(&self, job: &FollowupJob, member: &Member, handle: &MemberHandle) -> Delivery {
        let text = (job.message)(&handle.username);
        match self
            .timed(self.chat.send_direct_message(handle, &text))
            .await
        {
            Ok(()) => Delivery::Notified,
            Err(e) => {
                warn!(member = %member.log_label(), error = %e, "Failed to send follow-up");
                Delivery::Failed
            }
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, ChatError>>,
    ) -> Result<T, ChatError> {
        let limit = self.config.call_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(ChatError::Timeout(limit)))
    }
}

/// Spawn the follow-up ticker background task.
pub fn spawn_followup_ticker(
    scheduler: Arc<FollowupScheduler>,
    jobs: Vec<FollowupJob>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for job in &jobs {
                scheduler.run(job).await;
            }
        }
    })
}
