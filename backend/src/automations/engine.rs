// Execution Engine
//
// Interprets one step at a time for an execution, advancing until it pauses
// at a wait_for_reply step, completes at an end step, or fails. All pauses
// go through the pending store; all resumes go through its atomic `take`,
// which is what serializes concurrent events for the same conversation.

use chrono::{Duration, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ondas_shared::{Channel, Conversation};

use crate::config::AutomationConfig;
use crate::events::ReplyData;
use crate::notifications::{NotificationEvent, NotificationSink};
use crate::services::MessagingGateway;
use crate::storage::{NewMessage, Storage, StorageError, StorageResult};

use super::definition::{AutomationDefinition, Execution, ExecutionStatus};
use super::pending::{PendingExecution, PendingExecutionStore};
use super::steps::StepAction;

/// The contact's answer handed to a resume.
#[derive(Debug, Clone, Default)]
pub struct ResumeInput {
    pub text: String,
    pub reply: Option<ReplyData>,
}

#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    /// No execution was waiting on this conversation; the caller falls back
    /// to trigger resolution.
    NoPending,
    Resumed {
        execution_id: Uuid,
        variable: String,
        value: String,
    },
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub errors: Vec<String>,
}

/// Everything a step needs to execute; owned so delayed continuations can be
/// moved onto a timer task.
struct StepContext {
    definition: AutomationDefinition,
    channel: Channel,
    conversation: Conversation,
    execution: Execution,
}

pub struct ExecutionEngine {
    storage: Arc<dyn Storage>,
    gateway: Arc<dyn MessagingGateway>,
    pending: Arc<dyn PendingExecutionStore>,
    notifier: Arc<dyn NotificationSink>,
    config: AutomationConfig,
}

impl ExecutionEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: Arc<dyn MessagingGateway>,
        pending: Arc<dyn PendingExecutionStore>,
        notifier: Arc<dyn NotificationSink>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            storage,
            gateway,
            pending,
            notifier,
            config,
        }
    }

    /// Start a fresh execution at the definition's entry step and advance it.
    ///
    /// Returns the execution id, or `None` when the conversation is already
    /// owned by a non-terminal execution (the storage unique constraint is
    /// the arbiter under concurrency).
    pub async fn start(
        self: &Arc<Self>,
        definition: AutomationDefinition,
        channel: &Channel,
        conversation: &Conversation,
        contact_id: Uuid,
    ) -> StorageResult<Option<Uuid>> {
        let execution = Execution::new(&definition, conversation.id, contact_id);

        match self.storage.create_execution(&execution).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                debug!(
                    conversation_id = %conversation.id,
                    "conversation already owned by a non-terminal execution"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        info!(
            execution_id = %execution.id,
            automation = %definition.name,
            conversation_id = %conversation.id,
            "starting automation execution"
        );

        let execution_id = execution.id;
        self.advance(StepContext {
            definition,
            channel: channel.clone(),
            conversation: conversation.clone(),
            execution,
        })
        .await?;

        Ok(Some(execution_id))
    }

    /// Resume the conversation's waiting execution with the contact's reply.
    pub async fn resume(
        self: &Arc<Self>,
        channel: &Channel,
        conversation: &Conversation,
        input: ResumeInput,
    ) -> StorageResult<ResumeOutcome> {
        let Some(pending) = self.pending.take(conversation.id).await? else {
            return Ok(ResumeOutcome::NoPending);
        };

        let Some(definition) = self
            .storage
            .get_automation(pending.automation_id, pending.automation_version)
            .await?
        else {
            self.abandon(&pending, "automation definition version no longer loadable")
                .await?;
            return Ok(ResumeOutcome::NoPending);
        };

        let Some(StepAction::WaitForReply { variable, accept, next, .. }) = definition
            .step(&pending.waiting_step_id)
            .map(|s| s.action.clone())
        else {
            self.abandon(&pending, "pending entry references a non-wait step")
                .await?;
            return Ok(ResumeOutcome::NoPending);
        };

        if let Some(filter) = &accept {
            let reply_id = input.reply.as_ref().map(|r| r.id.as_str());
            if !filter.accepts(&input.text, reply_id) {
                // Mismatches still resume; the raw input is bound below.
                warn!(
                    conversation_id = %conversation.id,
                    "reply does not satisfy the step's accepted-input filter; resuming anyway"
                );
            }
        }

        let mut execution = match self.storage.get_execution(pending.execution_id).await? {
            Some(execution) => execution,
            None => rebuild_from_pending(&pending),
        };

        execution.bindings = pending.bindings.clone();
        let value = input.text.clone();
        execution.bindings.insert(variable.clone(), value.clone());
        if let Some(reply) = &input.reply {
            execution
                .bindings
                .insert(format!("{}_id", variable), reply.id.clone());
        }
        execution.status = ExecutionStatus::Running;
        execution.resume_deadline = None;
        execution.last_advanced_at = Utc::now();

        info!(
            execution_id = %execution.id,
            conversation_id = %conversation.id,
            variable = %variable,
            "resuming automation execution"
        );

        let outcome = ResumeOutcome::Resumed {
            execution_id: execution.id,
            variable,
            value,
        };

        match next {
            Some(next_id) => {
                execution.current_step_id = next_id;
                self.storage.update_execution(&execution).await?;
                self.advance(StepContext {
                    definition,
                    channel: channel.clone(),
                    conversation: conversation.clone(),
                    execution,
                })
                .await?;
            }
            None => {
                // The wait was the last step in the graph.
                execution.status = ExecutionStatus::Completed;
                self.storage.update_execution(&execution).await?;
            }
        }

        Ok(outcome)
    }

    /// Cancel the conversation's waiting execution, if any.
    pub async fn cancel(&self, conversation_id: Uuid) -> StorageResult<bool> {
        let Some(pending) = self.pending.take(conversation_id).await? else {
            return Ok(false);
        };

        if let Some(mut execution) = self.storage.get_execution(pending.execution_id).await? {
            if !execution.status.is_terminal() {
                execution.status = ExecutionStatus::Cancelled;
                execution.resume_deadline = None;
                execution.last_advanced_at = Utc::now();
                self.storage.update_execution(&execution).await?;
            }
        }

        info!(conversation_id = %conversation_id, "cancelled pending automation execution");
        Ok(true)
    }

    /// Expire every pending execution whose deadline has passed.
    ///
    /// `timeout_override` re-evaluates deadlines against `paused_at` instead
    /// of the recorded `resume_deadline` (the on-demand endpoint's knob).
    /// Uses the same atomic `take` as resume: when a reply races the sweep,
    /// exactly one of them claims the entry.
    pub async fn sweep_expired(&self, timeout_override: Option<Duration>) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let entries = match self.pending.list_all().await {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("listing pending executions: {}", e));
                return report;
            }
        };

        report.scanned = entries.len();

        for entry in entries {
            let due = match timeout_override {
                Some(timeout) => entry.paused_at + timeout <= now,
                None => entry.is_expired_at(now),
            };
            if !due {
                continue;
            }

            match self.pending.take(entry.conversation_id).await {
                Ok(Some(taken)) => {
                    if let Err(e) = self.mark_expired(&taken).await {
                        report
                            .errors
                            .push(format!("expiring execution {}: {}", taken.execution_id, e));
                    } else {
                        report.expired += 1;
                    }
                }
                // A resume claimed the entry between listing and take.
                Ok(None) => {}
                Err(e) => {
                    report
                        .errors
                        .push(format!("taking conversation {}: {}", entry.conversation_id, e));
                }
            }
        }

        if report.expired > 0 {
            info!(
                expired = report.expired,
                scanned = report.scanned,
                "expired timed-out automation executions"
            );
        }
        report
    }

    async fn mark_expired(&self, pending: &PendingExecution) -> StorageResult<()> {
        if let Some(mut execution) = self.storage.get_execution(pending.execution_id).await? {
            if !execution.status.is_terminal() {
                execution.status = ExecutionStatus::Expired;
                execution.resume_deadline = None;
                execution.last_advanced_at = Utc::now();
                self.storage.update_execution(&execution).await?;
            }
        }
        Ok(())
    }

    /// Run steps until the execution pauses, completes, or fails.
    async fn advance(self: &Arc<Self>, mut ctx: StepContext) -> StorageResult<()> {
        loop {
            let Some(step) = ctx.definition.step(&ctx.execution.current_step_id).cloned() else {
                let message = format!(
                    "step '{}' not found in automation '{}' v{}",
                    ctx.execution.current_step_id, ctx.definition.name, ctx.definition.version
                );
                return self.fail(ctx, message).await;
            };

            match step.action {
                StepAction::SendMessage { content, receipt_variable, next } => {
                    let body = interpolate(&content, &ctx.execution.bindings);
                    let receipt = match self
                        .gateway
                        .send_message(&ctx.channel, &ctx.conversation.contact_phone, &body)
                        .await
                    {
                        Ok(receipt) => receipt,
                        Err(e) => {
                            return self.fail(ctx, format!("send_message failed: {}", e)).await;
                        }
                    };
                    self.storage
                        .create_message(NewMessage::outbound(ctx.conversation.id, &receipt, &body))
                        .await?;
                    if let Some(variable) = receipt_variable {
                        ctx.execution.bindings.insert(variable, receipt);
                    }
                    if !self.step_to(&mut ctx, next).await? {
                        return self.complete(ctx).await;
                    }
                }

                StepAction::SendTemplate {
                    template_name,
                    variables,
                    receipt_variable,
                    next,
                } => {
                    let parameters: Vec<String> = variables
                        .iter()
                        .map(|v| interpolate(v, &ctx.execution.bindings))
                        .collect();
                    let receipt = match self
                        .gateway
                        .send_template(
                            &ctx.channel,
                            &ctx.conversation.contact_phone,
                            &template_name,
                            &parameters,
                        )
                        .await
                    {
                        Ok(receipt) => receipt,
                        Err(e) => {
                            return self.fail(ctx, format!("send_template failed: {}", e)).await;
                        }
                    };
                    let mut message = NewMessage::outbound(
                        ctx.conversation.id,
                        &receipt,
                        &format!("[template: {}]", template_name),
                    );
                    message.message_type = "template".to_string();
                    self.storage.create_message(message).await?;
                    if let Some(variable) = receipt_variable {
                        ctx.execution.bindings.insert(variable, receipt);
                    }
                    if !self.step_to(&mut ctx, next).await? {
                        return self.complete(ctx).await;
                    }
                }

                StepAction::SetVariable { variable, value, next } => {
                    let value = interpolate(&value, &ctx.execution.bindings);
                    ctx.execution.bindings.insert(variable, value);
                    if !self.step_to(&mut ctx, next).await? {
                        return self.complete(ctx).await;
                    }
                }

                StepAction::Delay { seconds, next } => {
                    let Some(next_id) = next else {
                        return self.complete(ctx).await;
                    };
                    // Cursor moves before the timer is armed; the continuation
                    // re-enters advance at the step after the delay.
                    ctx.execution.current_step_id = next_id;
                    ctx.execution.last_advanced_at = Utc::now();
                    self.storage.update_execution(&ctx.execution).await?;

                    self.schedule_continuation(ctx, seconds);
                    return Ok(());
                }

                StepAction::Branch { arms, default_next } => {
                    let target = arms
                        .iter()
                        .find(|arm| arm.predicate.evaluate(&ctx.execution.bindings))
                        .map(|arm| arm.next.clone())
                        .or(default_next);
                    if !self.step_to(&mut ctx, target).await? {
                        return self.complete(ctx).await;
                    }
                }

                StepAction::WaitForReply { timeout_minutes, .. } => {
                    let timeout = Duration::minutes(
                        timeout_minutes.unwrap_or(self.config.default_reply_timeout_minutes),
                    );
                    let now = Utc::now();

                    ctx.execution.current_step_id = step.id.clone();
                    ctx.execution.status = ExecutionStatus::Waiting;
                    ctx.execution.resume_deadline = Some(now + timeout);
                    ctx.execution.last_advanced_at = now;

                    self.pending
                        .put(PendingExecution {
                            execution_id: ctx.execution.id,
                            automation_id: ctx.execution.automation_id,
                            automation_version: ctx.execution.automation_version,
                            conversation_id: ctx.conversation.id,
                            channel_id: ctx.channel.id,
                            contact_id: ctx.execution.contact_id,
                            waiting_step_id: step.id,
                            bindings: ctx.execution.bindings.clone(),
                            paused_at: now,
                            resume_deadline: now + timeout,
                        })
                        .await?;
                    self.storage.update_execution(&ctx.execution).await?;

                    info!(
                        execution_id = %ctx.execution.id,
                        conversation_id = %ctx.conversation.id,
                        "execution paused waiting for reply"
                    );
                    return Ok(());
                }

                StepAction::End => {
                    return self.complete(ctx).await;
                }
            }
        }
    }

    /// Timer-driven continuation for delay steps: a spawned task sleeps and
    /// re-enters `advance`, so the caller's webhook path returns immediately
    /// and no worker blocks on the delay.
    fn schedule_continuation(self: &Arc<Self>, ctx: StepContext, seconds: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            if let Err(e) = engine.advance(ctx).await {
                error!("delayed automation continuation failed: {}", e);
            }
        });
    }

    /// Move the cursor to `next`. Returns false when there is no next step,
    /// which the caller treats as completion.
    async fn step_to(&self, ctx: &mut StepContext, next: Option<String>) -> StorageResult<bool> {
        let Some(next_id) = next else {
            return Ok(false);
        };
        ctx.execution.current_step_id = next_id;
        ctx.execution.last_advanced_at = Utc::now();
        self.storage.update_execution(&ctx.execution).await?;
        Ok(true)
    }

    async fn complete(&self, mut ctx: StepContext) -> StorageResult<()> {
        ctx.execution.status = ExecutionStatus::Completed;
        ctx.execution.resume_deadline = None;
        ctx.execution.last_advanced_at = Utc::now();
        self.pending.remove(ctx.conversation.id).await?;
        self.storage.update_execution(&ctx.execution).await?;
        info!(
            execution_id = %ctx.execution.id,
            conversation_id = %ctx.conversation.id,
            "automation execution completed"
        );
        Ok(())
    }

    /// Terminal failure: the error is published to the notification sink and
    /// never thrown back into the webhook-handling call path.
    async fn fail(&self, mut ctx: StepContext, message: String) -> StorageResult<()> {
        warn!(
            execution_id = %ctx.execution.id,
            conversation_id = %ctx.conversation.id,
            "automation execution failed: {}",
            message
        );
        ctx.execution.status = ExecutionStatus::Failed;
        ctx.execution.error = Some(message.clone());
        ctx.execution.resume_deadline = None;
        ctx.execution.last_advanced_at = Utc::now();
        self.pending.remove(ctx.conversation.id).await?;
        self.storage.update_execution(&ctx.execution).await?;
        self.notifier
            .publish(NotificationEvent::AutomationError {
                conversation_id: ctx.conversation.id,
                message,
            })
            .await;
        Ok(())
    }

    /// A pending entry whose execution can no longer be resumed (definition
    /// vanished, graph inconsistent). The entry has already been taken.
    async fn abandon(&self, pending: &PendingExecution, reason: &str) -> StorageResult<()> {
        warn!(
            execution_id = %pending.execution_id,
            conversation_id = %pending.conversation_id,
            "abandoning pending execution: {}",
            reason
        );
        if let Some(mut execution) = self.storage.get_execution(pending.execution_id).await? {
            if !execution.status.is_terminal() {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(reason.to_string());
                execution.resume_deadline = None;
                execution.last_advanced_at = Utc::now();
                self.storage.update_execution(&execution).await?;
            }
        }
        self.notifier
            .publish(NotificationEvent::AutomationError {
                conversation_id: pending.conversation_id,
                message: reason.to_string(),
            })
            .await;
        Ok(())
    }
}

fn rebuild_from_pending(pending: &PendingExecution) -> Execution {
    Execution {
        id: pending.execution_id,
        automation_id: pending.automation_id,
        automation_version: pending.automation_version,
        conversation_id: pending.conversation_id,
        channel_id: pending.channel_id,
        contact_id: pending.contact_id,
        current_step_id: pending.waiting_step_id.clone(),
        bindings: pending.bindings.clone(),
        status: ExecutionStatus::Waiting,
        error: None,
        created_at: pending.paused_at,
        last_advanced_at: pending.paused_at,
        resume_deadline: Some(pending.resume_deadline),
    }
}

/// Replace `{{name}}` placeholders with bound values; unknown names are left
/// in place so a typo is visible in the delivered text instead of silently
/// vanishing.
pub fn interpolate(template: &str, bindings: &HashMap<String, String>) -> String {
    let re = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
    re.replace_all(template, |caps: &regex::Captures| {
        bindings
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}
