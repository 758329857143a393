//! Agent message pipeline.
//!
//! One task per agent:
//!
//! ```text
//! Idle → Saving → Deciding → (Responding | Skipped) → Idle
//! ```
//!
//! - **Saving**: every message not authored by the agent goes into memory,
//!   whether or not the agent responds.
//! - **Deciding**: [`crate::decision::decide`].
//! - **Responding**: prompt from the memory window, streamed completion,
//!   post-processing, memory append, turn count, republish.
//!
//! A failed model call publishes an `error` stream event and leaves memory
//! and the turn count alone. It never affects other agents.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentStatus, ModelConfig};
use crate::types::{AgentId, Message, MessageId, Role, Sender};
use crate::decision::{decide, Decision};
use crate::events::WorldMessage;
use crate::mention::{address_reply, strip_leading_self_mentions};
use crate::streaming::StreamingCoordinator;
use crate::traits::llm::LlmMessage;
use crate::turn::TurnCounter;
use crate::world::WorldInner;

/// Handle kept by the world for each running pipeline.
///
/// Every pipeline owns an unbounded inbox, so a slow agent falls behind but
/// never loses a message.
pub(crate) struct PipelineHandle {
    inbox: mpsc::UnboundedSender<WorldMessage>,
    leave: oneshot::Sender<()>,
}

impl PipelineHandle {
    /// Queue a message. False when the pipeline already stopped.
    pub(crate) fn deliver(&self, message: WorldMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    /// Stop the pipeline after its current cycle.
    pub(crate) fn leave(self) {
        let _ = self.leave.send(());
    }
}

/// Start the pipeline task for `agent_id`.
///
/// Every delivered message was counted once in the world's activity tracker;
/// the pipeline settles each one after processing it, or when it leaves.
pub(crate) fn spawn(world: Weak<WorldInner>, agent_id: AgentId) -> PipelineHandle {
    let (inbox, mut receiver) = mpsc::unbounded_channel::<WorldMessage>();
    let (leave_tx, mut leave_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = &mut leave_rx => {
                    // Deliveries counted for us but never processed.
                    receiver.close();
                    let mut dropped = 0;
                    while receiver.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if let Some(world) = world.upgrade() {
                        world.activity.dec(dropped);
                    }
                    debug!(agent_id = %agent_id, dropped, "pipeline stopped");
                    break;
                }

                received = receiver.recv() => {
                    let Some(message) = received else {
                        break;
                    };
                    let Some(world) = world.upgrade() else {
                        break;
                    };

                    process_message(&world, &agent_id, message).await;
                    world.bump_cycle();
                    world.activity.dec(1);
                }
            }
        }
    });

    PipelineHandle {
        inbox,
        leave: leave_tx,
    }
}

/// What a responding agent needs once the state lock is released.
struct ResponsePlan {
    agent_name: String,
    config: ModelConfig,
    prompt: Vec<LlmMessage>,
    /// Chat swap counter when the prompt was built.
    chat_epoch: u64,
}

/// Outcome of the Saving and Deciding steps.
enum Next {
    Respond(ResponsePlan),
    /// Publish the turn-limit notice as the agent.
    Notify(String),
    Idle,
}

/// One Saving → Deciding → Responding cycle.
pub(crate) async fn process_message(world: &Arc<WorldInner>, agent_id: &str, message: WorldMessage) {
    let sender = message.sender_kind();

    let next = {
        let mut state = world.lock_state();
        let turns = TurnCounter::new(state.turn_limit);
        let chat_epoch = state.chat_epoch;
        let Some(agent) = state.agents.get_mut(agent_id) else {
            return;
        };

        if sender.agent_id() != Some(agent_id) {
            agent.memory.push(Message::inbound(&message));
        }

        match decide(agent, &message, &turns) {
            Decision::Respond => Next::Respond(ResponsePlan {
                agent_name: agent.name.clone(),
                config: agent.config.clone(),
                prompt: build_prompt(agent, world.settings.memory_window),
                chat_epoch,
            }),
            Decision::Throttled { notify } => {
                debug!(
                    world_id = %world.id,
                    agent_id = %agent_id,
                    message_id = %message.id,
                    notify,
                    "turn limit reached"
                );
                if notify {
                    Next::Notify(turns.notice_text(agent))
                } else {
                    Next::Idle
                }
            }
            Decision::Skip(reason) => {
                debug!(
                    world_id = %world.id,
                    agent_id = %agent_id,
                    message_id = %message.id,
                    reason = ?reason,
                    "not responding"
                );
                Next::Idle
            }
        }
    };

    let plan = match next {
        Next::Respond(plan) => plan,
        Next::Notify(notice) => {
            world.dispatch(WorldMessage::new(world.id.clone(), notice, agent_id));
            return;
        }
        Next::Idle => return,
    };

    let message_id = MessageId::new();
    let coordinator = StreamingCoordinator::new(world.bus.clone(), world.provider.clone());
    let result = coordinator
        .run(agent_id, &plan.config, &plan.prompt, message_id)
        .await;

    match result {
        Ok(completion) => {
            let reply = finish_reply(
                &completion.content,
                agent_id,
                &plan.agent_name,
                &sender,
                &world.settings.pass_token,
            );

            let outgoing = {
                let mut state = world.lock_state();
                let turns = TurnCounter::new(state.turn_limit);
                let swapped = state.chat_epoch != plan.chat_epoch;
                let Some(agent) = state.agents.get_mut(agent_id) else {
                    return;
                };
                turns.record_call(agent);
                agent.status = AgentStatus::Active;

                match reply {
                    // The trigger belongs to a chat that is no longer active.
                    Some(_) if swapped => {
                        info!(
                            world_id = %world.id,
                            agent_id = %agent_id,
                            message_id = %message_id,
                            "chat switched during the model call, reply dropped"
                        );
                        None
                    }
                    Some(reply) => {
                        agent
                            .memory
                            .push(Message::assistant(message_id, reply.remembered, agent_id));
                        if reply.passed {
                            info!(world_id = %world.id, agent_id = %agent_id, "agent passed control back");
                        }
                        Some(reply.published)
                    }
                    None => {
                        warn!(world_id = %world.id, agent_id = %agent_id, "model returned an empty reply");
                        None
                    }
                }
            };

            if let Some(content) = outgoing {
                world.dispatch(
                    WorldMessage::new(world.id.clone(), content, agent_id).with_id(message_id),
                );
            }
        }
        Err(e) => {
            warn!(
                world_id = %world.id,
                agent_id = %agent_id,
                message_id = %message_id,
                error = %e,
                "model call failed"
            );
            let mut state = world.lock_state();
            let turns = TurnCounter::new(state.turn_limit);
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.status = AgentStatus::Error;
                if world.settings.count_failed_calls {
                    turns.record_call(agent);
                }
            }
        }
    }
}

/// Prompt for `agent`: system prompt, then the last `window` memory entries.
///
/// Entries from others become user turns prefixed with their sender; the
/// agent's own entries become assistant turns.
pub fn build_prompt(agent: &Agent, window: usize) -> Vec<LlmMessage> {
    let mut prompt = Vec::with_capacity(window.min(agent.memory.len()) + 1);

    if let Some(system) = agent.config.system_prompt.as_deref() {
        if !system.trim().is_empty() {
            prompt.push(LlmMessage::system(system));
        }
    }

    let start = agent.memory.len().saturating_sub(window);
    for entry in &agent.memory[start..] {
        prompt.push(match entry.role {
            Role::Assistant => LlmMessage::assistant(entry.content.clone()),
            Role::User => LlmMessage::user(format!("{}: {}", entry.sender, entry.content)),
        });
    }

    prompt
}

/// Post-processed model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedReply {
    /// Text appended to the agent's memory.
    pub remembered: String,
    /// Text published on the bus.
    pub published: String,
    /// The agent handed control back with the pass token.
    pub passed: bool,
}

/// Apply pass-token detection and mention post-processing.
///
/// Returns `None` for an empty reply.
pub fn finish_reply(
    raw: &str,
    agent_id: &str,
    agent_name: &str,
    trigger: &Sender,
    pass_token: &str,
) -> Option<FinishedReply> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.eq_ignore_ascii_case(pass_token.trim()) {
        return Some(FinishedReply {
            remembered: raw.to_string(),
            published: format!("@human {} is passing control back to you.", agent_name),
            passed: true,
        });
    }

    let mut text = strip_leading_self_mentions(trimmed, agent_id);
    if *trigger != Sender::Human {
        text = address_reply(&text, trigger.as_str());
    }

    Some(FinishedReply {
        remembered: text.clone(),
        published: text,
        passed: false,
    })
}
