//! Per-agent turn budget.
//!
//! An agent may chain at most `turn_limit` model calls in reply to other
//! agents. Human or system input resets the count before the response
//! decision, so a human message always gets a fresh budget.

use chrono::Utc;

use crate::agent::Agent;
use crate::types::Sender;

/// Turn budget for one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnCounter {
    limit: u32,
}

impl TurnCounter {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// True when the agent used up its budget and the trigger is another agent.
    pub fn should_throttle(&self, agent: &Agent, sender: &Sender) -> bool {
        matches!(sender, Sender::Agent(_)) && agent.llm_call_count >= self.limit
    }

    /// Count one completed model call.
    pub fn record_call(&self, agent: &mut Agent) {
        agent.llm_call_count = agent.llm_call_count.saturating_add(1);
        agent.last_call_at = Some(Utc::now());
    }

    /// Reset the budget on human or system input. Idempotent.
    ///
    /// Returns true when something was reset.
    pub fn reset_on_external_input(&self, agent: &mut Agent, sender: &Sender) -> bool {
        if !sender.is_external() {
            return false;
        }
        let changed = agent.llm_call_count != 0 || agent.limit_notice_sent;
        agent.llm_call_count = 0;
        agent.limit_notice_sent = false;
        changed
    }

    /// Claim the single turn-limit notice of the current chain.
    pub(crate) fn claim_notice(&self, agent: &mut Agent) -> bool {
        if agent.limit_notice_sent {
            return false;
        }
        agent.limit_notice_sent = true;
        true
    }

    /// Text of the turn-limit notice.
    pub fn notice_text(&self, agent: &Agent) -> String {
        format!(
            "@human {} reached the turn limit ({} model calls) and is waiting for a human or system message.",
            agent.name, self.limit
        )
    }
}
