//! Response decision: must this agent call its model for this message?
//!
//! Order of checks:
//!
//! 1. own message: skip (no self-trigger)
//! 2. classify the sender
//! 3. human/system input resets the turn budget
//! 4. inactive agents never respond
//! 5. agent sender and budget used up: throttled (notice the first time the
//!    agent is addressed in the chain)
//! 6. leading mentions present: respond only if this agent is the first one
//! 7. no leading mentions: respond only to human/system broadcasts
//!
//! A message counts as a broadcast only where it originates (human or
//! system). An agent's reply without an explicit mention never chains.

use tracing::debug;

use crate::agent::Agent;
use crate::types::Sender;
use crate::events::WorldMessage;
use crate::mention::extract_leading_mentions;
use crate::turn::TurnCounter;

/// Why an agent stays silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The agent published the message itself.
    OwnMessage,
    /// The agent is inactive.
    Inactive,
    /// The first leading mention names someone else.
    AddressedToOther(String),
    /// Another agent spoke without addressing anyone.
    AgentChatter,
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Respond,
    Skip(SkipReason),
    /// Turn budget used up. `notify` is true the first time the agent is
    /// addressed in a throttled chain, when the turn-limit notice must be
    /// published.
    Throttled { notify: bool },
}

impl Decision {
    pub fn should_respond(&self) -> bool {
        matches!(self, Decision::Respond)
    }
}

/// Decide whether `agent` responds to `message`.
///
/// Mutates the agent only through the turn counter: the reset on external
/// input and the one-shot notice flag. Both are idempotent for a message.
pub fn decide(agent: &mut Agent, message: &WorldMessage, turns: &TurnCounter) -> Decision {
    let sender = message.sender_kind();

    if sender.agent_id() == Some(agent.id.as_str()) {
        return Decision::Skip(SkipReason::OwnMessage);
    }

    if turns.reset_on_external_input(agent, &sender) {
        debug!(agent_id = %agent.id, sender = %sender, "turn budget reset");
    }

    if !agent.is_active() {
        return Decision::Skip(SkipReason::Inactive);
    }

    let mentions = extract_leading_mentions(&message.content);

    if turns.should_throttle(agent, &sender) {
        let addressed = mentions
            .first()
            .is_some_and(|first| first.eq_ignore_ascii_case(&agent.id));
        return Decision::Throttled {
            notify: addressed && turns.claim_notice(agent),
        };
    }

    if let Some(first) = mentions.first() {
        if first.eq_ignore_ascii_case(&agent.id) {
            return Decision::Respond;
        }
        return Decision::Skip(SkipReason::AddressedToOther(first.clone()));
    }

    match sender {
        Sender::Human | Sender::System => Decision::Respond,
        Sender::Agent(_) => Decision::Skip(SkipReason::AgentChatter),
    }
}

/// Boolean view of [`decide`].
pub fn should_respond(agent: &mut Agent, message: &WorldMessage, turns: &TurnCounter) -> bool {
    decide(agent, message, turns).should_respond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, ModelConfig};

    fn agent(name: &str) -> Agent {
        Agent::new(name, ModelConfig::default()).unwrap()
    }

    fn msg(content: &str, sender: &str) -> WorldMessage {
        WorldMessage::new("w1", content, sender)
    }

    #[test]
    fn test_own_message_skipped() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert_eq!(
            decide(&mut bob, &msg("@bob hi", "bob"), &turns),
            Decision::Skip(SkipReason::OwnMessage)
        );
    }

    #[test]
    fn test_human_broadcast_answered() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert!(should_respond(&mut bob, &msg("hello everyone", "human"), &turns));
        assert!(should_respond(&mut bob, &msg("maintenance at noon", "system"), &turns));
    }

    #[test]
    fn test_mid_line_mention_does_not_trigger() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert!(!should_respond(&mut bob, &msg("Hello @bob, how are you", "alice"), &turns));
    }

    #[test]
    fn test_leading_mention_triggers() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert!(should_respond(&mut bob, &msg("@bob hello", "alice"), &turns));
        assert!(should_respond(&mut bob, &msg("Notes first.\n@Bob hello", "alice"), &turns));
    }

    #[test]
    fn test_only_first_mention_responds() {
        let turns = TurnCounter::new(3);
        let message = msg("@alice and\n@bob please look", "human");

        let mut alice = agent("alice");
        let mut bob = agent("bob");
        assert_eq!(decide(&mut alice, &message, &turns), Decision::Respond);
        assert_eq!(
            decide(&mut bob, &message, &turns),
            Decision::Skip(SkipReason::AddressedToOther("alice".into()))
        );
    }

    #[test]
    fn test_human_message_addressed_to_other() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert!(!should_respond(&mut bob, &msg("@alice summarize", "human"), &turns));
    }

    #[test]
    fn test_agent_chatter_does_not_chain() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(3);
        assert_eq!(
            decide(&mut bob, &msg("here is the summary", "alice"), &turns),
            Decision::Skip(SkipReason::AgentChatter)
        );
    }

    #[test]
    fn test_throttle_notifies_once() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(1);
        turns.record_call(&mut bob);

        let ping = msg("@bob again", "alice");
        assert_eq!(decide(&mut bob, &ping, &turns), Decision::Throttled { notify: true });
        assert_eq!(decide(&mut bob, &ping, &turns), Decision::Throttled { notify: false });
    }

    #[test]
    fn test_unaddressed_throttle_keeps_notice() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(1);
        turns.record_call(&mut bob);

        let aside = msg("@human alice is waiting", "alice");
        assert_eq!(decide(&mut bob, &aside, &turns), Decision::Throttled { notify: false });

        let ping = msg("@bob again", "alice");
        assert_eq!(decide(&mut bob, &ping, &turns), Decision::Throttled { notify: true });
    }

    #[test]
    fn test_human_resets_before_deciding() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(1);
        turns.record_call(&mut bob);

        assert_eq!(decide(&mut bob, &msg("@bob go", "human"), &turns), Decision::Respond);
        assert_eq!(bob.llm_call_count, 0);
    }

    #[test]
    fn test_reset_happens_even_when_not_addressed() {
        let mut bob = agent("bob");
        let turns = TurnCounter::new(1);
        turns.record_call(&mut bob);

        assert!(!should_respond(&mut bob, &msg("@alice go", "human"), &turns));
        assert_eq!(bob.llm_call_count, 0);
    }

    #[test]
    fn test_inactive_agent_skipped() {
        let mut bob = agent("bob");
        bob.status = AgentStatus::Inactive;
        let turns = TurnCounter::new(3);
        assert_eq!(
            decide(&mut bob, &msg("@bob hi", "human"), &turns),
            Decision::Skip(SkipReason::Inactive)
        );
    }

    #[test]
    fn test_error_status_still_responds() {
        let mut bob = agent("bob");
        bob.status = AgentStatus::Error;
        let turns = TurnCounter::new(3);
        assert!(should_respond(&mut bob, &msg("@bob retry", "human"), &turns));
    }
}
