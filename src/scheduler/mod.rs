//! 轮次调度：参与者状态、提及解析、相关度、发言人选择

pub mod mention;
pub mod participant;
pub mod relevance;
pub mod selector;

use crate::persona::PersonaRoster;

pub use mention::extract_mentions;
pub use participant::{ParticipantPhase, SessionParticipant};
pub use relevance::{ConstantRelevance, KeywordOverlapScorer, RelevanceScorer};
pub use selector::{ScoredCandidate, Selection, TurnContext, TurnScheduler};

/// 按名册对齐参与者列表：新角色以 Idle 加入，已移除的角色丢弃，保留已有冷却状态
pub fn reconcile(participants: &mut Vec<SessionParticipant>, roster: &PersonaRoster) {
    let mut next = Vec::with_capacity(roster.personas.len());
    for handle in roster.handles() {
        match participants.iter().position(|p| p.handle == handle) {
            Some(idx) => next.push(participants.swap_remove(idx)),
            None => next.push(SessionParticipant::new(handle)),
        }
    }
    *participants = next;
}

/// 轮次结束后的冷却结算：开过口的角色冷却计数置为 cooldown_turns，其余减一
pub fn settle_cooldowns(participants: &mut [SessionParticipant], roster: &PersonaRoster) {
    for p in participants.iter_mut() {
        if p.phase() == ParticipantPhase::Speaking {
            let turns = roster.get(&p.handle).map_or(0, |persona| persona.cooldown_turns);
            p.finish_speaking(turns);
        } else {
            p.release();
            p.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    #[test]
    fn test_reconcile_keeps_state_and_follows_roster() {
        let mut parts = vec![
            SessionParticipant::new("b").with_cooldown(2),
            SessionParticipant::new("gone"),
        ];
        let roster = PersonaRoster::new(vec![Persona::new("a", "A"), Persona::new("b", "B")]);
        reconcile(&mut parts, &roster);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].handle, "a");
        assert_eq!(parts[1].cooldown_counter, 2);
    }

    #[test]
    fn test_settle_sets_speaker_cooldown_and_decrements_others() {
        let roster = PersonaRoster::new(vec![
            Persona::new("a", "A").with_cooldown(3),
            Persona::new("b", "B"),
            Persona::new("c", "C"),
        ]);
        let mut parts = vec![
            SessionParticipant::new("a").with_cooldown(1),
            SessionParticipant::new("b").with_cooldown(2),
            SessionParticipant::new("c"),
        ];
        parts[0].select();
        parts[0].begin_speaking(1);
        parts[2].select();

        settle_cooldowns(&mut parts, &roster);
        assert_eq!(parts[0].cooldown_counter, 3);
        assert_eq!(parts[1].cooldown_counter, 1);
        assert_eq!(parts[2].cooldown_counter, 0);
        assert_eq!(parts[2].phase(), ParticipantPhase::Idle);
    }
}
