//! 发言人选择
//!
//! score = α·proactivity + β·relevance − γ·cooldown_penalty + δ·mention_bonus
//!
//! 选择规则：
//! - 本轮已在发言中（Selected / Speaking）的角色不参与打分
//! - 配置非法的角色记一条 SchedulerSkip 后排除，调度器本身不返回错误
//! - 上限 N = 有效候选中最小的正 max_agents_per_turn；全部为 -1 时不限
//! - 被提及的角色先占位（按提及顺序），再按分数降序、注册顺序填充过线（≥ 阈值）的角色
//! - 无人过线时冷却惩罚减半重试一次，仍为空则本轮无人发言

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SchedulerSection;
use crate::core::SchedulerSkip;
use crate::memory::{window, Message};
use crate::persona::{Persona, PersonaId, PersonaRoster};
use crate::scheduler::participant::SessionParticipant;
use crate::scheduler::relevance::{KeywordOverlapScorer, RelevanceScorer};

/// 一个轮次的输入
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    /// 会话内单调递增
    pub turn_index: u64,
    /// 触发本轮的消息（用户消息或上一轮某角色的回复）
    pub trigger: Message,
    /// 被提及的角色 handle，按提及顺序
    pub mentioned: Vec<PersonaId>,
    /// 历史快照（已包含 trigger），长度按最宽的角色窗口截取
    pub history: Vec<Message>,
}

impl TurnContext {
    pub fn is_mentioned(&self, handle: &str) -> bool {
        self.mentioned.iter().any(|m| m == handle)
    }
}

/// 单个候选的得分明细（每轮重算，不持久化）
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub persona: PersonaId,
    pub total: f64,
    pub proactivity: f64,
    pub relevance: f64,
    pub cooldown_penalty: f64,
    pub mention_bonus: f64,
}

/// 选择结果
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// 发言顺序
    pub ordered: Vec<PersonaId>,
    /// 最后一次打分的全部候选（按分数排序）
    pub scored: Vec<ScoredCandidate>,
    pub skipped: Vec<SchedulerSkip>,
    /// 是否触发了冷场重试
    pub cold_room_retry: bool,
    /// 生效的上限（None 表示不限）
    pub cap: Option<usize>,
}

/// 发言人调度器
#[derive(Clone)]
pub struct TurnScheduler {
    weights: SchedulerSection,
    relevance: Arc<dyn RelevanceScorer>,
}

struct Candidate<'a> {
    order: usize,
    persona: &'a Persona,
    cooling: bool,
}

impl TurnScheduler {
    pub fn new(weights: SchedulerSection) -> Self {
        Self {
            weights,
            relevance: Arc::new(KeywordOverlapScorer::default()),
        }
    }

    pub fn with_relevance(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.relevance = scorer;
        self
    }

    pub fn weights(&self) -> &SchedulerSection {
        &self.weights
    }

    /// 选出本轮发言的角色，按发言顺序
    pub fn select(
        &self,
        ctx: &TurnContext,
        participants: &[SessionParticipant],
        roster: &PersonaRoster,
    ) -> Vec<PersonaId> {
        self.select_detailed(ctx, participants, roster).ordered
    }

    /// 带打分明细的选择
    pub fn select_detailed(
        &self,
        ctx: &TurnContext,
        participants: &[SessionParticipant],
        roster: &PersonaRoster,
    ) -> Selection {
        let mut selection = Selection::default();
        let candidates = self.collect_candidates(participants, roster, &mut selection.skipped);
        for skip in &selection.skipped {
            warn!(session = %ctx.session_id, turn = ctx.turn_index, "{}", skip);
        }

        selection.cap = effective_cap(&candidates);

        let (ordered, scored, cleared) = self.rank(ctx, &candidates, selection.cap, 1.0);
        selection.ordered = ordered;
        selection.scored = scored;

        if cleared == 0 && selection.ordered.is_empty() && self.weights.cold_room_retry {
            debug!(session = %ctx.session_id, turn = ctx.turn_index, "cold room, retrying with halved cooldown penalty");
            let (ordered, scored, _) = self.rank(ctx, &candidates, selection.cap, 0.5);
            selection.ordered = ordered;
            selection.scored = scored;
            selection.cold_room_retry = true;
        }

        info!(
            session = %ctx.session_id,
            turn = ctx.turn_index,
            selected = ?selection.ordered,
            cap = ?selection.cap,
            "speakers selected"
        );
        selection
    }

    fn collect_candidates<'a>(
        &self,
        participants: &[SessionParticipant],
        roster: &'a PersonaRoster,
        skipped: &mut Vec<SchedulerSkip>,
    ) -> Vec<Candidate<'a>> {
        for p in participants {
            if roster.get(&p.handle).is_none() {
                skipped.push(SchedulerSkip::new(&p.handle, "missing persona config"));
            }
        }

        let mut candidates = Vec::new();
        for (order, persona) in roster.personas.iter().enumerate() {
            if let Err(reason) = persona.validate() {
                skipped.push(SchedulerSkip::new(&persona.handle, reason));
                continue;
            }
            let participant = participants.iter().find(|p| p.handle == persona.handle);
            if participant.map_or(false, SessionParticipant::is_mid_turn) {
                continue;
            }
            candidates.push(Candidate {
                order,
                persona,
                cooling: participant.map_or(false, SessionParticipant::is_cooling),
            });
        }
        candidates
    }

    /// 返回 (发言顺序, 打分明细, 过线人数)
    fn rank(
        &self,
        ctx: &TurnContext,
        candidates: &[Candidate<'_>],
        cap: Option<usize>,
        penalty_factor: f64,
    ) -> (Vec<PersonaId>, Vec<ScoredCandidate>, usize) {
        let w = &self.weights;
        let mut scored: Vec<(usize, ScoredCandidate)> = candidates
            .iter()
            .map(|c| {
                let history = window::slice_ref(&ctx.history, c.persona.memory_window);
                let relevance = self.relevance.score(history, c.persona).clamp(0.0, 1.0);
                let cooldown_penalty = if c.cooling {
                    w.cooldown_penalty * penalty_factor
                } else {
                    0.0
                };
                let mention_bonus = if ctx.is_mentioned(&c.persona.handle) {
                    w.mention_bonus
                } else {
                    0.0
                };
                let total = w.proactivity_weight * c.persona.proactivity
                    + w.relevance_weight * relevance
                    - w.cooldown_weight * cooldown_penalty
                    + w.mention_weight * mention_bonus;
                (
                    c.order,
                    ScoredCandidate {
                        persona: c.persona.handle.clone(),
                        total,
                        proactivity: c.persona.proactivity,
                        relevance,
                        cooldown_penalty,
                        mention_bonus,
                    },
                )
            })
            .collect();

        scored.sort_by(|(ao, a), (bo, b)| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ao.cmp(bo))
        });
        for (_, c) in &scored {
            debug!(
                persona = %c.persona,
                total = c.total,
                relevance = c.relevance,
                cooldown = c.cooldown_penalty,
                mention = c.mention_bonus,
                "candidate scored"
            );
        }

        let limit = cap.unwrap_or(usize::MAX);
        let mut ordered: Vec<PersonaId> = Vec::new();

        for handle in &ctx.mentioned {
            if ordered.len() >= limit {
                break;
            }
            if scored.iter().any(|(_, c)| &c.persona == handle) && !ordered.contains(handle) {
                ordered.push(handle.clone());
            }
        }

        let cleared: Vec<&ScoredCandidate> = scored
            .iter()
            .map(|(_, c)| c)
            .filter(|c| c.total >= w.activation_threshold)
            .collect();
        for c in &cleared {
            if ordered.len() >= limit {
                break;
            }
            if !ordered.contains(&c.persona) {
                ordered.push(c.persona.clone());
            }
        }

        let cleared_count = cleared.len();
        (
            ordered,
            scored.into_iter().map(|(_, c)| c).collect(),
            cleared_count,
        )
    }
}

/// 有效候选中最小的正上限
fn effective_cap(candidates: &[Candidate<'_>]) -> Option<usize> {
    candidates
        .iter()
        .filter(|c| c.persona.max_agents_per_turn > 0)
        .map(|c| c.persona.max_agents_per_turn as usize)
        .min()
}
