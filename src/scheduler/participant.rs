//! 会话参与者：角色在某个会话中的可变状态
//!
//! 只由所属会话的编排器在串行轮次处理中修改。
//! 状态流转：Idle -> Selected -> Speaking -> Cooldown -> Idle。

use serde::Serialize;

use crate::persona::PersonaId;

/// 参与者阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantPhase {
    Idle,
    Selected,
    Speaking,
    Cooldown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionParticipant {
    pub handle: PersonaId,
    /// 剩余冷却轮数，永不为负
    pub cooldown_counter: u32,
    pub last_spoke_turn_index: Option<u64>,
    phase: ParticipantPhase,
}

impl SessionParticipant {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            cooldown_counter: 0,
            last_spoke_turn_index: None,
            phase: ParticipantPhase::Idle,
        }
    }

    pub fn with_cooldown(mut self, counter: u32) -> Self {
        self.cooldown_counter = counter;
        if counter > 0 {
            self.phase = ParticipantPhase::Cooldown;
        }
        self
    }

    pub fn phase(&self) -> ParticipantPhase {
        self.phase
    }

    /// 正在本轮发言中（被选中或正在生成）
    pub fn is_mid_turn(&self) -> bool {
        matches!(
            self.phase,
            ParticipantPhase::Selected | ParticipantPhase::Speaking
        )
    }

    pub fn is_cooling(&self) -> bool {
        self.cooldown_counter > 0
    }

    /// Idle/Cooldown -> Selected
    pub fn select(&mut self) -> bool {
        match self.phase {
            ParticipantPhase::Idle | ParticipantPhase::Cooldown => {
                self.phase = ParticipantPhase::Selected;
                true
            }
            _ => false,
        }
    }

    /// Selected -> Speaking
    pub fn begin_speaking(&mut self, turn_index: u64) -> bool {
        if self.phase != ParticipantPhase::Selected {
            return false;
        }
        self.phase = ParticipantPhase::Speaking;
        self.last_spoke_turn_index = Some(turn_index);
        true
    }

    /// Speaking -> Cooldown（cooldown_turns 为 0 时直接回到 Idle）
    pub fn finish_speaking(&mut self, cooldown_turns: u32) {
        if self.phase != ParticipantPhase::Speaking {
            return;
        }
        self.cooldown_counter = cooldown_turns;
        self.phase = if cooldown_turns > 0 {
            ParticipantPhase::Cooldown
        } else {
            ParticipantPhase::Idle
        };
    }

    /// 被选中但没开口（stop 跳过）：退回选中前的阶段
    pub fn release(&mut self) {
        if self.phase == ParticipantPhase::Selected {
            self.phase = if self.cooldown_counter > 0 {
                ParticipantPhase::Cooldown
            } else {
                ParticipantPhase::Idle
            };
        }
    }

    /// 本轮未发言：冷却计数减一（下限 0）
    pub fn tick(&mut self) {
        self.cooldown_counter = self.cooldown_counter.saturating_sub(1);
        if self.cooldown_counter == 0 && self.phase == ParticipantPhase::Cooldown {
            self.phase = ParticipantPhase::Idle;
        }
    }
}
