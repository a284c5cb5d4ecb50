//! Prompt 组装：角色设定 + 群聊规则 + 附加说明 + 按记忆窗口截取的历史

use crate::llm::{ChatRole, ChatTurn, Prompt};
use crate::memory::{window, Role};
use crate::persona::{Persona, PersonaRoster};
use crate::scheduler::TurnContext;

pub fn build_prompt(
    persona: &Persona,
    roster: &PersonaRoster,
    ctx: &TurnContext,
    notes: &[String],
) -> Prompt {
    let mut system = persona.system_prompt();
    if !system.is_empty() {
        system.push_str("\n\n");
    }

    let others: Vec<String> = roster
        .personas
        .iter()
        .filter(|p| p.handle != persona.handle)
        .map(|p| format!("{}(@{})", p.name, p.handle))
        .collect();
    system.push_str(&format!(
        "你是群聊中的 {}(@{})。只以自己的身份发言，不要替其他人说话，不要在开头重复自己的名字。",
        persona.name, persona.handle
    ));
    if !others.is_empty() {
        system.push_str(&format!("\n群里的其他成员：{}。", others.join("、")));
    }
    for note in notes {
        system.push_str("\n\n");
        system.push_str(note);
    }

    let turns = window::slice_ref(&ctx.history, persona.memory_window)
        .iter()
        .map(|m| match m.role {
            Role::System => ChatTurn::new(ChatRole::System, m.content.clone()),
            _ if m.speaker == persona.handle => {
                ChatTurn::named(ChatRole::Assistant, &m.speaker, m.content.clone())
            }
            _ => ChatTurn::named(ChatRole::User, &m.speaker, m.transcript_line()),
        })
        .collect();

    Prompt {
        persona: persona.handle.clone(),
        system,
        turns,
    }
}
