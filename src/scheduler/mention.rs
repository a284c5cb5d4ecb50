//! 提及（@）解析
//!
//! 一条消息提及的角色包括：消息显式携带的 target_personas，以及正文中出现的
//! `@handle`、`@name`、或不带 @ 的 handle / 名字（大小写不敏感）。
//! 英文名要求词边界，中文名直接包含即可。结果按首次出现顺序去重，发言者不会提及自己。

use crate::memory::Message;
use crate::persona::{PersonaId, PersonaRoster};

/// 解析消息中提及的角色 handle
pub fn extract_mentions(message: &Message, roster: &PersonaRoster) -> Vec<PersonaId> {
    let mut found: Vec<(usize, PersonaId)> = Vec::new();

    for target in &message.target_personas {
        if let Some(p) = roster
            .personas
            .iter()
            .find(|p| p.handle.eq_ignore_ascii_case(target) || p.name == *target)
        {
            found.push((0, p.handle.clone()));
        }
    }

    let text = message.content.to_lowercase();
    for persona in &roster.personas {
        if persona.handle == message.speaker {
            continue;
        }
        let first = [persona.handle.as_str(), persona.name.as_str()]
            .into_iter()
            .filter(|alias| !alias.trim().is_empty())
            .filter_map(|alias| first_occurrence(&text, &alias.to_lowercase()))
            .min();
        if let Some(pos) = first {
            // 显式目标排在最前
            found.push((pos + 1, persona.handle.clone()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut out: Vec<PersonaId> = Vec::new();
    for (_, handle) in found {
        if handle != message.speaker && !out.contains(&handle) {
            out.push(handle);
        }
    }
    out
}

/// alias 在 text 中首次作为独立词（或 @alias）出现的位置
fn first_occurrence(text: &str, alias: &str) -> Option<usize> {
    let cjk = alias.chars().any(|c| !c.is_ascii());
    text.match_indices(alias)
        .find(|(start, _)| {
            if cjk {
                return true;
            }
            let before = text[..*start].chars().next_back();
            let after = text[start + alias.len()..].chars().next();
            let left_ok = before.map_or(true, |c| c == '@' || !is_word_char(c));
            let right_ok = after.map_or(true, |c| !is_word_char(c));
            left_ok && right_ok
        })
        .map(|(start, _)| {
            // 带 @ 的位置从 @ 算起
            if start > 0 && text[..start].ends_with('@') {
                start - 1
            } else {
                start
            }
        })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    fn roster() -> PersonaRoster {
        PersonaRoster::new(vec![
            Persona::new("alice", "Alice"),
            Persona::new("bob", "Bobby"),
            Persona::new("laoshi", "老师"),
        ])
    }

    #[test]
    fn test_handle_and_name_mentions_in_order() {
        let msg = Message::user("user", "Bobby what do you think? @ALICE too");
        assert_eq!(extract_mentions(&msg, &roster()), vec!["bob", "alice"]);
    }

    #[test]
    fn test_requires_word_boundary_for_ascii() {
        let msg = Message::user("user", "alicent and bobcat are not here");
        assert!(extract_mentions(&msg, &roster()).is_empty());
    }

    #[test]
    fn test_cjk_name_and_explicit_targets() {
        let msg = Message::user("user", "请老师讲讲").with_targets(vec!["bob".into()]);
        assert_eq!(extract_mentions(&msg, &roster()), vec!["bob", "laoshi"]);
    }

    #[test]
    fn test_speaker_does_not_mention_self() {
        let msg = Message::assistant("alice", "I'm alice, and @bob should answer");
        assert_eq!(extract_mentions(&msg, &roster()), vec!["bob"]);
    }
}
