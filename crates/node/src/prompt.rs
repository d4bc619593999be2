//! Prompt assembly under the context-budget policy.
//!
//! A task's prompt is the encoded system text followed by the rendered
//! dialogue. When the dialogue exceeds the remaining budget only its
//! suffix survives: oldest turns are dropped first, deterministically.

use genloop_common::config::PromptFormat;
use genloop_common::{NodeError, Result};
use genloop_proto::ChatMessage;

use crate::tokenizer::TokenizerService;

/// Encode cap for the raw dialogue before budget truncation applies.
const DIALOGUE_ENCODE_CAP: usize = 60_000;

/// Builds token-id prompts for admitted tasks.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    format: PromptFormat,
    context_limit: usize,
    reserved_margin: usize,
}

impl PromptBuilder {
    pub fn new(format: PromptFormat, context_limit: usize, reserved_margin: usize) -> Self {
        Self {
            format,
            context_limit,
            reserved_margin,
        }
    }

    /// Build the full prompt for a task, or refuse admission.
    ///
    /// The dialogue budget is what remains of the context window after the
    /// reserved margin, the generation budget, and the system prompt. A
    /// negative budget or an empty result refuses the task.
    pub fn build(
        &self,
        tokenizer: &dyn TokenizerService,
        system: &str,
        messages: &[ChatMessage],
        max_new_tokens: usize,
    ) -> Result<Vec<u32>> {
        let system_ids = tokenizer.encode(&format!("{system}\n\n"), self.context_limit, false)?;

        let budget = self.context_limit as i64
            - self.reserved_margin as i64
            - max_new_tokens as i64
            - system_ids.len() as i64;
        if budget < 0 {
            return Err(NodeError::admission(format!(
                "system prompt and generation budget leave no room in a {}-token context",
                self.context_limit
            )));
        }
        let prompt_max_len = budget as usize;

        let mut dialogue_ids = match self.format {
            PromptFormat::Plain => self.plain_dialogue(tokenizer, messages)?,
            PromptFormat::Tagged => {
                tokenizer.encode(&tagged_dialogue(messages), DIALOGUE_ENCODE_CAP, false)?
            }
        };

        // Keep only the most recent turns when over budget.
        if dialogue_ids.len() > prompt_max_len {
            dialogue_ids.drain(..dialogue_ids.len() - prompt_max_len);
        }

        let mut ids = system_ids;
        ids.extend(dialogue_ids);
        if ids.is_empty() {
            return Err(NodeError::admission("prompt is empty"));
        }
        Ok(ids)
    }

    /// `Role: content` lines. Completed assistant turns are closed with an
    /// end-of-sequence token; a trailing `Assistant:` cue invites the next
    /// turn unless the dialogue already ends mid-assistant-turn.
    fn plain_dialogue(
        &self,
        tokenizer: &dyn TokenizerService,
        messages: &[ChatMessage],
    ) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let mut text = String::new();
        for (i, m) in messages.iter().enumerate() {
            let role = role_label(&m.role);
            text.push_str(&format!("{role}: {}\n", m.content));
            if role == "Assistant" {
                text.push('\n');
                if i + 1 != messages.len() {
                    ids.extend(tokenizer.encode(&text, DIALOGUE_ENCODE_CAP, false)?);
                    ids.push(tokenizer.eos_id());
                    text.clear();
                }
            }
        }
        if !ends_with_assistant(messages) {
            text.push_str("Assistant:");
        }
        if !text.is_empty() {
            ids.extend(tokenizer.encode(&text, DIALOGUE_ENCODE_CAP, false)?);
        }
        Ok(ids)
    }
}

/// `<|role|>...<|says|>...<|end|>` turns. The final assistant turn, when
/// last, stays open as the generation target; otherwise a cue invites one.
fn tagged_dialogue(messages: &[ChatMessage]) -> String {
    let mut text = String::new();
    for (i, m) in messages.iter().enumerate() {
        let role = role_label(&m.role).to_lowercase();
        let open_target = i + 1 == messages.len() && role == "assistant";
        if open_target {
            text.push_str(&format!("<|role|>{role}<|says|>{}", m.content));
        } else {
            text.push_str(&format!("<|role|>{role}<|says|>{}<|end|>\n", m.content));
        }
    }
    if !ends_with_assistant(messages) {
        text.push_str("<|role|>assistant<|says|>");
    }
    text
}

/// Case-insensitive role match; anything unrecognized is a user turn.
fn role_label(role: &str) -> &'static str {
    if role.eq_ignore_ascii_case("assistant") {
        "Assistant"
    } else {
        "User"
    }
}

fn ends_with_assistant(messages: &[ChatMessage]) -> bool {
    messages
        .last()
        .map_or(false, |m| m.role.eq_ignore_ascii_case("assistant"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ByteTokenizer;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_plain_format_renders_roles_and_cue() {
        let builder = PromptBuilder::new(PromptFormat::Plain, 2048, 50);
        let tok = ByteTokenizer;
        let ids = builder
            .build(&tok, "sys", &[msg("user", "hi")], 16)
            .unwrap();
        let text = tok.decode(&ids).unwrap();
        assert_eq!(text, "sys\n\nUser: hi\nAssistant:");
    }

    #[test]
    fn test_plain_format_closes_completed_assistant_turns() {
        let builder = PromptBuilder::new(PromptFormat::Plain, 2048, 50);
        let tok = ByteTokenizer;
        let ids = builder
            .build(
                &tok,
                "s",
                &[msg("user", "a"), msg("assistant", "b"), msg("user", "c")],
                16,
            )
            .unwrap();
        // The completed assistant turn carries the end-of-sequence id.
        assert!(ids.contains(&tok.eos_id()));
        let text = tok.decode(&ids).unwrap();
        assert!(text.contains("User: a\nAssistant: b\n\n"));
        assert!(text.ends_with("User: c\nAssistant:"));
    }

    #[test]
    fn test_plain_format_no_cue_after_open_assistant_turn() {
        let builder = PromptBuilder::new(PromptFormat::Plain, 2048, 50);
        let tok = ByteTokenizer;
        let ids = builder
            .build(&tok, "s", &[msg("user", "a"), msg("assistant", "b")], 16)
            .unwrap();
        let text = tok.decode(&ids).unwrap();
        assert!(!text.ends_with("Assistant:"));
        // The open assistant turn is the generation target, not a closed
        // turn, so no end-of-sequence id is appended.
        assert!(!ids.contains(&tok.eos_id()));
    }

    #[test]
    fn test_tagged_format_renders_tags() {
        let builder = PromptBuilder::new(PromptFormat::Tagged, 2048, 50);
        let tok = ByteTokenizer;
        let ids = builder
            .build(&tok, "sys", &[msg("user", "hi")], 16)
            .unwrap();
        let text = tok.decode(&ids).unwrap();
        assert_eq!(
            text,
            "sys\n\n<|role|>user<|says|>hi<|end|>\n<|role|>assistant<|says|>"
        );
    }

    #[test]
    fn test_unknown_role_defaults_to_user() {
        assert_eq!(role_label("tool"), "User");
        assert_eq!(role_label("ASSISTANT"), "Assistant");
    }

    #[test]
    fn test_budget_overflow_rejects_task() {
        let builder = PromptBuilder::new(PromptFormat::Plain, 64, 50);
        let tok = ByteTokenizer;
        // 64 - 50 margin - 32 budget < 0 even before the system prompt.
        let err = builder.build(&tok, "x", &[msg("user", "hi")], 32);
        assert!(matches!(err, Err(NodeError::Admission(_))));
    }

    #[test]
    fn test_truncation_keeps_exact_suffix() {
        let builder = PromptBuilder::new(PromptFormat::Plain, 64, 4);
        let tok = ByteTokenizer;
        // System "\n\n" is 2 ids; budget = 64 - 4 - 10 - 2 = 48.
        let long = "m".repeat(200);
        let ids = builder.build(&tok, "", &[msg("user", &long)], 10).unwrap();
        assert_eq!(ids.len(), 2 + 48);

        // The retained dialogue must be exactly the last 48 tokens of the
        // untruncated rendering.
        let full = {
            let roomy = PromptBuilder::new(PromptFormat::Plain, 4096, 4);
            roomy.build(&tok, "", &[msg("user", &long)], 10).unwrap()
        };
        assert_eq!(&ids[2..], &full[full.len() - 48..]);
    }
}
