use crate::core::config::settings::PromptTemplateKind;
use crate::history::{Message, Role};

impl PromptTemplateKind {
    /// Marker the model emits when its turn is over.
    pub fn end_marker(&self) -> &'static str {
        match self {
            PromptTemplateKind::Chatml => "<|im_end|>",
            PromptTemplateKind::Gemma => "<end_of_turn>",
        }
    }

    /// Renders the messages and opens an assistant turn.
    pub fn render(&self, messages: &[Message]) -> String {
        match self {
            PromptTemplateKind::Chatml => render_chatml(messages),
            PromptTemplateKind::Gemma => render_gemma(messages),
        }
    }
}

fn render_chatml(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(&message.role.to_string());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

// Gemma has no system role; the system text is folded into the first user turn.
fn render_gemma(messages: &[Message]) -> String {
    let mut prompt = String::new();
    let mut pending_system: Vec<&str> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => pending_system.push(&message.content),
            Role::User => {
                prompt.push_str("<start_of_turn>user\n");
                for system in pending_system.drain(..) {
                    prompt.push_str(system);
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&message.content);
                prompt.push_str("<end_of_turn>\n");
            }
            Role::Assistant => {
                prompt.push_str("<start_of_turn>model\n");
                prompt.push_str(&message.content);
                prompt.push_str("<end_of_turn>\n");
            }
        }
    }
    prompt.push_str("<start_of_turn>model\n");
    prompt
}
