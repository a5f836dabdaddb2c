use crate::source::{SourceData, SourceSystem};

/// Why a message is being sent for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    New,
    Updated,
    Random,
}

/// Render the outbound text for an item.
pub fn render(item: &SourceData, kind: MessageKind) -> String {
    let lead = match (kind, item.source_system) {
        (MessageKind::Random, _) => "ICYMI:",
        (_, SourceSystem::Engagement) => "Speaking at",
        (MessageKind::Updated, _) => "Updated:",
        (MessageKind::New, SourceSystem::Video) => "New video:",
        (MessageKind::New, _) => "New post:",
    };

    let mut out = format!("{lead} {} {}", item.title.trim(), item.link());
    let hashtags = hashtags(item);
    if !hashtags.is_empty() {
        out.push(' ');
        out.push_str(&hashtags.join(" "));
    }
    out
}

fn hashtags(item: &SourceData) -> Vec<String> {
    item.tags
        .iter()
        .map(|tag| tag.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|tag| !tag.is_empty())
        .map(|tag| format!("#{tag}"))
        .collect()
}
