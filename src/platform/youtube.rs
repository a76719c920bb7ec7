//! YouTube author rules.

/// Author roles YouTube expresses through badge titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeRole {
    Owner,
    Moderator,
    Member,
}

/// Symbols allowed in a sanitized author name besides alphanumerics.
const ALLOWED_SYMBOLS: [char; 4] = ['_', '-', '.', '·'];

/// Strip every character that is neither alphanumeric nor an allowed symbol.
pub fn sanitize_author(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || ALLOWED_SYMBOLS.contains(c))
        .collect()
}

/// Role named by a badge title, matched case-insensitively as a substring.
pub fn badge_role(title: &str) -> Option<BadgeRole> {
    let title = title.to_lowercase();
    if title.contains("owner") {
        Some(BadgeRole::Owner)
    } else if title.contains("moderator") {
        Some(BadgeRole::Moderator)
    } else if title.contains("member") {
        Some(BadgeRole::Member)
    } else {
        None
    }
}
