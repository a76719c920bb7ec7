//! Twitch author rules.

use super::RawAuthor;

/// Twitch names are relayed verbatim from `display_name`, falling back to the login `name`.
pub fn author_name(author: &RawAuthor) -> &str {
    author
        .display_name
        .as_deref()
        .or(author.name.as_deref())
        .unwrap_or_default()
}
