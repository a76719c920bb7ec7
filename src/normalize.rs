use crate::config::NormalizerConfig;
use crate::platform::youtube::{self, BadgeRole};
use crate::platform::{twitch, CanonicalMessage, Platform, RawMessage};

/// Colours assigned to YouTube authors.
#[derive(Debug, Clone)]
pub struct Palette {
    pub default: String,
    pub owner: String,
    pub moderator: String,
    pub member: String,
}

impl Palette {
    fn for_role(&self, role: BadgeRole) -> &str {
        match role {
            BadgeRole::Owner => &self.owner,
            BadgeRole::Moderator => &self.moderator,
            BadgeRole::Member => &self.member,
        }
    }
}

/// Turns raw platform records into canonical messages. Holds only settings.
#[derive(Debug, Clone)]
pub struct Normalizer {
    palette: Palette,
    sanitize_twitch_authors: bool,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            palette: Palette {
                default: config.default_colour.clone(),
                owner: config.owner_colour.clone(),
                moderator: config.moderator_colour.clone(),
                member: config.member_colour.clone(),
            },
            sanitize_twitch_authors: config.sanitize_twitch_authors,
        }
    }

    pub fn normalize(&self, raw: RawMessage) -> CanonicalMessage {
        let platform = Platform::detect(&raw);

        let author = match platform {
            Platform::Twitch if self.sanitize_twitch_authors => {
                youtube::sanitize_author(twitch::author_name(&raw.author))
            }
            Platform::Twitch => twitch::author_name(&raw.author).to_string(),
            Platform::YouTube => {
                youtube::sanitize_author(raw.author.name.as_deref().unwrap_or_default())
            }
        };

        let colour = match (platform, &raw.colour) {
            (Platform::Twitch, Some(colour)) => colour.clone(),
            _ => self.youtube_colour(&raw),
        };

        CanonicalMessage {
            message: raw.text,
            author,
            emotes: raw.emotes.unwrap_or_default(),
            badges: raw.author.badges.unwrap_or_default(),
            colour,
        }
    }

    /// Later matching badges override earlier ones.
    fn youtube_colour(&self, raw: &RawMessage) -> String {
        raw.author
            .badge_titles()
            .filter_map(youtube::badge_role)
            .last()
            .map(|role| self.palette.for_role(role))
            .unwrap_or(self.palette.default.as_str())
            .to_string()
    }
}
