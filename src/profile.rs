use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Per-installation identity, stored next to the updater binary.
pub const PROFILE_FILE_NAME: &str = "updater-profile.conf";

pub const CHANNEL_STABLE: &str = "stable";

pub const ID_HEADER: &str = "X-profile-identity";
pub const CHANNEL_HEADER: &str = "X-profile-channel";
pub const TIMEZONE_HEADER: &str = "X-profile-timezone";

const MAX_ID_LEN: usize = 256;
const MAX_CHANNEL_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile Id or Channel format is invalid")]
    Invalid,
    #[error("{0}")]
    Io(String),
    #[error("invalid profile JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub channel: String,
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9|-]+$").unwrap())
}

fn channel_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]+$").unwrap())
}

impl Profile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !id_pattern().is_match(&self.id)
            || !channel_pattern().is_match(&self.channel)
            || self.id.len() > MAX_ID_LEN
            || self.channel.len() > MAX_CHANNEL_LEN
        {
            return Err(ProfileError::Invalid);
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Profile, ProfileError> {
        let data = std::fs::read(dir.join(PROFILE_FILE_NAME))
            .map_err(|e| ProfileError::Io(e.to_string()))?;
        let profile: Profile =
            serde_json::from_slice(&data).map_err(|e| ProfileError::Json(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn save(&self, dir: &Path) -> Result<(), ProfileError> {
        self.validate()?;
        let data = serde_json::to_vec(self).map_err(|e| ProfileError::Json(e.to_string()))?;
        std::fs::write(dir.join(PROFILE_FILE_NAME), data)
            .map_err(|e| ProfileError::Io(e.to_string()))
    }
}

pub fn random_id() -> String {
    rand::thread_rng().gen_range(0..u64::MAX).to_string()
}

pub fn set_random_id(dir: &Path) -> Result<(), ProfileError> {
    Profile {
        id: random_id(),
        channel: CHANNEL_STABLE.to_string(),
    }
    .save(dir)
}

pub fn set_id(dir: &Path, id: &str) -> Result<(), ProfileError> {
    let mut profile = Profile::load(dir).unwrap_or_else(|_| Profile {
        id: String::new(),
        channel: CHANNEL_STABLE.to_string(),
    });
    profile.id = id.to_string();
    profile.save(dir)
}

pub fn set_channel(dir: &Path, channel: &str) -> Result<(), ProfileError> {
    let mut profile = Profile::load(dir).unwrap_or_else(|_| Profile {
        id: random_id(),
        channel: String::new(),
    });
    profile.channel = channel.to_string();
    profile.save(dir)
}

/// Headers attached to update requests. The timezone gives the server a
/// broad geo hint; identity and channel are included only when a valid
/// profile is present (load failures are non-fatal).
pub fn request_headers(dir: &Path) -> Vec<(String, String)> {
    let mut headers = vec![(
        TIMEZONE_HEADER.to_string(),
        chrono::Local::now().format("%Z").to_string(),
    )];

    if let Ok(profile) = Profile::load(dir) {
        if !profile.id.is_empty() {
            headers.push((ID_HEADER.to_string(), profile.id));
        }
        if !profile.channel.is_empty() {
            headers.push((CHANNEL_HEADER.to_string(), profile.channel));
        }
    }

    headers
}
