use crate::player::PlayerId;

pub const DEFAULT_PREFIX: &str = "warpnet:";

/// Builds every shared key/channel name under a sanitized prefix.
///
/// The prefix always ends with exactly one `:`; an empty or whitespace
/// prefix falls back to [`DEFAULT_PREFIX`].
#[derive(Debug, Clone)]
pub struct Keys {
    p: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        let mut base = prefix.trim().to_string();
        if base.is_empty() {
            base = DEFAULT_PREFIX.to_string();
        }
        while base.ends_with("::") {
            base.pop();
        }
        if !base.ends_with(':') {
            base.push(':');
        }
        Self { p: base }
    }

    pub fn prefix(&self) -> &str {
        &self.p
    }

    /// Pub/sub topic for compute requests.
    pub fn compute_channel(&self) -> String {
        format!("{}compute", self.p)
    }

    pub fn resp(&self, request_id: &str) -> String {
        format!("{}resp:{}", self.p, request_id)
    }

    pub fn pending(&self, player: PlayerId) -> String {
        format!("{}pending:{}", self.p, player)
    }

    pub fn cooldown(&self, player: PlayerId) -> String {
        format!("{}cooldown:{}", self.p, player)
    }

    pub fn presence(&self, player: PlayerId) -> String {
        format!("{}presence:{}", self.p, player)
    }

    /// Cross-backend source-of-truth respawn point (bed/anchor).
    pub fn spawn(&self, player: PlayerId) -> String {
        format!("{}spawn:{}", self.p, player)
    }
}
