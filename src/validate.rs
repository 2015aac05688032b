use crate::message::Message;

// ---------------------------------------------------------------------------
// MessageValidator
// ---------------------------------------------------------------------------

/// User-content gate applied before broadcast.
///
/// Server-generated messages (system, join, leave) bypass every rule. The
/// returned reason string is sent back to the sender verbatim.
pub struct MessageValidator {
    pub min_length: usize,
    /// UTF-8 code points, not bytes.
    pub max_length: usize,
    pub allow_emojis: bool,
    pub allow_urls: bool,
    /// Case-insensitive blocked substrings.
    pub blocked_words: Vec<String>,
}

impl MessageValidator {
    pub fn new(min_length: usize, max_length: usize) -> Self {
        Self {
            min_length,
            max_length,
            allow_emojis: true,
            allow_urls: false,
            blocked_words: Vec::new(),
        }
    }

    pub fn with_urls_allowed(mut self, allowed: bool) -> Self {
        self.allow_urls = allowed;
        self
    }

    pub fn with_emojis_allowed(mut self, allowed: bool) -> Self {
        self.allow_emojis = allowed;
        self
    }

    pub fn with_blocked_words(mut self, words: Vec<String>) -> Self {
        self.blocked_words = words.into_iter().map(|w| w.to_lowercase()).collect();
        self
    }

    /// Validate; `Err` carries the rejection reason shown to the sender.
    pub fn validate(&self, message: &Message) -> Result<(), String> {
        if message.message_type.is_server_generated() {
            return Ok(());
        }

        let length = message.content.chars().count();
        if length < self.min_length {
            return Err(format!(
                "Message is too short (minimum {} characters).",
                self.min_length
            ));
        }
        if length > self.max_length {
            return Err(format!(
                "Message is too long (maximum {} characters).",
                self.max_length
            ));
        }

        if !self.allow_emojis && message.content.chars().any(is_emoji) {
            return Err("Emojis are not allowed in this room.".to_string());
        }

        let lowered = message.content.to_lowercase();
        if !self.allow_urls && (lowered.contains("http://") || lowered.contains("https://")) {
            return Err("Links are not allowed in this room.".to_string());
        }

        for word in &self.blocked_words {
            if lowered.contains(word) {
                return Err("Message contains blocked content.".to_string());
            }
        }

        Ok(())
    }
}

/// Rough emoji detection over the common Unicode emoji blocks.
fn is_emoji(c: char) -> bool {
    matches!(c,
        '\u{1F300}'..='\u{1FAFF}'   // pictographs, emoticons, symbols
        | '\u{2600}'..='\u{27BF}'   // misc symbols + dingbats
        | '\u{FE0F}'                // variation selector
        | '\u{1F1E6}'..='\u{1F1FF}' // regional indicators
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn text(content: &str) -> Message {
        let mut msg = Message::system("r1", content);
        msg.message_type = MessageType::Text;
        msg
    }

    #[test]
    fn length_bounds_count_code_points() {
        let v = MessageValidator::new(2, 5);
        assert!(v.validate(&text("hi")).is_ok());
        assert!(v.validate(&text("héllo")).is_ok());
        assert!(v.validate(&text("x")).is_err());
        assert!(v.validate(&text("toolong")).is_err());

        // Five multi-byte code points are within a 5-char limit.
        assert!(v.validate(&text("ねこねこね")).is_ok());
    }

    #[test]
    fn url_detection_is_case_insensitive() {
        let v = MessageValidator::new(1, 500);
        assert!(v.validate(&text("see HTTPS://example.com")).is_err());
        assert!(v.validate(&text("see http://example.com")).is_err());
        assert!(v.validate(&text("no links here")).is_ok());

        let permissive = MessageValidator::new(1, 500).with_urls_allowed(true);
        assert!(permissive.validate(&text("https://example.com")).is_ok());
    }

    #[test]
    fn blocked_words_match_substrings_case_insensitively() {
        let v = MessageValidator::new(1, 500)
            .with_blocked_words(vec!["Spoiler".to_string()]);
        assert!(v.validate(&text("big SPOILER ahead")).is_err());
        assert!(v.validate(&text("spoilers!!")).is_err());
        assert!(v.validate(&text("nothing to see")).is_ok());
    }

    #[test]
    fn emoji_gate() {
        let strict = MessageValidator::new(1, 500).with_emojis_allowed(false);
        assert!(strict.validate(&text("nice stream 🔥")).is_err());
        assert!(strict.validate(&text("nice stream")).is_ok());

        let relaxed = MessageValidator::new(1, 500);
        assert!(relaxed.validate(&text("nice stream 🔥")).is_ok());
    }

    #[test]
    fn server_messages_bypass_validation() {
        let v = MessageValidator::new(10, 20).with_urls_allowed(false);
        // Too short AND contains a URL, but system messages pass.
        let msg = Message::system("r1", "http://x");
        assert!(v.validate(&msg).is_ok());

        let join = Message::join("r1", "u1", "a", 1);
        assert!(v.validate(&join).is_ok());
    }

    #[test]
    fn rejection_reason_is_specific() {
        let v = MessageValidator::new(1, 5);
        let reason = v.validate(&text("toolong")).unwrap_err();
        assert!(reason.contains("maximum 5"));
    }
}
