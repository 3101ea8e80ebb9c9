/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render a username mention (`@name`), escaped for HTML.
pub fn mention(username: &str) -> String {
    escape_html(&format!("@{}", username.trim_start_matches('@')))
}
