//! Control-channel wire protocol helpers.
//!
//! Frames are UTF-8 text, whitespace-tokenized; the first token names the
//! command. Most commands carry `name=value` pairs.

use crate::error::{KitError, Result};

/// Maximum payload length echoed into log lines before elision.
const ABBREV_LEN: usize = 128;

/// Split a message into whitespace-delimited tokens.
pub fn tokenize(message: &str) -> Vec<&str> {
    message.split_whitespace().collect()
}

/// First whitespace-delimited token of a message.
pub fn first_token(message: &str) -> &str {
    message.split_whitespace().next().unwrap_or("")
}

/// Split a token of the form `name<sep>value` into its two halves.
///
/// Used both for `name=value` pairs and for the `child-<id>` command prefix.
pub fn parse_name_value(token: &str, sep: char) -> Option<(&str, &str)> {
    let idx = token.find(sep)?;
    Some((&token[..idx], &token[idx + 1..]))
}

/// Look up the string value of `name=` among the tokens.
pub fn get_token_string<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens.iter().find_map(|tok| {
        parse_name_value(tok, '=').and_then(|(n, v)| (n == name).then_some(v))
    })
}

/// Look up the integer value of `name=` among the tokens.
pub fn get_token_int(tokens: &[&str], name: &str) -> Option<i32> {
    get_token_string(tokens, name).and_then(|v| v.parse().ok())
}

/// Look up a comma-separated integer list `name=<i1,i2,...>` among the tokens.
pub fn get_token_int_list(tokens: &[&str], name: &str) -> Option<Vec<i32>> {
    let raw = get_token_string(tokens, name)?;
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

/// Decode a URL-encoded string.
pub fn url_decode(encoded: &str) -> Result<String> {
    urlencoding::decode(encoded)
        .map(|cow| cow.into_owned())
        .map_err(|e| KitError::Protocol(format!("invalid url-encoding: {e}")))
}

/// URL-encode a string.
pub fn url_encode(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Truncate a message for logging so tile payloads do not flood the log.
///
/// Only the first line is kept, elided at a fixed width.
pub fn abbreviate(message: &str) -> String {
    let line = message.lines().next().unwrap_or("");
    if line.len() <= ABBREV_LEN && line.len() == message.len() {
        return line.to_string();
    }
    let cut = line
        .char_indices()
        .take_while(|(i, _)| *i < ABBREV_LEN)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    format!("{}...", &line[..cut])
}
