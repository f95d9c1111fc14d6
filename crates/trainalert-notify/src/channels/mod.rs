//! Built-in channel implementations and their plugins.

pub mod dingtalk;
pub mod email;
pub mod sms;
pub mod webhook;

use crate::utils::{truncate_string, MAX_BODY_LENGTH};

/// Reads a response body for the send record, truncated.
pub(crate) async fn read_body(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
        Err(e) => format!("[Failed to read response body: {e}]"),
    }
}
