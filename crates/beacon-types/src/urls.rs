//! Builders for the tracking service urls.
//!
//! All urls take the form `{base_url}{path}{message_id}`; any trailing
//! `/` on the base url is ignored so that the paths join cleanly.
use crate::MessageId;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};

pub const OPEN_TRACKING_PATH: &str = "/track-open/";
pub const CLICK_TRACKING_PATH: &str = "/track-click/";
pub const DELIVERY_TRACKING_PATH: &str = "/track-delivery/";

/// Everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`, which matches
/// ECMAScript's `encodeURIComponent`.
pub const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Applied to the message id so that it stays within a single
/// path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn tracking_url(base_url: &str, path: &str, message_id: &MessageId) -> String {
    format!(
        "{}{path}{}",
        base_url.trim_end_matches('/'),
        utf8_percent_encode(message_id.as_str(), PATH_SEGMENT)
    )
}

/// Percent-encode a complete url so that it can be carried as
/// a single query parameter value
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URL_COMPONENT).to_string()
}

/// The source of the open-tracking beacon image
pub fn open_tracking_url(base_url: &str, message_id: &MessageId) -> String {
    tracking_url(base_url, OPEN_TRACKING_PATH, message_id)
}

/// The redirect url that replaces `destination` in a rewritten link
pub fn click_tracking_url(base_url: &str, message_id: &MessageId, destination: &str) -> String {
    format!(
        "{}?url={}",
        tracking_url(base_url, CLICK_TRACKING_PATH, message_id),
        encode_component(destination)
    )
}

/// Where delivery events are POSTed
pub fn delivery_tracking_url(base_url: &str, message_id: &MessageId) -> String {
    tracking_url(base_url, DELIVERY_TRACKING_PATH, message_id)
}
