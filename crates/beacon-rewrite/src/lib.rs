//! Rewrites an html body to embed open and click tracking.
//!
//! This is textual rather than DOM-aware: it uses substring search and
//! pattern matching so that markup we don't care about passes through
//! byte-for-byte, even when it is malformed. The known limitations are
//! that unquoted href values are not rewritten, and that html entities
//! inside an href are carried through literally rather than decoded.
use beacon_types::urls::{click_tracking_url, open_tracking_url};
use beacon_types::MessageId;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

static CLOSING_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</body\s*>").expect("valid closing body regex"));

/// Matches an anchor tag that has a quoted href attribute.
///
/// * 1: tag start through to the `=` (and any whitespace) before the quote
/// * 2: a double-quoted value
/// * 3: a single-quoted value
/// * 4: everything after the closing quote through to the end of the tag
static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(<a\s(?:[^>]*?\s)?href\s*=\s*)(?:"([^"]*)"|'([^']*)')([^>]*>)"#)
        .expect("valid anchor regex")
});

/// Only absolute web links are tracked; mailto:, tel:, relative
/// and fragment links are left alone.
fn is_trackable(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

/// Produce the invisible 1x1 image that serves as the open beacon
pub fn beacon_tag(beacon_url: &str) -> String {
    format!(
        "<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\" \
         style=\"display:none;width:1px;height:1px;border:0;\" />",
        beacon_url.replace('"', "&quot;")
    )
}

/// Insert the beacon immediately before the first closing body tag,
/// or append it when there is no closing body tag.
///
/// This is not idempotent: each call adds another beacon.
pub fn inject_pixel(html: &str, beacon_url: &str) -> String {
    let tag = beacon_tag(beacon_url);
    match CLOSING_BODY.find(html) {
        Some(body_end) => {
            let mut result = String::with_capacity(html.len() + tag.len());
            result.push_str(&html[..body_end.start()]);
            result.push_str(&tag);
            result.push_str(&html[body_end.start()..]);
            result
        }
        None => format!("{html}{tag}"),
    }
}

/// Replace the href of every anchor that points at an http or https
/// url with the click tracking redirect for that url.
/// Anchors with any other kind of href are returned byte-identical.
pub fn rewrite_links<'a>(html: &'a str, message_id: &MessageId, base_url: &str) -> Cow<'a, str> {
    ANCHOR_HREF.replace_all(html, |caps: &Captures| {
        let (quote, value) = match caps.get(2) {
            Some(value) => ('"', value.as_str()),
            None => ('\'', caps.get(3).map_or("", |value| value.as_str())),
        };

        let value = if is_trackable(value) {
            Cow::Owned(click_tracking_url(base_url, message_id, value))
        } else {
            Cow::Borrowed(value)
        };

        format!("{}{quote}{value}{quote}{}", &caps[1], &caps[4])
    })
}

/// Apply both transformations: the beacon first, then the links.
/// The beacon is an image without an href, so link rewriting
/// leaves it untouched.
pub fn rewrite_html(html: &str, message_id: &MessageId, base_url: &str) -> String {
    let with_beacon = inject_pixel(html, &open_tracking_url(base_url, message_id));
    rewrite_links(&with_beacon, message_id, base_url).into_owned()
}
