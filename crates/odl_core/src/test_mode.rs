//! Sticky, cookie-backed test mode

use crate::cookie::{CookieJar, CookieOptions};
use tracing::info;

/// Cookie and query parameter name toggling test mode
pub const TEST_MODE_COOKIE: &str = "__odltest__";

/// How long an opt-in sticks, in seconds
pub const TEST_MODE_MAX_AGE: u64 = 3600 * 24 * 7;

/// Value of the test-mode flag in a query string, if present
fn query_flag(query: &str) -> Option<String> {
    let query = query.trim_start_matches('?');
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TEST_MODE_COOKIE)
        .map(|(_, value)| value.into_owned())
}

/// Decide whether test mode is active, persisting opt-in and opt-out.
///
/// An existing cookie keeps test mode on unless the query carries `=0`, in
/// which case the cookie is removed. Without a cookie, `=1` sets it for
/// seven days on path `/`.
pub fn detect_test_mode(cookies: &dyn CookieJar, query: &str) -> bool {
    let flag = query_flag(query);
    let has_cookie = cookies
        .get(TEST_MODE_COOKIE)
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    if has_cookie {
        if flag.as_deref() == Some("0") {
            cookies.remove(TEST_MODE_COOKIE);
            info!("🧪 Test mode deactivated");
            return false;
        }
        return true;
    }

    if flag.as_deref() == Some("1") {
        let options = CookieOptions::default()
            .with_path("/")
            .with_max_age(TEST_MODE_MAX_AGE);
        cookies.set(TEST_MODE_COOKIE, "1", &options);
        info!("🧪 Test mode activated");
        return true;
    }

    false
}
