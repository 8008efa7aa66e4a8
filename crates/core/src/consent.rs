use crate::{config::DEFAULT_CONSENT_COOKIE, page::Page};

pub const TRUTHY_TOKENS: [&str; 7] = ["1", "true", "yes", "y", "on", "accept", "granted"];

pub const ATTR_CONSENT_COOKIE: &str = "data-ll-consent-cookie";
pub const ATTR_ANALYTICS_ENABLED: &str = "data-ll-analytics-enabled";

pub fn is_truthy(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    TRUTHY_TOKENS.contains(&normalized.as_str())
}

/// Read one cookie out of a `document.cookie` style header. The value is
/// percent-decoded; undecodable values fall back to the raw text.
pub fn read_cookie(header: &str, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    header
        .split(';')
        .filter_map(|pair| pair.trim_start().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, raw)| match urlencoding::decode(raw) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => raw.to_string(),
        })
}

/// Consent decision for a page, taken once at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentGate {
    cookie_name: String,
    allowed: bool,
}

impl ConsentGate {
    pub fn from_page(page: &Page) -> Self {
        Self::evaluate(page, DEFAULT_CONSENT_COOKIE)
    }

    pub fn evaluate(page: &Page, default_cookie: &str) -> Self {
        let body = page.body();
        let cookie_name = body
            .attr(ATTR_CONSENT_COOKIE)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(default_cookie)
            .to_string();

        let enabled_by_markup = match body.attr_non_empty(ATTR_ANALYTICS_ENABLED) {
            Some(flag) => is_truthy(flag),
            None => true,
        };

        let allowed = enabled_by_markup
            && read_cookie(page.cookie_header(), &cookie_name)
                .map(|value| is_truthy(&value))
                .unwrap_or(false);

        tracing::debug!(cookie = %cookie_name, allowed, "consent evaluated");
        Self {
            cookie_name,
            allowed,
        }
    }

    pub fn is_analytics_allowed(&self) -> bool {
        self.allowed
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(cookie: &str) -> Page {
        Page::new("https://shop.test", "/").with_cookie(cookie)
    }

    #[test]
    fn truthy_tokens_are_case_and_space_insensitive() {
        for value in ["1", " TRUE ", "Yes", "y", "on", "Accept", "GRANTED"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "false", "no", "denied", "truthy"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn reads_and_decodes_cookie() {
        let header = "a=1; cookie_consent_marketing=%20granted; b=x";
        assert_eq!(
            read_cookie(header, "cookie_consent_marketing").as_deref(),
            Some(" granted")
        );
        assert_eq!(read_cookie(header, "missing"), None);
        assert_eq!(read_cookie(header, ""), None);
    }

    #[test]
    fn default_cookie_grants() {
        let gate = ConsentGate::from_page(&page("cookie_consent_marketing=accept"));
        assert!(gate.is_analytics_allowed());
        assert_eq!(gate.cookie_name(), DEFAULT_CONSENT_COOKIE);
    }

    #[test]
    fn missing_cookie_fails_closed() {
        assert!(!ConsentGate::from_page(&page("")).is_analytics_allowed());
        assert!(!ConsentGate::from_page(&page("other=1")).is_analytics_allowed());
    }

    #[test]
    fn custom_cookie_name_from_body() {
        let page = page("cookie_consent_marketing=1; my_consent=yes")
            .with_body_attr(ATTR_CONSENT_COOKIE, "my_consent");
        let gate = ConsentGate::from_page(&page);
        assert_eq!(gate.cookie_name(), "my_consent");
        assert!(gate.is_analytics_allowed());

        let page = Page::new("https://shop.test", "/")
            .with_cookie("cookie_consent_marketing=1")
            .with_body_attr(ATTR_CONSENT_COOKIE, "my_consent");
        assert!(!ConsentGate::from_page(&page).is_analytics_allowed());
    }

    #[test]
    fn markup_kill_switch_wins() {
        let page = page("cookie_consent_marketing=1").with_body_attr(ATTR_ANALYTICS_ENABLED, "0");
        assert!(!ConsentGate::from_page(&page).is_analytics_allowed());
    }
}
