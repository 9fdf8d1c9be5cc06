//! Cookie model and `Set-Cookie` serialization.
//!
//! Both engine adapters serialize cookies through [`Cookie::to_set_cookie`],
//! so the emitted header bytes are identical regardless of the engine.
//! Clearing a cookie preserves the original Path/Domain/SameSite attributes
//! and emits the fixed epoch `Expires` value clients expect.

use std::fmt;
use std::time::SystemTime;

// =============================================================================
// SameSite
// =============================================================================

/// The `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None`
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => f.write_str("Strict"),
            SameSite::Lax => f.write_str("Lax"),
            SameSite::None => f.write_str("None"),
        }
    }
}

// =============================================================================
// Cookie
// =============================================================================

/// The `Expires` value emitted when clearing a cookie.
const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// A response cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// `Path` attribute.
    pub path: Option<String>,
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Max-Age` attribute, in seconds. Negative values expire the cookie.
    pub max_age: Option<i64>,
    /// `Expires` attribute.
    pub expires: Option<SystemTime>,
    /// `Secure` attribute.
    pub secure: bool,
    /// `HttpOnly` attribute.
    pub http_only: bool,
    /// `SameSite` attribute.
    pub same_site: Option<SameSite>,
    /// Forces the epoch `Expires` value, set by [`Cookie::clearing`].
    cleared: bool,
}

impl Cookie {
    /// Creates a cookie with only a name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
            cleared: false,
        }
    }

    /// Sets the `Path` attribute.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the `Domain` attribute.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Sets the `Max-Age` attribute in seconds.
    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Sets the `Expires` attribute.
    pub fn with_expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    /// Sets the `Secure` attribute.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the `HttpOnly` attribute.
    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Sets the `SameSite` attribute.
    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Builds the cookie that clears `original` on the client.
    ///
    /// The value is emptied, `Max-Age` is forced to `-1`, `Expires` to the
    /// Unix epoch, and the original Path/Domain/SameSite attributes are
    /// preserved so the browser matches the cookie being replaced.
    pub fn clearing(original: &Cookie) -> Self {
        Self {
            name: original.name.clone(),
            value: String::new(),
            path: original.path.clone(),
            domain: original.domain.clone(),
            max_age: Some(-1),
            expires: Some(SystemTime::UNIX_EPOCH),
            secure: original.secure,
            http_only: original.http_only,
            same_site: original.same_site,
            cleared: true,
        }
    }

    /// Serializes this cookie as a `Set-Cookie` header value.
    ///
    /// Attribute order is fixed (Path, Domain, Max-Age, Expires, Secure,
    /// HttpOnly, SameSite) so both adapters emit identical bytes.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            if self.cleared || expires == SystemTime::UNIX_EPOCH {
                out.push_str(EPOCH_EXPIRES);
            } else {
                out.push_str(&httpdate::fmt_http_date(expires));
            }
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(&same_site.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_all_attributes_in_fixed_order() {
        let cookie = Cookie::new("session", "abc123")
            .with_path("/app")
            .with_domain("example.com")
            .with_max_age(3600)
            .with_secure(true)
            .with_http_only(true)
            .with_same_site(SameSite::Lax);
        assert_eq!(
            cookie.to_set_cookie(),
            "session=abc123; Path=/app; Domain=example.com; Max-Age=3600; Secure; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn clearing_preserves_scope_attributes() {
        let original = Cookie::new("session", "abc123")
            .with_path("/app")
            .with_domain("example.com")
            .with_same_site(SameSite::Strict);
        let cleared = Cookie::clearing(&original);
        assert_eq!(
            cleared.to_set_cookie(),
            "session=; Path=/app; Domain=example.com; Max-Age=-1; \
             Expires=Thu, 01 Jan 1970 00:00:00 GMT; SameSite=Strict"
        );
    }

    #[test]
    fn minimal_cookie_has_no_attributes() {
        assert_eq!(Cookie::new("k", "v").to_set_cookie(), "k=v");
    }
}
