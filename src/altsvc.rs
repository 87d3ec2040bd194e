//! Alt-Svc (RFC 7838) header parsing and the shared alternative-service cache.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use smol_str::SmolStr;

use crate::{origin::Scheme, Origin};

/// Protocols the engine can dial when following an alternative.
pub const SUPPORTED_PROTOCOLS: &[&str] = &["h2", "http/1.1"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcEntry {
    pub origin: Origin,
    pub alternative: Origin,
    /// ALPN id, e.g. `h2`, `h3`.
    pub protocol: SmolStr,
    pub params: HashMap<SmolStr, SmolStr>,
    /// `None` when the advertisement carried no `ma`.
    pub expires_at: Option<Instant>,
}

impl AltSvcEntry {
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }

    #[inline]
    pub fn is_supported(&self) -> bool {
        SUPPORTED_PROTOCOLS.contains(&self.protocol.as_str())
    }
}

/// Origin-keyed table of advertised alternatives.
///
/// One instance is created by the application and shared through `Arc` by
/// every pool and engine; a single lock guards the table and is held only
/// for the duration of one prune, insert or clear.
#[derive(Debug, Default)]
pub struct AltSvcCache {
    entries: Mutex<HashMap<Origin, Vec<AltSvcEntry>>>,
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `alt-svc` header value for `origin` and store its entries.
    /// Returns the entries that were stored; `clear` empties the origin and
    /// returns nothing.
    #[inline]
    pub fn parse_and_store(&self, origin: &Origin, header: &str) -> Vec<AltSvcEntry> {
        self.parse_and_store_at(origin, header, Instant::now())
    }

    pub fn parse_and_store_at(
        &self,
        origin: &Origin,
        header: &str,
        now: Instant,
    ) -> Vec<AltSvcEntry> {
        self.store_response_at(origin, &[header], now)
    }

    /// Store every `alt-svc` field of one response together. A `clear` in
    /// any of them empties the origin and drops the rest of the response's
    /// advertisements.
    #[inline]
    pub fn store_response(&self, origin: &Origin, headers: &[&str]) -> Vec<AltSvcEntry> {
        self.store_response_at(origin, headers, Instant::now())
    }

    pub fn store_response_at(
        &self,
        origin: &Origin,
        headers: &[&str],
        now: Instant,
    ) -> Vec<AltSvcEntry> {
        if headers.iter().any(|h| h.trim() == "clear") {
            self.clear(origin);
            return Vec::new();
        }
        let entries: Vec<_> = headers
            .iter()
            .flat_map(|h| parse_alt_svc(origin, h, now))
            .collect();
        for entry in entries.iter() {
            self.insert(entry.clone());
        }
        entries
    }

    /// Store `entry`, replacing any entry with the same alternative. Returns
    /// true when the alternative was not cached before.
    pub fn insert(&self, entry: AltSvcEntry) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let list = entries.entry(entry.origin.clone()).or_default();
        match list.iter_mut().find(|e| e.alternative == entry.alternative) {
            Some(existing) => {
                *existing = entry;
                false
            }
            None => {
                #[cfg(feature = "logging")]
                tracing::debug!(
                    "alt-svc cached {} -> {} ({})",
                    entry.origin,
                    entry.alternative,
                    entry.protocol
                );
                list.push(entry);
                true
            }
        }
    }

    #[inline]
    pub fn lookup(&self, origin: &Origin) -> Vec<AltSvcEntry> {
        self.lookup_at(origin, Instant::now())
    }

    /// Live entries for `origin`, pruning the expired ones.
    pub fn lookup_at(&self, origin: &Origin, now: Instant) -> Vec<AltSvcEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = entries.get_mut(origin) else {
            return Vec::new();
        };
        list.retain(|e| !e.is_expired_at(now));
        let live = list.clone();
        if list.is_empty() {
            entries.remove(origin);
        }
        live
    }

    pub fn clear(&self, origin: &Origin) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(origin).is_some() {
            #[cfg(feature = "logging")]
            tracing::debug!("alt-svc cleared for {origin}");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Parse an `alt-svc` value into entries for `origin`. Malformed
/// alternatives are skipped.
pub fn parse_alt_svc(origin: &Origin, header: &str, now: Instant) -> Vec<AltSvcEntry> {
    let mut entries = Vec::new();
    for alt in split_unquoted(header, ',') {
        let mut parts = split_unquoted(alt, ';').into_iter();
        let Some(main) = parts.next() else {
            continue;
        };
        let Some((protocol, value)) = main.split_once('=') else {
            continue;
        };
        let protocol = protocol.trim();
        if protocol.is_empty() {
            continue;
        }
        let protocol = percent_decode(protocol);
        let scheme = alternative_scheme(origin, &protocol);
        let Some(alternative) = parse_authority(origin, scheme, unquote(value.trim())) else {
            continue;
        };

        let mut params = HashMap::new();
        let mut expires_at = None;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = unquote(value.trim());
            if key == "ma" {
                if let Ok(secs) = value.parse::<u64>() {
                    expires_at = Some(now + Duration::from_secs(secs));
                }
            }
            params.insert(SmolStr::new(key), SmolStr::new(value));
        }

        entries.push(AltSvcEntry {
            origin: origin.clone(),
            alternative,
            protocol: SmolStr::new(protocol),
            params,
            expires_at,
        });
    }
    entries
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                out.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(s[start..].trim());
    out.retain(|p| !p.is_empty());
    out
}

#[inline]
fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// `h2` and `h3` only run over TLS; `h2c` and `http/1.1` keep the
/// origin's scheme.
fn alternative_scheme(origin: &Origin, protocol: &str) -> Scheme {
    match protocol {
        "h2c" | "http/1.1" => origin.scheme,
        _ => Scheme::Https,
    }
}

/// `:port` keeps the origin host, `host:port` replaces both.
fn parse_authority(origin: &Origin, scheme: Scheme, value: &str) -> Option<Origin> {
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        value.rsplit_once(':')?
    };
    let port = port.parse::<u16>().ok()?;
    let host = if host.is_empty() {
        origin.host.as_str()
    } else {
        host
    };
    Some(Origin::new(scheme, host, port))
}

// ALPN ids may be percent-encoded (`http%2F1.1`).
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(host: &str) -> Origin {
        Origin::new(Scheme::Https, host, 443)
    }

    #[test]
    fn test_parse_alternatives() {
        let now = Instant::now();
        let a = origin("a.example");
        let entries = parse_alt_svc(
            &a,
            r#"h2=":8443"; ma=60, h3="b.example:443"; persist=1, http%2F1.1="[::1]:80""#,
            now,
        );
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].protocol, "h2");
        assert_eq!(entries[0].alternative, a.with_authority("a.example", 8443));
        assert_eq!(entries[0].expires_at, Some(now + Duration::from_secs(60)));
        assert!(entries[0].is_supported());

        assert_eq!(entries[1].alternative.host, "b.example");
        assert_eq!(entries[1].expires_at, None);
        assert_eq!(entries[1].params.get("persist").map(|v| v.as_str()), Some("1"));
        assert!(!entries[1].is_supported());

        assert_eq!(entries[2].protocol, "http/1.1");
        assert_eq!(entries[2].alternative.host, "::1");
    }

    #[test]
    fn test_malformed_alternatives_skipped() {
        let entries = parse_alt_svc(&origin("a.example"), r#"h2, =":1", h2="nohost", h2=":443""#, Instant::now());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = AltSvcCache::new();
        let a = origin("a.example");
        let start = Instant::now();
        cache.parse_and_store_at(&a, r#"h2="b.example:443"; ma=60"#, start);

        let live = cache.lookup_at(&a, start + Duration::from_secs(59));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].alternative.host, "b.example");

        assert!(cache
            .lookup_at(&a, start + Duration::from_secs(61))
            .is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_ma_never_expires() {
        let cache = AltSvcCache::new();
        let a = origin("a.example");
        let start = Instant::now();
        cache.parse_and_store_at(&a, r#"h2="b.example:443""#, start);
        let later = start + Duration::from_secs(365 * 24 * 3600);
        assert_eq!(cache.lookup_at(&a, later).len(), 1);
    }

    #[test]
    fn test_dedup_by_alternative() {
        let cache = AltSvcCache::new();
        let a = origin("a.example");
        let start = Instant::now();
        cache.parse_and_store_at(&a, r#"h2="b.example:443"; ma=10"#, start);
        cache.parse_and_store_at(&a, r#"h2="b.example:443"; ma=100, h2="c.example:443""#, start);

        let live = cache.lookup_at(&a, start + Duration::from_secs(50));
        assert_eq!(live.len(), 2);
        assert_eq!(
            live.iter().filter(|e| e.alternative.host == "b.example").count(),
            1
        );
    }

    #[test]
    fn test_clear_empties_origin() {
        let cache = AltSvcCache::new();
        let a = origin("a.example");
        let b = origin("b.example");
        cache.parse_and_store(&a, r#"h2="x.example:443", h2="y.example:443""#);
        cache.parse_and_store(&b, r#"h2="x.example:443""#);

        assert!(cache.parse_and_store(&a, " clear ").is_empty());
        assert!(cache.lookup(&a).is_empty());
        assert_eq!(cache.lookup(&b).len(), 1);
    }

    #[test]
    fn test_alternative_scheme_follows_protocol() {
        let plain = Origin::new(Scheme::Http, "a.example", 80);
        let entries = parse_alt_svc(
            &plain,
            r#"h2=":8443", http%2F1.1=":8080", h2c=":8081""#,
            Instant::now(),
        );
        let schemes: Vec<_> = entries.iter().map(|e| e.alternative.scheme).collect();
        assert_eq!(schemes, vec![Scheme::Https, Scheme::Http, Scheme::Http]);
        assert_eq!(entries[0].alternative, Origin::new(Scheme::Https, "a.example", 8443));
    }

    #[test]
    fn test_clear_wins_within_one_response() {
        let cache = AltSvcCache::new();
        let a = origin("a.example");
        cache.parse_and_store(&a, r#"h2="old.example:443""#);

        let stored = cache.store_response(&a, &["clear", r#"h2="b.example:443"; ma=60"#]);
        assert!(stored.is_empty());
        assert!(cache.lookup(&a).is_empty());

        let stored = cache.store_response(&a, &[r#"h2="b.example:443""#, r#"h2="c.example:443""#]);
        assert_eq!(stored.len(), 2);
        assert_eq!(cache.lookup(&a).len(), 2);
    }
}
