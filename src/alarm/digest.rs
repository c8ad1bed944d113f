// src/alarm/digest.rs
//
// HTTP digest authentication (RFC 2617, MD5, qop=auth) as spoken by NVR CGI endpoints.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parses a `WWW-Authenticate: Digest ...` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim();
        let rest = rest
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("digest"))
            .map(|_| &rest[6..])?;
        let params = parse_params(rest);

        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            opaque: params.get("opaque").cloned(),
            qop_auth: params
                .get("qop")
                .map(|q| q.split(',').any(|v| v.trim() == "auth"))
                .unwrap_or(false),
        })
    }

    /// `Authorization` header value for one request.
    pub fn authorization(
        &self,
        user: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", user, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let mut header = if self.qop_auth {
            let nc = format!("{:08x}", nc);
            let response = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ));
            format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm=MD5, response="{}", qop=auth, nc={}, cnonce="{}""#,
                user, self.realm, self.nonce, uri, response, nc, cnonce
            )
        } else {
            let response = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2));
            format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm=MD5, response="{}""#,
                user, self.realm, self.nonce, uri, response
            )
        };

        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        header
    }
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// `key=value, key="quoted, value"` → map. Keys are lower-cased.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut chars = s.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => break,
                    _ => {
                        value.push(c);
                        escaped = false;
                    }
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        out.insert(key, value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_challenge() {
        let c = DigestChallenge::parse(
            r#"Digest realm="Login to 4K05, NVR", qop="auth", nonce="1234567890", opaque="5ccc069c""#,
        )
        .unwrap();
        assert_eq!(c.realm, "Login to 4K05, NVR");
        assert_eq!(c.nonce, "1234567890");
        assert_eq!(c.opaque.as_deref(), Some("5ccc069c"));
        assert!(c.qop_auth);

        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }

    #[test]
    fn matches_rfc2617_example() {
        // RFC 2617 section 3.5
        let c = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop_auth: true,
        };
        let header = c.authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            1,
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.ends_with(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn legacy_challenge_without_qop() {
        let c = DigestChallenge::parse(r#"Digest realm=cam, nonce=abc"#).unwrap();
        assert!(!c.qop_auth);
        let header = c.authorization("u", "p", "GET", "/x", 1, "n");
        assert!(!header.contains("qop="));
        assert!(header.contains(r#"realm="cam""#));
    }
}
