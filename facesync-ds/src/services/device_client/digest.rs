//! HTTP Digest authentication (RFC 7616, MD5)
//!
//! Terminals answer every unauthenticated request with a `401` carrying a fresh
//! `WWW-Authenticate: Digest ...` challenge, so the client recomputes the
//! `Authorization` header for each call instead of caching a session.

use md5::{Digest, Md5};
use rand::RngCore;
use std::collections::HashMap;

/// Parsed `WWW-Authenticate: Digest` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `Some("auth")` when the server offers qop=auth
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

/// Static per-process credentials for one device
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value; `None` if it is not a Digest challenge
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let params = parse_params(rest);
        let realm = params.get("realm")?.clone();
        let nonce = params.get("nonce")?.clone();

        // qop may list several options ("auth,auth-int"); only auth is supported
        let qop = params.get("qop").and_then(|value| {
            value
                .split(',')
                .map(str::trim)
                .find(|q| q.eq_ignore_ascii_case("auth"))
                .map(|_| "auth".to_string())
        });

        Some(Self {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            qop,
            algorithm: params.get("algorithm").cloned(),
        })
    }

    /// Build the `Authorization` header value for one request
    ///
    /// `uri` is the request path including query string, exactly as sent.
    pub fn authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            credentials.username, self.realm, credentials.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nonce_count);

        let response = match &self.qop {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            credentials.username, self.realm, self.nonce, uri, response
        );
        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        if let Some(qop) = &self.qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

/// Fresh random client nonce (16 hex chars)
pub fn new_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Split `key="value", key=value` pairs, honouring commas inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

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

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
            value
        } else {
            chars
                .by_ref()
                .take_while(|c| *c != ',')
                .collect::<String>()
                .trim()
                .to_string()
        };

        params.insert(key, value);
    }

    params
}
