//! `WWW-Authenticate: Bearer` challenge parsing (RFC 6750 / RFC 9728)

use std::collections::HashMap;

/// Parameters of a `Bearer` challenge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Error code, e.g. `invalid_token`
    pub error: Option<String>,
    /// Human-readable error description
    pub error_description: Option<String>,
    /// Protected-resource metadata URL (RFC 9728)
    pub resource_metadata: Option<String>,
    /// Scope the resource wants
    pub scope: Option<String>,
    /// Realm
    pub realm: Option<String>,
}

impl BearerChallenge {
    /// Parse the `Bearer` challenge out of a header value.
    ///
    /// Returns `None` when the header carries no `Bearer` challenge. Other
    /// schemes in the same header are skipped.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let challenges = split_challenges(header);
        let params = challenges
            .into_iter()
            .find(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, params)| params)?;

        let take = |name: &str| params.get(name).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            error: take("error"),
            error_description: take("error_description"),
            resource_metadata: take("resource_metadata"),
            scope: take("scope"),
            realm: take("realm"),
        })
    }
}

/// Split a header into `(scheme, params)` pairs
fn split_challenges(header: &str) -> Vec<(String, HashMap<String, String>)> {
    let mut out: Vec<(String, HashMap<String, String>)> = Vec::new();
    let mut rest = header.trim();

    while !rest.is_empty() {
        rest = rest.trim_start_matches([',', ' ', '\t']);
        if rest.is_empty() {
            break;
        }

        let token_end = rest
            .find(|c: char| c == '=' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        if token_end == 0 {
            // stray '='
            rest = &rest[1..];
            continue;
        }
        let token = &rest[..token_end];
        let after = rest[token_end..].trim_start();

        if after.starts_with('=') && !out.is_empty() {
            // auth-param of the current challenge
            let (value, remaining) = parse_value(after[1..].trim_start());
            if let Some((_, params)) = out.last_mut() {
                params.insert(token.to_ascii_lowercase(), value);
            }
            rest = remaining;
        } else {
            // new scheme
            out.push((token.to_string(), HashMap::new()));
            rest = after;
        }
    }

    out
}

/// Parse a quoted-string or token value, returning it and the unparsed rest
fn parse_value(input: &str) -> (String, &str) {
    if let Some(quoted) = input.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => return (value, &quoted[i + 1..]),
                _ => value.push(c),
            }
        }
        // unterminated quote: take everything
        (value, "")
    } else {
        let end = input
            .find(|c: char| c == ',' || c.is_whitespace())
            .unwrap_or(input.len());
        (input[..end].to_string(), &input[end..])
    }
}
