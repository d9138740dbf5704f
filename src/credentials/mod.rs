//! Credential extraction from request headers

use axum::http::HeaderMap;
use secrecy::SecretString;

/// Header carrying a long-lived API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// A credential presented by the caller
#[derive(Debug, Clone)]
pub enum Credential {
    /// `Authorization: Bearer <token>` session token
    BearerToken(SecretString),
    /// `X-API-Key: <key>` API key
    ApiKey(SecretString),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::BearerToken(_) => "bearer",
            Credential::ApiKey(_) => "api_key",
        }
    }
}

/// Extract every credential present, in precedence order.
///
/// A bearer token comes before an API key when both are present.
pub fn extract_all(headers: &HeaderMap) -> Vec<Credential> {
    let mut found = Vec::with_capacity(2);
    if let Some(token) = bearer_token(headers) {
        found.push(Credential::BearerToken(SecretString::from(token)));
    }
    if let Some(key) = api_key(headers) {
        found.push(Credential::ApiKey(SecretString::from(key)));
    }
    found
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(API_KEY_HEADER)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use secrecy::ExposeSecret;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_no_credentials() {
        assert!(extract_all(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_bearer_token() {
        let map = headers(&[("authorization", "Bearer abc.def.ghi")]);
        match extract_all(&map).pop() {
            Some(Credential::BearerToken(token)) => assert_eq!(token.expose_secret(), "abc.def.ghi"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let map = headers(&[("authorization", "bearer   tok  ")]);
        match extract_all(&map).pop() {
            Some(Credential::BearerToken(token)) => assert_eq!(token.expose_secret(), "tok"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_other_schemes_ignored() {
        let map = headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(extract_all(&map).is_empty());

        let map = headers(&[("authorization", "Bearer ")]);
        assert!(extract_all(&map).is_empty());
    }

    #[test]
    fn test_api_key() {
        let map = headers(&[("x-api-key", "sk_0123")]);
        match extract_all(&map).pop() {
            Some(Credential::ApiKey(key)) => assert_eq!(key.expose_secret(), "sk_0123"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_bearer_takes_precedence() {
        let map = headers(&[("authorization", "Bearer tok"), ("x-api-key", "sk_0123")]);
        let all = extract_all(&map);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind(), "bearer");
        assert_eq!(all[1].kind(), "api_key");
    }

    #[test]
    fn test_debug_does_not_reveal_secret() {
        let map = headers(&[("x-api-key", "sk_supersecret")]);
        let credential = extract_all(&map).pop().unwrap();
        assert!(!format!("{credential:?}").contains("supersecret"));
    }
}
