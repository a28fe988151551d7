//! Built-in authentication schemes: Basic, Bearer, Digest, Form and client
//! certificate. Custom schemes are any other [`AuthScheme`] implementation.

use super::{AuthFailure, AuthScheme, AuthUser, Credentials, SchemeOutcome};
use crate::pipeline::HttpEvent;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;

/// Character set used to decode Basic credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicEncoding {
    Utf8,
    /// ISO-8859-1, the header's historical default.
    Latin1,
}

/// `Authorization: Basic base64(user:pass)`.
pub struct BasicScheme {
    header_tag: String,
    encoding: BasicEncoding,
    realm: String,
}

impl Default for BasicScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicScheme {
    pub fn new() -> Self {
        Self {
            header_tag: "Basic".to_string(),
            encoding: BasicEncoding::Utf8,
            realm: "User".to_string(),
        }
    }

    /// Override the expected header tag (some clients send a custom one).
    pub fn with_header_tag(mut self, tag: impl Into<String>) -> Self {
        self.header_tag = tag.into();
        self
    }

    pub fn with_encoding(mut self, encoding: BasicEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    fn decode_payload(&self, bytes: &[u8]) -> Result<String, AuthFailure> {
        match self.encoding {
            BasicEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|_| AuthFailure::new(400, "invalid encoding in Authorization header")),
            // Latin-1 maps bytes onto the first 256 code points directly.
            BasicEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

impl AuthScheme for BasicScheme {
    fn name(&self) -> &str {
        &self.header_tag
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn extract(&self, event: &HttpEvent) -> SchemeOutcome {
        let Some(header) = event.request.header("authorization") else {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "no Authorization header found",
            ));
        };
        let Some((tag, payload)) = header.trim().split_once(' ') else {
            return SchemeOutcome::Failure(AuthFailure::new(
                400,
                "invalid Authorization header format",
            ));
        };
        if !tag.eq_ignore_ascii_case(&self.header_tag) {
            return SchemeOutcome::Failure(AuthFailure::new(
                400,
                format!("Authorization header is not {} tagged", self.header_tag),
            ));
        }
        let bytes = match STANDARD.decode(payload.trim()) {
            Ok(b) => b,
            Err(_) => {
                return SchemeOutcome::Failure(AuthFailure::new(
                    400,
                    "invalid base64 in Authorization header",
                ))
            }
        };
        let decoded = match self.decode_payload(&bytes) {
            Ok(d) => d,
            Err(f) => return SchemeOutcome::Failure(f),
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return SchemeOutcome::Failure(AuthFailure::new(
                400,
                "credentials are not in user:password format",
            ));
        };
        SchemeOutcome::Credentials(Credentials::UserPass {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// `Authorization: Bearer <token>`, with RFC 6750 challenge codes and scope
/// enforcement in post-validation.
pub struct BearerScheme {
    /// Scopes this method requires. Empty means any token passes the scope
    /// check.
    scopes: Vec<String>,
    realm: String,
}

impl Default for BearerScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl BearerScheme {
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            realm: "User".to_string(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// The failure a validator should return for a token it rejects.
    pub fn invalid_token() -> AuthFailure {
        AuthFailure::new(401, "invalid token").with_challenge("error=\"invalid_token\"")
    }
}

impl AuthScheme for BearerScheme {
    fn name(&self) -> &str {
        "Bearer"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn extract(&self, event: &HttpEvent) -> SchemeOutcome {
        let Some(header) = event.request.header("authorization") else {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "no Authorization header found",
            ));
        };
        let Some((tag, token)) = header.trim().split_once(' ') else {
            return SchemeOutcome::Failure(
                AuthFailure::new(400, "invalid Authorization header format")
                    .with_challenge("error=\"invalid_request\""),
            );
        };
        if !tag.eq_ignore_ascii_case("Bearer") {
            return SchemeOutcome::Failure(
                AuthFailure::new(400, "Authorization header is not Bearer tagged")
                    .with_challenge("error=\"invalid_request\""),
            );
        }
        let token = token.trim();
        if token.is_empty() {
            return SchemeOutcome::Failure(
                AuthFailure::new(400, "no Bearer token supplied")
                    .with_challenge("error=\"invalid_request\""),
            );
        }
        SchemeOutcome::Credentials(Credentials::Token(token.to_string()))
    }

    fn post_validate(
        &self,
        _event: &HttpEvent,
        _credentials: &Credentials,
        user: &mut AuthUser,
    ) -> Result<(), AuthFailure> {
        if self.scopes.is_empty() {
            return Ok(());
        }
        if user.scopes.is_empty() || !user.scopes.iter().any(|s| self.scopes.contains(s)) {
            return Err(AuthFailure::forbidden("invalid scope")
                .with_challenge("error=\"insufficient_scope\""));
        }
        Ok(())
    }
}

/// `Authorization: Digest key=value, ...` with MD5 response verification.
pub struct DigestScheme {
    realm: String,
}

impl Default for DigestScheme {
    fn default() -> Self {
        Self::new()
    }
}

const DIGEST_REQUIRED_KEYS: &[&str] =
    &["username", "uri", "nonce", "nc", "cnonce", "qop", "response"];

impl DigestScheme {
    pub fn new() -> Self {
        Self {
            realm: "User".to_string(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    fn challenge() -> String {
        format!(
            "qop=\"auth\", algorithm=\"MD5\", nonce=\"{}\"",
            uuid::Uuid::new_v4()
        )
    }

    /// Parse `key=value` pairs, honouring quoted values with embedded commas.
    fn parse_params(raw: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let mut rest = raw.trim();
        while !rest.is_empty() {
            let Some(eq) = rest.find('=') else { break };
            let key = rest[..eq].trim().to_ascii_lowercase();
            rest = rest[eq + 1..].trim_start();
            let value;
            if let Some(stripped) = rest.strip_prefix('"') {
                match stripped.find('"') {
                    Some(end) => {
                        value = stripped[..end].to_string();
                        rest = stripped[end + 1..].trim_start().trim_start_matches(',').trim_start();
                    }
                    None => {
                        value = stripped.to_string();
                        rest = "";
                    }
                }
            } else {
                match rest.find(',') {
                    Some(end) => {
                        value = rest[..end].trim().to_string();
                        rest = rest[end + 1..].trim_start();
                    }
                    None => {
                        value = rest.trim().to_string();
                        rest = "";
                    }
                }
            }
            params.insert(key, value);
        }
        params
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// The Digest response check, exposed for property tests:
/// `expected = MD5(HA1:nonce:nc:cnonce:qop:HA2)`.
pub fn digest_expected_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
}

impl AuthScheme for DigestScheme {
    fn name(&self) -> &str {
        "Digest"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn extract(&self, event: &HttpEvent) -> SchemeOutcome {
        let Some(header) = event.request.header("authorization") else {
            return SchemeOutcome::Failure(
                AuthFailure::new(401, "no Authorization header found")
                    .with_challenge(Self::challenge()),
            );
        };
        let Some((tag, payload)) = header.trim().split_once(' ') else {
            return SchemeOutcome::Failure(AuthFailure::new(
                400,
                "invalid Authorization header format",
            ));
        };
        if !tag.eq_ignore_ascii_case("Digest") {
            return SchemeOutcome::Failure(AuthFailure::new(
                400,
                "Authorization header is not Digest tagged",
            ));
        }
        let params = Self::parse_params(payload);
        for key in DIGEST_REQUIRED_KEYS {
            if !params.contains_key(*key) {
                return SchemeOutcome::Failure(AuthFailure::new(
                    400,
                    format!("missing Digest parameter: {key}"),
                ));
            }
        }
        SchemeOutcome::Credentials(Credentials::Digest(params))
    }

    fn post_validate(
        &self,
        event: &HttpEvent,
        credentials: &Credentials,
        user: &mut AuthUser,
    ) -> Result<(), AuthFailure> {
        let Credentials::Digest(params) = credentials else {
            return Err(AuthFailure::new(400, "expected Digest credentials"));
        };
        let Some(password) = user.user.get("Password").and_then(Value::as_str) else {
            return Err(AuthFailure::new(
                401,
                "user record carries no password for Digest verification",
            )
            .with_challenge(Self::challenge()));
        };

        let expected = digest_expected_response(
            &params["username"],
            &self.realm,
            password,
            event.request.method.as_str(),
            &params["uri"],
            &params["nonce"],
            &params["nc"],
            &params["cnonce"],
            &params["qop"],
        );

        if !super::users::constant_time_eq(expected.as_bytes(), params["response"].as_bytes()) {
            return Err(
                AuthFailure::invalid_credentials().with_challenge(Self::challenge())
            );
        }

        // The password came back from the validator only for this check.
        if let Some(map) = user.user.as_object_mut() {
            map.remove("Password");
        }
        Ok(())
    }
}

/// Username/password fields from a POST form body.
pub struct FormScheme {
    username_field: String,
    password_field: String,
    realm: String,
}

impl Default for FormScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl FormScheme {
    pub fn new() -> Self {
        Self {
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            realm: "User".to_string(),
        }
    }

    pub fn with_fields(
        mut self,
        username_field: impl Into<String>,
        password_field: impl Into<String>,
    ) -> Self {
        self.username_field = username_field.into();
        self.password_field = password_field.into();
        self
    }
}

impl AuthScheme for FormScheme {
    fn name(&self) -> &str {
        "Form"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn extract(&self, event: &HttpEvent) -> SchemeOutcome {
        let body = &event.request.body;
        let field = |name: &str| -> Option<String> {
            body.form.get(name).cloned().or_else(|| {
                body.json
                    .as_ref()
                    .and_then(|j| j.get(name))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        };
        let (Some(username), Some(password)) = (
            field(&self.username_field),
            field(&self.password_field),
        ) else {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "username or password not supplied",
            ));
        };
        SchemeOutcome::Credentials(Credentials::UserPass { username, password })
    }
}

/// The TLS peer certificate, requested (not required) during the handshake.
pub struct ClientCertScheme {
    realm: String,
}

impl Default for ClientCertScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCertScheme {
    pub fn new() -> Self {
        Self {
            realm: "User".to_string(),
        }
    }
}

impl AuthScheme for ClientCertScheme {
    fn name(&self) -> &str {
        "Certificate"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn extract(&self, event: &HttpEvent) -> SchemeOutcome {
        let Some(cert) = &event.client_certificate else {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "no client certificate supplied",
            ));
        };
        let now = chrono::Utc::now();
        if cert.is_not_yet_valid(now) {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "client certificate is not yet valid",
            ));
        }
        if cert.is_expired(now) {
            return SchemeOutcome::Failure(AuthFailure::new(401, "client certificate has expired"));
        }
        if cert.thumbprint.is_empty() {
            return SchemeOutcome::Failure(AuthFailure::new(
                401,
                "client certificate has no thumbprint",
            ));
        }
        SchemeOutcome::Credentials(Credentials::Certificate(cert.clone()))
    }
}
