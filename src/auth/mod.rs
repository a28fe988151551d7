//! Authentication core: a named method composes a credential-extracting
//! scheme, a validator, and an optional post-validator.
//!
//! The scheme parses the request and either produces credentials for the
//! validator or fails immediately with a code and challenge. The validator
//! turns credentials into a user record. Post-validators run scheme-specific
//! cross-checks (the Digest response hash, Bearer scopes) after the
//! validator has produced a user.
//!
//! With sessions configured, a successful method writes its result into the
//! session's `Auth` slot; later requests inside the TTL skip the scheme and
//! validator entirely and read the cached slot.

pub mod schemes;
pub mod users;

pub use schemes::{
    BasicScheme, BearerScheme, ClientCertScheme, DigestScheme, FormScheme,
};
pub use users::UserFileStore;

use crate::context::ServerContext;
use crate::pipeline::HttpEvent;
use crate::session::AUTH_SLOT;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The authentication outcome attached to an event.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub user: Value,
    pub is_authenticated: bool,
    /// Name of the method that authenticated the request, when one did.
    pub method: Option<String>,
}

/// Raw credentials extracted by a scheme.
#[derive(Debug, Clone)]
pub enum Credentials {
    UserPass { username: String, password: String },
    Token(String),
    /// The key/value parameters of a `Digest` authorization header.
    Digest(HashMap<String, String>),
    Certificate(crate::listener::tls::ClientCertificate),
    Custom(Value),
}

/// A failed extraction or validation.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub code: u16,
    pub message: String,
    /// Parameters appended to the `WWW-Authenticate` challenge.
    pub challenge: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl AuthFailure {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            challenge: None,
            headers: Vec::new(),
        }
    }

    pub fn with_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.challenge = Some(challenge.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn invalid_credentials() -> Self {
        Self::new(401, "invalid credentials supplied")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }
}

/// A validated user, plus whatever scopes the token carried.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: Value,
    /// Scopes granted to the presented token (Bearer only).
    pub scopes: Vec<String>,
}

impl AuthUser {
    pub fn new(user: Value) -> Self {
        Self {
            user,
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }
}

/// What a scheme found in the request.
pub enum SchemeOutcome {
    /// Credentials to feed the validator.
    Credentials(Credentials),
    /// Immediate failure (missing/malformed credentials).
    Failure(AuthFailure),
    /// Immediate success without a validator (custom schemes).
    Success(AuthUser),
}

/// A credential extractor with a challenge identity.
pub trait AuthScheme: Send + Sync {
    /// The scheme name used in `WWW-Authenticate`, e.g. `Basic`.
    fn name(&self) -> &str;

    /// The challenge realm. Defaults to `User`.
    fn realm(&self) -> &str {
        "User"
    }

    /// Parse the request for raw credentials.
    fn extract(&self, event: &HttpEvent) -> SchemeOutcome;

    /// Scheme-specific cross-check after the validator produced a user.
    fn post_validate(
        &self,
        event: &HttpEvent,
        credentials: &Credentials,
        user: &mut AuthUser,
    ) -> Result<(), AuthFailure> {
        let _ = (event, credentials, user);
        Ok(())
    }
}

pub type Validator =
    Arc<dyn Fn(&Credentials) -> Result<AuthUser, AuthFailure> + Send + Sync>;

pub type PostValidator =
    Arc<dyn Fn(&HttpEvent, &Credentials, &mut AuthUser) -> Result<(), AuthFailure> + Send + Sync>;

/// How a method's validator wants to be invoked.
#[derive(Clone)]
pub enum ValidatorFn {
    Plain(Validator),
    /// The validator also receives the event (the method's pass-event flag).
    WithEvent(Arc<dyn Fn(&HttpEvent, &Credentials) -> Result<AuthUser, AuthFailure> + Send + Sync>),
}

/// A named authentication method.
#[derive(Clone)]
pub struct AuthMethod {
    pub name: String,
    pub scheme: Arc<dyn AuthScheme>,
    pub validator: ValidatorFn,
    pub post_validator: Option<PostValidator>,
    /// Do not read or write the session's auth slot for this method.
    pub sessionless: bool,
    pub failure_url: Option<String>,
    pub failure_message: Option<String>,
    pub success_url: Option<String>,
}

impl AuthMethod {
    pub fn new(
        name: impl Into<String>,
        scheme: Arc<dyn AuthScheme>,
        validator: Validator,
    ) -> Self {
        Self {
            name: name.into(),
            scheme,
            validator: ValidatorFn::Plain(validator),
            post_validator: None,
            sessionless: false,
            failure_url: None,
            failure_message: None,
            success_url: None,
        }
    }

    pub fn pass_event<F>(mut self, validator: F) -> Self
    where
        F: Fn(&HttpEvent, &Credentials) -> Result<AuthUser, AuthFailure> + Send + Sync + 'static,
    {
        self.validator = ValidatorFn::WithEvent(Arc::new(validator));
        self
    }

    pub fn with_post_validator(mut self, post: PostValidator) -> Self {
        self.post_validator = Some(post);
        self
    }

    pub fn sessionless(mut self) -> Self {
        self.sessionless = true;
        self
    }

    pub fn with_failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = Some(url.into());
        self
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    pub fn with_success_url(mut self, url: impl Into<String>) -> Self {
        self.success_url = Some(url.into());
        self
    }

    fn run_validator(
        &self,
        event: &HttpEvent,
        credentials: &Credentials,
    ) -> Result<AuthUser, AuthFailure> {
        match &self.validator {
            ValidatorFn::Plain(v) => v(credentials),
            ValidatorFn::WithEvent(v) => v(event, credentials),
        }
    }
}

/// Configure-once registry of authentication methods, keyed by name.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    methods: HashMap<String, Arc<AuthMethod>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: AuthMethod) -> crate::error::Result<()> {
        if self.methods.contains_key(&method.name) {
            return Err(crate::error::Error::config(format!(
                "an authentication method named '{}' is already defined",
                method.name
            )));
        }
        tracing::info!(name = %method.name, scheme = %method.scheme.name(), "authentication method registered");
        self.methods.insert(method.name.clone(), Arc::new(method));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AuthMethod>> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// The pipeline's authentication stage. `Ok(true)` continues the pipeline.
pub fn authenticate(ctx: &ServerContext, event: &mut HttpEvent) -> anyhow::Result<bool> {
    let Some(matched) = event.route.clone() else {
        return Ok(true);
    };
    let Some(auth_name) = matched.route.auth.clone() else {
        return Ok(true);
    };
    let method = ctx
        .auth
        .get(&auth_name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("route references unknown authentication method '{auth_name}'"))?;

    // A login page renders unauthenticated on GET so there is somewhere to
    // land when the method fails.
    if matched.route.login && event.request.method == http::Method::GET {
        return Ok(true);
    }

    if matched.route.logout {
        logout(event, &method);
        return Ok(false);
    }

    let use_session = ctx.sessions_enabled() && !method.sessionless;

    // Cached session auth short-circuits the scheme and validator.
    if use_session {
        if let Some(slot) = event.session.as_ref().and_then(|s| s.get(AUTH_SLOT)).cloned() {
            if slot["IsAuthenticated"].as_bool().unwrap_or(false) {
                event.auth = Some(AuthState {
                    user: slot["User"].clone(),
                    is_authenticated: true,
                    method: Some(method.name.clone()),
                });
                return Ok(true);
            }
        }
    }

    let outcome = method.scheme.extract(event);
    let user = match outcome {
        SchemeOutcome::Failure(failure) => {
            fail(event, &method, failure);
            return Ok(false);
        }
        SchemeOutcome::Success(user) => user,
        SchemeOutcome::Credentials(credentials) => {
            let mut user = match method.run_validator(event, &credentials) {
                Ok(user) => user,
                Err(failure) => {
                    fail(event, &method, failure);
                    return Ok(false);
                }
            };
            if let Err(failure) = method.scheme.post_validate(event, &credentials, &mut user) {
                fail(event, &method, failure);
                return Ok(false);
            }
            if let Some(post) = &method.post_validator {
                if let Err(failure) = post(event, &credentials, &mut user) {
                    fail(event, &method, failure);
                    return Ok(false);
                }
            }
            user
        }
    };

    tracing::debug!(
        request_id = %event.request_id,
        method = %method.name,
        "authentication succeeded"
    );
    event.auth = Some(AuthState {
        user: user.user.clone(),
        is_authenticated: true,
        method: Some(method.name.clone()),
    });

    if use_session {
        attach_to_session(event, &user.user);
    }

    if matched.route.login {
        if let Some(url) = &method.success_url {
            event.response.status(302).set_header("Location", url.clone());
            return Ok(false);
        }
    }

    Ok(true)
}

/// Store the auth result in the session and re-key the session so an id
/// handed out before login cannot be replayed after it.
fn attach_to_session(event: &mut HttpEvent, user: &Value) {
    let Some(binding) = event.session.as_mut() else {
        return;
    };
    binding.set(
        AUTH_SLOT,
        json!({ "User": user, "IsAuthenticated": true, "Store": true }),
    );
    if !binding.new {
        let mut runtime = event.runtime.lock().unwrap();
        if let Some(store) = runtime.sessions.as_mut() {
            if let Some(new_id) = store.regenerate(&binding.id) {
                let signed = store.sign(&new_id);
                drop(runtime);
                binding.id = new_id;
                binding.signed = signed;
            }
        }
    }
}

fn logout(event: &mut HttpEvent, method: &AuthMethod) {
    if let Some(binding) = event.session.as_mut() {
        binding.remove(AUTH_SLOT);
        binding.revoked = true;
    }
    event.auth = None;
    match &method.failure_url {
        Some(url) => {
            event.response.status(302).set_header("Location", url.clone());
        }
        None => {
            event.response.status(200);
        }
    }
}

/// Apply a failure to the response, composing the `WWW-Authenticate`
/// challenge when the caller has not set one.
fn fail(event: &mut HttpEvent, method: &AuthMethod, failure: AuthFailure) {
    tracing::debug!(
        request_id = %event.request_id,
        method = %method.name,
        code = failure.code,
        message = %failure.message,
        "authentication failed"
    );

    if let Some(url) = &method.failure_url {
        event.response.status(302).set_header("Location", url.clone());
        return;
    }

    event.response.status(failure.code);
    for (name, value) in &failure.headers {
        event.response.set_header(name, value.clone());
    }

    if matches!(failure.code, 401 | 403) && !event.response.has_header("www-authenticate") {
        let scheme = &method.scheme;
        let mut challenge = format!("{} realm=\"{}\"", scheme.name(), scheme.realm());
        if let Some(extra) = &failure.challenge {
            challenge.push_str(", ");
            challenge.push_str(extra);
        }
        event.response.set_header("WWW-Authenticate", challenge);
    }

    let message = method
        .failure_message
        .clone()
        .unwrap_or_else(|| failure.message.clone());
    event.response.json(&json!({ "error": message }));
}
