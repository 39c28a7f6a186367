//! Purpose: Identity Source: reactive auth state plus the imperative sign-in surface.
//! Exports: `User`, `AuthState`, `AuthBackend`, `Auth`, `LocalAuth`, `LinkSettings`, `Provider`.
//! Role: The only writer of the identity cell; synchronizers read `uid` from it.
//! Invariants: `signing_in` is cleared whether a sign-in succeeds or fails.
//! Invariants: Backend state events are applied in order, one write per event.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::ids::auto_id;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_anonymous: bool,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
            is_anonymous: false,
        }
    }

    pub fn anonymous(uid: impl Into<String>) -> Self {
        Self {
            is_anonymous: true,
            ..Self::new(uid)
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthState {
    /// True until the backend reports for the first time.
    pub loading: bool,
    pub signing_in: bool,
    pub uid: Option<String>,
    pub user: Option<User>,
}

impl AuthState {
    fn set_user(&mut self, user: User) {
        self.uid = Some(user.uid.clone());
        self.user = Some(user);
        self.loading = false;
        self.signing_in = false;
    }

    fn reset(&mut self) {
        self.uid = None;
        self.user = None;
        self.loading = false;
        self.signing_in = false;
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            loading: true,
            signing_in: false,
            uid: None,
            user: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkSettings {
    /// Where the emailed link sends the user back to.
    pub url: String,
    pub handle_code_in_app: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Provider {
    Google { scopes: Vec<String> },
}

impl Provider {
    pub fn google() -> Self {
        Provider::Google {
            scopes: vec!["https://www.googleapis.com/auth/userinfo.email".to_string()],
        }
    }
}

/// Seam to a hosted authentication service.
pub trait AuthBackend: Send + Sync + 'static {
    /// Current user first, then one event per actual auth-state change.
    fn state_changes(&self) -> mpsc::UnboundedReceiver<Option<User>>;

    fn sign_in_anonymously(&self) -> impl Future<Output = Result<User, Error>> + Send;

    fn sign_in_with_email_link(
        &self,
        email: &str,
        link: &str,
    ) -> impl Future<Output = Result<User, Error>> + Send;

    fn send_sign_in_link_to_email(
        &self,
        email: &str,
        settings: &LinkSettings,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn sign_in_with_provider(
        &self,
        provider: &Provider,
    ) -> impl Future<Output = Result<User, Error>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

pub struct Auth<A> {
    backend: Arc<A>,
    state: Arc<watch::Sender<AuthState>>,
}

impl<A> Clone for Auth<A> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
        }
    }
}

impl<A: AuthBackend> Auth<A> {
    pub fn new(backend: A) -> Self {
        let (state, _rx) = watch::channel(AuthState::default());
        Self {
            backend: Arc::new(backend),
            state: Arc::new(state),
        }
    }

    pub fn backend(&self) -> &A {
        &self.backend
    }

    pub fn state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn uid(&self) -> Option<String> {
        self.state.borrow().uid.clone()
    }

    /// Applies backend auth events to the state cell until the backend hangs up.
    pub(crate) fn spawn_listener(&self) -> JoinHandle<()> {
        let mut events = self.backend.state_changes();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Some(user) => {
                        debug!(uid = %user.uid, "auth state: signed in");
                        state.send_modify(|state| state.set_user(user));
                    }
                    None => {
                        debug!("auth state: signed out");
                        state.send_modify(AuthState::reset);
                    }
                }
            }
        })
    }

    pub async fn sign_in_anonymously(&self) -> Result<User, Error> {
        self.signing_in(self.backend.sign_in_anonymously()).await
    }

    pub async fn sign_in_with_email_link(&self, email: &str, link: &str) -> Result<User, Error> {
        if email.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("email is required to complete a link sign-in")
                .with_hint("Pass the address the link was sent to."));
        }
        self.signing_in(self.backend.sign_in_with_email_link(email, link))
            .await
    }

    pub async fn send_sign_in_link_to_email(
        &self,
        email: &str,
        settings: &LinkSettings,
    ) -> Result<(), Error> {
        self.backend.send_sign_in_link_to_email(email, settings).await
    }

    pub async fn sign_in_with_provider(&self, provider: &Provider) -> Result<User, Error> {
        self.signing_in(self.backend.sign_in_with_provider(provider))
            .await
    }

    pub async fn sign_out(&self) -> Result<(), Error> {
        self.backend.sign_out().await?;
        self.state.send_modify(AuthState::reset);
        Ok(())
    }

    async fn signing_in<F>(&self, attempt: F) -> Result<User, Error>
    where
        F: Future<Output = Result<User, Error>>,
    {
        self.state.send_modify(|state| state.signing_in = true);
        let result = attempt.await;
        match &result {
            Ok(user) => {
                let user = user.clone();
                self.state.send_modify(|state| state.set_user(user));
            }
            Err(_) => self.state.send_modify(|state| state.signing_in = false),
        }
        result
    }
}

/// In-process auth backend: anonymous sign-in and explicit `sign_in_as`.
///
/// Email-link and federated provider flows are not available locally and fail with
/// `ErrorKind::Unsupported`.
#[derive(Clone, Default)]
pub struct LocalAuth {
    inner: Arc<Mutex<LocalAuthInner>>,
}

#[derive(Default)]
struct LocalAuthInner {
    current: Option<User>,
    listeners: Vec<mpsc::UnboundedSender<Option<User>>>,
}

impl LocalAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user: User) -> Self {
        let auth = Self::new();
        auth.lock().current = Some(user);
        auth
    }

    pub fn current(&self) -> Option<User> {
        self.lock().current.clone()
    }

    /// Switches the signed-in user, as if the hosted service reported a new session.
    pub fn sign_in_as(&self, uid: impl Into<String>) -> User {
        let user = User::new(uid);
        self.publish(Some(user.clone()));
        user
    }

    fn publish(&self, user: Option<User>) {
        let mut inner = self.lock();
        if inner.current == user {
            return;
        }
        inner.current = user.clone();
        inner
            .listeners
            .retain(|listener| listener.send(user.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, LocalAuthInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl AuthBackend for LocalAuth {
    fn state_changes(&self) -> mpsc::UnboundedReceiver<Option<User>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if tx.send(inner.current.clone()).is_ok() {
            inner.listeners.push(tx);
        }
        rx
    }

    async fn sign_in_anonymously(&self) -> Result<User, Error> {
        let user = User::anonymous(auto_id()?);
        self.publish(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in_with_email_link(&self, _email: &str, _link: &str) -> Result<User, Error> {
        Err(unsupported("email link sign-in"))
    }

    async fn send_sign_in_link_to_email(
        &self,
        _email: &str,
        _settings: &LinkSettings,
    ) -> Result<(), Error> {
        Err(unsupported("sending sign-in links"))
    }

    async fn sign_in_with_provider(&self, _provider: &Provider) -> Result<User, Error> {
        Err(unsupported("federated provider sign-in"))
    }

    async fn sign_out(&self) -> Result<(), Error> {
        self.publish(None);
        Ok(())
    }
}

fn unsupported(flow: &str) -> Error {
    Error::new(ErrorKind::Unsupported)
        .with_message(format!("{flow} is not available with local auth"))
        .with_hint("Use sign_in_as or sign_in_anonymously, or plug in a hosted AuthBackend.")
}

#[cfg(test)]
mod tests {
    use super::{Auth, AuthBackend, LocalAuth, Provider, User};
    use crate::core::error::ErrorKind;

    #[tokio::test]
    async fn listener_applies_backend_events() {
        let backend = LocalAuth::new();
        let auth = Auth::new(backend.clone());
        let mut state = auth.state();
        assert!(state.borrow().loading);

        let _listener = auth.spawn_listener();
        state
            .wait_for(|state| !state.loading)
            .await
            .expect("first event");
        assert_eq!(state.borrow().uid, None);

        backend.sign_in_as("alice");
        state
            .wait_for(|state| state.uid.as_deref() == Some("alice"))
            .await
            .expect("signed in");

        auth.sign_out().await.expect("sign out");
        assert_eq!(auth.uid(), None);
    }

    #[tokio::test]
    async fn anonymous_sign_in_sets_user() {
        let auth = Auth::new(LocalAuth::new());
        let user = auth.sign_in_anonymously().await.expect("sign in");
        assert!(user.is_anonymous);
        assert_eq!(auth.uid(), Some(user.uid.clone()));
        assert!(!auth.state().borrow().signing_in);
    }

    #[tokio::test]
    async fn failed_sign_in_clears_signing_in() {
        let auth = Auth::new(LocalAuth::with_user(User::new("bob")));
        let err = auth
            .sign_in_with_provider(&Provider::google())
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(!auth.state().borrow().signing_in);
    }

    #[tokio::test]
    async fn email_link_requires_email() {
        let auth = Auth::new(LocalAuth::new());
        let err = auth
            .sign_in_with_email_link("", "https://example.test/link")
            .await
            .expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn state_changes_start_with_current_user() {
        let backend = LocalAuth::with_user(User::new("carol"));
        let mut events = backend.state_changes();
        let first = events.recv().await.expect("event");
        assert_eq!(first.map(|user| user.uid), Some("carol".to_string()));
    }
}
