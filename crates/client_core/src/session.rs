use std::sync::Arc;

use reqwest::Method;
use shared::{
    error::ApiError,
    protocol::{LoginRequest, ProfileUpdate, RegisterRequest, TokenPairResponse, UserProfile},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::{
    credentials::{CredentialStore, TokenPair},
    transport::{self, ApiClient, RequestFailure},
};

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("credentials rejected: {0}")]
    Rejected(ApiError),
    #[error("signed in but identity lookup failed: {0}")]
    Identity(String),
    #[error("token request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration rejected: {0}")]
    Rejected(ApiError),
    #[error("registration request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ProfileUpdateError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("profile update rejected: {0}")]
    Rejected(ApiError),
    #[error("profile update request failed: {0}")]
    Transport(String),
}

/// Session lifecycle. `Resolving` is entered once at construction and left
/// exactly once by `restore`; nothing transitions back into it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Resolving,
    Authenticated(UserProfile),
    Unauthenticated,
}

impl SessionState {
    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            SessionState::Authenticated(profile) => Some(profile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SignedIn(UserProfile),
    SignedOut,
    ProfileUpdated {
        profile: UserProfile,
        city_changed: bool,
    },
}

/// Owns the session state machine and the persisted-credential lifecycle.
/// All mutations go through here; dependent components subscribe to
/// [`SessionEvent`]s instead of polling.
pub struct SessionManager {
    api: ApiClient,
    credentials: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(api: ApiClient, credentials: Arc<dyn CredentialStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            api,
            credentials,
            state: Mutex::new(SessionState::Resolving),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn current_profile(&self) -> Option<UserProfile> {
        self.state.lock().await.profile().cloned()
    }

    pub async fn is_resolving(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Resolving)
    }

    /// Resolves the persisted session once at boot. Without stored
    /// credentials no network request is made; with stored credentials the
    /// identity endpoint decides. Every failure path is recovered here:
    /// credentials are cleared and the session ends `Unauthenticated`.
    pub async fn restore(&self) {
        {
            let state = self.state.lock().await;
            if !matches!(*state, SessionState::Resolving) {
                warn!("session restore invoked more than once; ignoring");
                return;
            }
        }

        let resolved = self.resolve_persisted_session().await;
        let signed_in = {
            let mut state = self.state.lock().await;
            match resolved {
                Some(profile) => {
                    *state = SessionState::Authenticated(profile.clone());
                    Some(profile)
                }
                None => {
                    *state = SessionState::Unauthenticated;
                    None
                }
            }
        };

        if let Some(profile) = signed_in {
            info!(user_id = profile.id.0, "session restored from persisted credentials");
            let _ = self.events.send(SessionEvent::SignedIn(profile));
        }
    }

    async fn resolve_persisted_session(&self) -> Option<UserProfile> {
        let tokens = match self.credentials.load().await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!("failed to read persisted credentials: {err:#}");
                return None;
            }
        };
        if tokens.is_none() {
            return None;
        }

        match self.fetch_identity().await {
            Ok(profile) => Some(profile),
            Err(failure) => {
                warn!("persisted session rejected; clearing credentials: {failure}");
                if let Err(err) = self.credentials.clear().await {
                    error!("failed to clear rejected credentials: {err:#}");
                }
                None
            }
        }
    }

    /// Exchanges credentials for a token pair, persists it, then resolves the
    /// identity the same way `restore` does. A rejected exchange persists
    /// nothing; a failed identity lookup rolls the persisted pair back.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserProfile, AuthenticationError> {
        let response = self
            .api
            .http()
            .post(self.api.url("token/"))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .map_err(|err| AuthenticationError::Transport(err.to_string()))?;
        let tokens: TokenPairResponse =
            transport::decode_json(response).await.map_err(|failure| match failure {
                RequestFailure::Rejected(api_error) => AuthenticationError::Rejected(api_error),
                RequestFailure::Transport(message) => AuthenticationError::Transport(message),
            })?;

        self.credentials
            .store(&TokenPair {
                access: tokens.access,
                refresh: tokens.refresh,
            })
            .await
            .map_err(|err| {
                AuthenticationError::Transport(format!("failed to persist credentials: {err:#}"))
            })?;

        let profile = match self.fetch_identity().await {
            Ok(profile) => profile,
            Err(failure) => {
                if let Err(err) = self.credentials.clear().await {
                    error!("failed to clear credentials after identity failure: {err:#}");
                }
                let mut state = self.state.lock().await;
                if !matches!(*state, SessionState::Resolving) {
                    *state = SessionState::Unauthenticated;
                }
                return Err(AuthenticationError::Identity(failure.to_string()));
            }
        };

        {
            let mut state = self.state.lock().await;
            *state = SessionState::Authenticated(profile.clone());
        }
        info!(user_id = profile.id.0, "signed in");
        let _ = self.events.send(SessionEvent::SignedIn(profile.clone()));
        Ok(profile)
    }

    /// Creates an account. Never establishes a session and never touches the
    /// persisted credentials; the caller signs in separately.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        city: Option<String>,
    ) -> Result<(), RegistrationError> {
        let response = self
            .api
            .http()
            .post(self.api.url("users/"))
            .json(&RegisterRequest {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                city: city.filter(|city| !city.is_empty()),
            })
            .send()
            .await
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;

        let _created: UserProfile =
            transport::decode_json(response).await.map_err(|failure| match failure {
                RequestFailure::Rejected(api_error) => RegistrationError::Rejected(api_error),
                RequestFailure::Transport(message) => RegistrationError::Transport(message),
            })?;
        info!(email, "account registered");
        Ok(())
    }

    /// Drops the session locally: clears the persisted pair and transitions
    /// to `Unauthenticated`. No network call; a storage failure is logged and
    /// the in-memory sign-out still happens.
    pub async fn logout(&self) {
        if let Err(err) = self.credentials.clear().await {
            error!("failed to clear persisted credentials on logout: {err:#}");
        }
        {
            let mut state = self.state.lock().await;
            *state = SessionState::Unauthenticated;
        }
        info!("signed out");
        let _ = self.events.send(SessionEvent::SignedOut);
    }

    /// Sends a partial profile update and replaces the local profile
    /// wholesale with the server's representation, so server-side
    /// normalization is never shadowed by a local merge.
    pub async fn update_profile(
        &self,
        update: ProfileUpdate,
    ) -> Result<UserProfile, ProfileUpdateError> {
        let previous_city = {
            let state = self.state.lock().await;
            match state.profile() {
                Some(profile) => profile.city.clone(),
                None => return Err(ProfileUpdateError::NotAuthenticated),
            }
        };

        let request = self
            .api
            .bearer_request(Method::PATCH, "users/me/")
            .await
            .map_err(|failure| ProfileUpdateError::Transport(failure.to_string()))?;
        let response = request
            .json(&update)
            .send()
            .await
            .map_err(|err| ProfileUpdateError::Transport(err.to_string()))?;
        let profile: UserProfile =
            transport::decode_json(response).await.map_err(|failure| match failure {
                RequestFailure::Rejected(api_error) => ProfileUpdateError::Rejected(api_error),
                RequestFailure::Transport(message) => ProfileUpdateError::Transport(message),
            })?;

        let city_changed = previous_city != profile.city;
        {
            let mut state = self.state.lock().await;
            *state = SessionState::Authenticated(profile.clone());
        }
        info!(user_id = profile.id.0, city_changed, "profile updated");
        let _ = self.events.send(SessionEvent::ProfileUpdated {
            profile: profile.clone(),
            city_changed,
        });
        Ok(profile)
    }

    async fn fetch_identity(&self) -> Result<UserProfile, RequestFailure> {
        let request = self.api.bearer_get("users/me/").await?;
        let response = request.send().await?;
        transport::decode_json(response).await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
