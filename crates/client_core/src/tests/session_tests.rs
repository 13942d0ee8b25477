use super::*;
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::UserId;
use tokio::net::TcpListener;

#[derive(Default)]
struct MemoryCredentialStore {
    tokens: Mutex<Option<TokenPair>>,
}

impl MemoryCredentialStore {
    fn with_tokens(access: &str, refresh: &str) -> Self {
        Self {
            tokens: Mutex::new(Some(TokenPair {
                access: access.to_string(),
                refresh: refresh.to_string(),
            })),
        }
    }

    async fn current(&self) -> Option<TokenPair> {
        self.tokens.lock().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn store(&self, tokens: &TokenPair) -> Result<()> {
        *self.tokens.lock().await = Some(tokens.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.tokens.lock().await = None;
        Ok(())
    }
}

#[derive(Clone)]
struct AuthServerState {
    valid_access: Arc<Mutex<Option<String>>>,
    profile: Arc<Mutex<UserProfile>>,
    identity_requests: Arc<Mutex<u32>>,
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
    reject_identity: Arc<Mutex<bool>>,
}

fn sample_profile() -> UserProfile {
    UserProfile {
        id: UserId(7),
        name: "Alice".to_string(),
        email: "alice@example.com".to_string(),
        city: Some("London".to_string()),
    }
}

impl AuthServerState {
    fn new() -> Self {
        Self {
            valid_access: Arc::new(Mutex::new(None)),
            profile: Arc::new(Mutex::new(sample_profile())),
            identity_requests: Arc::new(Mutex::new(0)),
            registrations: Arc::new(Mutex::new(Vec::new())),
            reject_identity: Arc::new(Mutex::new(false)),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn issue_token(
    State(state): State<AuthServerState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenPairResponse>, (StatusCode, Json<serde_json::Value>)> {
    if request.email != "alice@example.com" || request.password != "correct-horse" {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        ));
    }
    let access = "issued-access".to_string();
    *state.valid_access.lock().await = Some(access.clone());
    Ok(Json(TokenPairResponse {
        access,
        refresh: "issued-refresh".to_string(),
    }))
}

async fn current_identity(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, (StatusCode, Json<serde_json::Value>)> {
    *state.identity_requests.lock().await += 1;
    let valid = state.valid_access.lock().await.clone();
    let authorized = !*state.reject_identity.lock().await
        && valid.is_some()
        && bearer_token(&headers) == valid;
    if !authorized {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Given token not valid for any token type"})),
        ));
    }
    Ok(Json(state.profile.lock().await.clone()))
}

async fn patch_identity(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<UserProfile>, (StatusCode, Json<serde_json::Value>)> {
    let valid = state.valid_access.lock().await.clone();
    if valid.is_none() || bearer_token(&headers) != valid {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Given token not valid for any token type"})),
        ));
    }
    let mut profile = state.profile.lock().await;
    if let Some(name) = update.name {
        // The server normalizes; the client must take this representation
        // wholesale rather than merging its own input.
        profile.name = name.trim().to_string();
    }
    if let Some(city) = update.city {
        profile.city = Some(city.trim().to_string());
    }
    Ok(Json(profile.clone()))
}

async fn create_user(
    State(state): State<AuthServerState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<UserProfile>, (StatusCode, Json<serde_json::Value>)> {
    if request.email == "taken@example.com" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "user with this email already exists."})),
        ));
    }
    let created = UserProfile {
        id: UserId(99),
        name: request.name.clone(),
        email: request.email.clone(),
        city: request.city.clone(),
    };
    state.registrations.lock().await.push(request);
    Ok(Json(created))
}

async fn spawn_auth_server() -> Result<(String, AuthServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AuthServerState::new();
    let app = Router::new()
        .route("/token/", post(issue_token))
        .route("/users/", post(create_user))
        .route("/users/me/", get(current_identity).patch(patch_identity))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn session_with_store(
    server_url: &str,
    store: Arc<MemoryCredentialStore>,
) -> Arc<SessionManager> {
    let api = ApiClient::new(server_url, store.clone() as Arc<dyn CredentialStore>)
        .expect("api client");
    SessionManager::new(api, store)
}

#[tokio::test]
async fn restore_without_stored_tokens_makes_no_identity_request() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store);

    session.restore().await;

    assert_eq!(session.state().await, SessionState::Unauthenticated);
    assert!(!session.is_resolving().await);
    assert_eq!(*server.identity_requests.lock().await, 0);
}

#[tokio::test]
async fn restore_with_rejected_token_clears_credentials() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::with_tokens("expired", "expired-r"));
    let session = session_with_store(&server_url, store.clone());

    session.restore().await;

    assert_eq!(session.state().await, SessionState::Unauthenticated);
    assert_eq!(store.current().await, None);
    assert_eq!(*server.identity_requests.lock().await, 1);
}

#[tokio::test]
async fn restore_with_valid_token_signs_in() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    *server.valid_access.lock().await = Some("stored-access".to_string());
    let store = Arc::new(MemoryCredentialStore::with_tokens(
        "stored-access",
        "stored-refresh",
    ));
    let session = session_with_store(&server_url, store.clone());
    let mut events = session.subscribe();

    session.restore().await;

    assert_eq!(
        session.current_profile().await.map(|profile| profile.id),
        Some(UserId(7))
    );
    assert!(!session.is_resolving().await);
    match events.try_recv().expect("signed-in event") {
        SessionEvent::SignedIn(profile) => assert_eq!(profile.email, "alice@example.com"),
        other => panic!("unexpected event: {other:?}"),
    }
    // Credentials stay untouched on the success path.
    assert!(store.current().await.is_some());
}

#[tokio::test]
async fn second_restore_is_ignored() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());

    session.restore().await;
    store
        .store(&TokenPair {
            access: "late".to_string(),
            refresh: "late-r".to_string(),
        })
        .await
        .expect("seed tokens");
    session.restore().await;

    assert_eq!(session.state().await, SessionState::Unauthenticated);
    assert_eq!(*server.identity_requests.lock().await, 0);
}

#[tokio::test]
async fn login_persists_tokens_and_resolves_identity() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());
    session.restore().await;

    let profile = session
        .login("alice@example.com", "correct-horse")
        .await
        .expect("login");

    assert_eq!(profile.name, "Alice");
    assert_eq!(session.state().await, SessionState::Authenticated(profile));
    let tokens = store.current().await.expect("persisted tokens");
    assert_eq!(tokens.access, "issued-access");
    assert_eq!(tokens.refresh, "issued-refresh");
}

#[tokio::test]
async fn rejected_login_persists_nothing() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());
    session.restore().await;

    let err = session
        .login("alice@example.com", "wrong-password")
        .await
        .expect_err("must fail");

    assert!(matches!(err, AuthenticationError::Rejected(_)));
    assert_eq!(store.current().await, None);
    assert_eq!(session.state().await, SessionState::Unauthenticated);
}

#[tokio::test]
async fn login_identity_failure_rolls_back_persisted_tokens() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    *server.reject_identity.lock().await = true;
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());
    session.restore().await;

    let err = session
        .login("alice@example.com", "correct-horse")
        .await
        .expect_err("must fail");

    assert!(matches!(err, AuthenticationError::Identity(_)));
    assert_eq!(store.current().await, None);
    assert_eq!(session.state().await, SessionState::Unauthenticated);
}

#[tokio::test]
async fn logout_clears_tokens_and_emits_signed_out() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());
    session.restore().await;
    session
        .login("alice@example.com", "correct-horse")
        .await
        .expect("login");
    let mut events = session.subscribe();

    session.logout().await;

    assert_eq!(session.state().await, SessionState::Unauthenticated);
    assert_eq!(store.current().await, None);
    assert!(matches!(
        events.try_recv().expect("event"),
        SessionEvent::SignedOut
    ));
}

#[tokio::test]
async fn register_never_touches_session_or_credentials() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store.clone());
    session.restore().await;

    session
        .register("Bob", "bob@example.com", "hunter22", Some(String::new()))
        .await
        .expect("register");

    assert_eq!(session.state().await, SessionState::Unauthenticated);
    assert_eq!(store.current().await, None);
    let registrations = server.registrations.lock().await;
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].email, "bob@example.com");
    // An empty city is omitted from the payload rather than sent blank.
    assert_eq!(registrations[0].city, None);
}

#[tokio::test]
async fn duplicate_email_registration_surfaces_rejection() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store);

    let err = session
        .register("Mallory", "taken@example.com", "hunter22", None)
        .await
        .expect_err("must fail");

    match err {
        RegistrationError::Rejected(api_error) => {
            assert!(api_error.message.contains("already exists"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn update_profile_requires_authenticated_session() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store);
    session.restore().await;

    let err = session
        .update_profile(ProfileUpdate {
            city: Some("Paris".to_string()),
            ..Default::default()
        })
        .await
        .expect_err("must fail");

    assert!(matches!(err, ProfileUpdateError::NotAuthenticated));
}

#[tokio::test]
async fn update_profile_replaces_profile_and_flags_city_change() {
    let (server_url, _server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store);
    session.restore().await;
    session
        .login("alice@example.com", "correct-horse")
        .await
        .expect("login");
    let mut events = session.subscribe();

    let updated = session
        .update_profile(ProfileUpdate {
            city: Some("  Paris  ".to_string()),
            ..Default::default()
        })
        .await
        .expect("update");

    // The server trimmed the value; the local profile must match it exactly.
    assert_eq!(updated.city.as_deref(), Some("Paris"));
    match events.try_recv().expect("event") {
        SessionEvent::ProfileUpdated { city_changed, .. } => assert!(city_changed),
        other => panic!("unexpected event: {other:?}"),
    }

    let updated = session
        .update_profile(ProfileUpdate {
            name: Some("Alicia".to_string()),
            ..Default::default()
        })
        .await
        .expect("update");
    assert_eq!(updated.name, "Alicia");
    assert_eq!(updated.city.as_deref(), Some("Paris"));
    match events.try_recv().expect("event") {
        SessionEvent::ProfileUpdated { city_changed, .. } => assert!(!city_changed),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_update_leaves_prior_profile_untouched() {
    let (server_url, server) = spawn_auth_server().await.expect("spawn server");
    let store = Arc::new(MemoryCredentialStore::default());
    let session = session_with_store(&server_url, store);
    session.restore().await;
    let before = session
        .login("alice@example.com", "correct-horse")
        .await
        .expect("login");

    // Invalidate the token server-side so the PATCH is rejected.
    *server.valid_access.lock().await = Some("rotated-elsewhere".to_string());
    let err = session
        .update_profile(ProfileUpdate {
            city: Some("Paris".to_string()),
            ..Default::default()
        })
        .await
        .expect_err("must fail");

    assert!(matches!(err, ProfileUpdateError::Rejected(_)));
    assert_eq!(session.current_profile().await, Some(before));
}
