//! HTTP route handlers for the sheet API.
//!
//! Every `/api/sheet` handler works on the caller's edit session: the signed-in
//! account (if any) plus the browser's guest id. Responses are JSON; errors
//! are plain-text messages with a matching status code.

use crate::auth::{
    check_password, create_session, current_user, guest_id, GUEST_COOKIE, SESSION_COOKIE,
    SESSION_TTL_HOURS,
};
use crate::error::SessionError;
use crate::models::ViewMode;
use crate::persistence::Identity;
use crate::store::{generate_id, StoreEventKind};
use crate::{AppState, SharedSession};
use axum::{
    extract::{Path, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

// ============================================================================
// Caller Identity
// ============================================================================

/// Who is calling, plus the jar to send back (it may carry a new guest id).
pub struct Caller {
    pub jar: CookieJar,
    pub user: Option<String>,
    pub guest_id: String,
}

impl Caller {
    pub fn identity(&self) -> Identity {
        match &self.user {
            Some(user) => Identity::User(user.clone()),
            None => Identity::Guest,
        }
    }
}

pub fn identify(state: &AppState, jar: CookieJar) -> Caller {
    let user = current_user(&jar, state.secret());
    match guest_id(&jar) {
        Some(id) => Caller {
            jar,
            user,
            guest_id: id,
        },
        None => {
            let id = generate_id();
            let cookie = Cookie::build((GUEST_COOKIE, id.clone()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .permanent();
            Caller {
                jar: jar.add(cookie),
                user,
                guest_id: id,
            }
        }
    }
}

async fn open_session(state: &AppState, jar: CookieJar) -> Result<(CookieJar, SharedSession), Response> {
    let caller = identify(state, jar);
    match state.session_for(caller.identity(), &caller.guest_id).await {
        Ok(session) => Ok((caller.jar, session)),
        Err(e) => {
            tracing::error!(error = %e, "could not open edit session");
            let failure = (StatusCode::INTERNAL_SERVER_ERROR, "Could not open session");
            Err((caller.jar, failure).into_response())
        }
    }
}

pub fn session_error(error: SessionError) -> Response {
    let status = match &error {
        SessionError::DisambiguationPending(_) => StatusCode::CONFLICT,
        SessionError::NoDisambiguation => StatusCode::CONFLICT,
        SessionError::UnknownCandidate(_) => StatusCode::BAD_REQUEST,
        SessionError::EntryNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NotATextSource(_) => StatusCode::BAD_REQUEST,
        SessionError::EmptySource(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SessionError::VersionUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SessionError::EmptyInput(_) => StatusCode::BAD_REQUEST,
        SessionError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Assistant(_) => StatusCode::BAD_GATEWAY,
    };
    (status, error.to_string()).into_response()
}

/// Run a synchronous edit and answer with the refreshed view.
async fn edit<F>(state: &AppState, jar: CookieJar, apply: F) -> Response
where
    F: FnOnce(&mut crate::session::EditSession) -> Result<(), SessionError>,
{
    let (jar, session) = match open_session(state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match apply(&mut *session) {
        Ok(()) => (jar, Json(session.view())).into_response(),
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

// ============================================================================
// Sheet Handlers
// ============================================================================

pub async fn get_sheet(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    edit(&state, jar, |_| Ok(())).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSheetBody {
    pub id: Option<String>,
    #[serde(default)]
    pub is_new: bool,
}

pub async fn load_sheet(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<LoadSheetBody>,
) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.load(body.id.as_deref(), body.is_new).await {
        Ok(outcome) => {
            let body = serde_json::json!({
                "source": outcome.source,
                "error": outcome.error.map(|e| e.to_string()),
                "view": session.view(),
            });
            (jar, Json(body)).into_response()
        }
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

/// Start a blank sheet. Unsaved edits to the current one are written first.
pub async fn new_sheet(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.start_new().await {
        Ok(()) => (jar, Json(session.view())).into_response(),
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

#[derive(Deserialize)]
pub struct TitleBody {
    pub title: String,
}

pub async fn set_title(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<TitleBody>,
) -> Response {
    edit(&state, jar, |session| session.set_title(&body.title)).await
}

// ============================================================================
// Source Handlers
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSourceBody {
    pub citation: String,
    #[serde(default)]
    pub view_mode: ViewMode,
}

pub async fn add_source(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<AddSourceBody>,
) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.add_source(&body.citation, body.view_mode).await {
        Ok(outcome) => {
            let body = serde_json::json!({ "outcome": outcome, "view": session.view() });
            (jar, Json(body)).into_response()
        }
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SelectBody {
    #[serde(rename = "ref")]
    pub reference: String,
}

pub async fn select_candidate(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<SelectBody>,
) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.select_candidate(&body.reference).await {
        Ok(outcome) => {
            let body = serde_json::json!({ "outcome": outcome, "view": session.view() });
            (jar, Json(body)).into_response()
        }
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

pub async fn cancel_disambiguation(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    edit(&state, jar, |session| session.cancel_disambiguation()).await
}

#[derive(Deserialize)]
pub struct NoteBody {
    pub title: Option<String>,
    pub body: String,
}

pub async fn add_note(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<NoteBody>,
) -> Response {
    edit(&state, jar, |session| {
        session.add_note(body.title.as_deref(), &body.body).map(|_| ())
    })
    .await
}

#[derive(Deserialize)]
pub struct HeaderBody {
    pub label: String,
}

pub async fn add_header(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<HeaderBody>,
) -> Response {
    edit(&state, jar, |session| session.add_header(&body.label).map(|_| ())).await
}

pub async fn remove_entry(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Response {
    edit(&state, jar, |session| session.remove_entry(&id).map(|_| ())).await
}

#[derive(Deserialize)]
pub struct MoveBody {
    pub index: usize,
}

pub async fn move_entry(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Response {
    edit(&state, jar, |session| session.move_entry(&id, body.index)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionBody {
    pub version_title: String,
}

pub async fn change_version(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<VersionBody>,
) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.change_version(&id, &body.version_title).await {
        Ok(_) => (jar, Json(session.view())).into_response(),
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewBody {
    pub view_mode: ViewMode,
}

pub async fn set_view_mode(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<ViewBody>,
) -> Response {
    edit(&state, jar, |session| session.set_view_mode(&id, body.view_mode)).await
}

pub async fn undo(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    edit(&state, jar, |session| {
        session.undo();
        Ok(())
    })
    .await
}

pub async fn redo(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    edit(&state, jar, |session| {
        session.redo();
        Ok(())
    })
    .await
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<ChatBody>,
) -> Response {
    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    match session.chat(&body.message).await {
        Ok(reply) => {
            let body = serde_json::json!({ "reply": reply, "view": session.view() });
            (jar, Json(body)).into_response()
        }
        Err(e) => (jar, session_error(e)).into_response(),
    }
}

// ============================================================================
// Account Sheets
// ============================================================================

pub async fn list_sheets(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some(user) = current_user(&jar, state.secret()) else {
        return (StatusCode::UNAUTHORIZED, "Not logged in").into_response();
    };
    match state.store.list(&user).await {
        Ok(sheets) => Json(sheets).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "listing sheets failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Could not list sheets").into_response()
        }
    }
}

/// Destroy one of the caller's sheets. The open sheet resets to a blank one
/// when it is the one being deleted.
pub async fn delete_sheet(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Response {
    let Some(user) = current_user(&jar, state.secret()) else {
        return (StatusCode::UNAUTHORIZED, "Not logged in").into_response();
    };

    match state.store.owner_of(&id).await {
        Ok(Some(owner)) if owner == user => {}
        Ok(Some(_)) => return (StatusCode::FORBIDDEN, "Not your sheet").into_response(),
        Ok(None) => return (StatusCode::NOT_FOUND, "Sheet not found").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ownership lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Could not delete sheet").into_response();
        }
    }

    let (jar, session) = match open_session(&state, jar).await {
        Ok(opened) => opened,
        Err(response) => return response,
    };
    let mut session = session.lock().await;
    let result = if session.sheet().id.as_deref() == Some(id.as_str()) {
        session.delete().await.map_err(|e| e.to_string())
    } else {
        state.store.delete(&id).await.map_err(|e| e.to_string())
    };

    match result {
        Ok(()) => (jar, Json(session.view())).into_response(),
        Err(e) => {
            tracing::error!(%id, error = %e, "delete failed");
            (jar, (StatusCode::INTERNAL_SERVER_ERROR, "Could not delete sheet")).into_response()
        }
    }
}

/// Live feed of the caller's sheet list.
pub async fn sheet_events(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some(user) = current_user(&jar, state.secret()) else {
        return (StatusCode::UNAUTHORIZED, "Not logged in").into_response();
    };

    let subscription = state.store.subscribe(&user);
    let stream = futures_util::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = match event.kind {
            StoreEventKind::Saved(summary) => Event::default()
                .event("saved")
                .json_data(&summary)
                .unwrap_or_else(|_| Event::default().event("saved")),
            StoreEventKind::Deleted(id) => Event::default().event("deleted").data(id),
        };
        Some((Ok::<Event, Infallible>(sse), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ============================================================================
// Auth Handlers
// ============================================================================

#[derive(Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

pub async fn login_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Response {
    let (Some(secret), Some(password)) = (state.secret(), state.config.password.as_deref()) else {
        return (StatusCode::NOT_FOUND, "Accounts are not enabled").into_response();
    };
    let username = body.username.trim();
    if username.is_empty() {
        return (StatusCode::BAD_REQUEST, "Username required").into_response();
    }

    {
        let mut limit = state
            .login_rate_limit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if limit.is_locked() {
            return (StatusCode::TOO_MANY_REQUESTS, "Too many attempts, try again later")
                .into_response();
        }
        if !check_password(password, &body.password) {
            limit.record_failure();
            tracing::warn!(failures = limit.failures, "failed login");
            return (StatusCode::UNAUTHORIZED, "Invalid password").into_response();
        }
        limit.reset();
    }

    let Some(token) = create_session(secret, username) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session").into_response();
    };
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE,
        token,
        SESSION_TTL_HOURS * 3600
    );
    let Ok(value) = HeaderValue::from_str(&cookie) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session").into_response();
    };

    tracing::info!(user = username, "signed in");
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, value);
    (headers, Json(serde_json::json!({ "user": username }))).into_response()
}

pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Some(id) = guest_id(&jar) {
        state.drop_sessions(&id).await;
    }

    let cookie = format!("{}=; Path=/; HttpOnly; Secure; Max-Age=0", SESSION_COOKIE);
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, HeaderValue::from_str(&cookie).unwrap_or(HeaderValue::from_static("")));

    (headers, StatusCode::NO_CONTENT).into_response()
}

// ============================================================================
// Tests
// ============================================================================
