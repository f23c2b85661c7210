use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;
use validator::Validate;

use application::{LoginRequest, RegisterUserRequest};
use domain::{ChatDetails, ChatId, UserId, UserProfile};

use crate::{auth::AuthUser, error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default)]
struct RegisterPayload {
    #[validate(length(min = 1, message = "email is required"))]
    email: String,
    #[validate(length(min = 1, message = "password is required"))]
    password: String,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default)]
struct LoginPayload {
    #[validate(length(min = 1, message = "email is required"))]
    email: String,
    #[validate(length(min = 1, message = "password is required"))]
    password: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
struct StartChatPayload {
    #[validate(required(message = "receiverId is required"))]
    receiver_id: Option<String>,
}

impl StartChatPayload {
    fn receiver(&self) -> Result<UserId, ApiError> {
        self.validate()
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        self.receiver_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(UserId::from)
            .ok_or_else(|| ApiError::bad_request("receiverId must be a UUID"))
    }
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    message: &'static str,
    user: UserProfile,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register_user))
        .route("/auth/login", post(login_user))
        .route("/auth/logout", post(logout_user))
        .route("/auth/user", get(current_user))
        .route("/users", get(list_users))
        .route("/chats", get(list_chats).post(start_chat))
        .route("/chats/{chat_id}", get(get_chat))
}

/// 按配置生成 CORS 层。`*` 表示任意来源，此时不允许携带凭据。
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(Any);
    }

    let origins = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    base.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let user = state
        .user_service
        .register(RegisterUserRequest {
            email: payload.email,
            password: payload.password,
            name: payload.name,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User created successfully",
            user,
        }),
    ))
}

async fn login_user(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginPayload>,
) -> Result<(CookieJar, Json<AuthResponse>), ApiError> {
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let (user, token) = state
        .user_service
        .login(LoginRequest {
            email: payload.email,
            password: payload.password,
        })
        .await?;

    let jar = jar.add(state.auth_gate.session_cookie(token));
    Ok((
        jar,
        Json(AuthResponse {
            message: "Login successful",
            user,
        }),
    ))
}

async fn logout_user(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<MessageResponse>) {
    let jar = jar.add(state.auth_gate.expired_cookie());
    (
        jar,
        Json(MessageResponse {
            message: "Logged out successfully",
        }),
    )
}

async fn current_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> Result<Json<UserProfile>, ApiError> {
    let user = state.user_service.current_user(principal).await?;
    Ok(Json(user))
}

async fn list_users(
    State(state): State<AppState>,
    AuthUser(_principal): AuthUser,
) -> Result<Json<Vec<UserProfile>>, ApiError> {
    let users = state.user_service.list_users().await?;
    Ok(Json(users))
}

async fn list_chats(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> Result<Json<Vec<ChatDetails>>, ApiError> {
    let chats = state.engine.list_chats(principal).await?;
    Ok(Json(chats))
}

async fn start_chat(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(payload): Json<StartChatPayload>,
) -> Result<Json<ChatDetails>, ApiError> {
    let receiver_id = payload.receiver()?;
    let chat = state.engine.start_chat(principal, receiver_id).await?;
    Ok(Json(chat))
}

async fn get_chat(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<ChatDetails>, ApiError> {
    let chat = state
        .engine
        .get_chat(principal, ChatId::from(chat_id))
        .await?;
    Ok(Json(chat))
}

/// 认证在升级之前完成，失败直接返回 401。
async fn websocket_upgrade(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| WebSocketConnection::new(state, principal).run(socket))
}
