//! Auth & Session Bootstrap REST endpoints — §4.9.
//!
//! Username/password login against the bcrypt-hashed user store, issuing the
//! JWT the gateway and REST admin surface both trust.

use crate::auth::{
    jwt::JwtHandler,
    middleware::extract_claims,
    models::{CreateUserRequest, LoginRequest, LoginResponse, UserResponse, UserRole},
    user_store::UserStore,
};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared auth state threaded through the REST router.
#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub jwt_handler: Arc<JwtHandler>,
}

impl AuthState {
    pub fn new(user_store: Arc<UserStore>, jwt_handler: Arc<JwtHandler>) -> Self {
        Self { user_store, jwt_handler }
    }
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    info!(username = %payload.username, "login attempt");

    let valid = state
        .user_store
        .verify_password(&payload.username, &payload.password)
        .map_err(|_| AuthApiError::InternalError)?;

    if !valid {
        warn!(username = %payload.username, "failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    }

    let user = state
        .user_store
        .get_user_by_username(&payload.username)
        .map_err(|_| AuthApiError::InternalError)?
        .ok_or(AuthApiError::InvalidCredentials)?;

    let (token, expires_in) = state
        .jwt_handler
        .generate_token(&user)
        .map_err(|_| AuthApiError::InternalError)?;

    info!(username = %user.username, role = user.role.as_str(), "login successful");

    Ok(Json(LoginResponse {
        token,
        expires_in,
        role: user.role.clone(),
        user: UserResponse::from_user(&user),
    }))
}

/// `GET /api/auth/me` — resolves from the JWT claims already attached by the
/// auth middleware, no store round-trip needed.
pub async fn get_current_user(req: Request) -> Result<Json<LoginResponse>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;

    Ok(Json(LoginResponse {
        token: String::new(),
        expires_in: 0,
        role: claims.role.clone(),
        user: UserResponse {
            id: claims.sub.clone(),
            username: claims.username.clone(),
            role: claims.role.clone(),
            created_at: String::new(),
        },
    }))
}

/// `GET /api/admin/users` (admin only)
pub async fn list_users(State(state): State<AuthState>, req: Request) -> Result<Json<Vec<UserResponse>>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }

    let users = state.user_store.list_users().map_err(|_| AuthApiError::InternalError)?;
    Ok(Json(users.iter().map(UserResponse::from_user).collect()))
}

/// `POST /api/admin/users` (admin only)
pub async fn create_user(
    State(state): State<AuthState>,
    req: Request,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }
    if payload.password.len() < 8 {
        return Err(AuthApiError::WeakPassword);
    }

    let user = state
        .user_store
        .create_user(&payload.username, &payload.password, payload.role)
        .map_err(|e| {
            warn!(error = %e, "failed to create user");
            AuthApiError::UserAlreadyExists
        })?;

    info!(username = %user.username, role = user.role.as_str(), "user created");
    Ok(Json(UserResponse::from_user(&user)))
}

/// `DELETE /api/admin/users/:id` (admin only)
pub async fn delete_user(
    State(state): State<AuthState>,
    req: Request,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }

    let uuid = Uuid::parse_str(&user_id).map_err(|_| AuthApiError::InvalidUserId)?;
    if uuid.to_string() == claims.sub {
        return Err(AuthApiError::CannotDeleteSelf);
    }

    state.user_store.delete_user(&uuid).map_err(|_| AuthApiError::UserNotFound)?;
    info!(user_id = %user_id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    Unauthorized,
    Forbidden,
    UserNotFound,
    UserAlreadyExists,
    WeakPassword,
    InvalidUserId,
    CannotDeleteSelf,
    InternalError,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "Invalid username or password"),
            AuthApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthApiError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient permissions"),
            AuthApiError::UserNotFound => (StatusCode::NOT_FOUND, "User not found"),
            AuthApiError::UserAlreadyExists => (StatusCode::CONFLICT, "Username already exists"),
            AuthApiError::WeakPassword => (StatusCode::BAD_REQUEST, "Password must be at least 8 characters"),
            AuthApiError::InvalidUserId => (StatusCode::BAD_REQUEST, "Invalid user id format"),
            AuthApiError::CannotDeleteSelf => (StatusCode::BAD_REQUEST, "Cannot delete your own account"),
            AuthApiError::InternalError => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::User;
    use chrono::Utc;

    #[test]
    fn user_response_omits_password_hash() {
        let user = User {
            id: Uuid::new_v4(),
            username: "testuser".to_string(),
            password_hash: "hash123".to_string(),
            role: UserRole::Trader,
            api_key: None,
            created_at: Utc::now().to_rfc3339(),
        };
        let response = UserResponse::from_user(&user);
        assert_eq!(response.username, "testuser");
        assert_eq!(response.role, UserRole::Trader);
    }

    #[test]
    fn error_responses_map_to_expected_status_codes() {
        assert_eq!(AuthApiError::InvalidCredentials.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthApiError::Forbidden.into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthApiError::UserNotFound.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(AuthApiError::UserAlreadyExists.into_response().status(), StatusCode::CONFLICT);
    }
}
