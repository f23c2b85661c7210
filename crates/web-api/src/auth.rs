//! 认证闸门
//!
//! 从 `Cookie` 头读取签名令牌并交给 `TokenService` 校验。HTTP 路由通过
//! `AuthUser` 提取器使用，WebSocket 握手在升级之前使用同一个闸门。

use std::sync::Arc;

use application::{ApplicationError, Principal, TokenService};
use axum::{
    extract::FromRequestParts,
    http::{header::COOKIE, request::Parts, HeaderMap},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use config::JwtConfig;

use crate::{error::ApiError, state::AppState};

pub struct AuthGate {
    token_service: Arc<dyn TokenService>,
    cookie_name: String,
    max_age_hours: i64,
    secure_cookie: bool,
}

impl AuthGate {
    pub fn new(token_service: Arc<dyn TokenService>, config: &JwtConfig) -> Self {
        Self {
            token_service,
            cookie_name: config.cookie_name.clone(),
            max_age_hours: config.expiration_hours,
            secure_cookie: config.secure_cookie,
        }
    }

    /// 校验原始 `Cookie` 头。
    ///
    /// 缺少头或缺少认证 cookie 返回 `Unauthenticated`；签名无效或已过期返回
    /// `InvalidCredential`。
    pub fn authenticate_connection(
        &self,
        cookie_header: Option<&str>,
    ) -> Result<Principal, ApplicationError> {
        let header = cookie_header.ok_or(ApplicationError::Unauthenticated)?;
        let token = Cookie::split_parse(header)
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == self.cookie_name)
            .map(|cookie| cookie.value().to_owned())
            .filter(|value| !value.is_empty())
            .ok_or(ApplicationError::Unauthenticated)?;

        let claims = self.token_service.verify(&token).map_err(|err| {
            tracing::debug!(error = %err, "credential rejected");
            ApplicationError::InvalidCredential
        })?;
        Ok(Principal::new(claims.sub))
    }

    /// 多个 `Cookie` 头按 `; ` 合并后再校验。
    pub fn authenticate_headers(&self, headers: &HeaderMap) -> Result<Principal, ApplicationError> {
        let joined = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");
        let header = (!joined.is_empty()).then_some(joined.as_str());
        self.authenticate_connection(header)
    }

    /// 登录成功后下发的认证 cookie
    pub fn session_cookie(&self, token: String) -> Cookie<'static> {
        Cookie::build((self.cookie_name.clone(), token))
            .http_only(true)
            .same_site(SameSite::Strict)
            .path("/")
            .secure(self.secure_cookie)
            .max_age(time::Duration::hours(self.max_age_hours))
            .build()
    }

    /// 覆盖认证 cookie 并立即过期。
    pub fn expired_cookie(&self) -> Cookie<'static> {
        Cookie::build((self.cookie_name.clone(), String::new()))
            .http_only(true)
            .same_site(SameSite::Strict)
            .path("/")
            .secure(self.secure_cookie)
            .max_age(time::Duration::ZERO)
            .build()
    }
}

/// 已认证的调用方，用于需要登录的路由。
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Principal);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let principal = state.auth_gate.authenticate_headers(&parts.headers)?;
        Ok(AuthUser(principal))
    }
}
