//! JWT 认证
//!
//! REST 端点从 `Authorization: Bearer` 头取 token；
//! WebSocket 连接把 token 作为凭据交给实时核心，由 `JwtAuthenticator` 校验。

use application::{AuthFailure, Authenticator, Credential};
use async_trait::async_trait;
use axum::http::HeaderMap;
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.config.expiration_hours);
        let claims = Claims {
            user_id: user_id.as_uuid(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("token generation failed: {err}")))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
    }

    /// 从 headers 中提取和验证 token
    pub fn extract_user_from_headers(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::unauthorized("missing or malformed authorization header"))?;

        let claims = self
            .verify_token(token)
            .map_err(|err| ApiError::unauthorized(format!("invalid token: {err}")))?;
        Ok(UserId::from(claims.user_id))
    }
}

/// 取 `Authorization: Bearer <token>` 中的 token
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// 以 JWT 为凭据的实时连接认证器
#[derive(Clone)]
pub struct JwtAuthenticator {
    jwt_service: Arc<JwtService>,
}

impl JwtAuthenticator {
    pub fn new(jwt_service: Arc<JwtService>) -> Self {
        Self { jwt_service }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> Result<UserId, AuthFailure> {
        if credential.is_empty() {
            return Err(AuthFailure::MissingCredential);
        }
        match self.jwt_service.verify_token(credential.as_str()) {
            Ok(claims) => Ok(UserId::from(claims.user_id)),
            Err(err) => {
                debug!(error = %err, "JWT 校验失败");
                Err(AuthFailure::InvalidCredential)
            }
        }
    }
}
