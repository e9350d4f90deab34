//! 身份中间件：从网关注入的 `X-User-Id` 头解析当前用户。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, Request};
use axum::middleware;
use uuid::Uuid;

use crate::config::USER_ID_HEADER;
use crate::error::ApiError;

/// 已通过上游网关认证的用户。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

/// 解析用户头；缺失或格式错误时返回 `None`。
pub fn user_from_headers(headers: &HeaderMap) -> Option<CurrentUser> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| Uuid::parse_str(value).ok())
        .filter(|id| !id.is_nil())
        .map(CurrentUser)
}

/// 认证中间件：把当前用户写入请求扩展，未识别身份的请求返回 401。
pub async fn identity_middleware(
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let user = user_from_headers(req.headers()).ok_or(ApiError::Unauthenticated)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
