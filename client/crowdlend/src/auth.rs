//! Login, registration, refresh and logout.
//!
//! Credential-issuing endpoints are called without a bearer header so a
//! stale access token cannot get them rejected.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::multipart::Form;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::{self, ApiClient, Auth, Body};
use crate::errors::Result;
use crate::models::{AccessToken, Credentials, Registration, TokenPair};
use crate::session::{self, SessionKey};

/// `POST /users/login/`; stores both credentials on success.
pub async fn login(api: &ApiClient, credentials: &Credentials) -> Result<TokenPair> {
    let body = api
        .post_with("/users/login/", Body::json(credentials)?, Auth::Anonymous)
        .await?;
    let tokens: TokenPair = api::decode(body, "login response")?;
    session::store_tokens(api.session().as_ref(), &tokens).await?;
    info!("Logged in as {}", credentials.username);
    Ok(tokens)
}

/// `POST /users/register/` as multipart. Empty optional fields are omitted.
pub async fn register(api: &ApiClient, registration: &Registration) -> Result<Value> {
    let mut form = Form::new();
    form = api::text_field(form, "username", &registration.username);
    form = api::text_field(form, "first_name", &registration.first_name);
    form = api::text_field(form, "last_name", &registration.last_name);
    form = api::text_field(form, "email", &registration.email);
    form = api::text_field(form, "password", &registration.password);
    form = api::text_field(form, "bank_name", &registration.bank_name);
    form = api::text_field(form, "account_number", &registration.account_number);
    form = api::text_field(form, "user_type", registration.user_type.as_str());
    form = api::text_field(form, "bvn", registration.bvn.as_deref().unwrap_or_default());
    form = api::file_field(
        form,
        "identity_document",
        registration.identity_document.as_deref(),
    )
    .await?;

    api.post_with("/users/register/", Body::Multipart(form), Auth::Anonymous)
        .await
}

/// Exchange the stored refresh credential for a new access credential.
///
/// Returns `Ok(None)` when no refresh credential is stored. A rejected
/// refresh clears the whole session before the error is returned.
pub async fn refresh_access_token(api: &ApiClient) -> Result<Option<String>> {
    let store = api.session();
    let Some(refresh) = store.get(SessionKey::Refresh).await? else {
        return Ok(None);
    };

    let outcome = async {
        let body = api
            .post_with(
                "/users/refresh/",
                Body::Json(json!({ "refresh": refresh })),
                Auth::Anonymous,
            )
            .await?;
        api::decode::<AccessToken>(body, "refresh response")
    }
    .await;

    match outcome {
        Ok(token) => {
            store.set(SessionKey::Access, &token.access).await?;
            Ok(Some(token.access))
        }
        Err(e) => {
            warn!("Token refresh failed, clearing session: {e}");
            store.clear().await?;
            Err(e)
        }
    }
}

pub async fn logout(api: &ApiClient) -> Result<()> {
    api.session().clear().await?;
    info!("Logged out");
    Ok(())
}

/// Read the `exp` claim from a JWT without verifying its signature.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}
