//! Current-user and withdrawal endpoints.

use tracing::info;

use crate::api::{self, ApiClient, Body};
use crate::errors::Result;
use crate::models::{User, WithdrawReceipt, WithdrawRequest};
use crate::payment::parse_amount;

/// `GET /users/me/`
pub async fn me(api: &ApiClient) -> Result<User> {
    let body = api.get("/users/me/", &[]).await?;
    api::decode(body, "current user")
}

/// `POST /users/withdraw/`. `raw_amount` is validated before sending.
pub async fn withdraw(api: &ApiClient, raw_amount: &str) -> Result<WithdrawReceipt> {
    let amount = parse_amount(raw_amount)?;
    let body = api
        .post("/users/withdraw/", Body::json(&WithdrawRequest { amount })?)
        .await?;
    let receipt: WithdrawReceipt = api::decode(body, "withdraw response")?;
    info!("Withdrew {amount}; new balance {}", receipt.new_balance);
    Ok(receipt)
}
