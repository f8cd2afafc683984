//! Campaign endpoints.

use reqwest::multipart::Form;
use serde_json::Value;

use crate::api::{self, ApiClient, Body};
use crate::errors::{ClientError, Result};
use crate::models::{Campaign, CampaignId, NewCampaign};

/// `GET /campaigns/campaign/search/?search=`
pub async fn search(api: &ApiClient, term: &str) -> Result<Vec<Campaign>> {
    let body = api
        .get("/campaigns/campaign/search/", &[("search", term.to_string())])
        .await?;
    api::decode(body, "campaign search")
}

/// `GET /campaigns/create/`, the dashboard listing.
pub async fn list(api: &ApiClient) -> Result<Vec<Campaign>> {
    let body = api.get("/campaigns/create/", &[]).await?;
    api::decode(body, "campaign list")
}

/// `GET /campaigns/campaign/{id}/progress/`
pub async fn progress(api: &ApiClient, id: CampaignId) -> Result<Campaign> {
    let body = api
        .get(&format!("/campaigns/campaign/{id}/progress/"), &[])
        .await?;
    api::decode(body, "campaign progress")
}

/// `POST /campaigns/create/` as multipart.
pub async fn create(api: &ApiClient, campaign: &NewCampaign) -> Result<Value> {
    validate(campaign)?;

    let mut form = Form::new();
    form = api::text_field(form, "title", campaign.title.trim());
    form = api::text_field(form, "description", campaign.description.trim());
    form = api::text_field(form, "goal_amount", &campaign.goal_amount.to_string());
    form = api::text_field(form, "interest_rate", &campaign.interest_rate.to_string());
    form = api::text_field(
        form,
        "repayment_period",
        &campaign.repayment_period.to_string(),
    );
    form = api::file_field(form, "image", campaign.image.as_deref()).await?;
    form = api::file_field(form, "cac_d_img", campaign.cac_d_img.as_deref()).await?;

    api.post("/campaigns/create/", Body::Multipart(form)).await
}

/// Checks the form's required fields are filled in.
fn validate(campaign: &NewCampaign) -> Result<()> {
    if campaign.title.trim().is_empty() {
        return Err(ClientError::Validation("Campaign title is required.".into()));
    }
    if campaign.description.trim().is_empty() {
        return Err(ClientError::Validation("Description is required.".into()));
    }
    if campaign.goal_amount <= rust_decimal::Decimal::ZERO {
        return Err(ClientError::Validation(
            "Goal amount must be greater than zero.".into(),
        ));
    }
    if campaign.interest_rate.is_sign_negative() {
        return Err(ClientError::Validation(
            "Interest rate cannot be negative.".into(),
        ));
    }
    if campaign.repayment_period == 0 {
        return Err(ClientError::Validation(
            "Repayment period must be at least one month.".into(),
        ));
    }
    Ok(())
}
