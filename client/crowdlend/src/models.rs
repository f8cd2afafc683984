//! Wire types exchanged with the Crowdlend backend.
//!
//! The backend serialises decimal fields as JSON strings (`"5000.00"`) and
//! computed percentages as numbers; [`Decimal`] accepts both.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

pub type CampaignId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Founder,
    Lender,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Founder => "founder",
            Self::Lender => "lender",
        }
    }
}

/// `GET /users/me/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub user_type: UserType,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub balance: Decimal,
}

impl User {
    pub fn is_founder(&self) -> bool {
        self.user_type == UserType::Founder
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// A campaign's founder, sent either as a bare id or as a nested user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FounderRef {
    Id(UserId),
    User { id: UserId },
}

impl FounderRef {
    pub fn id(&self) -> UserId {
        match self {
            Self::Id(id) | Self::User { id } => *id,
        }
    }
}

/// Instalment summary for a funded campaign. Empty (`{}`) until funded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonthlyDueInfo {
    #[serde(default)]
    pub monthly_repayment: Option<Decimal>,
    #[serde(default)]
    pub installments_due: Option<u32>,
    #[serde(default)]
    pub installments_paid: Option<u32>,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub next_due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_this_month: Option<bool>,
    #[serde(default)]
    pub amount_due: Option<Decimal>,
}

impl MonthlyDueInfo {
    pub fn is_empty(&self) -> bool {
        self.monthly_repayment.is_none() && self.next_due_date.is_none() && self.amount_due.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub goal_amount: Decimal,
    #[serde(default)]
    pub current_amount: Decimal,
    #[serde(default)]
    pub interest_rate: Decimal,
    /// Months.
    #[serde(default)]
    pub repayment_period: u32,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub funded_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub founder: Option<FounderRef>,
    #[serde(default)]
    pub total_repayment: Option<Decimal>,
    #[serde(default)]
    pub remaining_repayment: Option<Decimal>,
    #[serde(default)]
    pub repayment_progress: Decimal,
    #[serde(default)]
    pub funding_progress: Decimal,
    #[serde(default)]
    pub is_fully_repaid: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cac_d_img: Option<String>,
    #[serde(default)]
    pub monthly_due_info: Option<MonthlyDueInfo>,
    #[serde(default)]
    pub has_funded: bool,
}

const SHORT_DESCRIPTION_CHARS: usize = 100;

impl Campaign {
    pub fn is_fully_funded(&self) -> bool {
        self.funding_progress >= Decimal::ONE_HUNDRED
    }

    pub fn founder_id(&self) -> Option<UserId> {
        self.founder.as_ref().map(FounderRef::id)
    }

    /// Card-sized description: the first 100 characters followed by `...`.
    pub fn short_description(&self) -> String {
        if self.description.chars().count() > SHORT_DESCRIPTION_CHARS {
            let head: String = self.description.chars().take(SHORT_DESCRIPTION_CHARS).collect();
            format!("{head}...")
        } else {
            self.description.clone()
        }
    }

    pub fn due_info(&self) -> Option<&MonthlyDueInfo> {
        self.monthly_due_info.as_ref().filter(|info| !info.is_empty())
    }
}

// ─────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// `POST /users/login/` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// `POST /users/refresh/` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access: String,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub bank_name: String,
    pub account_number: String,
    pub user_type: UserType,
    pub bvn: Option<String>,
    pub identity_document: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────
// Campaign creation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub description: String,
    pub goal_amount: Decimal,
    /// Percentage.
    pub interest_rate: Decimal,
    /// Months.
    pub repayment_period: u32,
    pub image: Option<PathBuf>,
    pub cac_d_img: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────
// Payments & withdrawals
// ─────────────────────────────────────────────────────────

/// Body of both initialize endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeRequest {
    pub campaign_id: CampaignId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// `POST /users/withdraw/` response.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawReceipt {
    #[serde(default)]
    pub message: Option<String>,
    pub new_balance: Decimal,
}

// ─────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────

/// Parse a backend timestamp. Offsets are honoured; naive values are UTC.
pub fn parse_backend_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn de_timestamp_opt<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_backend_timestamp))
}
