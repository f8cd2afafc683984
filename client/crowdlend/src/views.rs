//! Presentation logic shared by every front end: what a dashboard lists,
//! which payment action a campaign offers, and the fallback texts shown
//! when the backend does not explain a failure.

use tracing::debug;

use crate::api::ApiClient;
use crate::campaigns;
use crate::errors::Result;
use crate::models::{Campaign, CampaignId, User, WithdrawReceipt};
use crate::payment::PaymentKind;
use crate::users;

pub const LOAN_FAILED: &str = "Loan failed!";
pub const REPAYMENT_FAILED: &str = "Repayment failed!";
pub const PAYMENT_VERIFICATION_FAILED: &str = "Payment verification failed.";
pub const REPAYMENT_VERIFICATION_FAILED: &str = "Repayment verification failed.";
pub const LOGIN_FAILED: &str = "Not Approved / Invalid credentials";
pub const REGISTRATION_FAILED: &str = "Registration failed.";
pub const CREATE_CAMPAIGN_FAILED: &str = "Failed to create campaign";
pub const WITHDRAWAL_FAILED: &str = "Withdrawal failed.";
pub const FETCH_CAMPAIGNS_FAILED: &str = "Failed to fetch campaigns.";
pub const FETCH_CAMPAIGN_FAILED: &str = "Failed to fetch campaign details.";
pub const FETCH_USER_FAILED: &str = "Failed to fetch user details.";

/// Fallback texts for a payment of `kind`: (initiation, verification).
pub fn payment_fallbacks(kind: PaymentKind) -> (&'static str, &'static str) {
    match kind {
        PaymentKind::Investment => (LOAN_FAILED, PAYMENT_VERIFICATION_FAILED),
        PaymentKind::Repayment => (REPAYMENT_FAILED, REPAYMENT_VERIFICATION_FAILED),
    }
}

/// The payment button a campaign shows to a given user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignAction {
    /// Lender on a campaign still raising funds.
    Invest,
    /// Founder on a funded campaign with repayment outstanding.
    Repay,
    /// Lender on a campaign that reached its goal.
    FullyFunded,
    /// Founder on a campaign that is not funded yet, or already repaid.
    NotRepayable,
}

impl CampaignAction {
    pub fn for_user(campaign: &Campaign, user: &User) -> Self {
        match (user.is_founder(), campaign.is_fully_funded()) {
            (true, true) if !campaign.is_fully_repaid => Self::Repay,
            (true, _) => Self::NotRepayable,
            (false, true) => Self::FullyFunded,
            (false, false) => Self::Invest,
        }
    }

    pub fn payment_kind(&self) -> Option<PaymentKind> {
        match self {
            Self::Invest => Some(PaymentKind::Investment),
            Self::Repay => Some(PaymentKind::Repayment),
            Self::FullyFunded | Self::NotRepayable => None,
        }
    }

    /// Notice shown instead of opening the amount prompt.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            Self::FullyFunded => Some("This campaign is fully funded."),
            Self::NotRepayable => Some("Campaign is not fully funded for repayment."),
            Self::Invest | Self::Repay => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Dashboard
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dashboard {
    pub user: User,
    pub campaigns: Vec<Campaign>,
}

impl Dashboard {
    pub async fn load(api: &ApiClient) -> Result<Self> {
        let (user, campaigns) = tokio::try_join!(users::me(api), campaigns::list(api))?;
        debug!("Dashboard loaded {} campaigns", campaigns.len());
        Ok(Self { user, campaigns })
    }

    pub async fn reload(&mut self, api: &ApiClient) -> Result<()> {
        *self = Self::load(api).await?;
        Ok(())
    }

    /// Campaigns matching `search` (case-insensitive, by title). Founders
    /// only see their own campaigns.
    pub fn visible_campaigns(&self, search: &str) -> Vec<&Campaign> {
        let needle = search.trim().to_lowercase();
        self.campaigns
            .iter()
            .filter(|c| c.title.to_lowercase().contains(&needle))
            .filter(|c| !self.user.is_founder() || c.founder_id() == Some(self.user.id))
            .collect()
    }

    /// Withdraw and apply the returned balance to the local snapshot.
    pub async fn withdraw(&mut self, api: &ApiClient, raw_amount: &str) -> Result<WithdrawReceipt> {
        let receipt = users::withdraw(api, raw_amount).await?;
        self.user.balance = receipt.new_balance;
        Ok(receipt)
    }
}

// ─────────────────────────────────────────────────────────
// Campaign detail
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub user: User,
}

impl CampaignDetail {
    pub async fn load(api: &ApiClient, id: CampaignId) -> Result<Self> {
        let (campaign, user) = tokio::try_join!(campaigns::progress(api, id), users::me(api))?;
        Ok(Self { campaign, user })
    }

    pub async fn reload(&mut self, api: &ApiClient) -> Result<()> {
        self.campaign = campaigns::progress(api, self.campaign.id).await?;
        Ok(())
    }

    pub fn action(&self) -> CampaignAction {
        CampaignAction::for_user(&self.campaign, &self.user)
    }

    /// Founders, and lenders who funded the campaign, see repayment details.
    pub fn shows_repayment_details(&self) -> bool {
        self.user.is_founder() || self.campaign.has_funded
    }
}
