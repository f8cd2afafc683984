//! Subcommands and their rendering.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tracing::debug;

use crowdlend::models::{Campaign, Credentials, NewCampaign, Registration, UserType};
use crowdlend::payment::{
    self, CheckoutOpener, InFlightRegistry, ManualCheckout, SystemBrowser,
};
use crowdlend::session::{self, SessionKey};
use crowdlend::views::{self, CampaignDetail, Dashboard};
use crowdlend::{
    auth, campaigns, ApiClient, ClientError, Config, PaymentCoordinator, PaymentKind,
    SqliteSessionStore, VerificationOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "crowdlend", version, about = "Crowdlend loan crowdfunding client")]
pub struct Cli {
    /// REST API root, overriding API_BASE_URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Session database, overriding SESSION_DB_URL
    #[arg(long, global = true)]
    session_db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and store the session credentials
    Login {
        username: String,
        #[arg(long, env = "CROWDLEND_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account
    Register(RegisterArgs),
    /// Forget the stored session
    Logout,
    /// Exchange the refresh credential for a new access credential
    Refresh,
    /// Show the logged-in user
    Whoami,
    /// Balance and campaigns for the logged-in user
    Dashboard {
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Search all campaigns by keyword
    Search {
        #[arg(default_value = "")]
        term: String,
    },
    /// Campaign details and progress
    Campaign { id: u64 },
    /// Create a campaign (founders)
    CreateCampaign(CreateCampaignArgs),
    /// Fund a campaign through the payment gateway (lenders)
    Invest(PayArgs),
    /// Repay a funded campaign through the payment gateway (founders)
    Repay(PayArgs),
    /// Withdraw from your balance
    Withdraw { amount: String },
}

impl Command {
    fn needs_login(&self) -> bool {
        !matches!(
            self,
            Self::Login { .. } | Self::Register(_) | Self::Logout | Self::Refresh
        )
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AccountType {
    Founder,
    Lender,
}

impl From<AccountType> for UserType {
    fn from(value: AccountType) -> Self {
        match value {
            AccountType::Founder => UserType::Founder,
            AccountType::Lender => UserType::Lender,
        }
    }
}

#[derive(Debug, clap::Args)]
struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    email: String,
    #[arg(long, env = "CROWDLEND_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    bank_name: String,
    #[arg(long)]
    account_number: String,
    #[arg(long, value_enum, default_value = "founder")]
    user_type: AccountType,
    #[arg(long)]
    bvn: Option<String>,
    /// Scanned ID to upload with the application
    #[arg(long)]
    identity_document: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct CreateCampaignArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    /// Naira
    #[arg(long, value_parser = parse_decimal)]
    goal_amount: Decimal,
    /// Percent
    #[arg(long, value_parser = parse_decimal)]
    interest_rate: Decimal,
    /// Months
    #[arg(long)]
    repayment_period: u32,
    /// Banner image
    #[arg(long)]
    image: Option<PathBuf>,
    /// CAC registration document
    #[arg(long)]
    cac_document: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct PayArgs {
    /// Campaign id
    id: u64,
    /// Amount in naira
    amount: String,
    /// Print the checkout URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|_| format!("`{raw}` is not a number"))
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(db) = &self.session_db {
            config.session_db_url = db.clone();
        }
    }
}

/// Shared state for one invocation.
struct Context {
    config: Config,
    api: ApiClient,
    registry: InFlightRegistry,
}

impl Context {
    fn coordinator(&self, kind: PaymentKind, no_browser: bool) -> PaymentCoordinator {
        let opener: Arc<dyn CheckoutOpener> = if no_browser {
            Arc::new(ManualCheckout)
        } else {
            Arc::new(SystemBrowser)
        };
        let policy = match kind {
            PaymentKind::Investment => self.config.invest_policy(),
            PaymentKind::Repayment => self.config.repay_policy(),
        };
        PaymentCoordinator::new(kind, Arc::new(self.api.clone()), opener)
            .with_policy(policy)
            .with_registry(self.registry.clone())
    }
}

/// Turn a library error into what the person sees.
fn surface(err: ClientError, fallback: &str) -> anyhow::Error {
    debug!("{err:?}");
    let message = err.user_message(fallback);
    if err.is_unauthorized() {
        anyhow!("{message}\nYour session has expired; run `crowdlend refresh` or `crowdlend login`.")
    } else {
        anyhow!(message)
    }
}

/// Screens behind the login page refuse to run without a stored credential.
async fn require_login(ctx: &Context) -> anyhow::Result<()> {
    if session::is_authenticated(ctx.api.session().as_ref()).await? {
        Ok(())
    } else {
        Err(anyhow!("Not logged in; run `crowdlend login` first."))
    }
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let store = SqliteSessionStore::open(&config.session_db_url).await?;
    let api = ApiClient::new(
        &config.api_base_url,
        Arc::new(store),
        config.request_timeout(),
    )?;
    let ctx = Context {
        config,
        api,
        registry: InFlightRegistry::new(),
    };

    if cli.command.needs_login() {
        require_login(&ctx).await?;
    }

    match cli.command {
        Command::Login { username, password } => login(&ctx, username, password).await,
        Command::Register(args) => register(&ctx, args).await,
        Command::Logout => {
            auth::logout(&ctx.api).await?;
            println!("Logged out.");
            Ok(())
        }
        Command::Refresh => refresh(&ctx).await,
        Command::Whoami => whoami(&ctx).await,
        Command::Dashboard { search } => dashboard(&ctx, &search).await,
        Command::Search { term } => search(&ctx, &term).await,
        Command::Campaign { id } => {
            let detail = CampaignDetail::load(&ctx.api, id)
                .await
                .map_err(|e| surface(e, views::FETCH_CAMPAIGN_FAILED))?;
            print_detail(&detail);
            Ok(())
        }
        Command::CreateCampaign(args) => create_campaign(&ctx, args).await,
        Command::Invest(args) => pay(&ctx, PaymentKind::Investment, args).await,
        Command::Repay(args) => pay(&ctx, PaymentKind::Repayment, args).await,
        Command::Withdraw { amount } => withdraw(&ctx, &amount).await,
    }
}

async fn login(ctx: &Context, username: String, password: String) -> anyhow::Result<()> {
    auth::login(&ctx.api, &Credentials { username, password })
        .await
        .map_err(|e| surface(e, views::LOGIN_FAILED))?;
    println!("Login successful!");
    Ok(())
}

async fn register(ctx: &Context, args: RegisterArgs) -> anyhow::Result<()> {
    let registration = Registration {
        username: args.username,
        first_name: args.first_name,
        last_name: args.last_name,
        email: args.email,
        password: args.password,
        bank_name: args.bank_name,
        account_number: args.account_number,
        user_type: args.user_type.into(),
        bvn: args.bvn,
        identity_document: args.identity_document,
    };
    auth::register(&ctx.api, &registration)
        .await
        .map_err(|e| surface(e, views::REGISTRATION_FAILED))?;
    println!("Registration successful! Please wait for approval.");
    Ok(())
}

async fn refresh(ctx: &Context) -> anyhow::Result<()> {
    match auth::refresh_access_token(&ctx.api).await {
        Ok(Some(token)) => {
            println!("Session refreshed.");
            if let Some(exp) = auth::token_expiry(&token) {
                println!("Access valid until {exp}");
            }
            Ok(())
        }
        Ok(None) => Err(anyhow!("No stored session; run `crowdlend login`.")),
        Err(e) => Err(surface(e, "Token refresh failed; please log in again.")),
    }
}

async fn whoami(ctx: &Context) -> anyhow::Result<()> {
    let user = crowdlend::users::me(&ctx.api)
        .await
        .map_err(|e| surface(e, views::FETCH_USER_FAILED))?;
    println!("{} (@{})", user.display_name(), user.username);
    println!("  type:     {}", user.user_type.as_str());
    println!("  approved: {}", if user.is_approved { "yes" } else { "no" });
    println!("  balance:  ₦{}", user.balance);

    if let Some(token) = ctx.api.session().get(SessionKey::Access).await? {
        if let Some(exp) = auth::token_expiry(&token) {
            println!("  session:  valid until {exp}");
        }
    }
    Ok(())
}

async fn dashboard(ctx: &Context, search: &str) -> anyhow::Result<()> {
    let dashboard = Dashboard::load(&ctx.api)
        .await
        .map_err(|e| surface(e, views::FETCH_CAMPAIGNS_FAILED))?;

    println!("Welcome, {}", dashboard.user.display_name());
    println!("Balance: ₦{}", dashboard.user.balance);
    println!();

    let heading = if dashboard.user.is_founder() {
        "Your Campaigns"
    } else {
        "Available Campaigns"
    };
    println!("{heading}");

    let visible = dashboard.visible_campaigns(search);
    if visible.is_empty() {
        println!("  You currently have no campaigns.");
    }
    for campaign in visible {
        print_card(campaign);
    }
    Ok(())
}

async fn search(ctx: &Context, term: &str) -> anyhow::Result<()> {
    let found = campaigns::search(&ctx.api, term)
        .await
        .map_err(|e| surface(e, views::FETCH_CAMPAIGNS_FAILED))?;
    if found.is_empty() {
        println!("No campaigns found.");
    }
    for campaign in &found {
        print_card(campaign);
    }
    Ok(())
}

async fn create_campaign(ctx: &Context, args: CreateCampaignArgs) -> anyhow::Result<()> {
    let draft = NewCampaign {
        title: args.title,
        description: args.description,
        goal_amount: args.goal_amount,
        interest_rate: args.interest_rate,
        repayment_period: args.repayment_period,
        image: args.image,
        cac_d_img: args.cac_document,
    };
    campaigns::create(&ctx.api, &draft)
        .await
        .map_err(|e| surface(e, views::CREATE_CAMPAIGN_FAILED))?;
    println!("Campaign created successfully!");
    Ok(())
}

async fn withdraw(ctx: &Context, amount: &str) -> anyhow::Result<()> {
    let mut dashboard = Dashboard::load(&ctx.api)
        .await
        .map_err(|e| surface(e, views::FETCH_USER_FAILED))?;
    let receipt = dashboard
        .withdraw(&ctx.api, amount)
        .await
        .map_err(|e| surface(e, views::WITHDRAWAL_FAILED))?;
    if let Some(message) = receipt.message.as_deref() {
        println!("{message}");
    }
    println!("Balance: ₦{}", dashboard.user.balance);
    Ok(())
}

async fn pay(ctx: &Context, kind: PaymentKind, args: PayArgs) -> anyhow::Result<()> {
    let (initiate_fallback, verify_fallback) = views::payment_fallbacks(kind);

    // Reject bad input before touching the network.
    payment::parse_amount(&args.amount).map_err(|e| surface(e, initiate_fallback))?;

    let mut detail = CampaignDetail::load(&ctx.api, args.id)
        .await
        .map_err(|e| surface(e, views::FETCH_CAMPAIGN_FAILED))?;

    let action = detail.action();
    if action.payment_kind() != Some(kind) {
        let notice = action.notice().unwrap_or(match kind {
            PaymentKind::Investment => "Only lenders can fund campaigns.",
            PaymentKind::Repayment => "Only founders can repay campaigns.",
        });
        println!("{notice}");
        return Ok(());
    }

    let coordinator = ctx.coordinator(kind, args.no_browser);
    let (refreshed_tx, refreshed_rx) = oneshot::channel::<()>();
    let handle = coordinator
        .initiate(args.id, &args.amount, move || {
            let _ = refreshed_tx.send(());
        })
        .await
        .map_err(|e| surface(e, initiate_fallback))?;

    let label = match kind {
        PaymentKind::Investment => "Payment",
        PaymentKind::Repayment => "Repayment",
    };
    println!("{label} initiated. Complete payment at:");
    println!("  {}", handle.authorization_url());
    println!(
        "Checking the payment in {}s (Ctrl-C to stop waiting)...",
        coordinator.policy().initial_delay.as_secs()
    );

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            coordinator.cancel(args.id);
            VerificationOutcome::Cancelled
        }
    };

    match outcome {
        VerificationOutcome::Verified => {
            println!("{label} verified successfully.");
            if refreshed_rx.await.is_ok() {
                detail
                    .reload(&ctx.api)
                    .await
                    .map_err(|e| surface(e, views::FETCH_CAMPAIGN_FAILED))?;
                print_detail(&detail);
            }
            Ok(())
        }
        VerificationOutcome::Failed(message) => Err(anyhow!(
            message.unwrap_or_else(|| verify_fallback.to_string())
        )),
        VerificationOutcome::Cancelled => {
            println!("Stopped waiting. Payments completed at the gateway still settle on the backend.");
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────

fn print_card(campaign: &Campaign) {
    println!();
    println!("#{} {}", campaign.id, campaign.title);
    if let Some(created) = campaign.created_at {
        println!("  Created on: {}", created.format("%Y-%m-%d"));
    }
    println!("  {}", campaign.short_description());
    println!(
        "  Goal: ₦{}  Raised: ₦{}  Interest: {}%  Period: {} months",
        campaign.goal_amount,
        campaign.current_amount,
        campaign.interest_rate,
        campaign.repayment_period
    );
    println!(
        "  Progress: {:.2}%{}",
        campaign.funding_progress,
        if campaign.has_funded { "  (you funded)" } else { "" }
    );
}

fn print_detail(detail: &CampaignDetail) {
    let c = &detail.campaign;
    println!("{}", c.title);
    println!("{}", c.description);
    println!();
    println!("Goal:             ₦{}", c.goal_amount);
    println!("Raised:           ₦{}", c.current_amount);
    println!("Interest Rate:    {}%", c.interest_rate);
    println!("Repayment Period: {} months", c.repayment_period);
    println!("Funding Progress: {:.2}%", c.funding_progress);

    if detail.shows_repayment_details() {
        println!();
        if let Some(funded) = c.funded_at {
            println!("Funded At:          {}", funded.format("%Y-%m-%d"));
        }
        if let Some(total) = c.total_repayment {
            println!("Total Repayment:    ₦{total}");
        }
        if let Some(due) = c.due_info() {
            if let Some(monthly) = due.monthly_repayment {
                println!("Monthly Repayment:  ₦{monthly}");
            }
            if let Some(next) = due.next_due_date {
                println!("Next Due Date:      {}", next.format("%Y-%m-%d"));
            }
            if let Some(amount) = due.amount_due {
                println!("Amount Due:         ₦{amount}");
            }
        }
        println!("Repayment Progress: {:.2}%", c.repayment_progress);
    }

    match detail.action().notice() {
        Some(notice) => println!("\n{notice}"),
        None => match detail.action().payment_kind() {
            Some(PaymentKind::Investment) => {
                println!("\nRun `crowdlend invest {} <amount>` to fund this campaign.", c.id)
            }
            Some(PaymentKind::Repayment) => {
                println!("\nRun `crowdlend repay {} <amount>` to repay.", c.id)
            }
            None => {}
        },
    }
}
