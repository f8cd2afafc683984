//! Crowdlend client library.
//!
//! Talks to the Crowdlend REST API on behalf of founders and lenders:
//! session credentials, campaign listings, withdrawals, and the
//! investment/repayment workflow that hands the payer to the gateway's
//! hosted checkout and verifies the payment afterwards.

pub mod api;
pub mod auth;
pub mod campaigns;
pub mod config;
pub mod errors;
pub mod models;
pub mod payment;
pub mod session;
pub mod users;
pub mod views;

pub use api::ApiClient;
pub use config::Config;
pub use errors::{ClientError, Result};
pub use payment::{PaymentCoordinator, PaymentHandle, PaymentKind, VerificationOutcome, WorkflowState};
pub use session::{MemorySessionStore, SessionStore, SqliteSessionStore};
