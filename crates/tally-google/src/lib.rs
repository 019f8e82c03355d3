// Google API collaborators
//
// Gmail is the mail provider behind the event cursor; Sheets is the ledger
// backend behind the operation executor. Both are thin REST clients that map
// retryable HTTP failures to transient errors and leave retry scheduling to
// their callers.

pub mod auth;
pub mod gmail;
pub mod sheets;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use gmail::GmailClient;
pub use sheets::SheetsLedger;
