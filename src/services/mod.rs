//! External collaborators the funnel talks to.

pub mod quotes;
pub mod verification;

pub use quotes::{CarrierQuote, HttpQuoteLookup, QuoteLookup, QuoteRequest};
pub use verification::{CodeCheck, HttpVerificationService, Receipt, VerificationService};
