//! Scripted replies used while the decision engine is unavailable.
//!
//! Pure and deterministic: the reply depends only on the loan's current stage
//! and the user's text.

use loanflow_core::Stage;

pub const ASK_AMOUNT: &str =
    "Great! I'd be happy to help you with a personal loan. What amount are you looking to borrow?";
pub const ASK_TENURE: &str =
    "Thank you. And for how many months would you like this loan? (typically 12-60 months)";
pub const ASK_LOAN_TYPE: &str =
    "I'm here to help you with your loan application. What type of loan are you interested in?";
pub const ASK_IDENTITY: &str =
    "Now I'll need to verify your identity. Please provide your PAN number.";
pub const CREDIT_CHECK: &str =
    "We're checking your credit profile. This will just take a moment...";
pub const ASK_DOCUMENTS: &str = "Please upload your recent bank statements and income proof.";
pub const PROCESSING: &str =
    "Thank you for your information. We're processing your application.";

pub fn fallback_reply(stage: Stage, text: &str) -> &'static str {
    match stage {
        Stage::Init | Stage::Sales => {
            let text = text.to_lowercase();
            if text.contains("personal") || text.contains("loan") {
                ASK_AMOUNT
            } else if text.chars().any(|c| c.is_ascii_digit()) {
                ASK_TENURE
            } else {
                ASK_LOAN_TYPE
            }
        }
        Stage::Kyc => ASK_IDENTITY,
        Stage::Credit => CREDIT_CHECK,
        Stage::Documents => ASK_DOCUMENTS,
        _ => PROCESSING,
    }
}
