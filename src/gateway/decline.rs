use once_cell::sync::Lazy;
use std::collections::HashMap;

/// User-facing decline message plus the workflow-level retry hint.
///
/// `retryable` means it is safe to prompt the customer for another card,
/// not that the failed call may be resubmitted automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclineInfo {
    pub message: &'static str,
    pub retryable: bool,
}

const GENERIC_DECLINE: DeclineInfo = DeclineInfo {
    message: "Your card was declined.",
    retryable: true,
};

static DECLINE_TABLE: Lazy<HashMap<&'static str, DeclineInfo>> = Lazy::new(|| {
    HashMap::from([
        (
            "insufficient_funds",
            DeclineInfo {
                message: "Insufficient funds.",
                retryable: true,
            },
        ),
        ("generic_decline", GENERIC_DECLINE),
        (
            "processing_error",
            DeclineInfo {
                message: "An error occurred while processing your card. Please try again.",
                retryable: true,
            },
        ),
        (
            "expired_card",
            DeclineInfo {
                message: "Your card has expired.",
                retryable: false,
            },
        ),
        (
            "lost_card",
            DeclineInfo {
                message: "Your card was declined.",
                retryable: false,
            },
        ),
        (
            "stolen_card",
            DeclineInfo {
                message: "Your card was declined.",
                retryable: false,
            },
        ),
    ])
});

/// Looks up a decline code; unrecognized codes fall back to the generic
/// decline entry.
pub fn decline_info(code: &str) -> DeclineInfo {
    DECLINE_TABLE.get(code).copied().unwrap_or(GENERIC_DECLINE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_retryable() {
        let info = decline_info("insufficient_funds");
        assert_eq!(info.message, "Insufficient funds.");
        assert!(info.retryable);
    }

    #[test]
    fn test_expired_card_is_terminal() {
        let info = decline_info("expired_card");
        assert_eq!(info.message, "Your card has expired.");
        assert!(!info.retryable);
    }

    #[test]
    fn test_lost_and_stolen_cards_are_terminal() {
        assert!(!decline_info("lost_card").retryable);
        assert!(!decline_info("stolen_card").retryable);
    }

    #[test]
    fn test_unknown_code_gets_generic_message() {
        let info = decline_info("do_not_honor_v2");
        assert_eq!(info.message, "Your card was declined.");
        assert!(info.retryable);
    }
}
