//! The single job/page status enum: one state machine shared by both
//! stores, so there is no `"queued"`/`"pending"` ambiguity to resolve
//! at the call site. Any other token is a bug.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "text", rename_all = "lowercase")
)]
pub enum Status {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }

    /// User-visible terminal states are exactly {COMPLETED, FAILED,
    /// CANCELLED}.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status token: {other}")),
        }
    }
}

impl TryFrom<String> for Status {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_three() {
        let terminal: Vec<Status> = [
            Status::Pending,
            Status::Queued,
            Status::Processing,
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
        ]
        .into_iter()
        .filter(Status::is_terminal)
        .collect();

        assert_eq!(
            terminal,
            vec![Status::Completed, Status::Failed, Status::Cancelled]
        );
    }

    #[test]
    fn unknown_token_is_an_error() {
        assert!("queud".parse::<Status>().is_err());
    }

    #[test]
    fn round_trips_through_str() {
        for s in [
            Status::Pending,
            Status::Queued,
            Status::Processing,
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<Status>().unwrap(), s);
        }
    }
}
