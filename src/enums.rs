use serde::Deserialize;

/// How the slices of a sequence are staged under the sorted output tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrganizeMode {
    /// Symbolic link back to the source slice, replacing an existing link.
    #[default]
    Link,
    Copy,
    Move,
    /// Leave the slices where they are.
    Skip,
}

/// Status tokens written into ledger cells instead of output paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerStatus {
    SortFailed,
    ConvertFailed,
    NotAvailable,
}

impl LedgerStatus {
    pub const ALL: [LedgerStatus; 3] = [
        LedgerStatus::SortFailed,
        LedgerStatus::ConvertFailed,
        LedgerStatus::NotAvailable,
    ];

    pub fn token(self) -> &'static str {
        match self {
            LedgerStatus::SortFailed => "SORT_FAILED",
            LedgerStatus::ConvertFailed => "CONVERT_FAILED",
            LedgerStatus::NotAvailable => "NA",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.token() == token)
    }
}
