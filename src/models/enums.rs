use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(
    /// How an intake file is routed.
    Strategy {
        SingleDocument => "single_document",
        BatchScan => "batch_scan",
    }
);

str_enum!(
    /// Lifecycle of a batch record.
    BatchStatus {
        Intake => "intake",
        Ready => "ready",
        Processing => "processing",
        ReadyForManipulation => "ready_for_manipulation",
        Exported => "exported",
        Orphaned => "orphaned",
        Failed => "failed",
        Consolidated => "consolidated",
    }
);

impl Strategy {
    /// Lenient parse for user- and oracle-supplied labels.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "single_document" | "single" | "single_doc" | "document" => Some(Self::SingleDocument),
            "batch_scan" | "batch" | "multi_document" | "scan" => Some(Self::BatchScan),
            _ => None,
        }
    }
}

impl BatchStatus {
    /// Statuses that count as an open intake batch.
    pub const OPEN_INTAKE: [BatchStatus; 2] = [BatchStatus::Intake, BatchStatus::Ready];
}
