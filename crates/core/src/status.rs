//! Status enums mapping to the SMALLINT lookup tables, plus the batch and
//! per-target state machines.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table.

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID back to its variant.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Lower-case name matching the lookup table's `name` column.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle of a migration batch.
    BatchStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Paused = 3 => "paused",
        Completed = 4 => "completed",
        Failed = 5 => "failed",
        Cancelled = 6 => "cancelled",
    }
}

define_status_enum! {
    /// Lifecycle of one (batch, target) detail row.
    DetailStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Skipped = 5 => "skipped",
    }
}

define_status_enum! {
    /// Lifecycle of a queued migration event.
    EventStatus {
        Pending = 1 => "pending",
        Processing = 2 => "processing",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Retrying = 5 => "retrying",
    }
}

define_status_enum! {
    /// Lifecycle of a rollback execution.
    RollbackStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
    }
}

impl BatchStatus {
    /// Completed, failed and cancelled batches never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses reachable from `self`.
    pub fn valid_transitions(self) -> &'static [BatchStatus] {
        use BatchStatus::*;
        match self {
            Pending => &[Running, Failed, Cancelled],
            Running => &[Completed, Failed, Cancelled, Paused],
            Paused => &[Running, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: BatchStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Statuses from which `to` may be entered.
    pub fn sources(to: BatchStatus) -> Vec<BatchStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition(to))
            .collect()
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(self, to: BatchStatus) -> Result<(), String> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(format!("Invalid batch transition: {self} -> {to}"))
        }
    }
}

impl DetailStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn can_transition(self, to: DetailStatus) -> bool {
        use DetailStatus::*;
        match self {
            Pending => matches!(to, Running | Skipped | Failed),
            Running => matches!(to, Completed | Failed),
            Completed | Failed | Skipped => false,
        }
    }
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses a worker may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl RollbackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
