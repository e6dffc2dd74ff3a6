use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// How a processor finished with an exchange.
///
/// `Sync` means the exchange never left the calling task. `Async` means at least part of the
/// work was handed to another task, a timer, or a worker pool before the future resolved.
/// Composites fold the results of their children with [`Completion::and`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Sync,
    Async,
}

impl Completion {
    pub fn is_sync(self) -> bool {
        self == Completion::Sync
    }

    /// Combines two results. The result is `Sync` only if both are.
    pub fn and(self, other: Completion) -> Completion {
        match (self, other) {
            (Completion::Sync, Completion::Sync) => Completion::Sync,
            _ => Completion::Async,
        }
    }
}

/// Typed routing directives carried by an [`Exchange`](crate::exchange::Exchange).
///
/// These replace the stringly keyed control properties. The named-property view is still
/// available through `Exchange::property` for collaborators that only speak property names.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExchangeFlags(pub u32);

impl ExchangeFlags {
    pub const NONE: Self = Self(0);
    pub const ROLLBACK_ONLY: Self = Self(1);
    pub const ROLLBACK_ONLY_LAST: Self = Self(1 << 1);
    pub const ROUTE_STOP: Self = Self(1 << 2);
    pub const REDELIVERY_EXHAUSTED: Self = Self(1 << 3);
    pub const FAILURE_HANDLED: Self = Self(1 << 4);
    pub const TRANSACTED: Self = Self(1 << 5);
    pub const SYNCHRONOUS: Self = Self(1 << 6);

    pub fn any_flags(&self, flags: ExchangeFlags) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn any_flags_clear(&self, flags: ExchangeFlags) -> bool {
        self.0 & flags.0 != flags.0
    }

    pub fn all_flags(&self, flags: ExchangeFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn all_flags_clear(&self, flags: ExchangeFlags) -> bool {
        self.0 & flags.0 == 0
    }

    pub fn set(&mut self, flags: ExchangeFlags, value: bool) {
        if value {
            *self |= flags;
        } else {
            *self &= !flags;
        }
    }

    pub fn is_rollback(&self) -> bool {
        self.any_flags(ExchangeFlags::ROLLBACK_ONLY | ExchangeFlags::ROLLBACK_ONLY_LAST)
    }

    pub fn requires_synchronous(&self) -> bool {
        self.any_flags(ExchangeFlags::TRANSACTED | ExchangeFlags::SYNCHRONOUS)
    }
}

impl Display for ExchangeFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:b}", self.0)
    }
}

impl PartialEq for ExchangeFlags {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl BitOrAssign for ExchangeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAndAssign for ExchangeFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl Not for ExchangeFlags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl BitAnd for ExchangeFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for ExchangeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
