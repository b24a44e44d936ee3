//! Configuration of the domain.

use crate::abstraction::AbstractionConfig;
use crate::verifier::CheckLevel;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SmgOptions {
    /// Consistency checks run after every state mutation.
    pub check_level: CheckLevel,
    /// Size in bytes of objects standing for memory allocated outside the analyzed code.
    pub external_allocation_size: u64,
    /// Report findings as memory errors (`true`) or as undefined behaviour (`false`).
    pub memory_errors: bool,
    pub abstraction: AbstractionConfig,
}

impl Default for SmgOptions {
    fn default() -> Self {
        Self {
            check_level: CheckLevel::None,
            external_allocation_size: i32::MAX as u64,
            memory_errors: true,
            abstraction: AbstractionConfig::default(),
        }
    }
}

impl SmgOptions {
    pub fn with_check_level(self, check_level: CheckLevel) -> Self {
        Self { check_level, ..self }
    }

    /// How findings are called in log messages.
    pub(crate) fn finding_kind(&self) -> &'static str {
        if self.memory_errors {
            "memory error"
        } else {
            "undefined behavior"
        }
    }
}
