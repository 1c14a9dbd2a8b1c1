use std::{fmt, str::FromStr};

use crate::system::page_protection_available;

/// How the guard makes a closed handle's storage unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ProtectionStrategy {
    /// Revoke page access; touching closed storage faults the process.
    #[value(name = "page-protect")]
    PageProtect,
    /// Overwrite closed storage with a poison pattern checked on access.
    #[default]
    #[value(name = "canary-fill")]
    CanaryFill,
}

impl ProtectionStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::PageProtect => "page-protect",
            Self::CanaryFill => "canary-fill",
        }
    }
}

impl fmt::Display for ProtectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page-protect" => Ok(Self::PageProtect),
            "canary-fill" => Ok(Self::CanaryFill),
            other => Err(format!("unknown protection strategy '{other}'")),
        }
    }
}

// unset fields take the DebugSettings default
#[derive(Debug, Default, Clone)]
pub struct DebugCreateInfo {
    pub protection: Option<ProtectionStrategy>,
    pub quarantine_size: Option<usize>,
    // 0 disables capture
    pub stack_trace_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSettings {
    pub protection: ProtectionStrategy,
    // closed records kept protected before they are reclaimed
    pub quarantine_size: usize,
    pub stack_trace_limit: usize,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            protection: ProtectionStrategy::CanaryFill,
            quarantine_size: 1024,
            stack_trace_limit: 16,
        }
    }
}

impl DebugSettings {
    pub fn new(info: &DebugCreateInfo) -> Self {
        let mut settings = Self::default();
        info.protection.inspect(|&val| settings.protection = val);
        info.quarantine_size
            .inspect(|&val| settings.quarantine_size = val);
        info.stack_trace_limit
            .inspect(|&val| settings.stack_trace_limit = val);

        if settings.protection == ProtectionStrategy::PageProtect
            && !page_protection_available()
        {
            log::warn!(
                "page protection unavailable on this platform, \
                 using canary-fill"
            );
            settings.protection = ProtectionStrategy::CanaryFill;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_use_defaults() {
        let settings = DebugSettings::new(&DebugCreateInfo::default());
        assert_eq!(settings, DebugSettings::default());
    }

    #[test]
    fn set_fields_override_defaults() {
        let settings = DebugSettings::new(&DebugCreateInfo {
            quarantine_size: Some(3),
            stack_trace_limit: Some(0),
            ..Default::default()
        });
        assert_eq!(settings.quarantine_size, 3);
        assert_eq!(settings.stack_trace_limit, 0);
        assert_eq!(settings.protection, ProtectionStrategy::CanaryFill);
    }

    #[test]
    fn strategies_parse_from_their_names() {
        for strategy in
            [ProtectionStrategy::PageProtect, ProtectionStrategy::CanaryFill]
        {
            assert_eq!(strategy.name().parse(), Ok(strategy));
        }
        assert!("mprotect".parse::<ProtectionStrategy>().is_err());
    }
}
