//! Backend kind enumeration for determining which driver to use.

use std::fmt;

/// Explicit discriminator for agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cursor,
    Claude,
    Mock,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Cursor, Self::Claude, Self::Mock];

    /// Parse a backend name from configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use apc_core::agents::BackendKind;
    ///
    /// assert_eq!(BackendKind::from_name("cursor"), Some(BackendKind::Cursor));
    /// assert_eq!(BackendKind::from_name("Claude"), Some(BackendKind::Claude));
    /// assert_eq!(BackendKind::from_name("gemini"), None);
    /// ```
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "cursor" | "cursor-agent" => Some(Self::Cursor),
            "claude" | "claude-code" => Some(Self::Claude),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Configuration name of the backend.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cursor => "cursor",
            Self::Claude => "claude",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(BackendKind::from_name("cursor"), Some(BackendKind::Cursor));
        assert_eq!(BackendKind::from_name(" CURSOR-AGENT "), Some(BackendKind::Cursor));
        assert_eq!(BackendKind::from_name("claude-code"), Some(BackendKind::Claude));
        assert_eq!(BackendKind::from_name("mock"), Some(BackendKind::Mock));
        assert_eq!(BackendKind::from_name(""), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for kind in BackendKind::ALL {
            assert_eq!(BackendKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.to_string(), kind.name());
        }
    }
}
