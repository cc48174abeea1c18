//! Pre-execution static checks on migration content.
//!
//! Rules are regular expressions run over the raw migration text. Nothing here parses SQL,
//! so this is a pragmatic guard and not a semantic check: a destructive statement built
//! dynamically, hidden in a string literal, or spelled in a way the pattern doesn't
//! anticipate will get through (false negatives are possible). Matches inside `--`
//! comments are ignored.
//!
//! Destructive-statement rules only look at the apply block. Revert blocks undo the apply
//! block and are destructive by nature. An apply block may also opt a region out
//! explicitly:
//!
//! ```sql
//! -- +safety allow-destructive
//! DROP TABLE legacy_sessions;
//! -- +safety end
//! ```

use std::fmt;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::{is_blank_sql, strip_line_comments, MigrationSource};
use crate::error::SchemaGuardError;

static SAFETY_REGION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ims)^[ \t]*--[ \t]*\+safety[ \t]+allow-destructive\b.*?^[ \t]*--[ \t]*\+safety[ \t]+end\b[^\n]*")
        .unwrap()
});

/// Which part of a migration a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// The apply block, minus comments and explicit safety regions
    Apply,
    /// Every non-empty block, apply and revert, each checked on its own
    EachBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// A single named check. `matches` answers whether the rule's pattern occurs in a piece of
/// text; `apply` turns that into a verdict for a whole migration.
pub trait ValidationRule: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Required rules block execution; the rest are advisory.
    fn required(&self) -> bool;

    fn matches(&self, text: &str) -> bool;

    fn apply(&self, source: &MigrationSource) -> Result<(), RuleViolation>;
}

/// Text of the apply block that destructive-statement rules should see.
fn guarded_apply_text(source: &MigrationSource) -> String {
    let without_safety = SAFETY_REGION_RE.replace_all(source.apply_sql(), "");
    strip_line_comments(&without_safety)
}

/// Violated when the pattern occurs.
pub struct ForbidPattern {
    name: String,
    description: String,
    pattern: Regex,
    required: bool,
}

impl ForbidPattern {
    pub fn new(name: &str, description: &str, pattern: &str, required: bool) -> Result<Self, SchemaGuardError> {
        Ok(ForbidPattern {
            name: name.to_owned(),
            description: description.to_owned(),
            pattern: Regex::new(pattern)?,
            required,
        })
    }
}

impl ValidationRule for ForbidPattern {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn required(&self) -> bool {
        self.required
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    fn apply(&self, source: &MigrationSource) -> Result<(), RuleViolation> {
        let text = guarded_apply_text(source);
        match self.pattern.find(&text) {
            Some(found) => Err(RuleViolation {
                rule: self.name.clone(),
                message: format!("{} (found '{}')", self.description, found.as_str().trim()),
            }),
            None => Ok(()),
        }
    }
}

/// Violated when a block does not contain the pattern.
pub struct RequirePattern {
    name: String,
    description: String,
    pattern: Regex,
    required: bool,
    scope: RuleScope,
}

impl RequirePattern {
    pub fn new(
        name: &str,
        description: &str,
        pattern: &str,
        required: bool,
        scope: RuleScope,
    ) -> Result<Self, SchemaGuardError> {
        Ok(RequirePattern {
            name: name.to_owned(),
            description: description.to_owned(),
            pattern: Regex::new(pattern)?,
            required,
            scope,
        })
    }
}

impl ValidationRule for RequirePattern {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn required(&self) -> bool {
        self.required
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    fn apply(&self, source: &MigrationSource) -> Result<(), RuleViolation> {
        let blocks: Vec<(&str, String)> = match self.scope {
            RuleScope::Apply => vec![("apply", strip_line_comments(source.apply_sql()))],
            RuleScope::EachBlock => vec![
                ("apply", strip_line_comments(source.apply_sql())),
                ("revert", strip_line_comments(source.revert_sql())),
            ],
        };

        for (label, text) in blocks {
            if is_blank_sql(&text) {
                continue;
            }
            if !self.matches(&text) {
                return Err(RuleViolation {
                    rule: self.name.clone(),
                    message: format!("{} ({} block)", self.description, label),
                });
            }
        }

        Ok(())
    }
}

/// Ordered set of rules. Required rules fail fast in registration order.
pub struct ValidationEngine {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl ValidationEngine {
    pub fn empty() -> Self {
        ValidationEngine { rules: Vec::new() }
    }

    /// The built-in rule set, minus any rule named in `disabled`.
    pub fn with_defaults(disabled: &[String]) -> Result<Self, SchemaGuardError> {
        let defaults: Vec<Box<dyn ValidationRule>> = vec![
            Box::new(ForbidPattern::new(
                "no_drop_table",
                "DROP TABLE statements are not allowed",
                r"(?i)\bDROP\s+TABLE\b",
                true,
            )?),
            Box::new(ForbidPattern::new(
                "no_drop_column",
                "DROP COLUMN statements are not allowed",
                r"(?i)\bDROP\s+COLUMN\b",
                true,
            )?),
            Box::new(ForbidPattern::new(
                "no_truncate",
                "TRUNCATE statements are not allowed",
                r"(?i)\bTRUNCATE\s+(?:TABLE\s+)?\w",
                true,
            )?),
            Box::new(RequirePattern::new(
                "require_transaction",
                "Statements must be wrapped in BEGIN; ... COMMIT;",
                r"(?is)\bBEGIN\b[^;]*;.*\b(?:COMMIT|END)\b(?:\s+TRANSACTION)?\s*;",
                true,
                RuleScope::EachBlock,
            )?),
            Box::new(ForbidPattern::new(
                "require_if_not_exists",
                "CREATE TABLE should use IF NOT EXISTS",
                r"(?i)\bCREATE\s+(?:TEMP\s+|TEMPORARY\s+)?TABLE\s+(?:[^i\s]|i[^f])",
                false,
            )?),
        ];

        let mut engine = Self::empty();
        for rule in defaults {
            if disabled.iter().any(|name| name == rule.name()) {
                debug!("Validation rule '{}' disabled by configuration", rule.name());
                continue;
            }
            engine.add_rule(rule);
        }
        Ok(engine)
    }

    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Returns the advisory (non-required) violations on success, or the first required
    /// violation as an error.
    pub fn validate(&self, source: &MigrationSource) -> Result<Vec<RuleViolation>, SchemaGuardError> {
        let mut advisories = Vec::new();

        for rule in &self.rules {
            if let Err(violation) = rule.apply(source) {
                if rule.required() {
                    return Err(SchemaGuardError::Validation {
                        filename: source.filename().to_owned(),
                        rule: violation.rule,
                        message: violation.message,
                    });
                }
                warn!("Advisory rule violated in {}: {}", source.filename(), violation);
                advisories.push(violation);
            }
        }

        Ok(advisories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(content: &str) -> MigrationSource {
        MigrationSource::parse(1, "001_test.sql", content.to_owned())
    }

    fn wrapped(apply: &str, revert: &str) -> MigrationSource {
        source(&format!(
            "-- +migrate Up\nBEGIN;\n{}\nCOMMIT;\n-- +migrate Down\nBEGIN;\n{}\nCOMMIT;\n",
            apply, revert
        ))
    }

    fn failed_rule(result: Result<Vec<RuleViolation>, SchemaGuardError>) -> String {
        match result {
            Err(SchemaGuardError::Validation { rule, .. }) => rule,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_clean_migration_passes() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();
        let advisories = engine
            .validate(&wrapped(
                "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY);",
                "DROP TABLE users;",
            ))
            .unwrap();
        assert!(advisories.is_empty());
    }

    #[test]
    fn test_destructive_apply_statements_are_rejected() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();

        assert_eq!(failed_rule(engine.validate(&wrapped("DROP TABLE users;", ""))), "no_drop_table");
        assert_eq!(
            failed_rule(engine.validate(&wrapped("ALTER TABLE users DROP COLUMN email;", ""))),
            "no_drop_column"
        );
        assert_eq!(failed_rule(engine.validate(&wrapped("truncate table users;", ""))), "no_truncate");
    }

    #[test]
    fn test_destructive_text_in_comments_and_safety_regions_is_ignored() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();

        let commented = wrapped("-- we used to DROP TABLE users here\nSELECT 1;", "");
        assert!(engine.validate(&commented).is_ok());

        let guarded = wrapped(
            "-- +safety allow-destructive\nDROP TABLE legacy_sessions;\n-- +safety end\nSELECT 1;",
            "",
        );
        assert!(engine.validate(&guarded).is_ok());
    }

    #[test]
    fn test_unterminated_safety_region_does_not_exempt() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();
        let open = wrapped("-- +safety allow-destructive\nDROP TABLE legacy_sessions;", "");
        assert_eq!(failed_rule(engine.validate(&open)), "no_drop_table");
    }

    #[test]
    fn test_transaction_required_for_each_block() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();

        let unwrapped_apply = source("-- +migrate Up\nCREATE TABLE IF NOT EXISTS a (id INTEGER);\n");
        assert_eq!(failed_rule(engine.validate(&unwrapped_apply)), "require_transaction");

        let unwrapped_revert = source(
            "-- +migrate Up\nBEGIN;\nCREATE TABLE IF NOT EXISTS a (id INTEGER);\nCOMMIT;\n-- +migrate Down\nDROP TABLE a;\n",
        );
        let err = engine.validate(&unwrapped_revert).unwrap_err();
        assert!(err.to_string().contains("revert block"));

        let begin_transaction = source(
            "-- +migrate Up\nBEGIN TRANSACTION;\nCREATE TABLE IF NOT EXISTS a (id INTEGER);\nEND TRANSACTION;\n",
        );
        assert!(engine.validate(&begin_transaction).is_ok());
    }

    #[test]
    fn test_advisory_rule_reports_but_does_not_block() {
        let engine = ValidationEngine::with_defaults(&[]).unwrap();
        let advisories = engine
            .validate(&wrapped("CREATE TABLE users (id INTEGER);", "DROP TABLE users;"))
            .unwrap();

        assert_eq!(advisories.len(), 1);
        assert_eq!(advisories[0].rule, "require_if_not_exists");
    }

    #[test]
    fn test_disabled_rules_are_not_registered() {
        let engine = ValidationEngine::with_defaults(&["no_drop_table".to_owned()]).unwrap();
        assert!(!engine.rule_names().contains(&"no_drop_table"));
        assert!(engine
            .validate(&wrapped("DROP TABLE IF EXISTS users;", ""))
            .is_ok());
    }

    #[test]
    fn test_custom_rule_is_appended() {
        let mut engine = ValidationEngine::empty();
        engine.add_rule(Box::new(
            ForbidPattern::new("no_vacuum", "VACUUM is not allowed in migrations", r"(?i)\bVACUUM\b", true)
                .unwrap(),
        ));

        assert!(engine.rules[0].matches("vacuum;"));
        assert_eq!(failed_rule(engine.validate(&source("VACUUM;"))), "no_vacuum");
    }
}
