//! Rule database
//!
//! Raw rules are one per line: `id,group,pattern` or just `pattern`
//! (numbered from 1, group 1). Lines starting with `#` are comments.
//! Compiling validates every pattern and produces a database that is
//! stored as JSON and loaded by the device at init.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Database format version
pub const RULES_VERSION: u32 = 1;

/// Default rule group
pub const DEFAULT_GROUP: u16 = 1;

/// One matching rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id reported in matches
    pub id: u32,
    /// Rule group selected by ops
    pub group: u16,
    /// Regular expression
    pub pattern: String,
}

/// Compiled rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDatabase {
    /// Database format version
    pub version: u32,
    /// Rules in file order
    pub rules: Vec<Rule>,
}

impl RuleDatabase {
    /// Parse and validate raw rules text
    pub fn compile(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        let mut next_id = 1u32;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let rule = parse_line(line).unwrap_or_else(|| Rule {
                id: next_id,
                group: DEFAULT_GROUP,
                pattern: line.to_string(),
            });

            if rule.group == 0 {
                return Err(PipelineError::Rules(format!(
                    "line {}: group 0 is reserved",
                    lineno + 1
                )));
            }
            regex::bytes::Regex::new(&rule.pattern).map_err(|e| {
                PipelineError::Rules(format!("line {}: {}", lineno + 1, e))
            })?;

            next_id = next_id.max(rule.id.saturating_add(1));
            rules.push(rule);
        }

        if rules.is_empty() {
            return Err(PipelineError::Rules("no rules defined".into()));
        }

        Ok(Self {
            version: RULES_VERSION,
            rules,
        })
    }

    /// Compile a raw rules file
    pub fn compile_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Rules(format!("{}: {}", path.display(), e))
        })?;
        Self::compile(&text)
    }

    /// Load a compiled database
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Rules(format!("{}: {}", path.display(), e))
        })?;
        let db: RuleDatabase = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Rules(format!("{}: {}", path.display(), e)))?;

        if db.version != RULES_VERSION {
            return Err(PipelineError::Rules(format!(
                "{}: unsupported rules version {}",
                path.display(),
                db.version
            )));
        }
        Ok(db)
    }

    /// Write the compiled database
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Rules(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules were loaded
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_line(line: &str) -> Option<Rule> {
    let mut fields = line.splitn(3, ',');
    let id = fields.next()?.trim().parse().ok()?;
    let group = fields.next()?.trim().parse().ok()?;
    let pattern = fields.next()?.to_string();
    Some(Rule { id, group, pattern })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_mixed_formats() {
        let db = RuleDatabase::compile(
            "# url checks\n\
             10,2,/admin[0-9]+\n\
             \n\
             evil\\.com\n\
             20,1,a,b\n",
        )
        .unwrap();

        assert_eq!(db.len(), 3);
        assert_eq!(db.rules[0], Rule { id: 10, group: 2, pattern: "/admin[0-9]+".into() });
        assert_eq!(db.rules[1].id, 11);
        assert_eq!(db.rules[1].group, DEFAULT_GROUP);
        assert_eq!(db.rules[2].pattern, "a,b");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = RuleDatabase::compile("ok\n(unclosed\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_empty_rules_rejected() {
        assert!(RuleDatabase::compile("# nothing\n\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let db = RuleDatabase::compile("GET\nPOST\n").unwrap();
        db.save(&path).unwrap();
        assert_eq!(RuleDatabase::load(&path).unwrap(), db);
    }
}
