//! Safe transforms: idempotent normalisation rules applied on the first repair.

use regex::Regex;

use crate::patchwork_config::{RepairSection, TransformTarget};
use crate::unit::{Patch, Step};

#[derive(Debug, Clone)]
pub struct TransformRule {
    pub name: String,
    regex: Regex,
    replacement: String,
    target: TransformTarget,
}

impl TransformRule {
    pub fn new(
        name: &str,
        pattern: &str,
        replacement: &str,
        target: TransformTarget,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            regex: Regex::new(pattern)?,
            replacement: replacement.to_string(),
            target,
        })
    }

    fn rewrite(&self, text: &mut String) -> bool {
        let replaced = self
            .regex
            .replace_all(text, self.replacement.as_str())
            .into_owned();
        if replaced == *text {
            return false;
        }
        *text = replaced;
        true
    }
}

/// Built-in rules: line endings, byte-order marks, terminal escapes, and a
/// leading `sudo` (steps already run with the executor's privileges).
pub fn builtin_rules() -> Vec<TransformRule> {
    [
        ("strip-crlf", r"\r\n", "\n", TransformTarget::Both),
        ("strip-bom", "\u{feff}", "", TransformTarget::Both),
        ("strip-ansi", r"\x1b\[[0-9;]*[A-Za-z]", "", TransformTarget::Both),
        ("drop-sudo", r"^\s*sudo\s+", "", TransformTarget::Command),
    ]
    .into_iter()
    .filter_map(|(name, pattern, replacement, target)| {
        TransformRule::new(name, pattern, replacement, target).ok()
    })
    .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SafeTransformer {
    rules: Vec<TransformRule>,
}

impl SafeTransformer {
    pub fn new(rules: Vec<TransformRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules (unless disabled) followed by configured ones.
    /// Rules with invalid patterns are skipped with a warning.
    pub fn from_config(section: &RepairSection) -> Self {
        let mut rules = if section.builtin_transforms {
            builtin_rules()
        } else {
            Vec::new()
        };
        for rule in &section.safe_transforms {
            match TransformRule::new(&rule.name, &rule.pattern, &rule.replacement, rule.applies_to)
            {
                Ok(r) => rules.push(r),
                Err(e) => tracing::warn!(rule = %rule.name, error = %e, "skipping invalid safe transform"),
            }
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    /// Apply every rule to every step. Returns the names of rules that changed
    /// something.
    pub fn apply(&self, patch: &mut Patch) -> Vec<String> {
        let mut changed = Vec::new();
        for rule in &self.rules {
            let mut hit = false;
            for kind in crate::unit::PhaseKind::all() {
                for step in patch.phases.steps_mut(*kind).iter_mut() {
                    hit |= match step {
                        Step::Command(c) if rule.target != TransformTarget::Content => {
                            rule.rewrite(&mut c.run)
                        }
                        Step::Mutation(m) if rule.target != TransformTarget::Command => {
                            rule.rewrite(&mut m.content)
                        }
                        _ => false,
                    };
                }
            }
            if hit {
                changed.push(rule.name.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patchwork_config::TransformRuleConfig;
    use crate::unit::{Phases, UnitId};

    fn patch() -> Patch {
        Patch::new(
            UnitId::parse("1.1-a").unwrap(),
            Phases {
                pre_mutation: vec![Step::command("sudo mkdir -p conf\r\n")],
                mutation: vec![Step::write("conf/a.txt", "\u{feff}key=1\r\nother=2\r\n")],
                validate: vec![Step::command("grep -q key conf/a.txt")],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_builtin_rules_normalise_and_are_idempotent() {
        let transformer = SafeTransformer::from_config(&RepairSection::default());
        let mut p = patch();
        let changed = transformer.apply(&mut p);
        assert_eq!(changed, vec!["strip-crlf", "strip-bom", "drop-sudo"]);

        match &p.phases.pre_mutation[0] {
            Step::Command(c) => assert_eq!(c.run, "mkdir -p conf\n"),
            _ => panic!("Expected command"),
        }
        match &p.phases.mutation[0] {
            Step::Mutation(m) => assert_eq!(m.content, "key=1\nother=2\n"),
            _ => panic!("Expected mutation"),
        }

        let before = p.clone();
        assert!(transformer.apply(&mut p).is_empty());
        assert_eq!(p, before);
    }

    #[test]
    fn test_ansi_escapes_removed() {
        let transformer = SafeTransformer::new(builtin_rules());
        let mut p = Patch::new(
            UnitId::parse("1.1-a").unwrap(),
            Phases {
                validate: vec![Step::command("echo \u{1b}[32mok\u{1b}[0m")],
                ..Default::default()
            },
        );
        assert_eq!(transformer.apply(&mut p), vec!["strip-ansi"]);
    }

    #[test]
    fn test_configured_rules_respect_target() {
        let section = RepairSection {
            builtin_transforms: false,
            safe_transforms: vec![
                TransformRuleConfig {
                    name: "no-force".into(),
                    pattern: " --force".into(),
                    replacement: String::new(),
                    applies_to: TransformTarget::Command,
                },
                TransformRuleConfig {
                    name: "broken".into(),
                    pattern: "(".into(),
                    replacement: String::new(),
                    applies_to: TransformTarget::Both,
                },
            ],
            ..Default::default()
        };
        let transformer = SafeTransformer::from_config(&section);
        assert_eq!(transformer.rules().len(), 1);

        let mut p = Patch::new(
            UnitId::parse("1.1-a").unwrap(),
            Phases {
                mutation: vec![Step::write("notes.txt", "use --force here")],
                validate: vec![Step::command("git push --force")],
                ..Default::default()
            },
        );
        assert_eq!(transformer.apply(&mut p), vec!["no-force"]);
        match &p.phases.mutation[0] {
            Step::Mutation(m) => assert_eq!(m.content, "use --force here"),
            _ => panic!("Expected mutation"),
        }
    }
}
