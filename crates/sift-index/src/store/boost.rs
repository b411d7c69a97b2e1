//! Structural path boosting applied after base scoring.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostRule {
    pub pattern: String,
    pub factor: f32,
}

impl BoostRule {
    #[must_use]
    pub fn new(pattern: impl Into<String>, factor: f32) -> Self {
        Self {
            pattern: pattern.into(),
            factor,
        }
    }
}

/// Rules used when none are configured: de-emphasise tests, fixtures and
/// generated output; favour primary source directories.
#[must_use]
pub fn default_rules() -> Vec<BoostRule> {
    let mut rules = Vec::new();
    for pattern in [
        "**/test/**",
        "**/tests/**",
        "**/__tests__/**",
        "**/spec/**",
        "**/*_test.*",
        "**/*.test.*",
        "**/*.spec.*",
        "**/test_*.*",
    ] {
        rules.push(BoostRule::new(pattern, 0.5));
    }
    for pattern in ["**/mocks/**", "**/fixtures/**", "**/testdata/**"] {
        rules.push(BoostRule::new(pattern, 0.6));
    }
    for pattern in ["**/generated/**", "**/*.generated.*", "**/*.min.js", "**/*.pb.go"] {
        rules.push(BoostRule::new(pattern, 0.4));
    }
    for pattern in [
        "**/src/**",
        "**/lib/**",
        "**/cmd/**",
        "**/internal/**",
        "**/pkg/**",
        "**/app/**",
    ] {
        rules.push(BoostRule::new(pattern, 1.2));
    }
    rules
}

/// Compiled boost rules. The multiplier for a path is the product of the
/// factors of every rule it matches, or `1.0` when none match.
#[derive(Debug, Clone)]
pub struct PathBooster {
    set: GlobSet,
    factors: Vec<f32>,
}

impl PathBooster {
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` for a malformed glob or a factor that is
    /// not finite and positive.
    pub fn new(rules: &[BoostRule]) -> Result<Self, StoreError> {
        let mut builder = GlobSetBuilder::new();
        let mut factors = Vec::with_capacity(rules.len());
        for rule in rules {
            if !rule.factor.is_finite() || rule.factor <= 0.0 {
                return Err(StoreError::Invalid(format!(
                    "boost factor for `{}` must be positive, got {}",
                    rule.pattern, rule.factor
                )));
            }
            let glob = GlobBuilder::new(&rule.pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    StoreError::Invalid(format!("invalid boost pattern `{}`: {e}", rule.pattern))
                })?;
            builder.add(glob);
            factors.push(rule.factor);
        }
        let set = builder
            .build()
            .map_err(|e| StoreError::Invalid(format!("boost rules: {e}")))?;
        Ok(Self { set, factors })
    }

    /// A booster that leaves every score unchanged.
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            set: GlobSet::empty(),
            factors: Vec::new(),
        }
    }

    #[must_use]
    pub fn multiplier(&self, path: &str) -> f32 {
        self.set
            .matches(path)
            .into_iter()
            .map(|idx| self.factors[idx])
            .product()
    }
}

impl Default for PathBooster {
    fn default() -> Self {
        Self::new(&default_rules()).unwrap_or_else(|_| Self::neutral())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_path_is_neutral() {
        let booster = PathBooster::new(&[BoostRule::new("tests/**", 0.5)]).unwrap();
        assert!((booster.multiplier("README.md") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn factors_multiply() {
        let booster = PathBooster::new(&[
            BoostRule::new("**/tests/**", 0.5),
            BoostRule::new("**/*_test.*", 0.5),
        ])
        .unwrap();
        assert!((booster.multiplier("pkg/tests/auth_test.go") - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn defaults_demote_tests_and_promote_src() {
        let booster = PathBooster::default();
        assert!(booster.multiplier("tests/login.rs") < 1.0);
        assert!(booster.multiplier("src/login.rs") > 1.0);
        assert!(booster.multiplier("web/app.min.js") < 1.0);
        assert!(booster.multiplier("internal/mocks/db.go") < 1.0);
    }

    #[test]
    fn invalid_rules_rejected() {
        assert!(PathBooster::new(&[BoostRule::new("src/[", 1.0)]).is_err());
        assert!(PathBooster::new(&[BoostRule::new("src/**", 0.0)]).is_err());
        assert!(PathBooster::new(&[BoostRule::new("src/**", f32::NAN)]).is_err());
    }

    #[test]
    fn star_does_not_cross_directories() {
        let booster = PathBooster::default();
        assert!((booster.multiplier("docs/test_plan/notes.md") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn neutral_matches_nothing() {
        assert!((PathBooster::neutral().multiplier("tests/a.rs") - 1.0).abs() < f32::EPSILON);
    }
}
