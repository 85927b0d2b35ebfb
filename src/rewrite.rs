/// Replaces an outdated import path with its successor.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

impl RewriteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn matches(&self, content: &str) -> bool {
        !self.from.is_empty() && content.contains(&self.from)
    }

    /// Rewrites every occurrence, or returns `None` when there is nothing
    /// to change.
    pub fn apply(&self, content: &str) -> Option<String> {
        if !self.matches(content) {
            return None;
        }
        let rewritten = content.replace(&self.from, &self.to);
        (rewritten != content).then_some(rewritten)
    }
}

impl Default for RewriteRule {
    fn default() -> Self {
        Self::new("github.com/golang/lint/golint", "golang.org/x/lint/golint")
    }
}
