use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid expression regex"));

/// Context for variable interpolation in step inputs.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline and job variables
    pub variables: HashMap<String, String>,
    /// Matrix values for the current instance
    pub matrix: BTreeMap<String, String>,
    /// Secret values to mask in output, never interpolated
    pub secrets: HashMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - variable, falling back to the process environment
    /// - `${{ matrix.key }}` - matrix value, inserted verbatim
    ///
    /// Unknown names resolve to an empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }

    /// Mask secrets in the input string.
    pub fn mask_secrets(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in self.secrets.values() {
            if !value.is_empty() {
                output = output.replace(value, "***");
            }
        }
        output
    }
}
