//! Renders configuration templates against a set of variable bindings.
//!
//! Rendering is a pure substitution: identical inputs always produce identical output,
//! and nothing here touches the network. Templates are rendered on the control node
//! before any remote step runs, so a bad template aborts a task before it mutates
//! anything.
//!
//! # Placeholder syntax
//!
//! Two forms of substitution are supported:
//!
//! 1. Braced substitution (`${var}`): replaced with the binding named `var`. A braced
//!    placeholder with no binding is an error; braced placeholders are how templates
//!    declare the values they require.
//!
//! 2. Simple substitution (`$var`): any whole-word occurrence of `$var` is replaced
//!    with the binding named `var`, if one exists. If no binding exists, the text
//!    passes through unchanged. This keeps templates for programs with their own `$`
//!    syntax (notably the reverse proxy's `$host`, `$remote_addr`, and friends)
//!    renderable without an escape mechanism.

use anyhow::Context as _;
use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::path::Path;

/// A braced placeholder in a template had no binding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateError {
    /// The name of the template being rendered.
    pub template: String,

    /// The placeholder that had no binding.
    pub placeholder: String,
}

impl Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "template {} requires ${{{}}}, which has no binding",
            self.template, self.placeholder,
        )
    }
}

impl Error for TemplateError {}

/// Reads the template named `name` from `dir`.
pub fn load(dir: impl AsRef<Path>, name: &str) -> anyhow::Result<String> {
    let path = dir.as_ref().join(name);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read template: {}", path.display()))
}

/// Renders `source` by substituting `vars`, in binding order.
///
/// `name` identifies the template in error messages; it plays no role in substitution.
pub fn render(
    name: &str,
    source: &str,
    vars: &IndexMap<String, String>,
) -> Result<String, TemplateError> {
    let mut text = source.to_owned();

    for (var, value) in vars {
        // Form a regular expression that matches $<var> (as a whole word) and ${<var>}
        // where <var> is the name of the binding.
        let pattern = format!(r"\${var}\b|\$\{{{var}}}");
        let regex = Regex::new(&pattern).unwrap();
        text = regex.replace_all(&text, NoExpand(value)).into_owned();
    }

    // Any braced placeholder still standing has no binding.
    let unresolved = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)}").unwrap();
    if let Some(captures) = unresolved.captures(&text) {
        return Err(TemplateError {
            template: name.to_owned(),
            placeholder: captures[1].to_owned(),
        });
    }

    Ok(text)
}
