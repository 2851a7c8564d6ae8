//! Text template rendering over the request variable bundle.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::error::AppResult;

/// Render `template` against `vars`. Used for urls, queries, command lines,
/// file paths, email subjects and bodies. Parsing and rendering share no
/// state across calls; an undefined variable is an error, never a blank.
pub fn render<S: Serialize>(template: &str, vars: &S) -> AppResult<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let tmpl = env.template_from_str(template)?;
    Ok(tmpl.render(vars)?)
}

/// Parse `template` without rendering it. Lets factories reject broken
/// templates at startup instead of on the first request.
pub fn verify(template: &str) -> AppResult<()> {
    let env = Environment::new();
    env.template_from_str(template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_field_access() {
        let vars = json!({"url": {"id": "42"}, "query": {"q": "x"}});
        assert_eq!(render("item {{ url.id }}", &vars).unwrap(), "item 42");
        assert_eq!(render("{{ query.q }}", &vars).unwrap(), "x");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("echo hi", &json!({})).unwrap(), "echo hi");
    }

    #[test]
    fn undefined_variable_is_error() {
        assert!(render("{{ nope.missing }}", &json!({})).is_err());
    }

    #[test]
    fn rendering_is_pure() {
        let vars = json!({"url": {"id": "1"}});
        let a = render("{{ url.id }}-{{ url.id }}", &vars).unwrap();
        let b = render("{{ url.id }}-{{ url.id }}", &vars).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn verify_rejects_broken_syntax() {
        assert!(verify("{{ unclosed").is_err());
        assert!(verify("{{ ok }}").is_ok());
    }
}
