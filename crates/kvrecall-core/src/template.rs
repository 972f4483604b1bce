//! Prompt rendering.
//!
//! Templates are Jinja sources rendered with `facts_block`, `questions_block`,
//! `n`, `k` and `separator`. The rendered text is trimmed and terminated with
//! a blank line, so identical inputs always produce byte-identical prompts.

use minijinja::{context, Environment};
use sha2::{Digest, Sha256};

use crate::error::{KvError, KvResult};
use crate::facts::Instance;

const TEMPLATE_NAME: &str = "prompt";

pub const BUILTIN_TEMPLATE: &str = "\
Memorize the following {{ n }} facts. Each line maps a key to a value; \
keys and values are {{ k }} tokens joined by \"{{ separator }}\".

{{ facts_block }}

For each key below, write its value on its own line, in the same order. \
Output only the values, nothing else.

{{ questions_block }}
";

pub trait PromptRenderer: Send + Sync {
    /// Stable identifier written into every artifact rendered with this template.
    fn prompt_id(&self) -> &str;

    fn render(&self, fact_lines: &[String], keys: &[String], n: usize, k: usize)
        -> KvResult<String>;
}

/// `tpl_` followed by the first 8 hex chars of the SHA-256 of `source`.
pub fn prompt_id_for(source: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(source.as_bytes()));
    format!("tpl_{}", &digest[..8])
}

pub struct JinjaTemplate {
    env: Environment<'static>,
    prompt_id: String,
    separator: String,
}

impl JinjaTemplate {
    pub fn new(source: &str, separator: impl Into<String>) -> KvResult<Self> {
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME, source.to_string())
            .map_err(|e| KvError::Template(format!("parse error: {e}")))?;
        Ok(Self {
            env,
            prompt_id: prompt_id_for(source),
            separator: separator.into(),
        })
    }

    pub fn builtin(separator: impl Into<String>) -> KvResult<Self> {
        Self::new(BUILTIN_TEMPLATE, separator)
    }

    /// Override the derived id, e.g. to keep results of an edited template
    /// under the old directory.
    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = prompt_id.into().replace([' ', '/'], "_");
        self
    }
}

impl PromptRenderer for JinjaTemplate {
    fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    fn render(
        &self,
        fact_lines: &[String],
        keys: &[String],
        n: usize,
        k: usize,
    ) -> KvResult<String> {
        let tmpl = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| KvError::Template(e.to_string()))?;
        let text = tmpl
            .render(context! {
                facts_block => fact_lines.join("\n"),
                questions_block => keys.join("\n"),
                n => n,
                k => k,
                separator => self.separator.as_str(),
            })
            .map_err(|e| KvError::Template(format!("render error: {e}")))?;
        Ok(format!("{}\n\n", text.trim()))
    }
}

/// Prompt text plus the key order it asks in. Grading must use `keys`.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub text: String,
    pub keys: Vec<String>,
}

pub fn render_instance(renderer: &dyn PromptRenderer, instance: &Instance) -> KvResult<RenderedPrompt> {
    let text = renderer.render(
        &instance.fact_lines(),
        &instance.query_order,
        instance.num_facts,
        instance.k,
    )?;
    Ok(RenderedPrompt {
        text,
        keys: instance.query_order.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::InstanceGenerator;
    use crate::testing::oracle_answer;
    use crate::vocabulary::Vocabulary;
    use std::sync::Arc;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prompt_id_is_stable() {
        let a = prompt_id_for("hello {{ n }}");
        assert_eq!(a, prompt_id_for("hello {{ n }}"));
        assert_ne!(a, prompt_id_for("hello {{ k }}"));
        assert!(a.starts_with("tpl_"));
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_render_variables() {
        let tpl = JinjaTemplate::new("N={{ n }} K={{ k }}\n{{ facts_block }}\n--\n{{ questions_block }}", "|")
            .unwrap();
        let out = tpl
            .render(&lines(&["a => b", "c => d"]), &lines(&["c", "a"]), 2, 1)
            .unwrap();
        assert_eq!(out, "N=2 K=1\na => b\nc => d\n--\nc\na\n\n");
    }

    #[test]
    fn test_render_is_deterministic() {
        let tpl = JinjaTemplate::builtin("|").unwrap();
        let facts = lines(&["x|y => z|w"]);
        let keys = lines(&["x|y"]);
        let a = tpl.render(&facts, &keys, 1, 2).unwrap();
        let b = tpl.render(&facts, &keys, 1, 2).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("x|y\n\n"));
    }

    #[test]
    fn test_parse_error_is_template_error() {
        let err = JinjaTemplate::new("{% if %}", "|").err().unwrap();
        assert!(matches!(err, KvError::Template(_)));
    }

    #[test]
    fn test_prompt_id_override_sanitized() {
        let tpl = JinjaTemplate::builtin("|").unwrap().with_prompt_id("my prompt/v2");
        assert_eq!(tpl.prompt_id(), "my_prompt_v2");
    }

    #[test]
    fn test_render_instance_keeps_key_order() {
        let vocab = Arc::new(Vocabulary::new("t", (0..30).map(|i| format!("w{i}"))));
        let inst = InstanceGenerator::new(vocab, "|", Some(5)).generate(4, 2).unwrap();
        let tpl = JinjaTemplate::builtin("|").unwrap();
        let rendered = render_instance(&tpl, &inst).unwrap();
        assert_eq!(rendered.keys, inst.query_order);
        assert_eq!(oracle_answer(&rendered.text), inst.expected_text());
    }
}
