//! Minimal chat templating.
//!
//! Wraps a raw prompt in the manifest's template fragments when
//! `use_chat_template` is requested. Models without a template pass the
//! prompt through unchanged.

use doppler_model::manifest::ChatTemplate;

pub fn apply_chat_template(template: Option<&ChatTemplate>, prompt: &str) -> String {
    match template {
        Some(t) => format!("{}{}{}", t.prefix, prompt, t.suffix),
        None => prompt.to_string(),
    }
}
