use handlebars::{Handlebars, RenderError};
use once_cell::sync::Lazy;
use serde::Serialize;

// Prompts are plain text; HTML escaping would mangle quotes and ampersands.
static TEMPLATES: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.set_strict_mode(true);
    hb
});

pub fn render<T: Serialize>(template: &str, data: &T) -> Result<String, RenderError> {
    TEMPLATES.render_template(template, data)
}
