use axum::{
    extract::Query,
    http::header,
    response::IntoResponse,
    Json,
};
use minijinja::{context, Environment};
use serde::Deserialize;
use serde_json::{json, Value};

const EMBED_SCRIPT: &str = include_str!("../assets/embed.js");
const EMBED_SNIPPET_TEMPLATE: &str = include_str!("templates/embed_snippet.j2");
const CUSTOMER_SERVICE_TEMPLATE: &str = include_str!("templates/preset_customer_service.j2");
const PRODUCT_SUPPORT_TEMPLATE: &str = include_str!("templates/preset_product_support.j2");

const PRESETS: [(&str, &str, &str); 2] = [
    ("customer_service", "Basic Customer Service", CUSTOMER_SERVICE_TEMPLATE),
    ("product_support", "Product Support", PRODUCT_SUPPORT_TEMPLATE),
];

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let rendered = env.get_template(name).ok()?.render(ctx).ok()?;
    Some(rendered.trim().to_string())
}

/// The `<script>` tag an operator pastes into a third-party page.
pub fn embed_snippet(base_url: &str, chatbot_id: &str) -> String {
    render(
        "embed_snippet",
        EMBED_SNIPPET_TEMPLATE,
        context! { base_url => base_url, chatbot_id => chatbot_id },
    )
    .unwrap_or_else(|| {
        format!(
            "<script src=\"{base_url}/embed.js\" data-chatbot-id=\"{chatbot_id}\" data-host-url=\"{base_url}\"></script>"
        )
    })
}

pub async fn embed_script() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        EMBED_SCRIPT,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct PresetQuery {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn instruction_presets(Query(query): Query<PresetQuery>) -> Json<Value> {
    let name = query.name.as_deref().map(str::trim).unwrap_or_default();
    let presets: Vec<Value> = PRESETS
        .iter()
        .filter_map(|(id, label, source)| {
            let instructions = render(id, source, context! { name => name })?;
            Some(json!({ "id": id, "label": label, "instructions": instructions }))
        })
        .collect();
    Json(json!({ "data": presets }))
}
