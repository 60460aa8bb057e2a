use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::web::state::AppState;
use crate::web::templates::render_template;

// Main UI entry point
pub async fn index_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let prefs = state.session.read().await.prefs();

    let mut context = HashMap::new();
    context.insert(
        "version",
        minijinja::value::Value::from(env!("CARGO_PKG_VERSION")),
    );
    context.insert("prefs", minijinja::value::Value::from_serialize(&prefs));

    Html(render_template(&state.template_env, "index.html", context))
}
