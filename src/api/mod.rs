// API 路由汇总入口：任务路由挂载限流守卫，静态资源只受全局限流约束。
pub mod errors;
mod guards;
pub mod pages;
pub mod tasks;

use crate::state::AppState;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    let app = tasks::router().route_layer(from_fn_with_state(
        state.clone(),
        guards::endpoint_rate_limit,
    ));
    let app = mount_static(app, state.clone(), &state.config.web.static_dir, "/static");
    app.layer(TraceLayer::new_for_http())
        .layer(from_fn(guards::panic_guard))
        .with_state(state)
}

fn mount_static(
    app: Router<Arc<AppState>>,
    state: Arc<AppState>,
    dir: &str,
    route: &str,
) -> Router<Arc<AppState>> {
    let path = PathBuf::from(dir);
    if !path.is_dir() {
        // 目录不存在时不挂载，避免裁剪部署后启动报错。
        return app;
    }
    let assets: Router = Router::new()
        .fallback_service(ServeDir::new(path))
        .layer(from_fn_with_state(state.clone(), guards::global_rate_limit))
        .with_state(state);
    app.nest_service(route.trim_end_matches('/'), assets)
}
