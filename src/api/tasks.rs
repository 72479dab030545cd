// 任务路由：列表/新建、删除、编辑查看与编辑提交。
use crate::api::pages;
use crate::identity::ClientIdentity;
use crate::state::AppState;
use crate::storage::{normalize_content, TaskError, TaskResult, TaskStore};
use anyhow::anyhow;
use axum::extract::rejection::{FormRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index).post(create_task))
        .route("/delete/{id}", get(delete_task))
        .route("/edit/{id}", get(edit_view).post(edit_submit))
}

#[derive(Debug, Default, Deserialize)]
struct TaskForm {
    #[serde(default)]
    content: String,
}

fn read_form(form: Result<Form<TaskForm>, FormRejection>) -> TaskForm {
    match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            debug!("表单解析失败，按空内容处理: {rejection}");
            TaskForm::default()
        }
    }
}

/// 与整数路由参数一致：无法解析的 id 视为不存在。
fn read_task_id(id: Result<Path<i64>, PathRejection>) -> TaskResult<i64> {
    match id {
        Ok(Path(id)) => Ok(id),
        Err(rejection) => {
            debug!("任务 id 无效: {rejection}");
            Err(TaskError::NotFound(0))
        }
    }
}

async fn run_store<T, F>(state: &AppState, task: F) -> TaskResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn TaskStore) -> TaskResult<T> + Send + 'static,
{
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || task(store.as_ref())).await {
        Ok(result) => result,
        Err(err) => Err(TaskError::Storage(anyhow!("task store join error: {err}"))),
    }
}

fn finish(state: &AppState, identity: &ClientIdentity, result: TaskResult<Response>) -> Response {
    let mut response = result.unwrap_or_else(IntoResponse::into_response);
    state.identity.attach_if_issued(&mut response, identity);
    response
}

async fn index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = state.identity.resolve(&headers);
    let owner_id = identity.owner_id().to_string();
    let result = run_store(&state, move |store| store.list_by_owner(&owner_id))
        .await
        .map(|tasks| Html(pages::render_index(&tasks)).into_response());
    let mut response = result.unwrap_or_else(IntoResponse::into_response);
    state.identity.attach(&mut response, &identity);
    response
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<TaskForm>, FormRejection>,
) -> Response {
    let identity = state.identity.resolve(&headers);
    let form = read_form(form);
    let result = async {
        let content = normalize_content(&form.content)?;
        let owner_id = identity.owner_id().to_string();
        run_store(&state, move |store| store.create(&owner_id, &content)).await?;
        Ok::<_, TaskError>(Redirect::to("/").into_response())
    }
    .await;
    let mut response = result.unwrap_or_else(IntoResponse::into_response);
    state.identity.attach(&mut response, &identity);
    response
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Response {
    let identity = state.identity.resolve(&headers);
    let result = async {
        let id = read_task_id(id)?;
        let owner_id = identity.owner_id().to_string();
        run_store(&state, move |store| store.delete(id, &owner_id)).await?;
        Ok::<_, TaskError>(Redirect::to("/").into_response())
    }
    .await;
    finish(&state, &identity, result)
}

async fn edit_view(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Response {
    let identity = state.identity.resolve(&headers);
    let result = async {
        let id = read_task_id(id)?;
        let owner_id = identity.owner_id().to_string();
        let task = run_store(&state, move |store| store.get_owned(id, &owner_id)).await?;
        Ok::<_, TaskError>(Html(pages::render_edit(&task)).into_response())
    }
    .await;
    finish(&state, &identity, result)
}

async fn edit_submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
    form: Result<Form<TaskForm>, FormRejection>,
) -> Response {
    let identity = state.identity.resolve(&headers);
    let form = read_form(form);
    let result = async {
        let id = read_task_id(id)?;
        let owner_id = identity.owner_id().to_string();
        // 存储层按 404 → 403 → 400 的顺序校验。
        run_store(&state, move |store| {
            store.update_content(id, &owner_id, &form.content)
        })
        .await?;
        Ok::<_, TaskError>(Redirect::to("/").into_response())
    }
    .await;
    finish(&state, &identity, result)
}
