//! Axum + Askama presentation layer for Grantboard.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use grantboard_core::{Category, CategoryFilter, Opportunity};
use grantboard_session::{start_from_config, ActionError, BoardConfig, BoardState, BoardView};
use grantboard_storage::AdminToggle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "grantboard-web";

/// Shared server state. The mutex serialises handlers so each action runs
/// mutate → recompute → render before the next one starts.
pub struct AppState {
    pub workspace_root: PathBuf,
    board: Mutex<BoardState>,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, board: BoardState) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            board: Mutex::new(board),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    q: Option<String>,
    category: Option<String>,
    admin: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CardsQuery {
    q: Option<String>,
    category: Option<String>,
}

#[derive(Debug, Clone)]
struct NavItem {
    code: &'static str,
    label: &'static str,
    active: bool,
}

const NAV: [(&str, &str); 5] = [
    ("all", "Todos"),
    (Category::HEALTH, "Saúde"),
    (Category::HUMAN_RIGHTS, "Direitos Humanos"),
    (Category::RESEARCH, "Pesquisa"),
    ("saved", "Salvos"),
];

fn nav_items(view: &BoardView) -> Vec<NavItem> {
    NAV.iter()
        .map(|&(code, label)| NavItem {
            code,
            label,
            active: view.category == code,
        })
        .collect()
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    view: BoardView,
    nav: Vec<NavItem>,
    oob: bool,
}

#[derive(Template)]
#[template(path = "cards_partial.html")]
struct CardsPartialTemplate {
    view: BoardView,
    nav: Vec<NavItem>,
    oob: bool,
}

#[derive(Template)]
#[template(path = "opportunity_detail.html")]
struct OpportunityDetailTemplate {
    opportunity: Opportunity,
}

#[derive(Template)]
#[template(path = "load_error.html")]
struct LoadErrorTemplate {
    detail: String,
}

#[derive(Template)]
#[template(path = "load_error_panel.html")]
struct LoadErrorPanelTemplate {
    detail: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/view", get(view_json_handler))
        .route("/opportunities/cards", get(cards_handler))
        .route("/opportunities/{id}", get(opportunity_detail_handler))
        .route("/opportunities/{id}/save", post(toggle_save_handler))
        .route("/opportunities/{id}/discard", post(discard_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &BoardConfig) -> anyhow::Result<()> {
    let board = start_from_config(config, AdminToggle::Keep).await?;
    let state = AppState::new(".", board);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, source = %config.source, "serving opportunity board");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&BoardConfig::from_env()).await
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<PageQuery>) -> Response {
    let mut board = state.board.lock().await;
    let session = match &mut *board {
        BoardState::Ready(session) => session,
        BoardState::LoadFailed(err) => {
            return render_html(LoadErrorTemplate {
                detail: err.to_string(),
            })
        }
    };

    session.apply_admin_toggle(AdminToggle::from_arg(query.admin.as_deref()));
    session.on_search_changed(query.q.unwrap_or_default());
    let view = session.on_category_selected(CategoryFilter::parse(
        query.category.as_deref().unwrap_or_default(),
    ));
    let nav = nav_items(&view);
    render_html(IndexTemplate {
        view,
        nav,
        oob: false,
    })
}

async fn view_json_handler(State(state): State<Arc<AppState>>) -> Response {
    let board = state.board.lock().await;
    match &*board {
        BoardState::Ready(session) => Json(session.view()).into_response(),
        BoardState::LoadFailed(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body(err.to_string())),
        )
            .into_response(),
    }
}

async fn cards_handler(State(state): State<Arc<AppState>>, Query(query): Query<CardsQuery>) -> Response {
    let mut board = state.board.lock().await;
    let session = match &mut *board {
        BoardState::Ready(session) => session,
        BoardState::LoadFailed(err) => return load_failed_partial(err.to_string()),
    };

    if let Some(q) = query.q {
        session.on_search_changed(q);
    }
    let view = match query.category {
        Some(category) => session.on_category_selected(CategoryFilter::parse(&category)),
        None => session.view(),
    };
    render_cards(view)
}

async fn toggle_save_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let mut board = state.board.lock().await;
    let session = match &mut *board {
        BoardState::Ready(session) => session,
        BoardState::LoadFailed(err) => return load_failed_partial(err.to_string()),
    };
    let id = session.resolve_id(&id);
    render_cards(session.on_toggle_save(&id))
}

async fn discard_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let mut board = state.board.lock().await;
    let session = match &mut *board {
        BoardState::Ready(session) => session,
        BoardState::LoadFailed(err) => return load_failed_partial(err.to_string()),
    };

    let id = session.resolve_id(&id);
    match session.on_discard(&id) {
        Ok(view) => render_cards(view),
        Err(ActionError::Forbidden) => (
            StatusCode::FORBIDDEN,
            Html("Descartar editais exige modo administrador".to_string()),
        )
            .into_response(),
        Err(err @ ActionError::Storage(_)) => {
            warn!(%id, %err, "discard not persisted");
            server_error(anyhow::anyhow!(err))
        }
    }
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let board = state.board.lock().await;
    let session = match &*board {
        BoardState::Ready(session) => session,
        BoardState::LoadFailed(err) => return load_failed_partial(err.to_string()),
    };

    let id = session.resolve_id(&id);
    match session.on_record_selected(&id) {
        Ok(opportunity) => render_html(OpportunityDetailTemplate {
            opportunity: opportunity.clone(),
        }),
        Err(_) => (StatusCode::NOT_FOUND, Html("Edital não encontrado".to_string())).into_response(),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn render_cards(view: BoardView) -> Response {
    let nav = nav_items(&view);
    render_html(CardsPartialTemplate {
        view,
        nav,
        oob: true,
    })
}

fn load_failed_partial(detail: String) -> Response {
    match (LoadErrorPanelTemplate { detail }).render() {
        Ok(html) => (StatusCode::SERVICE_UNAVAILABLE, Html(html)).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn error_body(message: String) -> std::collections::BTreeMap<&'static str, String> {
    std::collections::BTreeMap::from([("error", message)])
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use axum::body::Body;
    use grantboard_core::{OpportunityId, OpportunityStore};
    use grantboard_session::Session;
    use grantboard_storage::{KeyValueStore, LoadError, MemoryKeyValueStore, ADMIN_KEY};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_board(admin: bool) -> BoardState {
        board_with(fixture_records(), admin)
    }

    fn board_with(records: Vec<Opportunity>, admin: bool) -> BoardState {
        let mut kv = MemoryKeyValueStore::new();
        if admin {
            kv.set(ADMIN_KEY, "true").unwrap();
        }
        BoardState::Ready(Session::new(
            OpportunityStore::new(records).unwrap(),
            Box::new(kv),
            AdminToggle::Keep,
        ))
    }

    fn text_record(id: &str, title: &str) -> Opportunity {
        Opportunity {
            id: OpportunityId::from(id),
            title: title.into(),
            org: "Fundo Municipal".into(),
            desc: String::new(),
            amount: "R$ 5.000".into(),
            deadline: "15/03/2027".into(),
            link: "https://example.org/editais".into(),
            category: Category::new("cultura"),
            saved: false,
        }
    }

    fn fixture_records() -> Vec<Opportunity> {
        let mk = |id: i64, title: &str, org: &str, category: &str| Opportunity {
            id: OpportunityId::Int(id),
            title: title.into(),
            org: org.into(),
            desc: format!("Descrição de {title}"),
            amount: "R$ 20.000".into(),
            deadline: "01/12/2026".into(),
            link: format!("https://example.org/editais/{id}"),
            category: Category::new(category),
            saved: false,
        };
        vec![
            mk(1, "Bolsa de Pesquisa X", "Fund Y", "pesquisa"),
            mk(2, "Saúde Mental na Comunidade", "Instituto Z", "saude"),
            mk(3, "Direitos em Foco", "Open Society", "direitos"),
        ]
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn index_renders_cards_and_counters() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Bolsa de Pesquisa X"));
        assert!(text.contains("Saúde Mental na Comunidade"));
        assert!(!text.contains("discard-btn"));
    }

    #[tokio::test]
    async fn cards_partial_filters_by_search_and_category() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app
            .clone()
            .oneshot(get("/opportunities/cards?q=SA%C3%9ADE&category=all"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Saúde Mental na Comunidade"));
        assert!(!text.contains("Bolsa de Pesquisa X"));

        let resp = app
            .oneshot(get("/opportunities/cards?q=&category=direitos"))
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("Direitos em Foco"));
        assert!(!text.contains("Saúde Mental na Comunidade"));
    }

    #[tokio::test]
    async fn save_toggle_updates_saved_view() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.clone().oneshot(post("/opportunities/3/save")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/api/view")).await.unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("\"saved_count\":1"));
    }

    #[tokio::test]
    async fn discard_is_forbidden_without_admin() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.oneshot(post("/opportunities/1/discard")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_discard_hides_card() {
        let app = app(AppState::new(workspace_root(), fixture_board(true)));
        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert!(body_text(resp).await.contains("discard-btn"));

        let resp = app.clone().oneshot(post("/opportunities/1/discard")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(!text.contains("Bolsa de Pesquisa X"));
        assert!(text.contains("Direitos em Foco"));
    }

    #[tokio::test]
    async fn admin_query_parameter_toggles_capability() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.clone().oneshot(get("/?admin=true")).await.unwrap();
        assert!(body_text(resp).await.contains("discard-btn"));

        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert!(body_text(resp).await.contains("discard-btn"));

        let resp = app.oneshot(get("/?admin=false")).await.unwrap();
        assert!(!body_text(resp).await.contains("discard-btn"));
    }

    #[tokio::test]
    async fn detail_modal_and_missing_record() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.clone().oneshot(get("/opportunities/2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("SAUDE"));
        assert!(text.contains("Acessar Edital Oficial"));

        let resp = app.oneshot(get("/opportunities/99")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn digit_only_text_ids_are_reachable_over_http() {
        let records = vec![text_record("101", "Edital Cultura Viva")];
        let app = app(AppState::new(workspace_root(), board_with(records, true)));

        let resp = app.clone().oneshot(get("/opportunities/101")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("Edital Cultura Viva"));

        let resp = app.clone().oneshot(post("/opportunities/101/save")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.clone().oneshot(get("/api/view")).await.unwrap();
        assert!(body_text(resp).await.contains("\"saved_count\":1"));

        let resp = app.oneshot(post("/opportunities/101/discard")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(!text.contains("Edital Cultura Viva"));
        assert!(text.contains("Sem resultados encontrados."));
    }

    #[tokio::test]
    async fn card_paths_are_percent_encoded() {
        let records = vec![text_record("edital 7/a", "Prêmio Periferia")];
        let app = app(AppState::new(workspace_root(), board_with(records, true)));

        let resp = app.clone().oneshot(get("/opportunities/cards")).await.unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("hx-get=\"/opportunities/edital%207%2Fa\""));
        assert!(text.contains("hx-post=\"/opportunities/edital%207%2Fa/save\""));
        assert!(text.contains("hx-post=\"/opportunities/edital%207%2Fa/discard\""));
        assert!(!text.contains("/opportunities/edital 7/a"));

        let resp = app
            .clone()
            .oneshot(get("/opportunities/edital%207%2Fa"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("Prêmio Periferia"));

        let resp = app
            .oneshot(post("/opportunities/edital%207%2Fa/discard"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!body_text(resp).await.contains("Prêmio Periferia"));
    }

    #[tokio::test]
    async fn whole_card_opens_the_detail_modal() {
        let app = app(AppState::new(workspace_root(), fixture_board(true)));
        let resp = app.oneshot(get("/opportunities/cards")).await.unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("<article class=\"opp-card\" hx-get=\"/opportunities/2\""));
        assert!(!text.contains("<h3 class=\"card-title\" hx-get"));
        assert_eq!(
            text.matches("onclick=\"event.stopPropagation()\"").count(),
            6
        );
    }

    #[tokio::test]
    async fn load_failure_renders_explanatory_panel() {
        let failed = BoardState::LoadFailed(LoadError::HttpStatus {
            status: 404,
            url: "http://localhost/editais_raspados.json".into(),
        });
        let app = app(AppState::new(workspace_root(), failed));
        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("load-error"));
        assert!(text.contains("http status 404"));
        assert!(!text.contains("opp-card"));

        let resp = app.oneshot(get("/opportunities/cards")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn serves_stylesheet() {
        let app = app(AppState::new(workspace_root(), fixture_board(false)));
        let resp = app.oneshot(get("/assets/static/app.css")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/css; charset=utf-8"
        );
    }
}
