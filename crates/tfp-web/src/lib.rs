//! Axum JSON API backing the representative search widget.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use sqlx::Row;
use tfp_core::{RelationType, Representative};
use tfp_sync::{Store, StoredEntity, SyncConfig, BILLS_TABLE, RELATIONS_TABLE, REPS_TABLE};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tfp-web";

/// Maximum number of representatives a search returns.
pub const SEARCH_LIMIT: usize = 100;

const LIKE_ESCAPE: char = '!';

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

/// One representative as rendered by the widget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepSearchResult {
    pub id: String,
    pub name: String,
    pub state: String,
    pub district: String,
    pub affiliation: Option<String>,
    pub role: String,
    pub email: Option<String>,
    pub capitol_phone_number: Option<String>,
    pub district_phone_number: Option<String>,
    pub twitter_url: Option<String>,
    pub bills_sponsored: Vec<String>,
    pub bills_yea_votes: Vec<String>,
    pub bills_nay_votes: Vec<String>,
}

impl From<Representative> for RepSearchResult {
    fn from(rep: Representative) -> Self {
        Self {
            id: rep.id,
            name: rep.name,
            state: rep.state,
            district: rep.district,
            affiliation: rep.political_party,
            role: rep.role,
            email: rep.email,
            capitol_phone_number: rep.capitol_phone,
            district_phone_number: rep.district_phone,
            twitter_url: rep.twitter,
            bills_sponsored: Vec::new(),
            bills_yea_votes: Vec::new(),
            bills_nay_votes: Vec::new(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/reps/search/{fragment}", get(search_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Store, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving representative search");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TFP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.store_config()).await?;
    store.migrate().await?;
    serve(store, port).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(fragment): AxumPath<String>,
) -> Response {
    match search_representatives(&state.store, &fragment).await {
        Ok(results) => {
            let mut resp = Json(results).into_response();
            resp.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                header::HeaderValue::from_static("*"),
            );
            resp
        }
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "search failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Substring pattern with LIKE metacharacters escaped. Case folding happens
/// in SQL so the pattern and the columns go through the same `LOWER()`.
fn like_pattern(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | LIKE_ESCAPE) {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Representatives whose name, state, district, or role contains `fragment`,
/// with the bills they sponsored or voted on.
pub async fn search_representatives(
    store: &Store,
    fragment: &str,
) -> anyhow::Result<Vec<RepSearchResult>> {
    if fragment.is_empty() {
        return Ok(Vec::new());
    }

    let p = store.dialect().placeholder(1);
    let matches = ["name", "state", "district", "role"]
        .iter()
        .map(|c| format!("LOWER({c}) LIKE LOWER({p}) ESCAPE '{LIKE_ESCAPE}'"))
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!(
        "SELECT {} FROM {REPS_TABLE} WHERE {matches} ORDER BY name, id LIMIT {SEARCH_LIMIT}",
        Representative::select_list()
    );
    let rows = sqlx::query(&sql)
        .bind(like_pattern(fragment))
        .fetch_all(store.pool())
        .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut result = RepSearchResult::from(Representative::from_row(row)?);
        attach_bills(store, &mut result).await?;
        results.push(result);
    }
    Ok(results)
}

async fn attach_bills(store: &Store, result: &mut RepSearchResult) -> anyhow::Result<()> {
    let sql = format!(
        "SELECT r.relation_type, b.case_name FROM {RELATIONS_TABLE} r \
         JOIN {BILLS_TABLE} b ON b.id = r.negative_bills_id \
         WHERE r.rep_id = {} ORDER BY r.id",
        store.dialect().placeholder(1)
    );
    let rows = sqlx::query(&sql)
        .bind(result.id.clone())
        .fetch_all(store.pool())
        .await?;

    for row in rows {
        let kind: String = row.try_get("relation_type")?;
        let case_name: String = row.try_get("case_name")?;
        match kind.parse::<RelationType>() {
            Ok(RelationType::Sponsorship) => result.bills_sponsored.push(case_name),
            Ok(RelationType::YeaVote) => result.bills_yea_votes.push(case_name),
            Ok(RelationType::NayVote) => result.bills_nay_votes.push(case_name),
            Ok(RelationType::Contact) | Err(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tfp_core::SourceRecord;
    use tfp_sync::{bulk_upsert, import_from_files, ImportFiles};
    use tower::ServiceExt;

    async fn seeded_store() -> Store {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/airtable");
        let store = Store::connect_in_memory().await.unwrap();
        let files = ImportFiles {
            state_reps: fixtures.join("state_reps.json"),
            national_reps: None,
            negative_bills: Some(fixtures.join("negative_bills.json")),
        };
        import_from_files(&store, &files, true).await.unwrap();
        store
    }

    async fn get_json(store: Store, uri: &str) -> (StatusCode, Option<String>, serde_json::Value) {
        let resp = app(AppState::new(store))
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let cors = resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, cors, json)
    }

    #[tokio::test]
    async fn surname_search_returns_rep_with_grouped_bills() {
        let (status, cors, json) = get_json(seeded_store().await, "/api/reps/search/barhorst").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cors.as_deref(), Some("*"));
        assert_eq!(
            json,
            serde_json::json!([{
                "id": "recaMS906YE9Kq2bj",
                "name": "Tim Barhorst",
                "state": "Ohio",
                "district": "85",
                "affiliation": "Republican",
                "role": "House Representative",
                "email": "rep85@ohiohouse.gov",
                "capitolPhoneNumber": "(614) 466-1507",
                "districtPhoneNumber": null,
                "twitterUrl": "https://twitter.com/timbarhorst",
                "billsSponsored": ["OH HB68"],
                "billsYeaVotes": ["OH HB68"],
                "billsNayVotes": []
            }])
        );
    }

    #[tokio::test]
    async fn role_search_orders_by_name() {
        let store = seeded_store().await;
        let results = search_representatives(&store, "HOUSE").await.unwrap();
        let names = results.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Tim Barhorst", "William Galvin"]);
        assert_eq!(results[1].bills_nay_votes, vec!["AL HB261"]);
    }

    #[tokio::test]
    async fn no_match_empty_and_wildcard_fragments_return_empty() {
        let store = seeded_store().await;
        assert!(search_representatives(&store, "zzz").await.unwrap().is_empty());
        assert!(search_representatives(&store, "").await.unwrap().is_empty());
        assert!(search_representatives(&store, "%").await.unwrap().is_empty());
        assert!(search_representatives(&store, "_").await.unwrap().is_empty());

        let (status, _, json) = get_json(store, "/api/reps/search/nobody").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn whitespace_fragment_matches_like_any_text() {
        let (status, _, json) = get_json(seeded_store().await, "/api/reps/search/%20").await;
        assert_eq!(status, StatusCode::OK);
        let names = json
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Tim Barhorst", "William Galvin"]);
    }

    #[tokio::test]
    async fn non_ascii_fragment_folds_the_same_way_as_columns() {
        let store = seeded_store().await;
        let record = SourceRecord::new("recElise", "2023-03-29T22:00:53.000Z")
            .with_field("Name", "Élise Durand")
            .with_field("District", "4")
            .with_field("Role", "Senator")
            .with_field("State", "Vermont")
            .with_field("Created", "2023-03-29T22:00:53.000Z")
            .with_field("Last Modified", "2023-03-29T22:00:53.000Z");
        bulk_upsert::<Representative>(&store, &[record]).await.unwrap();

        let results = search_representatives(&store, "Élise").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "recElise");
        assert_eq!(search_representatives(&store, "DURAND").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_fragment_route_is_not_found() {
        let (status, _, _) = get_json(seeded_store().await, "/api/reps/search/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = app(AppState::new(seeded_store().await))
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("Ba_r%"), "%Ba!_r!%%");
        assert_eq!(like_pattern("a!b"), "%a!!b%");
    }
}
