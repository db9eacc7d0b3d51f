//! `GET /v1/models`: the static catalog in OpenAI list format.
//!
//! This is what IDEs call to populate their model dropdown; it never
//! touches the store.

use axum::response::Json;
use serde::Serialize;

use crate::catalog;

#[derive(Serialize)]
pub struct ModelObject {
    id: &'static str,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
    root: &'static str,
    parent: Option<&'static str>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

pub async fn list_models() -> Json<ModelsResponse> {
    let data = catalog::CATALOG
        .iter()
        .map(|spec| ModelObject {
            id: spec.id,
            object: "model",
            created: 1_700_000_000,
            owned_by: "google",
            root: spec.id,
            parent: None,
        })
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_the_whole_catalog() {
        let response = list_models().await;
        assert_eq!(response.0.data.len(), catalog::CATALOG.len());
        assert!(response.0.data.iter().any(|m| m.id == catalog::EMBEDDING_MODEL));
    }
}
