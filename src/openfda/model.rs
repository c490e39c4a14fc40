use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize, Debug, Default)]
pub struct SearchResponse {
    #[serde(default)]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub results: Vec<Value>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Meta {
    #[serde(default)]
    pub results: Option<ResultsMeta>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ResultsMeta {
    #[serde(default)]
    pub skip: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub total: u64,
}

impl SearchResponse {
    pub fn total(&self) -> Option<u64> {
        self.meta.as_ref()?.results.as_ref().map(|r| r.total)
    }
}

#[derive(Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Deserialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorResponse {
    /// openFDA answers an empty search with 404 and this code.
    pub fn is_no_matches(&self) -> bool {
        self.error.code == "NOT_FOUND"
    }
}
