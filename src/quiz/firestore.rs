use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use serde_json::{Map, Number, Value};

use crate::quiz::store::{Document, DocumentStore, StoreError};

pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com";
const PAGE_SIZE: &str = "300";

/// Reads whole collections through the Firestore REST API.
pub struct FirestoreDocumentStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    next_page_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, FirestoreValue>,
}

#[derive(Debug, serde::Deserialize)]
struct GeoPoint {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
}

#[derive(Debug, serde::Deserialize)]
struct ArrayValue {
    #[serde(default)]
    values: Vec<FirestoreValue>,
}

#[derive(Debug, serde::Deserialize)]
struct MapValue {
    #[serde(default)]
    fields: BTreeMap<String, FirestoreValue>,
}

// Firestore tags every value with its type, e.g. {"integerValue": "42"}
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
enum FirestoreValue {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String),
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
    BytesValue(String),
    ReferenceValue(String),
    GeoPointValue(GeoPoint),
    ArrayValue(ArrayValue),
    MapValue(MapValue),
}

impl FirestoreValue {
    fn into_json(self) -> Result<Value, StoreError> {
        let value = match self {
            FirestoreValue::NullValue(()) => Value::Null,
            FirestoreValue::BooleanValue(b) => Value::Bool(b),
            FirestoreValue::IntegerValue(raw) => {
                let n: i64 = raw
                    .parse()
                    .map_err(|_| StoreError::Malformed(format!("bad integerValue {:?}", raw)))?;
                Value::from(n)
            }
            FirestoreValue::DoubleValue(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
            FirestoreValue::TimestampValue(s)
            | FirestoreValue::StringValue(s)
            | FirestoreValue::BytesValue(s)
            | FirestoreValue::ReferenceValue(s) => Value::String(s),
            FirestoreValue::GeoPointValue(point) => serde_json::json!({
                "latitude": point.latitude,
                "longitude": point.longitude,
            }),
            FirestoreValue::ArrayValue(array) => Value::Array(
                array
                    .values
                    .into_iter()
                    .map(FirestoreValue::into_json)
                    .collect::<Result<_, _>>()?,
            ),
            FirestoreValue::MapValue(map) => Value::Object(decode_fields(map.fields)?),
        };
        Ok(value)
    }
}

fn decode_fields(fields: BTreeMap<String, FirestoreValue>) -> Result<Map<String, Value>, StoreError> {
    let mut decoded = Map::new();
    for (key, value) in fields {
        decoded.insert(key, value.into_json()?);
    }
    Ok(decoded)
}

impl RawDocument {
    fn into_document(self) -> Result<Document, StoreError> {
        // name is "projects/{p}/databases/{d}/documents/{collection}/{id}"
        let id = match self.name.rsplit('/').next() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(StoreError::Malformed(format!("bad document name {:?}", self.name))),
        };
        Ok(Document::new(id, decode_fields(self.fields)?))
    }
}

impl FirestoreDocumentStore {
    pub fn new(base_url: String, project_id: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            project_id,
            api_key,
        }
    }

    fn collection_url(&self, collection: &str, page_token: Option<&str>) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StoreError::Malformed(format!("bad Firestore url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Malformed(format!("bad Firestore url: {}", self.base_url)))?
            .pop_if_empty()
            .extend([
                "v1",
                "projects",
                self.project_id.as_str(),
                "databases",
                "(default)",
                "documents",
                collection,
            ]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", PAGE_SIZE);
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
            if let Some(key) = &self.api_key {
                query.append_pair("key", key);
            }
        }
        Ok(url)
    }

    async fn fetch_page(
        &self,
        collection: &str,
        page_token: Option<&str>,
    ) -> Result<ListDocumentsResponse, StoreError> {
        let url = self.collection_url(collection, page_token)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.fetch_page(collection, page_token.as_deref()).await?;
            for raw in page.documents {
                documents.push(raw.into_document()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!("Fetched {} documents from {}", documents.len(), collection);
        Ok(documents)
    }
}
