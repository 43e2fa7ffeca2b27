//! Record CRUD requests and typed collections.
//!
//! These are thin request builders: every call authorizes through the
//! client's shared credential and is retried under the client's
//! [`RetryPolicy`](crate::retry::RetryPolicy).

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{Client, ClientError, RawResponse};
use crate::realtime::client::{subscribe, RealtimeError, SubscribeOptions};
use crate::realtime::subscription::Subscription;
use crate::retry::retry_async;

/// Query parameters for listing records. Unset fields are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamsList {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// Backend filter expression, passed through verbatim.
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub expand: Option<String>,
}

impl ParamsList {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(page) = self.page.filter(|page| *page > 0) {
            query.push(("page", page.to_string()));
        }
        if let Some(per_page) = self.per_page.filter(|per_page| *per_page > 0) {
            query.push(("perPage", per_page.to_string()));
        }
        let text_params = [
            ("filter", &self.filter),
            ("sort", &self.sort),
            ("expand", &self.expand),
        ];
        for (name, value) in text_params {
            if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                query.push((name, value.to_string()));
            }
        }
        query
    }
}

/// One page of records.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseList<T> {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub items: Vec<T>,
}

/// Metadata of a freshly created record.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCreate {
    pub id: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    #[serde(default)]
    pub collection_id: String,
    #[serde(default)]
    pub collection_name: String,
}

/// Untyped record as returned by the backend.
pub type Record = Map<String, Value>;

fn records_path(collection: &str) -> String {
    format!("/api/collections/{collection}/records")
}

fn record_path(collection: &str, id: &str) -> String {
    format!("/api/collections/{collection}/records/{id}")
}

fn decode<T: DeserializeOwned>(response: RawResponse) -> Result<T, ClientError> {
    serde_json::from_str(&response.body).map_err(|source| ClientError::Decode {
        source,
        body: response.body,
    })
}

impl Client {
    /// Creates a record in `collection`.
    pub async fn create<B>(&self, collection: &str, body: &B) -> Result<ResponseCreate, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(&records_path(collection));
        let response = self
            .send_with_retry(|http| http.post(url.as_str()).json(body))
            .await?;
        decode(response)
    }

    /// Patches record `id` in `collection` with the fields of `body`.
    pub async fn update<B>(&self, collection: &str, id: &str, body: &B) -> Result<(), ClientError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(&record_path(collection, id));
        self.send_with_retry(|http| http.patch(url.as_str()).json(body))
            .await?;
        Ok(())
    }

    /// Deletes record `id` from `collection`.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&record_path(collection, id));
        self.send_with_retry(|http| http.delete(url.as_str()))
            .await?;
        Ok(())
    }

    /// Lists one page of untyped records.
    pub async fn list(
        &self,
        collection: &str,
        params: &ParamsList,
    ) -> Result<ResponseList<Record>, ClientError> {
        self.list_as(collection, params).await
    }

    /// Fetches one untyped record.
    pub async fn one(&self, collection: &str, id: &str) -> Result<Record, ClientError> {
        self.one_as(collection, id, None).await
    }

    pub(crate) async fn list_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        params: &ParamsList,
    ) -> Result<ResponseList<T>, ClientError> {
        let url = self.endpoint(&records_path(collection));
        let query = params.query();
        let response = self
            .send_with_retry(|http| http.get(url.as_str()).query(&query))
            .await?;
        decode(response)
    }

    pub(crate) async fn one_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        expand: Option<&str>,
    ) -> Result<T, ClientError> {
        let url = self.endpoint(&record_path(collection, id));
        let query: Vec<(&str, &str)> = expand
            .filter(|expand| !expand.is_empty())
            .map(|expand| vec![("expand", expand)])
            .unwrap_or_default();
        let response = self
            .send_with_retry(|http| http.get(url.as_str()).query(&query))
            .await?;
        decode(response)
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<RawResponse, ClientError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let build = &build;
        retry_async(
            self.retry_policy(),
            |_| async move { self.send_authorized(build).await?.error_for_status() },
            ClientError::is_retryable,
        )
        .await
    }
}

/// Typed view over one collection.
///
/// `T` is the record shape; any serde type works, including [`Record`].
pub struct Collection<T> {
    client: Client,
    name: String,
    expand: Option<String>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            name: self.name.clone(),
            expand: self.expand.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(client: &Client, name: impl Into<String>) -> Self {
        Self {
            client: client.clone(),
            name: name.into(),
            expand: None,
            _record: PhantomData,
        }
    }

    /// Sets the relations expanded by default on reads.
    pub fn with_expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn create(&self, record: &T) -> Result<ResponseCreate, ClientError> {
        self.client.create(&self.name, record).await
    }

    pub async fn update(&self, id: &str, record: &T) -> Result<(), ClientError> {
        self.client.update(&self.name, id, record).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.client.delete(&self.name, id).await
    }

    /// Lists one page, applying the collection's default expand when
    /// `params.expand` is unset.
    pub async fn list(&self, params: ParamsList) -> Result<ResponseList<T>, ClientError> {
        let mut params = params;
        if params.expand.is_none() {
            params.expand = self.expand.clone();
        }
        self.client.list_as(&self.name, &params).await
    }

    pub async fn one(&self, id: &str) -> Result<T, ClientError> {
        self.client
            .one_as(&self.name, id, self.expand.as_deref())
            .await
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Subscribes to changes of this collection with default options.
    pub async fn subscribe(&self) -> Result<Subscription<T>, RealtimeError> {
        self.subscribe_with(SubscribeOptions::default(), Vec::new())
            .await
    }

    /// Subscribes to `targets`, or to this collection when `targets` is empty.
    pub async fn subscribe_with(
        &self,
        options: SubscribeOptions,
        targets: Vec<String>,
    ) -> Result<Subscription<T>, RealtimeError> {
        let targets = if targets.is_empty() {
            vec![self.name.clone()]
        } else {
            targets
        };
        subscribe(&self.client, targets, options).await
    }
}
