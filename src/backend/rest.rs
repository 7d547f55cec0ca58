use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::api_types::{
  ApiError, ApiObject, ApiTokenResponse, ListObjectsRequest, PasswordRequest, RefreshTokenRequest,
  RemoveObjectsRequest,
};
use super::{AuthEvent, Backend, Filter, ObjectInfo, Row, Select, Session};
use crate::config::Config;
use crate::error::{DataError, Result};

const AUTH_EVENT_CAPACITY: usize = 16;
const LIST_PAGE_SIZE: u32 = 100;

/// HTTP client for the backend service.
///
/// Cheap to clone; clones share the underlying connection pool, the current
/// session and the auth event channel.
#[derive(Clone)]
pub struct RestBackend {
  client: reqwest::Client,
  base_url: String,
  anon_key: String,
  session: Arc<RwLock<Option<Session>>>,
  events: broadcast::Sender<AuthEvent>,
}

impl RestBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert("apikey", header_value(&config.anon_key)?);
    headers.insert("x-client-info", header_value(&config.client_info)?);

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| DataError::config(format!("Failed to create HTTP client: {}", e)))?;

    let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);

    Ok(Self {
      client,
      base_url: config.url.trim_end_matches('/').to_string(),
      anon_key: config.anon_key.clone(),
      session: Arc::new(RwLock::new(None)),
      events,
    })
  }

  fn request(&self, method: Method, path: &str) -> RequestBuilder {
    let token = self
      .session
      .read()
      .as_ref()
      .map(|s| s.access_token.clone())
      .unwrap_or_else(|| self.anon_key.clone());

    self
      .client
      .request(method, format!("{}{}", self.base_url, path))
      .header(AUTHORIZATION, format!("Bearer {}", token))
  }

  fn rows_request(&self, method: Method, resource: &str, filters: &[Filter]) -> RequestBuilder {
    let params: Vec<(String, String)> = filters
      .iter()
      .map(|f| (f.column.clone(), f.encode_value()))
      .collect();
    self
      .request(method, &format!("/rest/v1/{}", resource))
      .query(&params)
  }

  fn select_request(&self, query: &Select) -> RequestBuilder {
    let mut params: Vec<(String, String)> = vec![("select".to_string(), query.columns.clone())];
    params.extend(
      query
        .filters
        .iter()
        .map(|f| (f.column.clone(), f.encode_value())),
    );
    if !query.sort.is_empty() {
      let order: Vec<String> = query
        .sort
        .iter()
        .map(|s| format!("{}.{}", s.column, if s.ascending { "asc" } else { "desc" }))
        .collect();
      params.push(("order".to_string(), order.join(",")));
    }
    if let Some(range) = query.range {
      params.push(("offset".to_string(), range.offset.to_string()));
      params.push(("limit".to_string(), range.count.to_string()));
    }

    self
      .request(Method::GET, &format!("/rest/v1/{}", query.resource))
      .query(&params)
  }

  fn set_session(&self, session: Option<Session>, event: AuthEvent) {
    *self.session.write() = session;
    // No receivers is fine: nobody has subscribed yet.
    let _ = self.events.send(event);
  }
}

fn header_value(value: &str) -> Result<HeaderValue> {
  HeaderValue::from_str(value)
    .map_err(|e| DataError::config(format!("Invalid header value: {}", e)))
}

/// Turn a response into `T`, mapping error bodies into [`DataError`].
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
  let status = response.status();
  if status.is_success() {
    return Ok(response.json().await?);
  }
  Err(read_error(status.as_u16(), response).await)
}

async fn expect_success(response: Response) -> Result<()> {
  let status = response.status();
  if status.is_success() {
    return Ok(());
  }
  Err(read_error(status.as_u16(), response).await)
}

async fn read_error(status: u16, response: Response) -> DataError {
  let body = response.text().await.unwrap_or_default();
  let api_error: ApiError = serde_json::from_str(&body).unwrap_or_else(|_| ApiError {
    message: (!body.is_empty()).then_some(body),
    ..Default::default()
  });
  api_error.into_error(status)
}

impl Backend for RestBackend {
  async fn select(&self, query: &Select) -> Result<Vec<Row>> {
    debug!(resource = %query.resource, "select");
    let response = self.select_request(query).send().await?;
    read_json(response).await
  }

  async fn insert(&self, resource: &str, rows: &[Row]) -> Result<Vec<Row>> {
    let response = self
      .rows_request(Method::POST, resource, &[])
      .header("Prefer", "return=representation")
      .json(rows)
      .send()
      .await?;
    read_json(response).await
  }

  async fn update(&self, resource: &str, filters: &[Filter], patch: &Row) -> Result<Vec<Row>> {
    if filters.is_empty() {
      return Err(DataError::validation(format!(
        "refusing to update every row of {}",
        resource
      )));
    }
    let response = self
      .rows_request(Method::PATCH, resource, filters)
      .header("Prefer", "return=representation")
      .json(patch)
      .send()
      .await?;
    read_json(response).await
  }

  async fn delete(&self, resource: &str, filters: &[Filter]) -> Result<Vec<Row>> {
    if filters.is_empty() {
      return Err(DataError::validation(format!(
        "refusing to delete every row of {}",
        resource
      )));
    }
    let response = self
      .rows_request(Method::DELETE, resource, filters)
      .header("Prefer", "return=representation")
      .send()
      .await?;
    read_json(response).await
  }

  async fn get_session(&self) -> Result<Option<Session>> {
    let current = self.session.read().clone();
    match current {
      Some(session) if session.is_expired() => {
        let refreshed = self.refresh_session(&session.refresh_token).await?;
        Ok(Some(refreshed))
      }
      other => {
        let _ = self.events.send(AuthEvent::InitialSession(other.clone()));
        Ok(other)
      }
    }
  }

  async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
    let response = self
      .request(Method::POST, "/auth/v1/token")
      .query(&[("grant_type", "refresh_token")])
      .json(&RefreshTokenRequest { refresh_token })
      .send()
      .await?;
    let session = read_json::<ApiTokenResponse>(response)
      .await?
      .into_session();
    self.set_session(
      Some(session.clone()),
      AuthEvent::TokenRefreshed(session.clone()),
    );
    Ok(session)
  }

  async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
    if email.is_empty() || password.is_empty() {
      return Err(DataError::validation("email and password are required"));
    }
    let response = self
      .request(Method::POST, "/auth/v1/token")
      .query(&[("grant_type", "password")])
      .json(&PasswordRequest { email, password })
      .send()
      .await?;
    let session = read_json::<ApiTokenResponse>(response)
      .await?
      .into_session();
    self.set_session(Some(session.clone()), AuthEvent::SignedIn(session.clone()));
    Ok(session)
  }

  async fn sign_out(&self) -> Result<()> {
    let had_session = self.session.read().is_some();
    if had_session {
      let result = self
        .request(Method::POST, "/auth/v1/logout")
        .send()
        .await
        .map_err(DataError::from);
      let result = match result {
        Ok(response) => expect_success(response).await,
        Err(e) => Err(e),
      };
      // The local session is dropped even when the server call fails.
      if let Err(e) = result {
        warn!(error = %e, "Remote sign-out failed");
      }
    }
    self.set_session(None, AuthEvent::SignedOut);
    Ok(())
  }

  fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
    self.events.subscribe()
  }

  async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
    let response = self
      .request(
        Method::POST,
        &format!("/storage/v1/object/{}/{}", bucket, path.trim_start_matches('/')),
      )
      .header(CONTENT_TYPE, content_type)
      .header("x-upsert", "true")
      .body(bytes)
      .send()
      .await?;
    expect_success(response).await
  }

  async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
    let mut all_objects = Vec::new();
    let mut offset = 0u32;

    loop {
      let response = self
        .request(Method::POST, &format!("/storage/v1/object/list/{}", bucket))
        .json(&ListObjectsRequest {
          prefix,
          limit: LIST_PAGE_SIZE,
          offset,
        })
        .send()
        .await?;
      let page: Vec<ApiObject> = read_json(response).await?;
      let count = page.len() as u32;
      all_objects.extend(page.into_iter().map(ObjectInfo::from));

      if count < LIST_PAGE_SIZE {
        break;
      }
      offset += LIST_PAGE_SIZE;
    }

    Ok(all_objects)
  }

  async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
      return Ok(());
    }
    let response = self
      .request(Method::DELETE, &format!("/storage/v1/object/{}", bucket))
      .json(&RemoveObjectsRequest { prefixes: paths })
      .send()
      .await?;
    expect_success(response).await
  }
}
