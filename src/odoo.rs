//! JSON-RPC connection to an Odoo server.
//!
//! Every call is a `POST {url}/jsonrpc` carrying a `call` envelope for either
//! the `common` service (login) or the `object` service (`execute_kw`).
//! Transport failures are tagged with a [`RemoteErrorKind`] so the classifier
//! can tell retryable network trouble from in-band application faults.

use crate::harvest::domain::Domain;
use crate::model::{Batch, FieldMap};
use crate::traits::{Connection, RemoteError, RemoteErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Field metadata attributes requested from `fields_get`.
const FIELD_ATTRIBUTES: &[&str] = &["string", "type"];

/// Credentials and endpoint of one Odoo database.
#[derive(Debug, Clone)]
pub struct OdooSettings {
    /// Base URL, already normalized to `https://host` without trailing slash.
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl OdooSettings {
    fn endpoint(&self) -> String {
        format!("{}/jsonrpc", self.url)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcFaultData>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcFaultData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    debug: String,
}

impl RpcFault {
    /// Server traceback when present, so the last line carries the
    /// exception text; otherwise `name: message`.
    fn into_remote_error(self) -> RemoteError {
        let data = self.data.unwrap_or_default();
        if !data.debug.trim().is_empty() {
            return RemoteError::fault(data.debug);
        }
        let text = if data.message.is_empty() {
            self.message
        } else {
            data.message
        };
        if data.name.is_empty() {
            RemoteError::fault(text)
        } else {
            RemoteError::fault(format!("{}: {}", data.name, text))
        }
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    let kind = if err.is_timeout() {
        RemoteErrorKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        RemoteErrorKind::ConnectionReset
    } else if err.is_status() {
        RemoteErrorKind::Protocol
    } else if err.is_decode() {
        RemoteErrorKind::Decode
    } else {
        RemoteErrorKind::Other
    };
    RemoteError::new(kind, err.to_string())
}

fn envelope(id: u64, service: &str, method: &str, args: Vec<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "call",
        "params": {
            "service": service,
            "method": method,
            "args": args,
        },
        "id": id,
    })
}

fn search_kwargs(fields: &[String], order: Option<&str>, limit: usize, offset: usize) -> Value {
    let mut kwargs = json!({
        "fields": fields,
        "limit": limit,
        "offset": offset,
    });
    if let Some(order) = order {
        kwargs["order"] = json!(order);
    }
    kwargs
}

fn decode_response(response: RpcResponse) -> Result<Value, RemoteError> {
    if let Some(fault) = response.error {
        return Err(fault.into_remote_error());
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn decode_records(entity: &str, value: Value) -> Result<Batch, RemoteError> {
    let Value::Array(rows) = value else {
        return Err(RemoteError::new(
            RemoteErrorKind::Decode,
            format!("search_read on {entity} did not return a list"),
        ));
    };
    rows.into_iter()
        .map(|row| match row {
            Value::Object(record) => Ok(record),
            other => Err(RemoteError::new(
                RemoteErrorKind::Decode,
                format!("search_read on {entity} returned a non-record row: {other}"),
            )),
        })
        .collect()
}

/// Authenticated Odoo session.
pub struct OdooConnection {
    http: reqwest::Client,
    settings: Arc<OdooSettings>,
    uid: i64,
    next_id: AtomicU64,
}

impl OdooConnection {
    /// Builds an HTTP client and logs in.
    pub async fn connect(settings: OdooSettings) -> Result<Self, RemoteError> {
        Self::login(Arc::new(settings)).await
    }

    async fn login(settings: Arc<OdooSettings>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(transport_error)?;

        let mut conn = Self {
            http,
            settings,
            uid: 0,
            next_id: AtomicU64::new(1),
        };

        let uid = conn
            .call(
                "common",
                "authenticate",
                vec![
                    json!(conn.settings.database),
                    json!(conn.settings.username),
                    json!(conn.settings.password),
                    json!({}),
                ],
            )
            .await
            .inspect_err(|e| error!(url = %conn.settings.url, "Authentication call failed: {}", e))?;

        conn.uid = uid.as_i64().filter(|uid| *uid > 0).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::Authentication,
                "Authentication rejected, check username, database and API key",
            )
        })?;

        info!(
            uid = conn.uid,
            database = %conn.settings.database,
            url = %conn.settings.url,
            "Connected to Odoo"
        );
        Ok(conn)
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    async fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = envelope(id, service, method, args);

        let response = self
            .http
            .post(self.settings.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json::<RpcResponse>()
            .await
            .map_err(transport_error)?;

        decode_response(response)
    }

    async fn execute_kw(
        &self,
        entity: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Value,
    ) -> Result<Value, RemoteError> {
        debug!(entity, method, "execute_kw");
        self.call(
            "object",
            "execute_kw",
            vec![
                json!(self.settings.database),
                json!(self.uid),
                json!(self.settings.password),
                json!(entity),
                json!(method),
                Value::Array(args),
                kwargs,
            ],
        )
        .await
    }
}

#[async_trait]
impl Connection for OdooConnection {
    async fn list_fields(&self, entity: &str) -> Result<FieldMap, RemoteError> {
        let metadata = self
            .execute_kw(
                entity,
                "fields_get",
                Vec::new(),
                json!({ "attributes": FIELD_ATTRIBUTES }),
            )
            .await?;

        serde_json::from_value(metadata).map_err(|e| {
            RemoteError::new(
                RemoteErrorKind::Decode,
                format!("fields_get on {entity} returned unexpected metadata: {e}"),
            )
        })
    }

    async fn search_read(
        &self,
        entity: &str,
        domain: &Domain,
        fields: &[String],
        order: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Batch, RemoteError> {
        let rows = self
            .execute_kw(
                entity,
                "search_read",
                vec![Value::Array(domain.to_wire())],
                search_kwargs(fields, order, limit, offset),
            )
            .await?;
        decode_records(entity, rows)
    }

    async fn reconnect(&self) -> Result<Arc<dyn Connection>, RemoteError> {
        info!(url = %self.settings.url, "Re-authenticating");
        let fresh = Self::login(Arc::clone(&self.settings)).await?;
        Ok(Arc::new(fresh))
    }
}
