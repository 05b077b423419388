use async_trait::async_trait;
use caramba_db::models::node::Node;
use caramba_shared::api::{self, Envelope, Inbound, ServerStatus};
use caramba_shared::panel::{Binding, BindingRef, BindingSpec, PanelStatus};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::{PanelClient, PanelConnector, PanelError};

/// Client for a 3x-ui style panel. Session is cookie based; an expired
/// session is renewed once per request before the call is given up.
pub struct HttpPanelClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    logged_in: tokio::sync::Mutex<bool>,
}

impl HttpPanelClient {
    pub fn new(
        base_url: &str,
        username: String,
        password: String,
        timeout: Duration,
    ) -> Result<Self, PanelError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            logged_in: tokio::sync::Mutex::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_session(&self) -> Result<(), PanelError> {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.do_login().await?;
            *logged_in = true;
        }
        Ok(())
    }

    async fn renew_session(&self) -> Result<(), PanelError> {
        let mut logged_in = self.logged_in.lock().await;
        *logged_in = false;
        self.do_login().await?;
        *logged_in = true;
        Ok(())
    }

    async fn do_login(&self) -> Result<(), PanelError> {
        let resp = self
            .client
            .post(self.url("/login"))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(classify)?;

        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PanelError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(PanelError::Status(resp.status().as_u16()));
        }

        let envelope: Envelope<serde_json::Value> = resp.json().await.map_err(classify)?;
        if !envelope.success {
            return Err(PanelError::Unauthorized);
        }
        debug!(panel = %self.base_url, "Panel session established");
        Ok(())
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, PanelError> {
        let mut req = self.client.request(method.clone(), self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(classify)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, PanelError> {
        self.ensure_session().await?;

        let mut resp = self.send(&method, path, body.as_ref()).await?;
        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!(panel = %self.base_url, "Panel session expired, logging in again");
            self.renew_session().await?;
            resp = self.send(&method, path, body.as_ref()).await?;
            if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                return Err(PanelError::Unauthorized);
            }
        }
        if !resp.status().is_success() {
            return Err(PanelError::Status(resp.status().as_u16()));
        }

        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| PanelError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }
        Ok(envelope.obj)
    }
}

fn classify(err: reqwest::Error) -> PanelError {
    if err.is_timeout() {
        PanelError::Timeout
    } else if err.is_connect() {
        PanelError::Unreachable(err.to_string())
    } else if err.is_decode() {
        PanelError::Decode(err.to_string())
    } else {
        PanelError::Transport(err)
    }
}

#[async_trait]
impl PanelClient for HttpPanelClient {
    async fn login(&self) -> Result<(), PanelError> {
        self.renew_session().await
    }

    async fn get_status(&self) -> Result<PanelStatus, PanelError> {
        let status: Option<ServerStatus> = self
            .call(Method::POST, "/panel/api/server/status", None)
            .await?;
        status
            .map(PanelStatus::from)
            .ok_or_else(|| PanelError::Decode("status response without payload".into()))
    }

    async fn list_bindings(&self) -> Result<Vec<Binding>, PanelError> {
        let inbounds: Vec<Inbound> = self
            .call(Method::GET, "/panel/api/inbounds/list", None)
            .await?
            .unwrap_or_default();

        let mut bindings = Vec::new();
        for inbound in &inbounds {
            let mut found = inbound
                .bindings()
                .map_err(|e| PanelError::Decode(format!("inbound {}: {}", inbound.id, e)))?;
            bindings.append(&mut found);
        }
        Ok(bindings)
    }

    async fn create_binding(&self, spec: &BindingSpec) -> Result<Binding, PanelError> {
        let settings =
            api::client_settings(spec).map_err(|e| PanelError::Decode(e.to_string()))?;
        let _: Option<serde_json::Value> = self
            .call(
                Method::POST,
                "/panel/api/inbounds/addClient",
                Some(serde_json::json!({ "id": spec.inbound_id, "settings": settings })),
            )
            .await?;
        Ok(Binding::from(spec))
    }

    async fn update_binding(
        &self,
        binding: &BindingRef,
        spec: &BindingSpec,
    ) -> Result<(), PanelError> {
        let settings =
            api::client_settings(spec).map_err(|e| PanelError::Decode(e.to_string()))?;
        let path = format!("/panel/api/inbounds/updateClient/{}", binding.client_id);
        let _: Option<serde_json::Value> = self
            .call(
                Method::POST,
                &path,
                Some(serde_json::json!({ "id": binding.inbound_id, "settings": settings })),
            )
            .await?;
        Ok(())
    }

    async fn delete_binding(&self, binding: &BindingRef) -> Result<(), PanelError> {
        let path = format!(
            "/panel/api/inbounds/{}/delClient/{}",
            binding.inbound_id, binding.client_id
        );
        let _: Option<serde_json::Value> = self.call(Method::POST, &path, None).await?;
        Ok(())
    }
}

/// Builds one [`HttpPanelClient`] per node and keeps it while the node's
/// address is unchanged, so the panel session survives across cycles.
pub struct HttpPanelConnector {
    timeout: Duration,
    clients: Mutex<HashMap<i64, (String, Arc<HttpPanelClient>)>>,
}

impl HttpPanelConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

/// The credentials reference names an environment variable holding
/// `user:password`.
pub fn resolve_credentials(reference: &str) -> Result<(String, String), PanelError> {
    let raw = std::env::var(reference)
        .map_err(|_| PanelError::Credentials(format!("variable {} is not set", reference)))?;
    let (user, password) = raw.split_once(':').ok_or_else(|| {
        PanelError::Credentials(format!("variable {} is not in user:password form", reference))
    })?;
    if user.is_empty() {
        return Err(PanelError::Credentials(format!(
            "variable {} has an empty user name",
            reference
        )));
    }
    Ok((user.to_string(), password.to_string()))
}

impl PanelConnector for HttpPanelConnector {
    fn client_for(&self, node: &Node) -> Result<Arc<dyn PanelClient>, PanelError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((address, client)) = clients.get(&node.id) {
            if address == &node.address {
                return Ok(client.clone());
            }
        }

        let (user, password) = resolve_credentials(&node.credentials_ref)?;
        let client = Arc::new(HttpPanelClient::new(
            &node.address,
            user,
            password,
            self.timeout,
        )?);
        clients.insert(node.id, (node.address.clone(), client.clone()));
        Ok(client)
    }

    fn forget(&self, node_id: i64) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node_id);
    }
}
