use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::*;

use super::error::{AviError, AviResult};
use super::models::*;

pub const DEFAULT_AVI_TIMEOUT: Duration = Duration::from_secs(60);
const CSRF_COOKIE: &str = "csrftoken";

/// Typed operations against an AVI controller.
///
/// Implementations must be safe to share between reconcilers; the REST
/// implementation serializes its session handling internally.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AviClient: Send + Sync {
    async fn cloud_get_by_name(&self, name: &str) -> AviResult<Cloud>;

    /// `cloud` scopes the lookup when non-empty
    async fn network_get_by_name(&self, name: &str, cloud: &str) -> AviResult<Network>;
    async fn network_update(&self, network: &Network) -> AviResult<Network>;

    async fn ipam_profile_get(&self, uuid: &str) -> AviResult<IpamDnsProviderProfile>;
    async fn ipam_profile_update(
        &self,
        profile: &IpamDnsProviderProfile,
    ) -> AviResult<IpamDnsProviderProfile>;

    async fn tenant_get(&self, name: &str) -> AviResult<Tenant>;

    async fn role_get_by_name(&self, name: &str) -> AviResult<Role>;
    async fn role_create(&self, role: &Role) -> AviResult<Role>;
    async fn role_update(&self, role: &Role) -> AviResult<Role>;

    async fn user_get_by_name(&self, name: &str) -> AviResult<User>;
    async fn user_create(&self, user: &User) -> AviResult<User>;
    async fn user_update(&self, user: &User) -> AviResult<User>;
    async fn user_delete_by_name(&self, name: &str) -> AviResult<()>;

    /// Version reported by the controller, independent of the pinned API version
    async fn controller_version(&self) -> AviResult<String>;
}

/// Connection settings for [`RestAviClient`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AviClientConfig {
    /// Host, `host:port` or full base URL of the controller
    pub controller: String,
    pub username: String,
    pub password: String,
    /// PEM bundle; empty disables certificate verification
    pub ca: String,
    /// Pinned `X-Avi-Version`; autodetected when absent
    pub version: Option<String>,
    pub tenant: String,
}

#[derive(Default)]
struct Session {
    csrf_token: Option<String>,
    version: Option<String>,
    logged_in: bool,
}

/// reqwest-backed AVI session client.
pub struct RestAviClient {
    config: AviClientConfig,
    base_url: String,
    http: HttpClient,
    session: RwLock<Session>,
}

pub fn base_url(controller: &str) -> AviResult<String> {
    let controller = controller.trim().trim_end_matches('/');
    if controller.is_empty() {
        return Err(AviError::InvalidUrl("controller address is empty".into()));
    }
    if controller.starts_with("http://") || controller.starts_with("https://") {
        Ok(controller.to_string())
    } else if controller.contains("://") {
        Err(AviError::InvalidUrl(format!(
            "unsupported scheme in controller address {controller}"
        )))
    } else {
        Ok(format!("https://{controller}"))
    }
}

impl RestAviClient {
    pub fn new(config: AviClientConfig) -> AviResult<Self> {
        Self::with_timeout(config, DEFAULT_AVI_TIMEOUT)
    }

    pub fn with_timeout(config: AviClientConfig, timeout: Duration) -> AviResult<Self> {
        let base_url = base_url(&config.controller)?;
        let mut builder = HttpClient::builder().cookie_store(true).timeout(timeout);
        if config.ca.is_empty() {
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            for cert in reqwest::Certificate::from_pem_bundle(config.ca.as_bytes())? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            base_url,
            http: builder.build()?,
            session: RwLock::new(Session {
                version: config.version.clone(),
                ..Session::default()
            }),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{}", self.base_url, path)
    }

    fn tenant(&self) -> &str {
        if self.config.tenant.is_empty() {
            crate::crd::DEFAULT_AVI_TENANT
        } else {
            &self.config.tenant
        }
    }

    async fn login(&self) -> AviResult<()> {
        let mut session = self.session.write().await;
        let response = self
            .http
            .post(self.url("login"))
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AviError::Login(format!("status {status}: {body}")));
        }
        session.csrf_token = response
            .cookies()
            .find(|c| c.name() == CSRF_COOKIE)
            .map(|c| c.value().to_string());
        session.logged_in = true;
        debug!("logged in to AVI controller {}", self.base_url);

        if session.version.is_none() {
            let version = self.fetch_version(session.csrf_token.as_deref()).await?;
            info!("detected AVI controller version {version}");
            session.version = Some(version);
        }
        Ok(())
    }

    async fn ensure_session(&self) -> AviResult<()> {
        if self.session.read().await.logged_in {
            return Ok(());
        }
        self.login().await
    }

    async fn fetch_version(&self, csrf: Option<&str>) -> AviResult<String> {
        let mut request = self
            .http
            .get(self.url("api/initial-data"))
            .header("Referer", &self.base_url);
        if let Some(token) = csrf {
            request = request.header("X-CSRFToken", token);
        }
        let body: serde_json::Value = handle_response(request.send().await?).await?;
        body["version"]["Version"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AviError::Api {
                status: 200,
                message: "initial-data has no version".into(),
            })
    }

    async fn decorate(&self, builder: RequestBuilder) -> RequestBuilder {
        let session = self.session.read().await;
        let mut builder = builder
            .header("X-Avi-Tenant", self.tenant())
            .header("Referer", &self.base_url);
        if let Some(version) = &session.version {
            builder = builder.header("X-Avi-Version", version);
        }
        if let Some(token) = &session.csrf_token {
            builder = builder.header("X-CSRFToken", token);
        }
        builder
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> AviResult<Response> {
        self.ensure_session().await?;
        let build = || {
            let builder = self.http.request(method.clone(), self.url(path)).query(query);
            match body {
                Some(b) => builder.json(b),
                None => builder,
            }
        };
        let response = self.decorate(build()).await.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!("AVI session expired, logging in again");
        self.session.write().await.logged_in = false;
        self.login().await?;
        Ok(self.decorate(build()).await.send().await?)
    }

    async fn get_by_name<T: DeserializeOwned + AviObject>(
        &self,
        name: &str,
        cloud: &str,
    ) -> AviResult<T> {
        let path = format!("api/{}", T::KIND);
        let mut query = vec![("name", name)];
        if !cloud.is_empty() {
            query.push(("cloud_ref.name", cloud));
        }
        let response = self.send::<()>(Method::GET, &path, &query, None).await?;
        let collection: Collection<T> = handle_response(response).await?;
        collection
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AviError::NotFound {
                kind: T::KIND.to_string(),
                name: name.to_string(),
            })
    }

    async fn get<T: DeserializeOwned + AviObject>(&self, uuid: &str) -> AviResult<T> {
        let path = format!("api/{}/{}", T::KIND, uuid);
        let response = self.send::<()>(Method::GET, &path, &[], None).await?;
        handle_response(response).await
    }

    async fn create<T: DeserializeOwned + Serialize + Sync + AviObject>(
        &self,
        obj: &T,
    ) -> AviResult<T> {
        let path = format!("api/{}", T::KIND);
        let response = self.send(Method::POST, &path, &[], Some(obj)).await?;
        handle_response(response).await
    }

    async fn update<T: DeserializeOwned + Serialize + Sync + AviObject>(
        &self,
        obj: &T,
    ) -> AviResult<T> {
        let uuid = obj
            .uuid()
            .ok_or_else(|| AviError::MissingUuid(T::KIND.to_string()))?;
        let path = format!("api/{}/{}", T::KIND, uuid);
        let response = self.send(Method::PUT, &path, &[], Some(obj)).await?;
        handle_response(response).await
    }

    async fn delete_by_name<T: DeserializeOwned + AviObject>(&self, name: &str) -> AviResult<()> {
        let obj: T = self.get_by_name(name, "").await?;
        let uuid = obj
            .uuid()
            .ok_or_else(|| AviError::MissingUuid(T::KIND.to_string()))?;
        let path = format!("api/{}/{}", T::KIND, uuid);
        let response = self.send::<()>(Method::DELETE, &path, &[], None).await?;
        handle_empty_response(response).await
    }
}

async fn error_from(response: Response) -> AviError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|json| {
            json["error"]
                .as_str()
                .or_else(|| json["detail"].as_str())
                .or_else(|| json["message"].as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    AviError::Api { status, message }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> AviResult<T> {
    if response.status().is_success() {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    } else {
        Err(error_from(response).await)
    }
}

async fn handle_empty_response(response: Response) -> AviResult<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(error_from(response).await)
    }
}

#[async_trait]
impl AviClient for RestAviClient {
    async fn cloud_get_by_name(&self, name: &str) -> AviResult<Cloud> {
        self.get_by_name(name, "").await
    }

    async fn network_get_by_name(&self, name: &str, cloud: &str) -> AviResult<Network> {
        self.get_by_name(name, cloud).await
    }

    async fn network_update(&self, network: &Network) -> AviResult<Network> {
        self.update(network).await
    }

    async fn ipam_profile_get(&self, uuid: &str) -> AviResult<IpamDnsProviderProfile> {
        self.get(uuid).await
    }

    async fn ipam_profile_update(
        &self,
        profile: &IpamDnsProviderProfile,
    ) -> AviResult<IpamDnsProviderProfile> {
        self.update(profile).await
    }

    async fn tenant_get(&self, name: &str) -> AviResult<Tenant> {
        self.get_by_name(name, "").await
    }

    async fn role_get_by_name(&self, name: &str) -> AviResult<Role> {
        self.get_by_name(name, "").await
    }

    async fn role_create(&self, role: &Role) -> AviResult<Role> {
        self.create(role).await
    }

    async fn role_update(&self, role: &Role) -> AviResult<Role> {
        self.update(role).await
    }

    async fn user_get_by_name(&self, name: &str) -> AviResult<User> {
        self.get_by_name(name, "").await
    }

    async fn user_create(&self, user: &User) -> AviResult<User> {
        self.create(user).await
    }

    async fn user_update(&self, user: &User) -> AviResult<User> {
        self.update(user).await
    }

    async fn user_delete_by_name(&self, name: &str) -> AviResult<()> {
        self.delete_by_name::<User>(name).await
    }

    async fn controller_version(&self) -> AviResult<String> {
        self.ensure_session().await?;
        let csrf = self.session.read().await.csrf_token.clone();
        self.fetch_version(csrf.as_deref()).await
    }
}
